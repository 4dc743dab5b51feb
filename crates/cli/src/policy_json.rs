//! Translates a plain-JSON policy document into `sapl_core::ast::PolicyDocument`.
//!
//! There is no textual `.sapl` grammar in scope (spec Section 1); this
//! module stands in for the "external, unspecified parser front-end" the
//! spec says may feed `CompiledPolicy` construction. It lives in the CLI,
//! not in `sapl-core`, so the AST crate stays free of any one front-end's
//! JSON conventions -- the same separation `tenor-cli::manifest` keeps
//! from `tenor-core::ast` (the manifest's on-disk shape is a CLI concern,
//! not a core one).
//!
//! Every node gets a `SourceLocation::synthetic(document name)`: there is
//! no source text to point at, only the JSON document this tree was built
//! from.

use sapl_core::ast::{
    BinaryOperator, CombiningAlgorithm, Expression, FilterStep, Import, PolicyBody, PolicyDocument,
    SchemaExpression, Statement, Step, SubscriptionElement, UnaryOperator,
};
use sapl_core::{PolicyKind, QualifiedName, SourceLocation, Value};

/// Pure plumbing -- this is a JSON-shape error, not an evaluation-time
/// `Value::Error`, so it follows `CompileError`'s `thiserror` convention
/// rather than the hand-rolled in-band style.
#[derive(Debug, thiserror::Error)]
#[error("policy JSON error: {0}")]
pub struct PolicyJsonError(String);

type Result<T> = std::result::Result<T, PolicyJsonError>;

fn err(msg: impl Into<String>) -> PolicyJsonError {
    PolicyJsonError(msg.into())
}

fn field<'a>(obj: &'a serde_json::Value, name: &str) -> Result<&'a serde_json::Value> {
    obj.get(name).ok_or_else(|| err(format!("missing field '{}'", name)))
}

fn as_str<'a>(v: &'a serde_json::Value) -> Result<&'a str> {
    v.as_str().ok_or_else(|| err("expected a string"))
}

fn as_array<'a>(v: &'a serde_json::Value) -> Result<&'a Vec<serde_json::Value>> {
    v.as_array().ok_or_else(|| err("expected an array"))
}

fn qualified_name(raw: &str) -> Result<QualifiedName> {
    QualifiedName::parse(raw).ok_or_else(|| err(format!("invalid qualified name '{}'", raw)))
}

/// Parse a whole document at the top level of a policy file. `doc_name` is
/// used only to stamp `SourceLocation::synthetic`.
pub fn parse_policy_document(json: &serde_json::Value, doc_name: &str) -> Result<PolicyDocument> {
    let name = as_str(field(json, "name")?)?.to_string();
    let location = SourceLocation::synthetic(doc_name);

    let imports = match json.get("imports") {
        Some(v) => as_array(v)?.iter().map(|i| parse_import(i, doc_name)).collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };

    let body = parse_body(field(json, "body")?, doc_name)?;

    Ok(PolicyDocument {
        name,
        imports,
        body,
        location,
    })
}

fn parse_import(json: &serde_json::Value, doc_name: &str) -> Result<Import> {
    let raw = as_str(field(json, "name")?)?;
    let qualified_name = qualified_name(raw)?;
    let alias = match json.get("alias") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        _ => None,
    };
    Ok(Import {
        qualified_name,
        alias,
        location: SourceLocation::synthetic(doc_name),
    })
}

fn parse_body(json: &serde_json::Value, doc_name: &str) -> Result<PolicyBody> {
    let kind = as_str(field(json, "kind")?)?;
    match kind {
        "set" => {
            let algorithm = parse_algorithm(as_str(field(json, "algorithm")?)?)?;
            let variables = match json.get("variables") {
                Some(v) => as_array(v)?
                    .iter()
                    .map(|item| {
                        let name = as_str(field(item, "name")?)?.to_string();
                        let value = parse_expr(field(item, "value")?, doc_name)?;
                        Ok((name, value))
                    })
                    .collect::<Result<Vec<_>>>()?,
                None => Vec::new(),
            };
            let policies = as_array(field(json, "policies")?)?
                .iter()
                .map(|p| parse_policy_document(p, doc_name))
                .collect::<Result<Vec<_>>>()?;
            let target = parse_expr(field(json, "target")?, doc_name)?;
            let schemas = parse_schemas(json.get("schemas"), doc_name)?;
            Ok(PolicyBody::Set {
                algorithm,
                variables,
                policies,
                target,
                schemas,
            })
        }
        "rule" => {
            let entitlement = match as_str(field(json, "entitlement")?)? {
                "permit" => PolicyKind::Permit,
                "deny" => PolicyKind::Deny,
                other => return Err(err(format!("unknown entitlement '{}'", other))),
            };
            let target = parse_expr(field(json, "target")?, doc_name)?;
            let body = match json.get("body") {
                Some(v) => as_array(v)?.iter().map(|s| parse_statement(s, doc_name)).collect::<Result<Vec<_>>>()?,
                None => Vec::new(),
            };
            let obligation = parse_optional_expr(json.get("obligation"), doc_name)?;
            let advice = parse_optional_expr(json.get("advice"), doc_name)?;
            let transform = parse_optional_expr(json.get("transform"), doc_name)?;
            let schemas = parse_schemas(json.get("schemas"), doc_name)?;
            Ok(PolicyBody::Rule {
                entitlement,
                target,
                body,
                obligation,
                advice,
                transform,
                schemas,
            })
        }
        other => Err(err(format!("unknown policy body kind '{}'", other))),
    }
}

fn parse_algorithm(raw: &str) -> Result<CombiningAlgorithm> {
    match raw {
        "deny-overrides" => Ok(CombiningAlgorithm::DenyOverrides),
        "permit-overrides" => Ok(CombiningAlgorithm::PermitOverrides),
        "first-applicable" => Ok(CombiningAlgorithm::FirstApplicable),
        "only-one-applicable" => Ok(CombiningAlgorithm::OnlyOneApplicable),
        "deny-unless-permit" => Ok(CombiningAlgorithm::DenyUnlessPermit),
        "permit-unless-deny" => Ok(CombiningAlgorithm::PermitUnlessDeny),
        other => Err(err(format!("unknown combining algorithm '{}'", other))),
    }
}

fn parse_schemas(json: Option<&serde_json::Value>, doc_name: &str) -> Result<Vec<SchemaExpression>> {
    let Some(json) = json else {
        return Ok(Vec::new());
    };
    as_array(json)?
        .iter()
        .map(|item| {
            let element = parse_element(as_str(field(item, "element")?)?)?;
            let schema = parse_expr(field(item, "schema")?, doc_name)?;
            Ok(SchemaExpression {
                element,
                schema,
                location: SourceLocation::synthetic(doc_name),
            })
        })
        .collect()
}

fn parse_element(raw: &str) -> Result<SubscriptionElement> {
    match raw {
        "subject" => Ok(SubscriptionElement::Subject),
        "action" => Ok(SubscriptionElement::Action),
        "resource" => Ok(SubscriptionElement::Resource),
        "environment" => Ok(SubscriptionElement::Environment),
        other => Err(err(format!("unknown subscription element '{}'", other))),
    }
}

fn parse_statement(json: &serde_json::Value, doc_name: &str) -> Result<Statement> {
    let kind = as_str(field(json, "kind")?)?;
    match kind {
        "value" => {
            let name = as_str(field(json, "name")?)?.to_string();
            let value = parse_expr(field(json, "value")?, doc_name)?;
            Ok(Statement::ValueDefinition {
                name,
                value,
                location: SourceLocation::synthetic(doc_name),
            })
        }
        "condition" => Ok(Statement::Condition(parse_expr(field(json, "expr")?, doc_name)?)),
        other => Err(err(format!("unknown statement kind '{}'", other))),
    }
}

fn parse_optional_expr(json: Option<&serde_json::Value>, doc_name: &str) -> Result<Option<Expression>> {
    match json {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => Ok(Some(parse_expr(v, doc_name)?)),
    }
}

fn parse_expr(json: &serde_json::Value, doc_name: &str) -> Result<Expression> {
    let location = SourceLocation::synthetic(doc_name);
    let kind = as_str(field(json, "type")?)?;
    match kind {
        "literal" => Ok(Expression::Literal {
            value: Value::from_json(field(json, "value")?),
            location,
        }),
        "element" => Ok(Expression::SubscriptionElement {
            element: parse_element(as_str(field(json, "element")?)?)?,
            location,
        }),
        "variable" => Ok(Expression::Variable {
            name: as_str(field(json, "name")?)?.to_string(),
            location,
        }),
        "attribute" => {
            let name = qualified_name(as_str(field(json, "name")?)?)?;
            let entity = parse_optional_expr(json.get("entity"), doc_name)?.map(Box::new);
            let arguments = parse_expr_list(json.get("arguments"), doc_name)?;
            Ok(Expression::AttributeFinderRef {
                name,
                entity,
                arguments,
                location,
            })
        }
        "call" => Ok(Expression::FunctionCall {
            name: qualified_name(as_str(field(json, "name")?)?)?,
            arguments: parse_expr_list(json.get("arguments"), doc_name)?,
            location,
        }),
        "unary" => {
            let op = match as_str(field(json, "op")?)? {
                "not" => UnaryOperator::Not,
                "negate" => UnaryOperator::Negate,
                other => return Err(err(format!("unknown unary operator '{}'", other))),
            };
            Ok(Expression::Unary {
                op,
                operand: Box::new(parse_expr(field(json, "operand")?, doc_name)?),
                location,
            })
        }
        "binary" => {
            let op = parse_binary_op(as_str(field(json, "op")?)?)?;
            Ok(Expression::Binary {
                op,
                left: Box::new(parse_expr(field(json, "left")?, doc_name)?),
                right: Box::new(parse_expr(field(json, "right")?, doc_name)?),
                location,
            })
        }
        "conditional" => Ok(Expression::Conditional {
            condition: Box::new(parse_expr(field(json, "condition")?, doc_name)?),
            if_true: Box::new(parse_expr(field(json, "if_true")?, doc_name)?),
            if_false: Box::new(parse_expr(field(json, "if_false")?, doc_name)?),
            location,
        }),
        "array" => Ok(Expression::ArrayLiteral {
            items: parse_expr_list(json.get("items"), doc_name)?,
            location,
        }),
        "object" => {
            let fields_json = field(json, "fields")?.as_object().ok_or_else(|| err("expected an object"))?;
            let mut fields = Vec::with_capacity(fields_json.len());
            for (k, v) in fields_json {
                fields.push((k.clone(), parse_expr(v, doc_name)?));
            }
            Ok(Expression::ObjectLiteral { fields, location })
        }
        "step" => {
            let base = Box::new(parse_expr(field(json, "base")?, doc_name)?);
            let step = parse_step(field(json, "step")?, doc_name)?;
            Ok(Expression::Step { base, step, location })
        }
        "filter" => {
            let base = Box::new(parse_expr(field(json, "base")?, doc_name)?);
            let path = as_array(field(json, "path")?)?
                .iter()
                .map(|s| parse_filter_step(s, doc_name))
                .collect::<Result<Vec<_>>>()?;
            let function = qualified_name(as_str(field(json, "function")?)?)?;
            let arguments = parse_expr_list(json.get("arguments"), doc_name)?;
            Ok(Expression::Filter {
                base,
                path,
                function,
                arguments,
                location,
            })
        }
        other => Err(err(format!("unknown expression type '{}'", other))),
    }
}

fn parse_expr_list(json: Option<&serde_json::Value>, doc_name: &str) -> Result<Vec<Expression>> {
    match json {
        None => Ok(Vec::new()),
        Some(v) => as_array(v)?.iter().map(|e| parse_expr(e, doc_name)).collect(),
    }
}

fn parse_binary_op(raw: &str) -> Result<BinaryOperator> {
    Ok(match raw {
        "+" => BinaryOperator::Add,
        "-" => BinaryOperator::Sub,
        "*" => BinaryOperator::Mul,
        "/" => BinaryOperator::Div,
        "&&" => BinaryOperator::And,
        "||" => BinaryOperator::Or,
        "==" => BinaryOperator::Eq,
        "!=" => BinaryOperator::NotEq,
        "<" => BinaryOperator::Lt,
        "<=" => BinaryOperator::LtEq,
        ">" => BinaryOperator::Gt,
        ">=" => BinaryOperator::GtEq,
        "=~" => BinaryOperator::Regex,
        other => return Err(err(format!("unknown binary operator '{}'", other))),
    })
}

fn parse_step(json: &serde_json::Value, doc_name: &str) -> Result<Step> {
    let kind = as_str(field(json, "kind")?)?;
    match kind {
        "member" => Ok(Step::Member(as_str(field(json, "name")?)?.to_string())),
        "index" => Ok(Step::Index(field(json, "index")?.as_i64().ok_or_else(|| err("expected an integer"))?)),
        "wildcard" => Ok(Step::Wildcard),
        "recursive" => Ok(Step::RecursiveDescent),
        "slice" => Ok(Step::Slice {
            start: json.get("start").and_then(|v| v.as_i64()),
            end: json.get("end").and_then(|v| v.as_i64()),
        }),
        "filter" => Ok(Step::ConditionFilter(Box::new(parse_expr(field(json, "condition")?, doc_name)?))),
        other => Err(err(format!("unknown path step kind '{}'", other))),
    }
}

fn parse_filter_step(json: &serde_json::Value, doc_name: &str) -> Result<FilterStep> {
    let kind = as_str(field(json, "kind")?)?;
    match kind {
        "member" => Ok(FilterStep::Member(as_str(field(json, "name")?)?.to_string())),
        "index" => Ok(FilterStep::Index(field(json, "index")?.as_i64().ok_or_else(|| err("expected an integer"))?)),
        "wildcard" => Ok(FilterStep::Wildcard),
        "recursive" => Ok(FilterStep::RecursiveDescent),
        "each" => Ok(FilterStep::Each),
        "filter" => Ok(FilterStep::ConditionFilter(Box::new(parse_expr(field(json, "condition")?, doc_name)?))),
        other => Err(err(format!("unknown filter step kind '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_permit_rule() {
        let json = serde_json::json!({
            "name": "allow-all",
            "body": {
                "kind": "rule",
                "entitlement": "permit",
                "target": {"type": "literal", "value": true},
                "body": []
            }
        });
        let doc = parse_policy_document(&json, "allow-all.json").unwrap();
        assert_eq!(doc.name, "allow-all");
        match doc.body {
            PolicyBody::Rule { entitlement, .. } => assert_eq!(entitlement, PolicyKind::Permit),
            _ => panic!("expected a rule"),
        }
    }

    #[test]
    fn rejects_unknown_combining_algorithm() {
        let json = serde_json::json!({
            "name": "bad-set",
            "body": {
                "kind": "set",
                "algorithm": "weighted-vote",
                "policies": [],
                "target": {"type": "literal", "value": true}
            }
        });
        assert!(parse_policy_document(&json, "bad-set.json").is_err());
    }
}
