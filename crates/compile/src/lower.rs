//! Lowers `sapl_core::ast` into `CompiledExpression` (spec Section 4.2).
//!
//! One recursive function, `compile_expr`, walks the AST once. Constant
//! folding and stratum lifting happen inline as each node is built rather
//! than as separate tree-rewrite passes: an n-ary node (`Unary`, `Binary`,
//! `Conditional`, `ArrayLiteral`, `ObjectLiteral`) inspects its
//! already-compiled children and picks the cheapest stratum that is still
//! correct -- `Value` if every child is `Value`, `Pure` if every child is
//! `Value`/`Pure`, `Stream` if any child is a live attribute. This mirrors
//! `tenor-core`'s `pass4_typecheck`, which likewise infers a node's
//! properties bottom-up from its already-processed children rather than a
//! separate annotate-then-rewrite pass.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use regex::Regex;

use sapl_core::ast::{
    BinaryOperator, FilterStep, PolicyBody, Statement, Step, SubscriptionElement, UnaryOperator,
};
use sapl_core::{Expression, PolicyDocument, QualifiedName, SourceLocation, Value};

use crate::compiled::{
    CompiledExpression, CompiledPolicy, CompiledPolicyRule, CompiledPolicySet, CompiledStatement,
    EvaluationContext, PrecompiledSchemaValidator, PureOperator, StreamOperator, Trace, TracedValue,
};
use crate::error::CompileError;
use crate::invocation::AttributeFinderInvocation;
use crate::passes::{self, build_import_table, candidate_names, eval_pure_child, resolve_against, subscribe_any};
use crate::stream_util::{combine_latest, switch_map_attribute_args};

/// Lower one policy document (a rule, a set, or -- recursively -- a policy
/// nested inside a set) into its compiled form.
pub fn compile_policy_document(doc: &PolicyDocument) -> Result<CompiledPolicy, CompileError> {
    let imports = Arc::new(build_import_table(&doc.imports)?);

    match &doc.body {
        PolicyBody::Rule {
            entitlement,
            target,
            body,
            obligation,
            advice,
            transform,
            schemas,
        } => {
            let compiled_target = compile_target(target)?;
            let compiled_schemas = schemas
                .iter()
                .map(compile_schema_expression)
                .collect::<Result<Vec<_>, _>>()?;
            let compiled_body = body.iter().map(compile_statement).collect::<Result<Vec<_>, _>>()?;
            let compiled_obligation = obligation
                .as_ref()
                .map(|e| compile_expr(e, false))
                .transpose()?
                .map(passes::lift_to_stream);
            let compiled_advice = advice
                .as_ref()
                .map(|e| compile_expr(e, false))
                .transpose()?
                .map(passes::lift_to_stream);
            let compiled_transform = transform
                .as_ref()
                .map(|e| compile_expr(e, false))
                .transpose()?
                .map(passes::lift_to_stream);

            Ok(CompiledPolicy::Rule(CompiledPolicyRule {
                name: doc.name.clone(),
                entitlement: *entitlement,
                target: compiled_target,
                body: compiled_body,
                obligation: compiled_obligation,
                advice: compiled_advice,
                transform: compiled_transform,
                schemas: compiled_schemas,
                imports,
            }))
        }
        PolicyBody::Set {
            algorithm,
            variables,
            policies,
            target,
            schemas,
        } => {
            let compiled_target = compile_target(target)?;
            let compiled_schemas = schemas
                .iter()
                .map(compile_schema_expression)
                .collect::<Result<Vec<_>, _>>()?;
            let compiled_variables = variables
                .iter()
                .map(|(name, expr)| compile_policy_set_variable(name, expr))
                .collect::<Result<Vec<_>, _>>()?;
            let compiled_policies = policies
                .iter()
                .map(compile_policy_document)
                .collect::<Result<Vec<_>, _>>()?;

            Ok(CompiledPolicy::Set(CompiledPolicySet {
                name: doc.name.clone(),
                variables: compiled_variables,
                algorithm: *algorithm,
                policies: compiled_policies,
                target: compiled_target,
                schemas: compiled_schemas,
                imports,
            }))
        }
    }
}

fn compile_target(target: &Expression) -> Result<Arc<dyn PureOperator>, CompileError> {
    match compile_expr(target, true)? {
        CompiledExpression::Value(v) => Ok(Arc::new(ConstPureOperator { value: v })),
        CompiledExpression::Pure(op) => Ok(op),
        CompiledExpression::Stream(_) => {
            unreachable!("compile_expr(forbid_attributes=true) never yields Stream")
        }
    }
}

fn compile_schema_expression(
    schema: &sapl_core::ast::SchemaExpression,
) -> Result<PrecompiledSchemaValidator, CompileError> {
    let compiled = compile_expr(&schema.schema, true)?;
    passes::compile_schema(schema.element, &schema.location, compiled)
}

fn compile_policy_set_variable(
    name: &str,
    expr: &Expression,
) -> Result<(String, Arc<dyn PureOperator>), CompileError> {
    match compile_expr(expr, false)? {
        CompiledExpression::Value(v) => Ok((name.to_string(), Arc::new(ConstPureOperator { value: v }))),
        CompiledExpression::Pure(op) => Ok((name.to_string(), op)),
        CompiledExpression::Stream(_) => Err(CompileError::VariableNotPure {
            location: expr.location().clone(),
            name: name.to_string(),
        }),
    }
}

fn compile_statement(statement: &Statement) -> Result<CompiledStatement, CompileError> {
    match statement {
        Statement::ValueDefinition { name, value, .. } => Ok(CompiledStatement::ValueDefinition {
            name: name.clone(),
            value: compile_expr(value, false)?,
        }),
        Statement::Condition(expr) => Ok(CompiledStatement::Condition(compile_expr(expr, false)?)),
    }
}

// ──────────────────────────────────────────────
// The expression compiler
// ──────────────────────────────────────────────

/// `forbid_attributes` is threaded down from a target expression or a
/// filter/path condition, both of which must be evaluable without any live
/// attribute subscription (spec Section 4.2: `AttributeInTarget`).
fn compile_expr(expr: &Expression, forbid_attributes: bool) -> Result<CompiledExpression, CompileError> {
    match expr {
        Expression::Literal { value, .. } => Ok(CompiledExpression::Value(value.clone())),

        Expression::SubscriptionElement { element, location } => Ok(CompiledExpression::Pure(Arc::new(
            SubscriptionElementOperator {
                element: *element,
                location: location.clone(),
            },
        ))),

        Expression::Variable { name, location } => Ok(CompiledExpression::Pure(Arc::new(VariableOperator {
            name: name.clone(),
            location: location.clone(),
        }))),

        Expression::AttributeFinderRef {
            name,
            entity,
            arguments,
            location,
        } => {
            if forbid_attributes {
                return Err(CompileError::AttributeInTarget {
                    location: location.clone(),
                });
            }
            let entity = entity
                .as_ref()
                .map(|e| compile_expr(e, forbid_attributes))
                .transpose()?;
            let arguments = arguments
                .iter()
                .map(|a| compile_expr(a, forbid_attributes))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CompiledExpression::Stream(Arc::new(AttributeFinderOperator {
                name: name.clone(),
                entity,
                arguments,
                location: location.clone(),
            })))
        }

        Expression::FunctionCall { name, arguments, location } => {
            let arguments = arguments
                .iter()
                .map(|a| compile_expr(a, forbid_attributes))
                .collect::<Result<Vec<_>, _>>()?;
            compile_function_call(name.clone(), arguments, location.clone())
        }

        Expression::Unary { op, operand, location } => {
            let operand = compile_expr(operand, forbid_attributes)?;
            let op = *op;
            let loc = location.clone();
            Ok(compile_nary(
                vec![operand],
                &format!("unary:{:?}", op),
                loc,
                move |vals| eval_unary(op, &vals[0]),
            ))
        }

        Expression::Binary { op, left, right, location } => {
            let left = compile_expr(left, forbid_attributes)?;
            let right = compile_expr(right, forbid_attributes)?;
            let op = *op;
            let loc = location.clone();
            Ok(compile_nary(
                vec![left, right],
                &format!("binary:{:?}", op),
                loc,
                move |vals| eval_binary(op, &vals[0], &vals[1]),
            ))
        }

        Expression::Conditional {
            condition,
            if_true,
            if_false,
            location,
        } => {
            let condition = compile_expr(condition, forbid_attributes)?;
            let if_true = compile_expr(if_true, forbid_attributes)?;
            let if_false = compile_expr(if_false, forbid_attributes)?;
            Ok(compile_conditional(condition, if_true, if_false, location.clone()))
        }

        Expression::ArrayLiteral { items, location } => {
            let items = items
                .iter()
                .map(|i| compile_expr(i, forbid_attributes))
                .collect::<Result<Vec<_>, _>>()?;
            let loc = location.clone();
            Ok(compile_nary(items, "array", loc, |vals| {
                if let Some(e) = Value::first_error(vals.iter()) {
                    return e.clone();
                }
                match Value::array(vals.to_vec()) {
                    Ok(v) => v,
                    Err(e) => Value::error(e.0, None),
                }
            }))
        }

        Expression::ObjectLiteral { fields, location } => {
            let names: Vec<String> = fields.iter().map(|(k, _)| k.clone()).collect();
            let values = fields
                .iter()
                .map(|(_, v)| compile_expr(v, forbid_attributes))
                .collect::<Result<Vec<_>, _>>()?;
            let loc = location.clone();
            Ok(compile_nary(values, "object", loc, move |vals| {
                if let Some(e) = Value::first_error(vals.iter()) {
                    return e.clone();
                }
                let mut map = indexmap::IndexMap::with_capacity(vals.len());
                for (name, v) in names.iter().zip(vals.iter()) {
                    map.insert(name.clone(), v.clone());
                }
                match Value::object(map) {
                    Ok(v) => v,
                    Err(e) => Value::error(e.0, None),
                }
            }))
        }

        Expression::Step { base, step, location } => {
            let base = compile_expr(base, forbid_attributes)?;
            compile_step(base, step, location.clone(), forbid_attributes)
        }

        Expression::Filter {
            base,
            path,
            function,
            arguments,
            location,
        } => {
            let base = compile_expr(base, forbid_attributes)?;
            let path = path
                .iter()
                .map(|s| compile_filter_step(s, forbid_attributes))
                .collect::<Result<Vec<_>, _>>()?;
            let arguments = arguments
                .iter()
                .map(|a| compile_expr(a, forbid_attributes))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CompiledExpression::Stream(Arc::new(FilterOperator {
                base,
                path,
                function: function.clone(),
                arguments,
                location: location.clone(),
            })))
        }
    }
}

// ──────────────────────────────────────────────
// Leaf operators
// ──────────────────────────────────────────────

struct ConstPureOperator {
    value: Value,
}
impl PureOperator for ConstPureOperator {
    fn evaluate(&self, _ctx: &EvaluationContext) -> TracedValue {
        TracedValue::new(self.value.clone(), Trace::leaf("const", None))
    }
    fn is_depending_on_subscription(&self) -> bool {
        false
    }
}

struct SubscriptionElementOperator {
    element: SubscriptionElement,
    location: SourceLocation,
}
impl PureOperator for SubscriptionElementOperator {
    fn evaluate(&self, ctx: &EvaluationContext) -> TracedValue {
        let v = match self.element {
            SubscriptionElement::Subject => ctx.subscription.subject.clone(),
            SubscriptionElement::Action => ctx.subscription.action.clone(),
            SubscriptionElement::Resource => ctx.subscription.resource.clone(),
            SubscriptionElement::Environment => ctx.subscription.environment.clone(),
        };
        TracedValue::new(v, Trace::leaf(format!("{:?}", self.element), Some(self.location.clone())))
    }
    fn is_depending_on_subscription(&self) -> bool {
        true
    }
}

struct VariableOperator {
    name: String,
    location: SourceLocation,
}
impl PureOperator for VariableOperator {
    fn evaluate(&self, ctx: &EvaluationContext) -> TracedValue {
        let v = ctx
            .lookup_variable(&self.name)
            .unwrap_or_else(|| Value::error(format!("undefined variable '{}'", self.name), Some(self.location.clone())));
        TracedValue::new(v, Trace::leaf(format!("var:{}", self.name), Some(self.location.clone())))
    }
    fn is_depending_on_subscription(&self) -> bool {
        true
    }
}

// ──────────────────────────────────────────────
// N-ary pure/stream combination (constant folding + stratum lifting)
// ──────────────────────────────────────────────

type Combine = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

struct NaryPureOperator {
    children: Vec<CompiledExpression>,
    combine: Combine,
    operator_name: String,
    location: SourceLocation,
    depends: bool,
}
impl PureOperator for NaryPureOperator {
    fn evaluate(&self, ctx: &EvaluationContext) -> TracedValue {
        let mut vals = Vec::with_capacity(self.children.len());
        let mut traces = Vec::with_capacity(self.children.len());
        for child in &self.children {
            let tv = eval_pure_child(child, ctx);
            vals.push(tv.value);
            traces.push(tv.trace);
        }
        let out = (self.combine)(&vals);
        TracedValue::new(out, Trace::node(self.operator_name.clone(), Some(self.location.clone()), traces))
    }
    fn is_depending_on_subscription(&self) -> bool {
        self.depends
    }
}

struct NaryStreamOperator {
    children: Vec<CompiledExpression>,
    combine: Combine,
    operator_name: String,
    location: SourceLocation,
}
impl StreamOperator for NaryStreamOperator {
    fn subscribe(&self, ctx: EvaluationContext) -> BoxStream<'static, TracedValue> {
        let streams: Vec<BoxStream<'static, TracedValue>> = self
            .children
            .iter()
            .map(|c| subscribe_any(c, ctx.clone()))
            .collect();
        let combine = self.combine.clone();
        let name = self.operator_name.clone();
        let loc = self.location.clone();
        Box::pin(combine_latest(streams).map(move |tvs: Vec<TracedValue>| {
            let vals: Vec<Value> = tvs.iter().map(|t| t.value.clone()).collect();
            let traces: Vec<Trace> = tvs.into_iter().map(|t| t.trace).collect();
            let out = (combine)(&vals);
            TracedValue::new(out, Trace::node(name.clone(), Some(loc.clone()), traces))
        }))
    }
}

/// Build an n-ary operator over already-compiled children: folds to a
/// `Value` if every child already is one, lowers to `Pure` if every child
/// is `Value`/`Pure`, and lifts every child to the `Stream` stratum
/// (spec Section 4.2) if any child is live.
fn compile_nary(
    children: Vec<CompiledExpression>,
    operator_name: &str,
    location: SourceLocation,
    combine: impl Fn(&[Value]) -> Value + Send + Sync + 'static,
) -> CompiledExpression {
    let combine: Combine = Arc::new(combine);
    let has_stream = children.iter().any(|c| matches!(c, CompiledExpression::Stream(_)));
    if has_stream {
        return CompiledExpression::Stream(Arc::new(NaryStreamOperator {
            children,
            combine,
            operator_name: operator_name.to_string(),
            location,
        }));
    }

    let all_const = children.iter().all(|c| matches!(c, CompiledExpression::Value(_)));
    if all_const {
        let vals: Vec<Value> = children
            .iter()
            .map(|c| match c {
                CompiledExpression::Value(v) => v.clone(),
                _ => unreachable!(),
            })
            .collect();
        return CompiledExpression::Value((combine)(&vals));
    }

    let depends = children
        .iter()
        .any(|c| matches!(c, CompiledExpression::Pure(op) if op.is_depending_on_subscription()));
    CompiledExpression::Pure(Arc::new(NaryPureOperator {
        children,
        combine,
        operator_name: operator_name.to_string(),
        location,
        depends,
    }))
}

fn eval_unary(op: UnaryOperator, v: &Value) -> Value {
    if v.is_error() {
        return v.clone();
    }
    match op {
        UnaryOperator::Not => match v.as_bool() {
            Some(b) => Value::Boolean(!b),
            None => Value::error(format!("'!' requires a Boolean operand, got {}", v.type_name()), None),
        },
        UnaryOperator::Negate => match v {
            Value::Number(n) => Value::Number(-*n),
            other => Value::error(format!("unary '-' requires a Number operand, got {}", other.type_name()), None),
        },
    }
}

fn eval_binary(op: BinaryOperator, a: &Value, b: &Value) -> Value {
    if let Some(e) = Value::first_error([a, b]) {
        return e.clone();
    }
    match op {
        BinaryOperator::Add => a.add(b),
        BinaryOperator::Sub => a.sub(b),
        BinaryOperator::Mul => a.mul(b),
        BinaryOperator::Div => a.div(b),
        BinaryOperator::And => match (a.as_bool(), b.as_bool()) {
            (Some(x), Some(y)) => Value::Boolean(x && y),
            _ => Value::error("'&&' requires Boolean operands", None),
        },
        BinaryOperator::Or => match (a.as_bool(), b.as_bool()) {
            (Some(x), Some(y)) => Value::Boolean(x || y),
            _ => Value::error("'||' requires Boolean operands", None),
        },
        BinaryOperator::Eq => Value::Boolean(a == b),
        BinaryOperator::NotEq => Value::Boolean(a != b),
        BinaryOperator::Lt | BinaryOperator::LtEq | BinaryOperator::Gt | BinaryOperator::GtEq => {
            match a.partial_compare(b) {
                Some(ord) => Value::Boolean(match op {
                    BinaryOperator::Lt => ord.is_lt(),
                    BinaryOperator::LtEq => ord.is_le(),
                    BinaryOperator::Gt => ord.is_gt(),
                    BinaryOperator::GtEq => ord.is_ge(),
                    _ => unreachable!(),
                }),
                None => Value::error(
                    format!("cannot compare {} and {}", a.type_name(), b.type_name()),
                    None,
                ),
            }
        }
        BinaryOperator::Regex => match (a, b) {
            (Value::Text(s), Value::Text(pattern)) => match Regex::new(pattern) {
                Ok(re) => Value::Boolean(re.is_match(s)),
                Err(e) => Value::error(format!("invalid regex '{}': {}", pattern, e), None),
            },
            _ => Value::error("'=~' requires Text operands", None),
        },
    }
}

fn compile_conditional(
    condition: CompiledExpression,
    if_true: CompiledExpression,
    if_false: CompiledExpression,
    location: SourceLocation,
) -> CompiledExpression {
    let any_stream = matches!(condition, CompiledExpression::Stream(_))
        || matches!(if_true, CompiledExpression::Stream(_))
        || matches!(if_false, CompiledExpression::Stream(_));

    if !any_stream {
        return compile_nary(vec![condition, if_true, if_false], "conditional", location, |vals| {
            select_branch(&vals[0], &vals[1], &vals[2])
        });
    }

    CompiledExpression::Stream(Arc::new(ConditionalStreamOperator {
        condition,
        if_true,
        if_false,
        location,
    }))
}

fn select_branch(condition: &Value, if_true: &Value, if_false: &Value) -> Value {
    if condition.is_error() {
        return condition.clone();
    }
    match condition.as_bool() {
        Some(true) => if_true.clone(),
        Some(false) => if_false.clone(),
        None => Value::error(
            format!("conditional requires a Boolean condition, got {}", condition.type_name()),
            None,
        ),
    }
}

/// Unlike `NaryStreamOperator` (which keeps every branch permanently
/// subscribed), this only ever subscribes to the branch the condition
/// currently selects -- avoiding e.g. a permanently-open upstream
/// subscription for the `if_false` side of `<entity.risk> > 5 ? ... : ...`
/// while the condition is true.
struct ConditionalStreamOperator {
    condition: CompiledExpression,
    if_true: CompiledExpression,
    if_false: CompiledExpression,
    location: SourceLocation,
}
impl StreamOperator for ConditionalStreamOperator {
    fn subscribe(&self, ctx: EvaluationContext) -> BoxStream<'static, TracedValue> {
        let condition_stream = subscribe_any(&self.condition, ctx.clone());
        let if_true = self.if_true.clone();
        let if_false = self.if_false.clone();
        let location = self.location.clone();
        crate::stream_util::switch_map(condition_stream, move |cond_tv: TracedValue| {
            let cond_trace = cond_tv.trace.clone();
            let location = location.clone();
            if cond_tv.value.is_error() {
                let v = cond_tv.value;
                return futures::stream::once(futures::future::ready(TracedValue::new(
                    v,
                    Trace::node("conditional", Some(location), vec![cond_trace]),
                )))
                .boxed();
            }
            match cond_tv.value.as_bool() {
                Some(true) => subscribe_any(&if_true, ctx.clone()),
                Some(false) => subscribe_any(&if_false, ctx.clone()),
                None => {
                    let v = Value::error("conditional requires a Boolean condition", Some(location.clone()));
                    futures::stream::once(futures::future::ready(TracedValue::new(
                        v,
                        Trace::node("conditional", Some(location), vec![cond_trace]),
                    )))
                    .boxed()
                }
            }
        })
    }
}

// ──────────────────────────────────────────────
// Function calls (ctx-aware: resolved against the function broker)
// ──────────────────────────────────────────────

fn compile_function_call(
    name: QualifiedName,
    arguments: Vec<CompiledExpression>,
    location: SourceLocation,
) -> Result<CompiledExpression, CompileError> {
    let has_stream = arguments.iter().any(|a| matches!(a, CompiledExpression::Stream(_)));
    if has_stream {
        return Ok(CompiledExpression::Stream(Arc::new(FunctionCallStreamOperator {
            name,
            arguments,
            location,
        })));
    }
    let depends = arguments
        .iter()
        .any(|a| matches!(a, CompiledExpression::Pure(op) if op.is_depending_on_subscription()));
    Ok(CompiledExpression::Pure(Arc::new(FunctionCallPureOperator {
        name,
        arguments,
        location,
        depends,
    })))
}

fn invoke_function(name: &QualifiedName, vals: &[Value], ctx: &EvaluationContext, location: &SourceLocation) -> Value {
    if let Some(e) = Value::first_error(vals.iter()) {
        return e.clone();
    }
    let candidates = candidate_names(name, &ctx.imports);
    let resolved = resolve_against(&candidates, |c| ctx.function_broker.is_provided_function(c));
    if !ctx.function_broker.is_provided_function(&resolved) {
        return Value::error(format!("unknown function '{}'", name), Some(location.clone()));
    }
    ctx.function_broker.evaluate(&resolved, vals)
}

struct FunctionCallPureOperator {
    name: QualifiedName,
    arguments: Vec<CompiledExpression>,
    location: SourceLocation,
    depends: bool,
}
impl PureOperator for FunctionCallPureOperator {
    fn evaluate(&self, ctx: &EvaluationContext) -> TracedValue {
        let mut vals = Vec::with_capacity(self.arguments.len());
        let mut traces = Vec::with_capacity(self.arguments.len());
        for a in &self.arguments {
            let tv = eval_pure_child(a, ctx);
            vals.push(tv.value);
            traces.push(tv.trace);
        }
        let out = invoke_function(&self.name, &vals, ctx, &self.location);
        TracedValue::new(
            out,
            Trace::node(format!("call:{}", self.name), Some(self.location.clone()), traces),
        )
    }
    fn is_depending_on_subscription(&self) -> bool {
        self.depends
    }
}

struct FunctionCallStreamOperator {
    name: QualifiedName,
    arguments: Vec<CompiledExpression>,
    location: SourceLocation,
}
impl StreamOperator for FunctionCallStreamOperator {
    fn subscribe(&self, ctx: EvaluationContext) -> BoxStream<'static, TracedValue> {
        let streams: Vec<BoxStream<'static, TracedValue>> = self
            .arguments
            .iter()
            .map(|a| subscribe_any(a, ctx.clone()))
            .collect();
        let name = self.name.clone();
        let location = self.location.clone();
        let ctx = ctx.clone();
        Box::pin(combine_latest(streams).map(move |tvs: Vec<TracedValue>| {
            let vals: Vec<Value> = tvs.iter().map(|t| t.value.clone()).collect();
            let traces: Vec<Trace> = tvs.into_iter().map(|t| t.trace).collect();
            let out = invoke_function(&name, &vals, &ctx, &location);
            TracedValue::new(out, Trace::node(format!("call:{}", name), Some(location.clone()), traces))
        }))
    }
}

// ──────────────────────────────────────────────
// Attribute finder references (always Stream)
// ──────────────────────────────────────────────

struct AttributeFinderOperator {
    name: QualifiedName,
    entity: Option<CompiledExpression>,
    arguments: Vec<CompiledExpression>,
    location: SourceLocation,
}
impl StreamOperator for AttributeFinderOperator {
    fn subscribe(&self, ctx: EvaluationContext) -> BoxStream<'static, TracedValue> {
        let mut children: Vec<BoxStream<'static, TracedValue>> = Vec::new();
        if let Some(e) = &self.entity {
            children.push(subscribe_any(e, ctx.clone()));
        }
        for a in &self.arguments {
            children.push(subscribe_any(a, ctx.clone()));
        }

        let outer: BoxStream<'static, Vec<TracedValue>> = if children.is_empty() {
            futures::stream::once(futures::future::ready(Vec::new())).boxed()
        } else {
            combine_latest(children)
        };

        let has_entity = self.entity.is_some();
        let name = self.name.clone();
        let location = self.location.clone();
        let ctx = ctx.clone();

        switch_map_attribute_args(outer, move |values: Vec<Value>| {
            let (entity, arguments): (Option<Value>, Vec<Value>) = if has_entity {
                let mut it = values.into_iter();
                (it.next(), it.collect())
            } else {
                (None, values)
            };

            if let Some(e) = entity
                .as_ref()
                .filter(|v| v.is_error())
                .cloned()
                .or_else(|| Value::first_error(arguments.iter()).cloned())
            {
                return futures::stream::once(futures::future::ready(TracedValue::new(
                    e,
                    Trace::leaf(format!("attribute:{}", name), Some(location.clone())),
                )))
                .boxed();
            }

            let candidates = candidate_names(&name, &ctx.imports);
            let resolved = resolve_against(&candidates, |c| ctx.attribute_broker.is_provided_function(c));

            let invocation = AttributeFinderInvocation {
                config_id: ctx.configuration_id.to_string(),
                fully_qualified_name: resolved,
                entity,
                arguments,
                variables: (*ctx.local_variables).clone(),
                initial_timeout_millis: 0,
                freshness_ttl_millis: 0,
                poll_interval_millis: None,
                backoff_budget: 0,
                request_initial_only: false,
            };
            ctx.attribute_broker.attribute_stream(invocation)
        })
    }
}

// ──────────────────────────────────────────────
// Path navigation (`.field`, `[n]`, `[*]`, `..`, slices, `[?(@..)]`)
// ──────────────────────────────────────────────

enum CompiledStep {
    Member(String),
    Index(i64),
    Wildcard,
    RecursiveDescent,
    Slice { start: Option<i64>, end: Option<i64> },
    ConditionFilter(Arc<dyn PureOperator>),
}

fn compile_step(
    base: CompiledExpression,
    step: &Step,
    location: SourceLocation,
    forbid_attributes: bool,
) -> Result<CompiledExpression, CompileError> {
    let compiled_step = match step {
        Step::Member(name) => CompiledStep::Member(name.clone()),
        Step::Index(i) => CompiledStep::Index(*i),
        Step::Wildcard => CompiledStep::Wildcard,
        Step::RecursiveDescent => CompiledStep::RecursiveDescent,
        Step::Slice { start, end } => CompiledStep::Slice { start: *start, end: *end },
        Step::ConditionFilter(cond) => {
            CompiledStep::ConditionFilter(compile_path_condition(cond, forbid_attributes)?)
        }
    };

    Ok(match &base {
        CompiledExpression::Value(v) => {
            let out = navigate(v, &compiled_step, None);
            match out {
                NavigationResult::Constant(result) => CompiledExpression::Value(result),
                NavigationResult::NeedsContext => CompiledExpression::Pure(Arc::new(StepPureOperator {
                    base,
                    step: compiled_step,
                    location,
                })),
            }
        }
        CompiledExpression::Pure(_) => CompiledExpression::Pure(Arc::new(StepPureOperator {
            base,
            step: compiled_step,
            location,
        })),
        CompiledExpression::Stream(_) => CompiledExpression::Stream(Arc::new(StepStreamOperator {
            base,
            step: compiled_step,
            location,
        })),
    })
}

/// A `[?(<condition>)]` path/filter condition must be evaluable without a
/// live attribute subscription per element -- reactively re-subscribing a
/// finder for every candidate array element has no sensible semantics, so
/// (like a target expression) it is always compiled Pure-only.
fn compile_path_condition(expr: &Expression, forbid_attributes: bool) -> Result<Arc<dyn PureOperator>, CompileError> {
    match compile_expr(expr, forbid_attributes)? {
        CompiledExpression::Value(v) => Ok(Arc::new(ConstPureOperator { value: v })),
        CompiledExpression::Pure(op) => Ok(op),
        CompiledExpression::Stream(_) => Err(CompileError::AttributeInFilterCondition {
            location: expr.location().clone(),
        }),
    }
}

enum NavigationResult {
    Constant(Value),
    NeedsContext,
}

/// Apply one navigation step to `base`. `ctx` is only needed to evaluate a
/// `ConditionFilter`'s condition against each candidate element (bound to
/// `@`); when `ctx` is `None` this returns `NeedsContext` so the caller
/// knows it cannot be constant-folded further.
fn navigate(base: &Value, step: &CompiledStep, ctx: Option<&EvaluationContext>) -> NavigationResult {
    if base.is_error() {
        return NavigationResult::Constant(base.clone());
    }
    if matches!(step, CompiledStep::ConditionFilter(_)) && ctx.is_none() {
        return NavigationResult::NeedsContext;
    }
    NavigationResult::Constant(apply_step(base, step, ctx))
}

fn apply_step(base: &Value, step: &CompiledStep, ctx: Option<&EvaluationContext>) -> Value {
    if base.is_error() {
        return base.clone();
    }
    match step {
        CompiledStep::Member(name) => base.get_field(name),
        CompiledStep::Index(i) => match base {
            Value::Array(items) => match normalize_index(*i, items.len()) {
                Some(idx) => items[idx].clone(),
                None => Value::Undefined,
            },
            _ => Value::error(format!("cannot index into {}", base.type_name()), None),
        },
        CompiledStep::Wildcard => match base {
            Value::Array(items) => Value::Array(items.clone()),
            Value::Object(fields) => Value::Array(fields.values().cloned().collect()),
            _ => Value::error(format!("cannot apply '[*]' to {}", base.type_name()), None),
        },
        CompiledStep::RecursiveDescent => Value::Array(collect_recursive(base)),
        CompiledStep::Slice { start, end } => match base {
            Value::Array(items) => Value::Array(slice(items, *start, *end)),
            _ => Value::error(format!("cannot slice {}", base.type_name()), None),
        },
        CompiledStep::ConditionFilter(cond) => match base {
            Value::Array(items) => {
                let ctx = ctx.expect("ConditionFilter requires an EvaluationContext");
                let matched: Vec<Value> = items
                    .iter()
                    .filter(|item| {
                        let item_ctx = ctx.with_variable("@", (*item).clone());
                        cond.evaluate(&item_ctx).value.as_bool().unwrap_or(false)
                    })
                    .cloned()
                    .collect();
                Value::Array(matched)
            }
            _ => Value::error(format!("cannot filter {}", base.type_name()), None),
        },
    }
}

fn normalize_index(i: i64, len: usize) -> Option<usize> {
    let idx = if i < 0 { len as i64 + i } else { i };
    if idx < 0 || idx as usize >= len {
        None
    } else {
        Some(idx as usize)
    }
}

fn slice(items: &[Value], start: Option<i64>, end: Option<i64>) -> Vec<Value> {
    let len = items.len() as i64;
    let norm = |v: i64| -> i64 {
        let v = if v < 0 { len + v } else { v };
        v.clamp(0, len)
    };
    let s = norm(start.unwrap_or(0)) as usize;
    let e = norm(end.unwrap_or(len)) as usize;
    if s >= e {
        Vec::new()
    } else {
        items[s..e].to_vec()
    }
}

fn collect_recursive(value: &Value) -> Vec<Value> {
    let mut out = Vec::new();
    fn walk(v: &Value, out: &mut Vec<Value>) {
        out.push(v.clone());
        match v {
            Value::Array(items) => items.iter().for_each(|i| walk(i, out)),
            Value::Object(fields) => fields.values().for_each(|i| walk(i, out)),
            _ => {}
        }
    }
    walk(value, &mut out);
    out
}

struct StepPureOperator {
    base: CompiledExpression,
    step: CompiledStep,
    location: SourceLocation,
}
impl PureOperator for StepPureOperator {
    fn evaluate(&self, ctx: &EvaluationContext) -> TracedValue {
        let base_tv = eval_pure_child(&self.base, ctx);
        let out = apply_step(&base_tv.value, &self.step, Some(ctx));
        TracedValue::new(out, Trace::node("step", Some(self.location.clone()), vec![base_tv.trace]))
    }
    fn is_depending_on_subscription(&self) -> bool {
        let base_depends = match &self.base {
            CompiledExpression::Pure(op) => op.is_depending_on_subscription(),
            _ => false,
        };
        let step_depends = match &self.step {
            CompiledStep::ConditionFilter(cond) => cond.is_depending_on_subscription(),
            _ => false,
        };
        base_depends || step_depends
    }
}

struct StepStreamOperator {
    base: CompiledExpression,
    step: CompiledStep,
    location: SourceLocation,
}
impl StreamOperator for StepStreamOperator {
    fn subscribe(&self, ctx: EvaluationContext) -> BoxStream<'static, TracedValue> {
        let base_stream = subscribe_any(&self.base, ctx.clone());
        let location = self.location.clone();
        let step = step_clone(&self.step);
        Box::pin(base_stream.map(move |base_tv| {
            let out = apply_step(&base_tv.value, &step, Some(&ctx));
            TracedValue::new(out, Trace::node("step", Some(location.clone()), vec![base_tv.trace]))
        }))
    }
}

fn step_clone(step: &CompiledStep) -> CompiledStep {
    match step {
        CompiledStep::Member(n) => CompiledStep::Member(n.clone()),
        CompiledStep::Index(i) => CompiledStep::Index(*i),
        CompiledStep::Wildcard => CompiledStep::Wildcard,
        CompiledStep::RecursiveDescent => CompiledStep::RecursiveDescent,
        CompiledStep::Slice { start, end } => CompiledStep::Slice { start: *start, end: *end },
        CompiledStep::ConditionFilter(cond) => CompiledStep::ConditionFilter(cond.clone()),
    }
}

// ──────────────────────────────────────────────
// Filter / transform application
// ──────────────────────────────────────────────

enum CompiledFilterStep {
    Member(String),
    Index(i64),
    Wildcard,
    RecursiveDescent,
    ConditionFilter(Arc<dyn PureOperator>),
    Each,
}

fn compile_filter_step(step: &FilterStep, forbid_attributes: bool) -> Result<CompiledFilterStep, CompileError> {
    Ok(match step {
        FilterStep::Member(n) => CompiledFilterStep::Member(n.clone()),
        FilterStep::Index(i) => CompiledFilterStep::Index(*i),
        FilterStep::Wildcard => CompiledFilterStep::Wildcard,
        FilterStep::RecursiveDescent => CompiledFilterStep::RecursiveDescent,
        FilterStep::Each => CompiledFilterStep::Each,
        FilterStep::ConditionFilter(cond) => {
            CompiledFilterStep::ConditionFilter(compile_path_condition(cond, forbid_attributes)?)
        }
    })
}

struct FilterOperator {
    base: CompiledExpression,
    path: Vec<CompiledFilterStep>,
    function: QualifiedName,
    arguments: Vec<CompiledExpression>,
    location: SourceLocation,
}

impl FilterOperator {
    fn apply(&self, base: Value, arg_vals: &[Value], ctx: &EvaluationContext) -> Value {
        if let Some(e) = Value::first_error(std::iter::once(&base).chain(arg_vals.iter())) {
            return e.clone();
        }
        let function = self.function.clone();
        let location = self.location.clone();
        let ctx2 = ctx.clone();
        let arg_vals = arg_vals.to_vec();
        let apply_fn = move |matched: &Value| -> Value {
            let mut call_args = Vec::with_capacity(1 + arg_vals.len());
            call_args.push(matched.clone());
            call_args.extend(arg_vals.iter().cloned());
            invoke_function(&function, &call_args, &ctx2, &location)
        };
        transform_at_path(&base, &self.path, &apply_fn, ctx)
    }
}

impl StreamOperator for FilterOperator {
    fn subscribe(&self, ctx: EvaluationContext) -> BoxStream<'static, TracedValue> {
        let mut streams = vec![subscribe_any(&self.base, ctx.clone())];
        for a in &self.arguments {
            streams.push(subscribe_any(a, ctx.clone()));
        }
        let ctx2 = ctx.clone();
        let this = FilterOperator {
            base: self.base.clone(),
            path: clone_filter_path(&self.path),
            function: self.function.clone(),
            arguments: self.arguments.clone(),
            location: self.location.clone(),
        };
        Box::pin(combine_latest(streams).map(move |mut tvs: Vec<TracedValue>| {
            let base_tv = tvs.remove(0);
            let arg_vals: Vec<Value> = tvs.iter().map(|t| t.value.clone()).collect();
            let traces: Vec<Trace> = std::iter::once(base_tv.trace.clone())
                .chain(tvs.into_iter().map(|t| t.trace))
                .collect();
            let out = this.apply(base_tv.value, &arg_vals, &ctx2);
            TracedValue::new(out, Trace::node("filter", Some(this.location.clone()), traces))
        }))
    }
}

fn clone_filter_path(path: &[CompiledFilterStep]) -> Vec<CompiledFilterStep> {
    path.iter()
        .map(|s| match s {
            CompiledFilterStep::Member(n) => CompiledFilterStep::Member(n.clone()),
            CompiledFilterStep::Index(i) => CompiledFilterStep::Index(*i),
            CompiledFilterStep::Wildcard => CompiledFilterStep::Wildcard,
            CompiledFilterStep::RecursiveDescent => CompiledFilterStep::RecursiveDescent,
            CompiledFilterStep::Each => CompiledFilterStep::Each,
            CompiledFilterStep::ConditionFilter(c) => CompiledFilterStep::ConditionFilter(c.clone()),
        })
        .collect()
}

/// Rebuild `value` with `apply` applied at every location `path` matches,
/// leaving everything else structurally unchanged.
fn transform_at_path(
    value: &Value,
    path: &[CompiledFilterStep],
    apply: &dyn Fn(&Value) -> Value,
    ctx: &EvaluationContext,
) -> Value {
    let (step, rest) = match path.split_first() {
        None => return apply(value),
        Some(pair) => pair,
    };

    match step {
        CompiledFilterStep::Member(name) => match value {
            Value::Object(fields) => {
                let mut out = fields.clone();
                if let Some(v) = fields.get(name) {
                    out.insert(name.clone(), transform_at_path(v, rest, apply, ctx));
                }
                Value::Object(out)
            }
            other => other.clone(),
        },
        CompiledFilterStep::Index(i) => match value {
            Value::Array(items) => {
                let mut out = items.clone();
                if let Some(idx) = normalize_index(*i, out.len()) {
                    out[idx] = transform_at_path(&items[idx], rest, apply, ctx);
                }
                Value::Array(out)
            }
            other => other.clone(),
        },
        CompiledFilterStep::Wildcard | CompiledFilterStep::Each => match value {
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| transform_at_path(v, rest, apply, ctx)).collect())
            }
            Value::Object(fields) => {
                let mut out = fields.clone();
                for (k, v) in fields.iter() {
                    out.insert(k.clone(), transform_at_path(v, rest, apply, ctx));
                }
                Value::Object(out)
            }
            other => other.clone(),
        },
        CompiledFilterStep::RecursiveDescent => transform_recursive(value, rest, apply, ctx),
        CompiledFilterStep::ConditionFilter(cond) => match value {
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| {
                        let item_ctx = ctx.with_variable("@", item.clone());
                        let keep = cond.evaluate(&item_ctx).value.as_bool().unwrap_or(false);
                        if keep {
                            transform_at_path(item, rest, apply, ctx)
                        } else {
                            item.clone()
                        }
                    })
                    .collect(),
            ),
            other => other.clone(),
        },
    }
}

fn transform_recursive(
    value: &Value,
    rest: &[CompiledFilterStep],
    apply: &dyn Fn(&Value) -> Value,
    ctx: &EvaluationContext,
) -> Value {
    let applied_here = transform_at_path(value, rest, apply, ctx);
    match applied_here {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| transform_recursive(v, rest, apply, ctx))
                .collect(),
        ),
        Value::Object(fields) => {
            let mut out = fields.clone();
            for (k, v) in fields.iter() {
                out.insert(k.clone(), transform_recursive(v, rest, apply, ctx));
            }
            Value::Object(out)
        }
        other => other,
    }
}
