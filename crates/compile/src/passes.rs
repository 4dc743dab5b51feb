//! Compiler passes that do not walk `Expression` trees directly: import
//! resolution, qualified-name candidate generation, stratum lifting, and
//! schema precompilation (spec Section 4.2/4.3). `lower.rs` is the pass
//! that *does* walk `Expression` trees; these are its supporting utilities,
//! split out the way `tenor-core`'s `pass4_typecheck` leans on free
//! functions in `pass4_typecheck::support` rather than inlining everything
//! into one recursive descent.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use sapl_core::{Import, QualifiedName, SourceLocation};

use crate::compiled::{
    CompiledExpression, EvaluationContext, ImportTable, PrecompiledSchemaValidator, PureOperator,
    StreamOperator, Trace, TracedValue,
};
use crate::error::CompileError;

/// Resolve `import` statements into an `ImportTable` (spec Section 4.2:
/// "policy documents may import functions and attribute finders, either by
/// full name, by alias, or as a library wildcard").
pub fn build_import_table(imports: &[Import]) -> Result<ImportTable, CompileError> {
    let mut table = ImportTable::default();

    for import in imports {
        let is_wildcard = import.qualified_name.simple_name() == "*";

        if is_wildcard {
            let library = import.qualified_name.library();
            if table.aliases.contains_key(&library) {
                return Err(CompileError::WildcardImportCollision {
                    library: library.clone(),
                    name: library,
                });
            }
            table.wildcard_libraries.insert(library);
            continue;
        }

        let key = import
            .alias
            .clone()
            .unwrap_or_else(|| import.qualified_name.simple_name().to_string());
        let full = import.qualified_name.full_name();

        if table.aliases.insert(key.clone(), full).is_some() {
            return Err(CompileError::DuplicateImport { name: key });
        }
        if table.wildcard_libraries.contains(&key) {
            return Err(CompileError::WildcardImportCollision { library: key.clone(), name: key });
        }
    }

    Ok(table)
}

/// The ordered list of fully-qualified candidates a bare or aliased
/// `QualifiedName` reference could resolve to: alias first, then each
/// wildcard-imported library (sorted for determinism), then the name
/// itself verbatim as a last resort. Multi-part names (already fully
/// qualified in the source) have exactly one candidate: themselves.
pub fn candidate_names(name: &QualifiedName, imports: &ImportTable) -> Vec<String> {
    let parts = name.parts();
    if parts.len() != 1 {
        return vec![name.full_name()];
    }

    let simple = &parts[0];
    let mut out = Vec::new();
    if let Some(full) = imports.aliases.get(simple) {
        out.push(full.clone());
    }
    let mut libraries: Vec<&String> = imports.wildcard_libraries.iter().collect();
    libraries.sort();
    for library in libraries {
        out.push(format!("{}.{}", library, simple));
    }
    out.push(simple.clone());
    out
}

/// Pick the first candidate `is_provided` accepts, falling back to the last
/// candidate (so an unresolved reference still carries a sensible name into
/// its runtime error message).
pub fn resolve_against(candidates: &[String], is_provided: impl Fn(&str) -> bool) -> String {
    candidates
        .iter()
        .find(|c| is_provided(c))
        .cloned()
        .unwrap_or_else(|| candidates.last().cloned().expect("candidate_names never returns empty"))
}

// ──────────────────────────────────────────────
// Stratum lifting (spec Section 4.2)
// ──────────────────────────────────────────────

struct ConstantStreamOperator {
    expr: CompiledExpression,
}

impl StreamOperator for ConstantStreamOperator {
    fn subscribe(&self, ctx: EvaluationContext) -> BoxStream<'static, TracedValue> {
        match &self.expr {
            CompiledExpression::Value(v) => {
                futures::stream::once(futures::future::ready(TracedValue::new(
                    v.clone(),
                    Trace::leaf("const", None),
                )))
                .boxed()
            }
            CompiledExpression::Pure(op) => {
                let tv = op.evaluate(&ctx);
                futures::stream::once(futures::future::ready(tv)).boxed()
            }
            CompiledExpression::Stream(_) => unreachable!("ConstantStreamOperator over a Stream"),
        }
    }
}

/// Lift a `CompiledExpression` of any stratum into a `StreamOperator`: a
/// constant becomes a one-shot stream of itself (`ConstantStream`); a pure
/// operator becomes a one-shot stream that evaluates once per subscription
/// (`PureToStream`); a stream passes through unchanged. Used wherever the
/// compiled form requires a uniform Stream stratum -- obligation, advice,
/// transform, and as a building block inside n-ary stream operators.
pub fn lift_to_stream(expr: CompiledExpression) -> Arc<dyn StreamOperator> {
    match expr {
        CompiledExpression::Stream(op) => op,
        other => Arc::new(ConstantStreamOperator { expr: other }),
    }
}

/// Evaluate a Value/Pure child synchronously. Panics if handed a Stream --
/// callers are expected to have already dispatched on stratum.
pub fn eval_pure_child(expr: &CompiledExpression, ctx: &EvaluationContext) -> TracedValue {
    match expr {
        CompiledExpression::Value(v) => TracedValue::new(v.clone(), Trace::leaf("const", None)),
        CompiledExpression::Pure(op) => op.evaluate(ctx),
        CompiledExpression::Stream(_) => unreachable!("stream child where only Value/Pure expected"),
    }
}

/// Subscribe to any stratum as a `BoxStream`, lifting Value/Pure children
/// into one-shot streams as needed.
pub fn subscribe_any(expr: &CompiledExpression, ctx: EvaluationContext) -> BoxStream<'static, TracedValue> {
    match expr {
        CompiledExpression::Value(v) => {
            futures::stream::once(futures::future::ready(TracedValue::new(
                v.clone(),
                Trace::leaf("const", None),
            )))
            .boxed()
        }
        CompiledExpression::Pure(op) => {
            let tv = op.evaluate(&ctx);
            futures::stream::once(futures::future::ready(tv)).boxed()
        }
        CompiledExpression::Stream(op) => op.subscribe(ctx),
    }
}

// ──────────────────────────────────────────────
// Schema precompilation (spec Section 4.3)
// ──────────────────────────────────────────────

/// Precompile one `where schema <expr> enforced` clause. The schema
/// expression must already have folded to a constant `Value::Object`
/// (callers enforce this by compiling it with no subscription in scope);
/// `$ref` is forbidden so a compiled policy never depends on network
/// fetches at evaluation time.
pub fn compile_schema(
    element: sapl_core::SubscriptionElement,
    location: &SourceLocation,
    compiled: CompiledExpression,
) -> Result<PrecompiledSchemaValidator, CompileError> {
    let value = match compiled {
        CompiledExpression::Value(v) => v,
        _ => {
            return Err(CompileError::SchemaMustBeConstant {
                location: location.clone(),
            })
        }
    };

    let sapl_core::Value::Object(_) = &value else {
        return Err(CompileError::SchemaMustBeConstant {
            location: location.clone(),
        });
    };

    let json = value.to_json().map_err(|e| CompileError::InvalidSchema {
        location: location.clone(),
        message: e.0,
    })?;

    if contains_ref(&json) {
        return Err(CompileError::SchemaRefForbidden {
            location: location.clone(),
        });
    }

    let validator = jsonschema::validator_for(&json).map_err(|e| CompileError::InvalidSchema {
        location: location.clone(),
        message: e.to_string(),
    })?;

    Ok(PrecompiledSchemaValidator {
        element,
        validator: Arc::new(validator),
        location: location.clone(),
    })
}

fn contains_ref(json: &serde_json::Value) -> bool {
    match json {
        serde_json::Value::Object(fields) => {
            fields.contains_key("$ref") || fields.values().any(contains_ref)
        }
        serde_json::Value::Array(items) => items.iter().any(contains_ref),
        _ => false,
    }
}
