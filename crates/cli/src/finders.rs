//! Demo collaborators for `sapl eval`: a function broker that rejects
//! every call (no pure functions are built into the engine itself, spec
//! Section 6: the function broker is a collaborator) and a loader that
//! registers a flat JSON file of `qualified.name -> constant value` pairs
//! as environment-attribute finders on a real `sapl_broker::AttributeBroker`.
//!
//! Grounded on `tenor-eval::adapter::static_adapter`, the teacher's
//! simplest `FactProvider`: answer from an in-memory map rather than a
//! live source. There is no streaming counterpart here because a flat
//! JSON file has no notion of "new value arrives later" -- every attribute
//! it can answer is already fully known, so `FnFinder` (one-shot) is
//! always the right wrapper, never `StreamFinder`.

use std::collections::HashMap;
use std::sync::Arc;

use sapl_broker::{AttributeBroker, BrokerError};
use sapl_compile::{AttributeFinderSpecification, FunctionBroker, InnerArity};
use sapl_core::Value;

/// No function broker is wired up for the CLI demo; every `<lib.fn(...)>`
/// call fails closed rather than silently succeeding, so a missing
/// registration surfaces as `indeterminate` instead of a wrong answer.
pub struct NoFunctionBroker;

impl FunctionBroker for NoFunctionBroker {
    fn is_provided_function(&self, _name: &str) -> bool {
        false
    }

    fn evaluate(&self, name: &str, _args: &[Value]) -> Value {
        Value::error(format!("no function broker configured for '{}'", name), None)
    }
}

/// Read `path` as a JSON object mapping fully-qualified attribute names to
/// constant values, and register one finder per entry on `broker`. Every
/// registered attribute takes no entity and no arguments -- the flat file
/// format has no way to express either.
pub async fn load_static_finders(
    broker: &AttributeBroker,
    path: &std::path::Path,
) -> std::io::Result<Result<(), BrokerError>> {
    let contents = std::fs::read_to_string(path)?;
    let json: serde_json::Value = serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let entries = match json.as_object() {
        Some(obj) => obj.clone(),
        None => HashMap::new().into_iter().collect(),
    };

    for (name, json_value) in entries {
        let value = Value::from_json(&json_value);
        let spec = AttributeFinderSpecification {
            fully_qualified_name: name.clone(),
            is_environment_attribute: true,
            inner_arity: InnerArity::Fixed(0),
            takes_variables: false,
            entity_validator: None,
            parameter_validators: Vec::new(),
        };
        let finder = Arc::new(sapl_broker::FnFinder(move |_args: &[Value]| value.clone()));
        if let Err(e) = broker.register_attribute_finder(spec, finder).await {
            return Ok(Err(e));
        }
    }
    Ok(Ok(()))
}
