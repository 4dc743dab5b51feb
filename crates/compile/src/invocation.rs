//! Attribute finder specifications and invocations (spec Section 3). These
//! are pure data -- the re-architecture spec Section 9 calls for:
//! "explicit AttributeFinderSpecification values plus a plain function
//! pointer / trait object passed at registration. No runtime reflection;
//! finders are data."

use std::collections::HashMap;

use sapl_core::Value;

/// How many positional arguments (after any entity) a finder accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerArity {
    Fixed(usize),
    Variadic,
}

/// A validator for one argument position (or the entity, or the variadic
/// element type). Kept as a plain function pointer per spec Section 9 --
/// no schema-object indirection needed at this layer.
pub type ValueValidator = fn(&Value) -> bool;

/// Registered once per finder; immutable thereafter (spec Section 3).
#[derive(Clone)]
pub struct AttributeFinderSpecification {
    pub fully_qualified_name: String,
    pub is_environment_attribute: bool,
    pub inner_arity: InnerArity,
    pub takes_variables: bool,
    pub entity_validator: Option<ValueValidator>,
    pub parameter_validators: Vec<ValueValidator>,
}

impl AttributeFinderSpecification {
    pub fn validate_entity(&self, entity: Option<&Value>) -> bool {
        match (&self.entity_validator, entity) {
            (None, _) => true,
            (Some(v), Some(e)) => v(e),
            (Some(_), None) => self.is_environment_attribute,
        }
    }

    pub fn validate_arguments(&self, arguments: &[Value]) -> bool {
        match self.inner_arity {
            InnerArity::Fixed(n) => {
                if arguments.len() != n {
                    return false;
                }
                arguments
                    .iter()
                    .zip(self.parameter_validators.iter())
                    .all(|(arg, validator)| validator(arg))
            }
            InnerArity::Variadic => {
                let validator = match self.parameter_validators.first() {
                    Some(v) => *v,
                    None => return true,
                };
                arguments.iter().all(|arg| validator(arg))
            }
        }
    }
}

/// The cache key for the Attribute Broker (spec Section 3): identity is
/// structural equality of all fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeFinderInvocation {
    pub config_id: String,
    pub fully_qualified_name: String,
    pub entity: Option<Value>,
    pub arguments: Vec<Value>,
    pub variables: HashMap<String, Value>,
    pub initial_timeout_millis: u64,
    pub freshness_ttl_millis: u64,
    pub poll_interval_millis: Option<u64>,
    pub backoff_budget: u32,
    pub request_initial_only: bool,
}
