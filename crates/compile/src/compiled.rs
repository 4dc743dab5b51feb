//! The compiled, three-stratum representation (spec Section 3/4.2):
//! `CompiledExpression` is a `Value` (constant), a `PureOperator`
//! (synchronous), or a `StreamOperator` (async, lazy, multicast-able).
//!
//! Grounded on `tenor-eval`'s split between `predicate::eval_pred`
//! (synchronous tree-walking evaluator) and `fact_provider::FactProvider`
//! (`async_trait` supplier) -- SAPL's `PureOperator`/`StreamOperator` are
//! that same synchronous/asynchronous split, generalized to trait objects
//! so the compiler can freely mix strata within one expression tree.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::stream::BoxStream;
use sapl_core::{CombiningAlgorithm, PolicyKind, SourceLocation, Value};

// ──────────────────────────────────────────────
// Tracing
// ──────────────────────────────────────────────

/// The evaluation steps that produced a `Value`, for diagnostics (spec
/// Glossary: "Traced Value").
#[derive(Debug, Clone)]
pub struct Trace {
    pub operator: String,
    pub location: Option<SourceLocation>,
    pub children: Vec<Trace>,
}

impl Trace {
    pub fn leaf(operator: impl Into<String>, location: Option<SourceLocation>) -> Self {
        Trace {
            operator: operator.into(),
            location,
            children: Vec::new(),
        }
    }

    pub fn node(
        operator: impl Into<String>,
        location: Option<SourceLocation>,
        children: Vec<Trace>,
    ) -> Self {
        Trace {
            operator: operator.into(),
            location,
            children,
        }
    }
}

/// A `Value` plus the trace that produced it.
#[derive(Debug, Clone)]
pub struct TracedValue {
    pub value: Value,
    pub trace: Trace,
}

impl TracedValue {
    pub fn new(value: Value, trace: Trace) -> Self {
        TracedValue { value, trace }
    }
}

// ──────────────────────────────────────────────
// Subscription & evaluation context
// ──────────────────────────────────────────────

/// The four JSON documents a client submits (spec Section 6). `environment`
/// defaults to an empty object when absent, per spec.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub subject: Value,
    pub action: Value,
    pub resource: Value,
    pub environment: Value,
}

impl Subscription {
    pub fn new(subject: Value, action: Value, resource: Value, environment: Option<Value>) -> Self {
        Subscription {
            subject,
            action,
            resource,
            environment: environment.unwrap_or_else(|| Value::Object(Default::default())),
        }
    }
}

/// Synchronous pure function evaluator, resolved via qualified name (spec
/// Section 6: Function broker).
pub trait FunctionBroker: Send + Sync {
    fn is_provided_function(&self, name: &str) -> bool;
    fn evaluate(&self, name: &str, args: &[Value]) -> Value;
}

/// The Attribute Broker's exposed interface (spec Section 4.3/6). The
/// concrete, stateful implementation lives in `sapl-broker`; this crate
/// only needs the contract so `StreamOperator`s can call it.
pub trait AttributeBroker: Send + Sync {
    fn attribute_stream(&self, invocation: AttributeFinderInvocation) -> BoxStream<'static, TracedValue>;
    fn provided_functions_of_library(&self, library: &str) -> HashSet<String>;
    fn is_provided_function(&self, fully_qualified_name: &str) -> bool;
}

/// `{pdpId, configurationId, evaluationId, subscription, functionBroker,
/// attributeBroker, localVariables, imports}` (spec Section 3).
///
/// Local variables flow downward through nested scopes and are never
/// mutated in place: extending a scope clones the map into a fresh `Arc`.
#[derive(Clone)]
pub struct EvaluationContext {
    pub pdp_id: Arc<str>,
    pub configuration_id: Arc<str>,
    pub evaluation_id: Arc<str>,
    pub subscription: Arc<Subscription>,
    pub function_broker: Arc<dyn FunctionBroker>,
    pub attribute_broker: Arc<dyn AttributeBroker>,
    pub local_variables: Arc<HashMap<String, Value>>,
    pub imports: Arc<ImportTable>,
}

impl EvaluationContext {
    pub fn lookup_variable(&self, name: &str) -> Option<Value> {
        self.local_variables.get(name).cloned()
    }

    /// Returns a new context with `name` bound to `value` in local scope.
    /// Does not mutate `self`.
    pub fn with_variable(&self, name: impl Into<String>, value: Value) -> EvaluationContext {
        let mut vars = (*self.local_variables).clone();
        vars.insert(name.into(), value);
        EvaluationContext {
            local_variables: Arc::new(vars),
            ..self.clone()
        }
    }
}

/// Resolved imports: alias/simple-name -> fully qualified name, plus
/// wildcard-imported libraries.
#[derive(Debug, Clone, Default)]
pub struct ImportTable {
    pub aliases: HashMap<String, String>,
    pub wildcard_libraries: HashSet<String>,
}

// ──────────────────────────────────────────────
// Operators
// ──────────────────────────────────────────────

/// Synchronously evaluates to a `Value` from an `EvaluationContext`.
/// Declares whether it depends on the current subscription (needed for
/// constant folding, spec Section 4.2).
pub trait PureOperator: Send + Sync {
    fn evaluate(&self, ctx: &EvaluationContext) -> TracedValue;
    fn is_depending_on_subscription(&self) -> bool;
}

/// An asynchronous, lazy, multicast-able, restartable-on-fresh-subscribe
/// sequence of `TracedValue`s.
pub trait StreamOperator: Send + Sync {
    fn subscribe(&self, ctx: EvaluationContext) -> BoxStream<'static, TracedValue>;
}

/// The three-stratum compiled form of an expression (spec Section 3).
#[derive(Clone)]
pub enum CompiledExpression {
    Value(Value),
    Pure(Arc<dyn PureOperator>),
    Stream(Arc<dyn StreamOperator>),
}

impl fmt::Debug for CompiledExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompiledExpression::Value(v) => write!(f, "CompiledExpression::Value({:?})", v),
            CompiledExpression::Pure(_) => write!(f, "CompiledExpression::Pure(..)"),
            CompiledExpression::Stream(_) => write!(f, "CompiledExpression::Stream(..)"),
        }
    }
}

impl CompiledExpression {
    pub fn is_depending_on_subscription(&self) -> bool {
        match self {
            CompiledExpression::Value(_) => false,
            CompiledExpression::Pure(op) => op.is_depending_on_subscription(),
            // A StreamOperator is, by construction, either genuinely live
            // (an attribute) or a lifted pure/constant -- in both cases it
            // may vary per subscription, so conservatively true.
            CompiledExpression::Stream(_) => true,
        }
    }
}

// ──────────────────────────────────────────────
// Compiled policies
// ──────────────────────────────────────────────

#[derive(Clone)]
pub struct PrecompiledSchemaValidator {
    pub element: sapl_core::SubscriptionElement,
    pub validator: Arc<jsonschema::Validator>,
    pub location: SourceLocation,
}

impl fmt::Debug for PrecompiledSchemaValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrecompiledSchemaValidator({:?} @ {})", self.element, self.location)
    }
}

#[derive(Clone)]
pub enum CompiledStatement {
    ValueDefinition { name: String, value: CompiledExpression },
    Condition(CompiledExpression),
}

#[derive(Clone)]
pub struct CompiledPolicyRule {
    pub name: String,
    pub entitlement: PolicyKind,
    pub target: Arc<dyn PureOperator>,
    pub body: Vec<CompiledStatement>,
    pub obligation: Option<Arc<dyn StreamOperator>>,
    pub advice: Option<Arc<dyn StreamOperator>>,
    pub transform: Option<Arc<dyn StreamOperator>>,
    pub schemas: Vec<PrecompiledSchemaValidator>,
    /// This document's own import table, resolved at compile time. The
    /// evaluator attaches it to the `EvaluationContext` it builds for this
    /// rule, so qualified-name resolution for functions/attributes stays
    /// scoped per policy document (spec Section 4.2).
    pub imports: Arc<ImportTable>,
}

#[derive(Clone)]
pub struct CompiledPolicySet {
    pub name: String,
    pub variables: Vec<(String, Arc<dyn PureOperator>)>,
    pub algorithm: CombiningAlgorithm,
    pub policies: Vec<CompiledPolicy>,
    pub target: Arc<dyn PureOperator>,
    pub schemas: Vec<PrecompiledSchemaValidator>,
    pub imports: Arc<ImportTable>,
}

#[derive(Clone)]
pub enum CompiledPolicy {
    Set(CompiledPolicySet),
    Rule(CompiledPolicyRule),
}

impl CompiledPolicy {
    pub fn name(&self) -> &str {
        match self {
            CompiledPolicy::Set(s) => &s.name,
            CompiledPolicy::Rule(r) => &r.name,
        }
    }
}
