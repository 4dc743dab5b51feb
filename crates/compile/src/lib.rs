//! sapl-compile: lowers `sapl_core::ast` into the three-stratum
//! `CompiledExpression` form (spec Section 2/4.2).
//!
//! `lower::compile_expr` walks the AST once, bottom-up; constant folding and
//! stratum lifting happen inline as each node is built rather than as
//! separate tree-rewrite passes (see `lower`'s module doc for why). Import
//! resolution and schema precompilation, which don't walk `Expression` trees
//! at all, live in `passes` instead. This mirrors the teacher's pass-oriented
//! compiler (`pass3_types` -> `pass4_typecheck` -> `pass5_validate`) in
//! spirit -- distinct concerns in distinct modules -- without literally
//! replaying its separate-pass structure, since SAPL's compiler is smaller
//! in scope than Tenor's six-pass elaborator.

pub mod compiled;
pub mod error;
pub mod invocation;
pub mod lower;
pub mod passes;
pub mod stream_util;

pub use compiled::{
    AttributeBroker, CompiledExpression, CompiledPolicy, CompiledPolicyRule, CompiledPolicySet,
    CompiledStatement, EvaluationContext, FunctionBroker, ImportTable, PrecompiledSchemaValidator,
    PureOperator, StreamOperator, Subscription, Trace, TracedValue,
};
pub use error::CompileError;
pub use invocation::{AttributeFinderInvocation, AttributeFinderSpecification, InnerArity, ValueValidator};
pub use lower::compile_policy_document;
