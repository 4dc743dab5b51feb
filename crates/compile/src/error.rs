//! Compile-time errors (spec Section 7: surfaced synchronously at policy
//! load, never from evaluation).
//!
//! Grounded on `tenor-storage::StorageError`'s `thiserror` derive style --
//! compile errors are pure plumbing with no need for hand-written
//! `Display` wording per variant, unlike the in-band `EvalError` emulated
//! by `sapl-core::Value::Error` (produced in `sapl-eval::evaluator` and
//! `sapl-eval::decision`, not here).
//!
//! No `EmptyQualifiedName` variant: `QualifiedName::parse`/`from_parts`
//! already reject an empty name at construction, before any AST node can
//! hold one, so the compiler never encounters one. No `ArityMismatch`
//! either: function arity is the `FunctionBroker` collaborator's contract,
//! resolved per-call at evaluation time, not a declaration this crate
//! could check statically against an import.

use sapl_core::SourceLocation;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CompileError {
    #[error("compile error at {location}: schema must be a constant object literal")]
    SchemaMustBeConstant { location: SourceLocation },

    #[error("compile error at {location}: external refs ($ref) are forbidden in enforced schemas")]
    SchemaRefForbidden { location: SourceLocation },

    #[error("compile error at {location}: invalid schema: {message}")]
    InvalidSchema { location: SourceLocation, message: String },

    #[error("compile error at {location}: attribute finder references are not allowed in a target expression")]
    AttributeInTarget { location: SourceLocation },

    #[error("compile error at {location}: attribute finder references are not allowed in a filter/path condition")]
    AttributeInFilterCondition { location: SourceLocation },

    #[error("compile error at {location}: policy-set variable '{name}' must not depend on a live attribute stream")]
    VariableNotPure { location: SourceLocation, name: String },

    #[error("compile error: duplicate import '{name}'")]
    DuplicateImport { name: String },

    #[error("compile error: wildcard import for '{library}' collides with explicit import '{name}'")]
    WildcardImportCollision { library: String, name: String },
}
