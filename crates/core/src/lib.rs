//! sapl-core: the value model, AST, and source-location types shared by
//! the rest of the SAPL evaluation engine.
//!
//! Nothing in this crate evaluates anything -- it only defines the data
//! that the compiler (`sapl-compile`) lowers and the evaluator
//! (`sapl-eval`) walks.

pub mod ast;
pub mod qualified_name;
pub mod source;
pub mod value;

pub use ast::{
    BinaryOperator, CombiningAlgorithm, Expression, FilterStep, Import, PolicyBody,
    PolicyDocument, PolicyKind, SchemaExpression, Statement, Step, SubscriptionElement,
    UnaryOperator,
};
pub use qualified_name::QualifiedName;
pub use source::SourceLocation;
pub use value::Value;
