//! SAPL AST: policy documents, expressions, path-navigation steps, filter
//! path elements, and imports (spec Section 2/3, AST bullet).
//!
//! This is the *target* shape a (deliberately out-of-scope, per spec
//! Section 1) textual-grammar parser would produce. Nothing in this crate
//! parses `.sapl` source; policies are built as `PolicyDocument` values
//! directly, then lowered by `sapl-compile`.
//!
//! Grounded on `tenor-core::ast`'s Raw* hierarchy (`RawConstruct`,
//! `RawExpr`, `RawTerm`, `Provenance`): a sealed, source-location-carrying
//! tree produced ahead of any later pass. SAPL's AST has no `RawType`
//! counterpart -- SAPL is untyped at the policy-document level (typing
//! only appears in JSON-Schema-based enforcement, modeled separately as
//! `SchemaExpression`).

use crate::qualified_name::QualifiedName;
use crate::source::SourceLocation;
use crate::value::Value;

// ──────────────────────────────────────────────
// Policy documents
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Permit,
    Deny,
}

/// The six pure reduction functions over a list of per-document decisions
/// (spec Section 4.5). The variant names match the spec's table exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CombiningAlgorithm {
    DenyOverrides,
    PermitOverrides,
    FirstApplicable,
    OnlyOneApplicable,
    DenyUnlessPermit,
    PermitUnlessDeny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionElement {
    Subject,
    Action,
    Resource,
    Environment,
}

/// `where schema <expr> enforced` on one subscription element. Multiple
/// enforced schemas on one element combine conjunctively (spec Section 4.2).
#[derive(Debug, Clone)]
pub struct SchemaExpression {
    pub element: SubscriptionElement,
    pub schema: Expression,
    pub location: SourceLocation,
}

/// A statement in a policy rule body: either a local value definition or a
/// boolean condition (spec Section 4.4).
#[derive(Debug, Clone)]
pub enum Statement {
    ValueDefinition {
        name: String,
        value: Expression,
        location: SourceLocation,
    },
    Condition(Expression),
}

#[derive(Debug, Clone)]
pub enum PolicyBody {
    Set {
        algorithm: CombiningAlgorithm,
        variables: Vec<(String, Expression)>,
        policies: Vec<PolicyDocument>,
        target: Expression,
        schemas: Vec<SchemaExpression>,
    },
    Rule {
        entitlement: PolicyKind,
        target: Expression,
        body: Vec<Statement>,
        obligation: Option<Expression>,
        advice: Option<Expression>,
        transform: Option<Expression>,
        schemas: Vec<SchemaExpression>,
    },
}

#[derive(Debug, Clone)]
pub struct PolicyDocument {
    pub name: String,
    pub imports: Vec<Import>,
    pub body: PolicyBody,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct Import {
    pub qualified_name: QualifiedName,
    /// `import lib.name as alias`; wildcard imports (`import lib.*`) are
    /// represented by a `QualifiedName` whose simple name is `"*"`.
    pub alias: Option<String>,
    pub location: SourceLocation,
}

// ──────────────────────────────────────────────
// Path navigation steps
// ──────────────────────────────────────────────

/// A single path-navigation step applied to a base expression, e.g. the
/// `.field`, `[2]`, `[*]`, `..`, or `[?(@.x > 5)]` suffixes of a SAPL
/// expression.
#[derive(Debug, Clone)]
pub enum Step {
    Member(String),
    Index(i64),
    Wildcard,
    RecursiveDescent,
    Slice {
        start: Option<i64>,
        end: Option<i64>,
    },
    /// `[?(<condition>)]` -- condition is evaluated with `@` bound to each
    /// candidate element.
    ConditionFilter(Box<Expression>),
}

/// A path element used specifically inside a `transform`/filter expression
/// (spec: "filter path elements" as its own AST category, distinct from
/// ordinary navigation steps because a filter element also names the
/// function applied at that path). Structurally identical to `Step`; kept
/// as its own type because filter semantics (apply-in-place vs. navigate)
/// differ at the compiler/evaluator boundary.
#[derive(Debug, Clone)]
pub enum FilterStep {
    Member(String),
    Index(i64),
    Wildcard,
    RecursiveDescent,
    ConditionFilter(Box<Expression>),
    /// `each` -- apply the filter function to every element instead of
    /// replacing the container itself.
    Each,
}

// ──────────────────────────────────────────────
// Expressions
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Regex,
}

#[derive(Debug, Clone)]
pub enum Expression {
    /// A literal value. Only JSON-compatible Values are legal here
    /// (enforced by the compiler, not the AST) -- no `Undefined`/`Error`
    /// literals.
    Literal { value: Value, location: SourceLocation },

    /// One of `subject` / `action` / `resource` / `environment`.
    SubscriptionElement {
        element: SubscriptionElement,
        location: SourceLocation,
    },

    /// A local variable reference (policy-set variable, value definition,
    /// or `forall`-bound-style local).
    Variable { name: String, location: SourceLocation },

    /// `<library.name(args...)>` or `<entity.library.name(args...)>` --
    /// an attribute finder invocation.
    AttributeFinderRef {
        name: QualifiedName,
        entity: Option<Box<Expression>>,
        arguments: Vec<Expression>,
        location: SourceLocation,
    },

    /// A pure function call resolved via the function broker.
    FunctionCall {
        name: QualifiedName,
        arguments: Vec<Expression>,
        location: SourceLocation,
    },

    Unary {
        op: UnaryOperator,
        operand: Box<Expression>,
        location: SourceLocation,
    },

    Binary {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
        location: SourceLocation,
    },

    /// `condition ? if_true : if_false`
    Conditional {
        condition: Box<Expression>,
        if_true: Box<Expression>,
        if_false: Box<Expression>,
        location: SourceLocation,
    },

    ArrayLiteral {
        items: Vec<Expression>,
        location: SourceLocation,
    },

    ObjectLiteral {
        fields: Vec<(String, Expression)>,
        location: SourceLocation,
    },

    /// `base.step` / `base[step]` / `base..` / etc.
    Step {
        base: Box<Expression>,
        step: Step,
        location: SourceLocation,
    },

    /// A `filter` application: walk `base` through `path`, applying
    /// `function(arguments, ..)` at the matched location(s).
    Filter {
        base: Box<Expression>,
        path: Vec<FilterStep>,
        function: QualifiedName,
        arguments: Vec<Expression>,
        location: SourceLocation,
    },
}

impl Expression {
    pub fn location(&self) -> &SourceLocation {
        match self {
            Expression::Literal { location, .. }
            | Expression::SubscriptionElement { location, .. }
            | Expression::Variable { location, .. }
            | Expression::AttributeFinderRef { location, .. }
            | Expression::FunctionCall { location, .. }
            | Expression::Unary { location, .. }
            | Expression::Binary { location, .. }
            | Expression::Conditional { location, .. }
            | Expression::ArrayLiteral { location, .. }
            | Expression::ObjectLiteral { location, .. }
            | Expression::Step { location, .. }
            | Expression::Filter { location, .. } => location,
        }
    }
}
