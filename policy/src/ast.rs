//! Parsed structure of a Cedar document, before any semantic mapping.
//!
//! Deliberately a plain struct-per-node-kind AST (no dynamic reflection):
//! the linter and transpiler visit it with explicit match arms, per the
//! design note about replacing reflective AST walks with a structured
//! visitor.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Permit,
    Forbid,
}

/// `Type::"id"`, e.g. `File::"/etc/passwd"` or `Net::Hostname::"example.com"`.
/// `ty` is the dotted type path joined with `::` (e.g. `"Net::Hostname"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRef {
    pub ty: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrincipalClause {
    /// Bare `principal`, matching any principal.
    Any,
    /// Any other shape (`principal == X`, `principal in X`), which this
    /// runtime cannot differentiate on, hence `unsupported_principal`.
    Constrained,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionClause {
    /// `Some(entity)` for `action == Action::"X"`. `None` for bare `action`.
    pub entity: Option<EntityRef>,
    /// True when the clause used a shape other than `action == Action::"X"`
    /// (e.g. `action in [...]`), which is parsed permissively but flagged.
    pub non_canonical: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceClause {
    /// `Some(list)` for `resource in [...]`. `None` for bare `resource`.
    pub entities: Option<Vec<EntityRef>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    When,
    Unless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Equals,
    Like,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    And(Vec<Expr>),
    ResourceIn(Vec<EntityRef>),
    ContextCmp { key: String, op: CmpOp, value: String },
    /// Anything not matching one of the two supported condition shapes.
    /// Carries the raw token text for lint messages.
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionBlock {
    pub kind: ConditionKind,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub id: String,
    pub effect: Effect,
    pub principal: PrincipalClause,
    pub action: ActionClause,
    pub resource: ResourceClause,
    pub conditions: Vec<ConditionBlock>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    pub policies: Vec<Policy>,
}
