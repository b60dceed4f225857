//! Policy DSL syntax tree.
//!
//! Every node carries the source range it spans so that the compiler can
//! anchor diagnostics to it.

use std::fmt;

use crate::span::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralKind {
    String,
    Integer,
    Boolean,
}

impl fmt::Display for LiteralKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        })
    }
}

/// A literal with its raw (already unescaped) value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Literal {
    pub kind: LiteralKind,
    pub value: String,
    pub range: Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Modulo => "%",
        })
    }
}

/// Arithmetic over literals. Only ever seen transiently: the parser folds
/// every expression into a single [`Literal`] before building the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Literal(Literal),
    Binary {
        operator: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
        range: Range,
    },
}

impl Expression {
    #[must_use]
    pub const fn range(&self) -> Range {
        match self {
            Self::Literal(literal) => literal.range,
            Self::Binary { range, .. } => *range,
        }
    }
}

/// One `identifier expression` entry of a `module { ... }` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleProperty {
    pub name: String,
    pub value: Literal,
    pub range: Range,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleBlock {
    pub properties: Vec<ModuleProperty>,
    pub range: Range,
}

impl ModuleBlock {
    /// Last declaration of `name`, if any.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&ModuleProperty> {
        self.properties.iter().rev().find(|p| p.name == name)
    }
}

/// `type <identifier>` inside a `require` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequireType {
    pub identifier: String,
    pub range: Range,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequireBlock {
    pub types: Vec<RequireType>,
    pub range: Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Allow,
    Deny,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        })
    }
}

/// Rule target: a named type or the `*` wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Wildcard,
    Type(String),
}

/// An identifier together with where it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    pub name: String,
    pub range: Range,
}

/// `allow|deny <subject> <target|*> { Permission, ... }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowDeny {
    pub kind: RuleKind,
    pub subject: Ident,
    pub target: Target,
    pub target_range: Range,
    pub permissions: Vec<Ident>,
    pub range: Range,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Module(ModuleBlock),
    Require(RequireBlock),
    AllowDeny(AllowDeny),
}

impl Statement {
    #[must_use]
    pub const fn range(&self) -> Range {
        match self {
            Self::Module(node) => node.range,
            Self::Require(node) => node.range,
            Self::AllowDeny(node) => node.range,
        }
    }
}

/// A parsed source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    pub statements: Vec<Statement>,
    pub range: Range,
}
