//! Syntax tree for Manifest source.

use serde::{Deserialize, Serialize};

use crate::diagnostics::Span;
use crate::ir::Severity;

/// Parsed program: every top-level declaration in source order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub entities: Vec<EntityDecl>,
    /// Top-level commands (`command x(..) for Entity { .. }`).
    pub commands: Vec<CommandDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDecl {
    pub name: String,
    pub properties: Vec<PropertyDecl>,
    /// Entity-level rules, applied to every command the entity owns.
    pub constraints: Vec<ConstraintDecl>,
    pub commands: Vec<CommandDecl>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Number,
    Boolean,
    List,
    Map,
}

impl DataType {
    pub fn parse(name: &str) -> Option<DataType> {
        match name {
            "string" => Some(DataType::String),
            "number" => Some(DataType::Number),
            "boolean" => Some(DataType::Boolean),
            "list" => Some(DataType::List),
            "map" => Some(DataType::Map),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyModifier {
    Required,
    Optional,
    Unique,
    Indexed,
    Readonly,
}

impl PropertyModifier {
    pub fn parse(name: &str) -> Option<PropertyModifier> {
        match name {
            "required" => Some(PropertyModifier::Required),
            "optional" => Some(PropertyModifier::Optional),
            "unique" => Some(PropertyModifier::Unique),
            "indexed" => Some(PropertyModifier::Indexed),
            "readonly" => Some(PropertyModifier::Readonly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDecl {
    pub name: String,
    pub data_type: DataType,
    pub modifiers: Vec<PropertyModifier>,
    pub default: Option<Literal>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDecl {
    pub name: String,
    /// `for Entity` owner. `None` on commands nested in an entity block,
    /// whose owner is the enclosing entity.
    pub owner: Option<String>,
    pub params: Vec<ParamDecl>,
    pub constraints: Vec<ConstraintDecl>,
    pub emits: Vec<EmitDecl>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDecl {
    pub name: String,
    pub data_type: DataType,
    pub optional: bool,
    pub default: Option<Literal>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintDecl {
    pub name: String,
    pub severity: Severity,
    pub expr: Expr,
    pub message: Option<String>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitDecl {
    /// Dotted event type, e.g. `kitchen.task.claimed`.
    pub event_type: String,
    pub span: Span,
}

/// Literal values usable as defaults and inside expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

impl Literal {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Literal::Null => serde_json::Value::Null,
            Literal::Bool(b) => serde_json::Value::Bool(*b),
            Literal::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Literal::Str(s) => serde_json::Value::String(s.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
    In,
    Contains,
}

/// Constraint expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Literal {
        value: Literal,
    },
    Ident {
        name: String,
    },
    Member {
        object: Box<Expr>,
        property: String,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}
