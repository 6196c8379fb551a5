//! Compiled representation consumed by the runtime.
//!
//! The IR is an immutable, serializable artifact: a new deployment
//! recompiles, a running process never patches it. `BTreeMap` keys and
//! struct field order keep its canonical JSON stable, which is what the
//! digest (and compile determinism) rely on.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::ast::{DataType, Expr, Literal};

/// Ordered constraint severities. `Block` and `Fatal` fail a command;
/// `Info` and `Warn` are advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Block,
    Fatal,
}

impl Severity {
    /// Severities that fail the command.
    pub fn blocks(self) -> bool {
        matches!(self, Severity::Block | Severity::Fatal)
    }

    pub fn parse(name: &str) -> Option<Severity> {
        match name {
            "info" => Some(Severity::Info),
            "warn" => Some(Severity::Warn),
            "block" => Some(Severity::Block),
            "fatal" => Some(Severity::Fatal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ir {
    pub entities: BTreeMap<String, IrEntity>,
    /// SHA-256 over the canonical JSON of `entities`.
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrEntity {
    pub name: String,
    pub properties: Vec<IrProperty>,
    pub commands: Vec<IrCommand>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrProperty {
    pub name: String,
    pub data_type: DataType,
    pub required: bool,
    pub default: Option<Literal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrCommand {
    pub name: String,
    /// Owning entity name. Always set by the generator; the ownership
    /// pass rejects IR where this disagrees with the holding entity.
    pub entity: String,
    pub params: Vec<IrParam>,
    /// Entity-level rules first, then command rules, declaration order.
    pub constraints: Vec<IrConstraint>,
    pub events: Vec<IrEventTemplate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrParam {
    pub name: String,
    pub data_type: DataType,
    pub optional: bool,
    pub default: Option<Literal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrConstraint {
    pub rule: String,
    pub severity: Severity,
    pub expr: Expr,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrEventTemplate {
    pub event_type: String,
}

/// Result of resolving a command name against the IR.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandLookup<'a> {
    Found(&'a IrCommand),
    NotFound,
    UnknownEntity,
    /// The bare name exists on several entities; callers must pass one.
    Ambiguous(Vec<String>),
}

impl Ir {
    /// Resolve a command by name, optionally pinned to an entity.
    pub fn resolve(&self, command: &str, entity: Option<&str>) -> CommandLookup<'_> {
        match entity {
            Some(owner) => match self.entities.get(owner) {
                None => CommandLookup::UnknownEntity,
                Some(e) => e
                    .commands
                    .iter()
                    .find(|c| c.name == command)
                    .map(CommandLookup::Found)
                    .unwrap_or(CommandLookup::NotFound),
            },
            None => {
                let matches: Vec<&IrCommand> = self
                    .entities
                    .values()
                    .flat_map(|e| e.commands.iter())
                    .filter(|c| c.name == command)
                    .collect();
                match matches.len() {
                    0 => CommandLookup::NotFound,
                    1 => CommandLookup::Found(matches[0]),
                    _ => CommandLookup::Ambiguous(
                        matches.into_iter().map(|c| c.entity.clone()).collect(),
                    ),
                }
            }
        }
    }

    /// Deterministic digest over the entity table.
    pub fn compute_digest(entities: &BTreeMap<String, IrEntity>) -> String {
        let bytes = serde_json::to_vec(entities).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(name: &str, entity: &str) -> IrCommand {
        IrCommand {
            name: name.to_string(),
            entity: entity.to_string(),
            params: vec![],
            constraints: vec![],
            events: vec![],
        }
    }

    fn ir_with(entities: Vec<IrEntity>) -> Ir {
        let entities: BTreeMap<String, IrEntity> =
            entities.into_iter().map(|e| (e.name.clone(), e)).collect();
        let digest = Ir::compute_digest(&entities);
        Ir { entities, digest }
    }

    #[test]
    fn test_resolve_unique_name_without_entity() {
        let ir = ir_with(vec![IrEntity {
            name: "Task".to_string(),
            properties: vec![],
            commands: vec![command("claim", "Task")],
        }]);

        match ir.resolve("claim", None) {
            CommandLookup::Found(c) => assert_eq!(c.entity, "Task"),
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_collision_requires_entity() {
        let ir = ir_with(vec![
            IrEntity {
                name: "Task".to_string(),
                properties: vec![],
                commands: vec![command("archive", "Task")],
            },
            IrEntity {
                name: "Menu".to_string(),
                properties: vec![],
                commands: vec![command("archive", "Menu")],
            },
        ]);

        match ir.resolve("archive", None) {
            CommandLookup::Ambiguous(owners) => assert_eq!(owners.len(), 2),
            other => panic!("expected Ambiguous, got {other:?}"),
        }
        match ir.resolve("archive", Some("Menu")) {
            CommandLookup::Found(c) => assert_eq!(c.entity, "Menu"),
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_unknown_entity_and_command() {
        let ir = ir_with(vec![]);
        assert_eq!(ir.resolve("x", Some("Nope")), CommandLookup::UnknownEntity);
        assert_eq!(ir.resolve("x", None), CommandLookup::NotFound);
    }

    #[test]
    fn test_severity_ordering_and_blocking() {
        assert!(Severity::Info < Severity::Warn);
        assert!(Severity::Warn < Severity::Block);
        assert!(Severity::Block < Severity::Fatal);
        assert!(!Severity::Warn.blocks());
        assert!(Severity::Block.blocks());
        assert!(Severity::Fatal.blocks());
    }

    #[test]
    fn test_digest_is_stable() {
        let a = ir_with(vec![IrEntity {
            name: "Task".to_string(),
            properties: vec![],
            commands: vec![command("claim", "Task")],
        }]);
        let b = ir_with(vec![IrEntity {
            name: "Task".to_string(),
            properties: vec![],
            commands: vec![command("claim", "Task")],
        }]);
        assert_eq!(a.digest, b.digest);

        let c = ir_with(vec![IrEntity {
            name: "Task".to_string(),
            properties: vec![],
            commands: vec![command("release", "Task")],
        }]);
        assert_ne!(a.digest, c.digest);
    }
}
