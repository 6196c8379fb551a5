//! Command-ownership validation.
//!
//! Runtime lookup-by-name is only sound when every command is attached
//! to exactly one owning entity. IR from [`crate::lower::compile`] holds
//! that invariant by construction; this pass is the trust boundary for
//! IR that arrives any other way: deserialized from a cache, or built by
//! hand in a test fixture. It validates and rejects. It never installs
//! an owner: any repair heuristic would pick an arbitrary entity and
//! make later lookups silently wrong.

use std::collections::BTreeSet;
use tracing::debug;

use crate::error::OwnershipError;
use crate::ir::Ir;

/// Validate that every command in `ir` has exactly one consistent owner.
///
/// Returns the IR unchanged on success so callers can chain
/// `compile(..)` → `enforce(..)` → engine load.
pub fn enforce(ir: Ir) -> Result<Ir, OwnershipError> {
    for (key, entity) in &ir.entities {
        if key != &entity.name {
            return Err(OwnershipError::EntityKeyMismatch {
                key: key.clone(),
                name: entity.name.clone(),
            });
        }

        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for command in &entity.commands {
            if command.entity.is_empty() {
                return Err(OwnershipError::Unowned {
                    command: command.name.clone(),
                });
            }
            if command.entity != entity.name {
                return Err(OwnershipError::OwnerMismatch {
                    command: command.name.clone(),
                    holder: entity.name.clone(),
                    declared: command.entity.clone(),
                });
            }
            if !seen.insert(command.name.as_str()) {
                return Err(OwnershipError::DuplicateCommand {
                    entity: entity.name.clone(),
                    command: command.name.clone(),
                });
            }
        }
    }

    debug!(entities = ir.entities.len(), "ownership validated");
    Ok(ir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::compile;

    fn compiled() -> Ir {
        compile(
            r#"
            entity Task {
              command claim() {}
              command release() {}
            }
            entity Menu {
              command archive() {}
            }
            "#,
        )
        .ir
        .expect("ir")
    }

    #[test]
    fn test_generator_output_passes() {
        let ir = compiled();
        assert!(enforce(ir).is_ok());
    }

    #[test]
    fn test_mismatched_owner_is_rejected() {
        let mut ir = compiled();
        if let Some(entity) = ir.entities.get_mut("Task") {
            entity.commands[0].entity = "Menu".to_string();
        }
        assert!(matches!(
            enforce(ir),
            Err(OwnershipError::OwnerMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_owner_is_rejected() {
        let mut ir = compiled();
        if let Some(entity) = ir.entities.get_mut("Task") {
            entity.commands[0].entity = String::new();
        }
        assert!(matches!(enforce(ir), Err(OwnershipError::Unowned { .. })));
    }

    #[test]
    fn test_duplicate_command_is_rejected() {
        let mut ir = compiled();
        if let Some(entity) = ir.entities.get_mut("Task") {
            let dup = entity.commands[0].clone();
            entity.commands.push(dup);
        }
        assert!(matches!(
            enforce(ir),
            Err(OwnershipError::DuplicateCommand { .. })
        ));
    }

    #[test]
    fn test_entity_key_mismatch_is_rejected() {
        let mut ir = compiled();
        let entity = ir.entities.remove("Task").expect("entity");
        ir.entities.insert("Renamed".to_string(), entity);
        assert!(matches!(
            enforce(ir),
            Err(OwnershipError::EntityKeyMismatch { .. })
        ));
    }

    #[test]
    fn test_round_trip_through_json_still_passes() {
        let ir = compiled();
        let json = serde_json::to_string(&ir).expect("serialize");
        let restored: Ir = serde_json::from_str(&json).expect("deserialize");
        assert!(enforce(restored).is_ok());
    }
}
