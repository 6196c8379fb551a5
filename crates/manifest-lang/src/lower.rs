//! Lowers a parsed program into IR.
//!
//! Compilation is a pure function: identical source always yields
//! byte-identical IR. Any error-severity diagnostic suppresses the IR
//! entirely; callers must never execute a partially-valid schema.

use std::collections::BTreeMap;
use tracing::debug;

use crate::ast::{CommandDecl, EntityDecl, Program, PropertyModifier};
use crate::diagnostics::{has_errors, Diagnostic};
use crate::ir::{Ir, IrCommand, IrConstraint, IrEntity, IrEventTemplate, IrParam, IrProperty};
use crate::parser::Parser;

/// Output of one compilation: IR (absent on any error) plus every
/// syntax and semantic diagnostic, in source order.
#[derive(Debug, Clone)]
pub struct CompileResult {
    pub ir: Option<Ir>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Compile Manifest source text.
pub fn compile(source: &str) -> CompileResult {
    let (program, mut diagnostics) = Parser::parse(source);
    let ir = lower(&program, &mut diagnostics);

    if has_errors(&diagnostics) {
        return CompileResult {
            ir: None,
            diagnostics,
        };
    }

    debug!(
        entities = ir.entities.len(),
        digest = %ir.digest,
        "compiled manifest"
    );
    CompileResult {
        ir: Some(ir),
        diagnostics,
    }
}

fn lower(program: &Program, diagnostics: &mut Vec<Diagnostic>) -> Ir {
    let mut entities: BTreeMap<String, IrEntity> = BTreeMap::new();
    // Entity-level rules, kept aside so every owned command gets them
    // prepended in declaration order.
    let mut entity_rules: BTreeMap<String, Vec<IrConstraint>> = BTreeMap::new();

    for decl in &program.entities {
        if entities.contains_key(&decl.name) {
            diagnostics.push(Diagnostic::error(
                format!("duplicate entity '{}'", decl.name),
                decl.span,
            ));
            continue;
        }
        let properties = lower_properties(decl, diagnostics);
        let rules: Vec<IrConstraint> = decl.constraints.iter().map(lower_constraint).collect();
        entity_rules.insert(decl.name.clone(), rules);
        entities.insert(
            decl.name.clone(),
            IrEntity {
                name: decl.name.clone(),
                properties,
                commands: Vec::new(),
            },
        );
    }

    // Nested commands own themselves via the enclosing entity; top-level
    // commands name their owner with `for`.
    let mut pending: Vec<(String, &CommandDecl)> = Vec::new();
    for decl in &program.entities {
        for command in &decl.commands {
            pending.push((decl.name.clone(), command));
        }
    }
    for command in &program.commands {
        match &command.owner {
            Some(owner) => pending.push((owner.clone(), command)),
            // The parser already reported the missing `for` clause.
            None => continue,
        }
    }

    for (owner, command) in pending {
        let Some(entity) = entities.get_mut(&owner) else {
            diagnostics.push(Diagnostic::error(
                format!(
                    "command '{}' references undeclared entity '{}'",
                    command.name, owner
                ),
                command.span,
            ));
            continue;
        };
        if entity.commands.iter().any(|c| c.name == command.name) {
            diagnostics.push(Diagnostic::error(
                format!(
                    "entity '{}' already owns a command named '{}'",
                    owner, command.name
                ),
                command.span,
            ));
            continue;
        }

        let mut constraints = entity_rules.get(&owner).cloned().unwrap_or_default();
        constraints.extend(command.constraints.iter().map(lower_constraint));

        let mut events = Vec::new();
        for emit in &command.emits {
            if events
                .iter()
                .any(|e: &IrEventTemplate| e.event_type == emit.event_type)
            {
                diagnostics.push(Diagnostic::warning(
                    format!(
                        "command '{}' emits '{}' more than once",
                        command.name, emit.event_type
                    ),
                    emit.span,
                ));
                continue;
            }
            events.push(IrEventTemplate {
                event_type: emit.event_type.clone(),
            });
        }

        entity.commands.push(IrCommand {
            name: command.name.clone(),
            entity: owner.clone(),
            params: command
                .params
                .iter()
                .map(|p| IrParam {
                    name: p.name.clone(),
                    data_type: p.data_type,
                    optional: p.optional,
                    default: p.default.clone(),
                })
                .collect(),
            constraints,
            events,
        });
    }

    let digest = Ir::compute_digest(&entities);
    Ir { entities, digest }
}

fn lower_properties(decl: &EntityDecl, diagnostics: &mut Vec<Diagnostic>) -> Vec<IrProperty> {
    let mut properties: Vec<IrProperty> = Vec::new();
    for property in &decl.properties {
        if properties.iter().any(|p| p.name == property.name) {
            diagnostics.push(Diagnostic::error(
                format!(
                    "entity '{}' declares property '{}' more than once",
                    decl.name, property.name
                ),
                property.span,
            ));
            continue;
        }
        properties.push(IrProperty {
            name: property.name.clone(),
            data_type: property.data_type,
            required: property.modifiers.contains(&PropertyModifier::Required),
            default: property.default.clone(),
        });
    }
    properties
}

fn lower_constraint(decl: &crate::ast::ConstraintDecl) -> IrConstraint {
    IrConstraint {
        rule: decl.name.clone(),
        severity: decl.severity,
        expr: decl.expr.clone(),
        message: decl.message.clone(),
    }
}
