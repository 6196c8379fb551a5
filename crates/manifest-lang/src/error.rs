//! Error types for IR validation.

use thiserror::Error;

/// Rejections from the command-ownership pass.
///
/// These are structural defects in an IR value, distinct from compile
/// diagnostics: `compile` cannot produce them, so hitting one means the
/// IR was assembled or deserialized outside the generator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OwnershipError {
    #[error("command '{command}' has no owning entity")]
    Unowned { command: String },

    #[error("command '{command}' is held by entity '{holder}' but declares owner '{declared}'")]
    OwnerMismatch {
        command: String,
        holder: String,
        declared: String,
    },

    #[error("entity '{entity}' declares command '{command}' more than once")]
    DuplicateCommand { entity: String, command: String },

    #[error("entity table key '{key}' does not match entity name '{name}'")]
    EntityKeyMismatch { key: String, name: String },
}
