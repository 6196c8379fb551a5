//! Manifest - business-rule runtime CLI
//!
//! ## Commands
//!
//! - `check`: compile a manifest and report diagnostics
//! - `ir`: compile, validate ownership, and dump IR as JSON
//! - `invoke`: execute one command against a state snapshot
//! - `drain`: run one outbox drain + sweep cycle

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use manifest_lang::{compile, enforce, DiagnosticSeverity, Ir};
use manifest_outbox::{
    ChannelError, EventChannel, EventEnvelope, Publisher, PublisherConfig, SurrealStore,
};
use manifest_runtime::{to_response, AggregateSnapshot, CommandRequest, RuntimeEngine};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "manifest")]
#[command(author = "Harborline Ops")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Manifest business-rule runtime", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a manifest and print diagnostics
    Check {
        /// Manifest source file
        file: PathBuf,
    },

    /// Compile, validate ownership, and dump IR as JSON
    Ir {
        /// Manifest source file
        file: PathBuf,

        /// Pretty-print the JSON output
        #[arg(long)]
        pretty: bool,
    },

    /// Execute one command against a state snapshot
    Invoke {
        /// Manifest source file
        file: PathBuf,

        /// Command name
        #[arg(long)]
        command: String,

        /// Owning entity (required when command names collide)
        #[arg(long)]
        entity: Option<String>,

        /// Command payload as JSON
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Aggregate state snapshot as JSON
        #[arg(long, default_value = "{}")]
        state: String,

        /// Acting collaborator id
        #[arg(long, default_value = "cli")]
        actor: String,

        /// Aggregate id
        #[arg(long, default_value = "local")]
        aggregate: String,
    },

    /// Run one outbox drain + sweep cycle against the configured store
    Drain {
        /// Maximum rows to claim
        #[arg(long, default_value = "100")]
        limit: usize,
    },
}

/// Channel that logs envelopes instead of pushing to a transport.
/// Transport wiring lives with the deployment, not the CLI.
struct LogChannel;

#[async_trait::async_trait]
impl EventChannel for LogChannel {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), ChannelError> {
        info!(
            event_type = %envelope.event_type,
            aggregate = %envelope.aggregate_id,
            seq = envelope.seq,
            "publish"
        );
        Ok(())
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Compile a manifest file, printing diagnostics to stderr. Returns the
/// ownership-validated IR.
fn load_ir(file: &Path) -> Result<Ir> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let result = compile(&source);

    for diagnostic in &result.diagnostics {
        let severity = match diagnostic.severity {
            DiagnosticSeverity::Error => "error",
            DiagnosticSeverity::Warning => "warning",
        };
        eprintln!(
            "{severity}: {} [{}..{}]",
            diagnostic.message, diagnostic.span.start, diagnostic.span.end
        );
    }

    let ir = result
        .ir
        .with_context(|| format!("compilation of {} failed", file.display()))?;
    enforce(ir).context("ownership validation failed")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    match cli.command {
        Commands::Check { file } => {
            let ir = load_ir(&file)?;
            let commands: usize = ir.entities.values().map(|e| e.commands.len()).sum();
            println!(
                "ok: {} entities, {} commands, digest {}",
                ir.entities.len(),
                commands,
                &ir.digest[..12]
            );
        }

        Commands::Ir { file, pretty } => {
            let ir = load_ir(&file)?;
            let json = if pretty {
                serde_json::to_string_pretty(&ir)?
            } else {
                serde_json::to_string(&ir)?
            };
            println!("{json}");
        }

        Commands::Invoke {
            file,
            command,
            entity,
            payload,
            state,
            actor,
            aggregate,
        } => {
            let ir = load_ir(&file)?;
            let engine = RuntimeEngine::new(Arc::new(ir));

            let payload = serde_json::from_str(&payload).context("parsing --payload")?;
            let state = serde_json::from_str(&state).context("parsing --state")?;
            let request = CommandRequest {
                entity,
                command,
                payload,
                actor,
                aggregate_id: aggregate,
            };
            let snapshot = AggregateSnapshot::new(state);

            let execution = engine.execute(&request, &snapshot);
            let response = to_response(&execution);
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "status": response.status,
                    "body": response.body,
                }))?
            );
        }

        Commands::Drain { limit } => {
            let store = Arc::new(SurrealStore::from_env().await?);
            let publisher = Publisher::new(
                store,
                Arc::new(LogChannel),
                PublisherConfig {
                    batch_size: limit,
                    ..PublisherConfig::default()
                },
            );
            let swept = publisher.sweep().await?;
            let report = publisher.drain_once().await?;
            println!(
                "published={} retried={} dead={} released={} swept={}",
                report.published, report.retried, report.dead, report.released, swept
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_check_command() {
        let cli = Cli::try_parse_from(["manifest", "check", "rules.manifest"])
            .expect("parse");
        assert!(matches!(cli.command, Commands::Check { .. }));
    }

    #[test]
    fn load_ir_compiles_a_manifest_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rules.manifest");
        std::fs::write(
            &path,
            "entity Task { command claim() { emit kitchen.task.claimed } }",
        )
        .expect("write manifest");

        let ir = load_ir(&path).expect("load");
        assert_eq!(ir.entities.len(), 1);
        assert_eq!(ir.entities["Task"].commands.len(), 1);
    }

    #[test]
    fn load_ir_rejects_invalid_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.manifest");
        std::fs::write(&path, "entity Broken {").expect("write manifest");

        assert!(load_ir(&path).is_err());
    }

    #[test]
    fn cli_parses_invoke_with_flags() {
        let cli = Cli::try_parse_from([
            "manifest",
            "invoke",
            "rules.manifest",
            "--command",
            "claim",
            "--payload",
            r#"{"employeeId":"emp-7"}"#,
        ])
        .expect("parse");
        let Commands::Invoke {
            command, payload, ..
        } = cli.command
        else {
            panic!("expected invoke");
        };
        assert_eq!(command, "claim");
        assert!(payload.contains("emp-7"));
    }
}
