//! CLI command definitions for the `stagehand` binary.

pub mod task;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;

/// Validate, compile, and run declarative task configurations.
#[derive(Parser)]
#[command(name = "stagehand", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Log verbosity (-v info, -vv debug, -vvv trace). `RUST_LOG` overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit per-expression resolution diagnostics. Without this flag the
    /// STAGEHAND_DEBUG environment variable decides.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Write logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a task configuration and report unknown helpers and builders.
    Validate {
        /// Path to the task file (.yaml, .yml, or .json).
        file: PathBuf,
    },

    /// Compile each stage's dependencies without executing them.
    Compile {
        /// Path to the task file (.yaml, .yml, or .json).
        file: PathBuf,

        /// Only compile this stage.
        #[arg(long)]
        stage: Option<String>,

        #[command(flatten)]
        invocation: InvocationArgs,
    },

    /// Run a task end to end, answering every dependency with its own
    /// parameters.
    Run {
        /// Path to the task file (.yaml, .yml, or .json).
        file: PathBuf,

        #[command(flatten)]
        invocation: InvocationArgs,
    },

    /// List the built-in helpers and builders.
    Builtins,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// The inbound event and invocation identity for a compile or run.
#[derive(Args, Debug, Clone)]
pub struct InvocationArgs {
    /// Inline JSON event.
    #[arg(long, conflicts_with = "event_file")]
    pub event: Option<String>,

    /// Path to a JSON event file.
    #[arg(long)]
    pub event_file: Option<PathBuf>,

    /// Function name reported as `invocationMetadata.functionName`.
    #[arg(long, env = "STAGEHAND_FUNCTION_NAME", default_value = "stagehand")]
    pub function_name: String,

    /// Invocation ID. A fresh UUID when omitted.
    #[arg(long)]
    pub invocation_id: Option<String>,
}

pub async fn dispatch(cli: Cli) -> Result<()> {
    let verbose = cli.debug.then_some(true);
    match cli.command {
        Commands::Validate { file } => task::handle_validate(&file, cli.json),
        Commands::Compile {
            file,
            stage,
            invocation,
        } => task::handle_compile(&file, stage.as_deref(), &invocation, verbose, cli.json),
        Commands::Run { file, invocation } => {
            task::handle_run(&file, &invocation, verbose, cli.json).await
        }
        Commands::Builtins => task::handle_builtins(cli.json),
        // Generated in main before tracing starts.
        Commands::Completions { .. } => Ok(()),
    }
}
