//! Stagehand command-line entry point.
//!
//! Binary name: `stagehand`
//!
//! Loads task configurations from disk and validates, compiles, or runs them
//! against the echoing provider.

mod cli;

use clap::Parser;
use clap_complete::generate;
use stagehand_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "stagehand", &mut std::io::stdout());
        return Ok(());
    }

    let options = TracingOptions {
        default_directive: TracingOptions::directive_for_verbosity(cli.verbose).to_string(),
        json: cli.log_json,
        otel: cli.otel,
    };
    init_tracing(&options).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = cli::dispatch(cli).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "command failed");
    }
    shutdown_tracing();
    result
}
