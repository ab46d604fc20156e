//! Observa: cluster inventory mirror agent CLI.
//!
//! # Usage
//!
//! ```text
//! observa run [--config <path>]
//! observa status [--json]
//! observa sync
//! observa stop
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{run::RunArgs, status::StatusArgs};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "observa",
    version,
    about = "Mirror live cluster inventory into a durable or remote sink",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent in the foreground (scheduler + event watch + socket).
    Run(RunArgs),

    /// Query runtime status of a running agent.
    Status(StatusArgs),

    /// Trigger one reconciliation cycle now and print its counts.
    Sync,

    /// Request graceful agent shutdown over the control socket.
    Stop,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Sync => commands::sync::run(),
        Commands::Stop => commands::stop::run(),
    }
}
