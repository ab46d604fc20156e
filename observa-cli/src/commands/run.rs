//! `observa run`: foreground agent.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use observa_core::AgentConfig;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Explicit config file (default: ~/.observa/config.yaml if present,
    /// plus OBSERVA_* environment overrides).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let config =
            AgentConfig::load(self.config.as_deref()).context("failed to load configuration")?;
        observa_agent::start_blocking(&home, config).context("agent exited with error")?;
        Ok(())
    }
}
