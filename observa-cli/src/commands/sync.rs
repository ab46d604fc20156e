//! `observa sync`: trigger one reconciliation cycle now.

use anyhow::{Context, Result};
use colored::Colorize;

use observa_agent::{request_sync, AgentError};

pub fn run() -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;

    let cycle = match request_sync(&home) {
        Ok(cycle) => cycle,
        Err(AgentError::AgentNotRunning { .. }) => {
            println!("{}", "agent is not running".red());
            return Ok(());
        }
        Err(err) => return Err(err).context("failed to trigger sync"),
    };

    if let Some(kinds) = cycle["kinds"].as_array() {
        for kind in kinds {
            println!(
                "{:<12} collected {:>4}  deleted {:>3}  skipped {:>3}",
                kind["kind"].as_str().unwrap_or("?"),
                kind["collected"],
                kind["deleted"],
                kind["skipped"],
            );
        }
    }
    if cycle["commit_error"].as_bool().unwrap_or(false) {
        println!("{}", "cycle commit failed; counts were not credited".red());
    }

    Ok(())
}
