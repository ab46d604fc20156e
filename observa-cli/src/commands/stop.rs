//! `observa stop`: request graceful agent shutdown.

use anyhow::{Context, Result};

use observa_agent::{request_stop, AgentError};

pub fn run() -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    match request_stop(&home) {
        Ok(()) => println!("agent stop requested"),
        Err(AgentError::AgentNotRunning { .. }) => println!("agent is not running"),
        Err(err) => return Err(err).context("failed to stop agent"),
    }
    Ok(())
}
