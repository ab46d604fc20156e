//! `observa status`: query the running agent over the control socket.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use observa_agent::paths::socket_path;
use observa_agent::{request_status, AgentError};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Print the raw status JSON instead of the human summary.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;

        let status = match request_status(&home) {
            Ok(status) => status,
            Err(AgentError::AgentNotRunning { .. }) => {
                if self.json {
                    let payload = serde_json::json!({
                        "running": false,
                        "socket": socket_path(&home).display().to_string(),
                    });
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                } else {
                    println!("{}", "agent is not running".red());
                }
                return Ok(());
            }
            Err(err) => return Err(err).context("failed to query agent status"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("failed to render status JSON")?
            );
            return Ok(());
        }

        println!("cluster:      {}", status["cluster_id"].as_str().unwrap_or("?"));
        println!("sync mode:    {}", status["sync_mode"].as_str().unwrap_or("?"));
        println!("source:       {}", connected_label(&status["source_connected"]));
        println!("sink:         {}", connected_label(&status["sink_connected"]));
        println!("event watch:  {}", active_label(&status["event_watch_active"]));
        println!("cycle:        {}", active_label(&status["cycle_active"]));

        if let Some(kinds) = status["last_cycle"]["kinds"].as_array() {
            println!("last cycle:");
            for kind in kinds {
                let label = kind["kind"].as_str().unwrap_or("?");
                let line = format!(
                    "  {label:<12} collected {:>4}  deleted {:>3}  skipped {:>3}",
                    kind["collected"], kind["deleted"], kind["skipped"],
                );
                if kind["error"].as_bool().unwrap_or(false) {
                    println!("{} {}", line, "error".red());
                } else {
                    println!("{line}");
                }
            }
        }

        Ok(())
    }
}

fn connected_label(value: &serde_json::Value) -> String {
    if value.as_bool().unwrap_or(false) {
        "connected".green().to_string()
    } else {
        "disconnected".red().to_string()
    }
}

fn active_label(value: &serde_json::Value) -> String {
    if value.as_bool().unwrap_or(false) {
        "active".green().to_string()
    } else {
        "idle".to_string()
    }
}
