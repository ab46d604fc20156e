//! Agent configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.observa/
//!   config.yaml          (agent configuration)
//!   data/observa.db      (direct-store sink, when no remote endpoint is set)
//!   agent.sock           (control socket, created by the running agent)
//! ```
//!
//! Every field can be overridden through an `OBSERVA_*` environment variable,
//! so an in-cluster deployment needs no config file at all.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};
use crate::types::ClusterId;

fn default_sync_interval_secs() -> u64 {
    10
}

fn default_watch_events() -> bool {
    true
}

fn default_api_server() -> String {
    // In-cluster service address; overridden for out-of-cluster runs.
    "https://kubernetes.default.svc".to_string()
}

/// Where the inventory is collected from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_api_server")]
    pub api_server: String,
    /// Bearer token; `None` for unauthenticated test servers.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            api_server: default_api_server(),
            token: None,
        }
    }
}

/// Which sink strategy the agent writes through, decided once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkConfig {
    /// One snapshot POST per cycle; the endpoint owns diffing.
    Snapshot { api_url: String, agent_token: String },
    /// Row-level upsert/delete against an embedded store.
    Direct { db_path: PathBuf },
}

/// Full agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub cluster_id: String,

    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    #[serde(default = "default_watch_events")]
    pub watch_events: bool,

    #[serde(default)]
    pub source: SourceConfig,

    /// Remote snapshot endpoint; together with `agent_token` selects the
    /// snapshot sink.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_token: Option<String>,

    /// Direct-store database path; defaults to `~/.observa/data/observa.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            sync_interval_secs: default_sync_interval_secs(),
            watch_events: default_watch_events(),
            source: SourceConfig::default(),
            api_url: None,
            agent_token: None,
            db_path: None,
        }
    }
}

impl AgentConfig {
    /// `<home>/.observa/config.yaml`; pure, no I/O.
    pub fn path_at(home: &Path) -> PathBuf {
        home.join(".observa").join("config.yaml")
    }

    /// Parse the config file at `path`.
    pub fn load_at(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                io_err(path, e)
            }
        })?;
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Resolve the effective configuration: file (explicit path, or the
    /// default location if present), then environment overrides, then
    /// validation.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::load_at(path)?,
            None => {
                let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
                let path = Self::path_at(&home);
                if path.exists() {
                    Self::load_at(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        if config.db_path.is_none() {
            if let Some(home) = dirs::home_dir() {
                config.db_path = Some(home.join(".observa").join("data").join("observa.db"));
            }
        }
        if config.cluster_id.trim().is_empty() {
            return Err(ConfigError::MissingClusterId);
        }
        Ok(config)
    }

    /// Apply `OBSERVA_*` environment overrides in place.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("OBSERVA_CLUSTER_ID") {
            self.cluster_id = v;
        }
        if let Ok(v) = std::env::var("OBSERVA_SYNC_INTERVAL") {
            if let Ok(secs) = v.parse() {
                self.sync_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("OBSERVA_WATCH_EVENTS") {
            self.watch_events = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("OBSERVA_API_SERVER") {
            self.source.api_server = v;
        }
        if let Ok(v) = std::env::var("OBSERVA_SOURCE_TOKEN") {
            self.source.token = Some(v);
        }
        if let Ok(v) = std::env::var("OBSERVA_API_URL") {
            self.api_url = Some(v);
        }
        if let Ok(v) = std::env::var("OBSERVA_AGENT_TOKEN") {
            self.agent_token = Some(v);
        }
        if let Ok(v) = std::env::var("OBSERVA_DB_PATH") {
            self.db_path = Some(PathBuf::from(v));
        }
    }

    /// Sink selection: a configured endpoint wins over the embedded store.
    pub fn sink(&self) -> SinkConfig {
        match (&self.api_url, &self.agent_token) {
            (Some(api_url), Some(agent_token))
                if !api_url.is_empty() && !agent_token.is_empty() =>
            {
                SinkConfig::Snapshot {
                    api_url: api_url.clone(),
                    agent_token: agent_token.clone(),
                }
            }
            _ => SinkConfig::Direct {
                db_path: self
                    .db_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("observa.db")),
            },
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn cluster(&self) -> ClusterId {
        ClusterId::from(self.cluster_id.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
