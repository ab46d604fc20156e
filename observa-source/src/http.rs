//! HTTP inventory source.
//!
//! Listing calls are plain GETs against the per-kind collection paths; the
//! subscription is the watch endpoint read as line-delimited JSON on a
//! dedicated reader thread. The thread exits when the stream ends or when the
//! receiving side is dropped; it never reconnects.

use std::io::{BufRead, BufReader};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use observa_core::config::SourceConfig;
use observa_core::types::ResourceKind;

use crate::error::SourceError;
use crate::extract;
use crate::{InventorySource, ResourceDescriptor, SourceEvent};

const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const EVENTS_WATCH_PATH: &str = "/api/v1/events?watch=true";

/// Collection path for one kind.
fn list_path(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Node => "/api/v1/nodes",
        ResourceKind::Namespace => "/api/v1/namespaces",
        ResourceKind::Pod => "/api/v1/pods",
        ResourceKind::Deployment => "/apis/apps/v1/deployments",
        ResourceKind::StatefulSet => "/apis/apps/v1/statefulsets",
        ResourceKind::DaemonSet => "/apis/apps/v1/daemonsets",
        ResourceKind::Service => "/api/v1/services",
        ResourceKind::Ingress => "/apis/networking.k8s.io/v1/ingresses",
        ResourceKind::Job => "/apis/batch/v1/jobs",
    }
}

/// Inventory source backed by a Kubernetes-style REST API.
pub struct HttpSource {
    agent: ureq::Agent,
    base_url: String,
    token: Option<String>,
}

impl HttpSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().build(),
            base_url: config.api_server.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        }
    }

    fn request(&self, path: &str) -> ureq::Request {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.agent.get(&url);
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        request
    }

    fn get_json(&self, path: &str) -> Result<Value, SourceError> {
        let response = self
            .request(path)
            .timeout(LIST_TIMEOUT)
            .call()
            .map_err(|err| classify(path, err))?;
        response
            .into_json()
            .map_err(|err| SourceError::Decode(err.to_string()))
    }
}

fn classify(path: &str, err: ureq::Error) -> SourceError {
    match err {
        ureq::Error::Status(code @ (401 | 403), _) => SourceError::Auth(code),
        ureq::Error::Status(404, _) => SourceError::NotFound {
            path: path.to_string(),
        },
        ureq::Error::Status(code, _) => {
            SourceError::Connectivity(format!("{path} returned status {code}"))
        }
        ureq::Error::Transport(transport) => SourceError::Connectivity(transport.to_string()),
    }
}

impl InventorySource for HttpSource {
    fn list(&self, kind: ResourceKind) -> Result<Vec<ResourceDescriptor>, SourceError> {
        let body = self.get_json(list_path(kind))?;
        let items = body
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                SourceError::Decode(format!("{} listing has no items array", kind.label()))
            })?;
        Ok(items
            .iter()
            .filter_map(|item| extract::descriptor(kind, item))
            .collect())
    }

    fn subscribe(&self) -> Result<UnboundedReceiver<SourceEvent>, SourceError> {
        // No read timeout: the watch stream legitimately idles between events.
        let response = self
            .request(EVENTS_WATCH_PATH)
            .call()
            .map_err(|err| classify(EVENTS_WATCH_PATH, err))?;

        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            let reader = BufReader::new(response.into_reader());
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::warn!(error = %err, "event watch stream read failed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let parsed: Value = match serde_json::from_str(&line) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        tracing::warn!(error = %err, "skipping undecodable watch line");
                        continue;
                    }
                };
                let Some(event) = extract::event(&parsed) else {
                    continue;
                };
                if tx.send(event).is_err() {
                    // Receiver dropped: subscription was cancelled.
                    break;
                }
            }
            tracing::info!("event watch stream ended");
        });

        Ok(rx)
    }
}
