//! # observa-source
//!
//! Capability surface over the inventory source: full-listing collection per
//! kind and a live change-notification stream. The concrete [`HttpSource`]
//! talks to a Kubernetes-style REST API; tests substitute in-memory fakes.

pub mod error;
pub mod extract;
pub mod http;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedReceiver;

use observa_core::types::{EventRecord, ResourceKind};

pub use error::SourceError;
pub use http::HttpSource;

/// One raw inventory item as reported by a listing call, before namespace
/// resolution and sink keys are attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub attributes: Map<String, Value>,
}

/// One live change notification from the source's subscription stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEvent {
    pub event_type: String,
    pub reason: String,
    pub message: String,
    pub involved_kind: String,
    pub involved_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub involved_namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_component: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_seen_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl SourceEvent {
    /// Map to the sink's append-only record shape. Missing timestamps fall
    /// back to the receive time.
    pub fn into_record(self, received_at: DateTime<Utc>) -> EventRecord {
        EventRecord {
            event_type: self.event_type,
            reason: self.reason,
            message: self.message,
            involved_kind: self.involved_kind,
            involved_name: self.involved_name,
            involved_namespace: self.involved_namespace,
            source_component: self.source_component,
            first_seen_at: self.first_seen_at.unwrap_or(received_at),
            last_seen_at: self.last_seen_at.unwrap_or(received_at),
        }
    }
}

/// The inventory source seen by the reconciliation core.
///
/// Both operations may fail with connectivity or authorization errors; the
/// caller catches them per call and never lets them propagate out of a cycle.
pub trait InventorySource: Send + Sync {
    /// One full listing of the given kind across all scoping groups.
    fn list(&self, kind: ResourceKind) -> Result<Vec<ResourceDescriptor>, SourceError>;

    /// Open the live change-notification stream.
    ///
    /// The returned channel closes when the upstream stream ends; the source
    /// does not reconnect on its own.
    fn subscribe(&self) -> Result<UnboundedReceiver<SourceEvent>, SourceError>;
}
