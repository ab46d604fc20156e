//! Sink adapters.
//!
//! One polymorphic interface, two strategies chosen once at startup:
//! [`direct::DirectStore`] applies row-level upserts/deletes against an
//! embedded store and is the only variant that feeds the full
//! diff-and-delete path; [`snapshot::RemoteSnapshot`] buffers a cycle's
//! records and pushes them as one request, leaving diffing to the endpoint.

pub mod direct;
pub mod snapshot;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use observa_core::config::SinkConfig;
use observa_core::types::{
    ClusterId, ClusterState, EventRecord, NamespaceId, ResourceKey, ResourceKind, ResourceRecord,
};

use crate::error::SinkError;

pub use direct::DirectStore;
pub use snapshot::RemoteSnapshot;

/// Which sink strategy a process runs with. Reported in status payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Direct,
    Snapshot,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Direct => write!(f, "direct"),
            SyncMode::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Capability surface for persisting reconciled state.
///
/// Every write is either an idempotent upsert keyed by stable identity or an
/// append-only insert, so the scheduler and the event forwarder may interleave
/// calls freely without coordination.
pub trait SinkAdapter: Send + Sync {
    /// Idempotent upsert keyed by (cluster, kind, scoping id, name). A
    /// unique-key conflict is an update, never an error.
    fn upsert(&self, record: &ResourceRecord) -> Result<(), SinkError>;

    /// Delete one record by key.
    fn delete(
        &self,
        cluster: &ClusterId,
        kind: ResourceKind,
        key: &ResourceKey,
    ) -> Result<(), SinkError>;

    /// Current key set held for this cluster/kind. Strategies that diff
    /// remotely return the empty set, which leaves the deletion branch inert.
    fn existing_keys(
        &self,
        cluster: &ClusterId,
        kind: ResourceKind,
    ) -> Result<HashSet<ResourceKey>, SinkError>;

    /// Full scoping-group name → surrogate id mapping for this cluster.
    fn namespace_index(
        &self,
        cluster: &ClusterId,
    ) -> Result<BTreeMap<String, NamespaceId>, SinkError>;

    /// Append-only event insert. No key, no dedup.
    fn insert_event(&self, cluster: &ClusterId, event: &EventRecord) -> Result<(), SinkError>;

    /// Record the cluster connection state. Written with
    /// [`ClusterState::Disconnected`] exactly once, at shutdown.
    fn set_cluster_state(&self, cluster: &ClusterId, state: ClusterState)
        -> Result<(), SinkError>;

    /// Close out one reconciliation cycle. The snapshot strategy sends its
    /// buffered request here; the direct store refreshes the cluster row.
    fn commit_cycle(
        &self,
        cluster: &ClusterId,
        collected_at: DateTime<Utc>,
    ) -> Result<(), SinkError>;

    /// Release the underlying connection.
    fn close(&self) -> Result<(), SinkError>;

    fn mode(&self) -> SyncMode;
}

/// Construct the sink selected by the configuration. This is the only place
/// that knows both strategies; everything downstream sees the trait.
pub fn open_sink(config: &SinkConfig) -> Result<Arc<dyn SinkAdapter>, SinkError> {
    match config {
        SinkConfig::Direct { db_path } => Ok(Arc::new(DirectStore::open(db_path)?)),
        SinkConfig::Snapshot {
            api_url,
            agent_token,
        } => Ok(Arc::new(RemoteSnapshot::new(api_url, agent_token))),
    }
}
