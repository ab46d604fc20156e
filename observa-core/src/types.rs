//! Domain types for the Observa inventory mirror.
//!
//! Record identity is (cluster id, scoping-group id, name) per kind and never
//! changes across cycles; upserts update in place.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed cluster identifier (the UUID assigned by the sink side).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterId(pub String);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ClusterId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ClusterId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Surrogate identifier for a scoping group (namespace) row in the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespaceId(pub i64);

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Resource kinds
// ---------------------------------------------------------------------------

/// The closed set of inventory kinds the agent mirrors.
///
/// Per-kind behavior hangs off this enum; adding a kind means adding a
/// variant and filling in the methods below, not new control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Node,
    Namespace,
    Pod,
    Deployment,
    StatefulSet,
    DaemonSet,
    Service,
    Ingress,
    Job,
}

impl ResourceKind {
    /// All kinds in dependency order: scoping groups before everything that
    /// needs a resolved scoping id.
    pub fn all() -> &'static [ResourceKind] {
        &[
            ResourceKind::Namespace,
            ResourceKind::Node,
            ResourceKind::Pod,
            ResourceKind::Deployment,
            ResourceKind::StatefulSet,
            ResourceKind::DaemonSet,
            ResourceKind::Service,
            ResourceKind::Ingress,
            ResourceKind::Job,
        ]
    }

    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Node => "node",
            ResourceKind::Namespace => "namespace",
            ResourceKind::Pod => "pod",
            ResourceKind::Deployment => "deployment",
            ResourceKind::StatefulSet => "statefulset",
            ResourceKind::DaemonSet => "daemonset",
            ResourceKind::Service => "service",
            ResourceKind::Ingress => "ingress",
            ResourceKind::Job => "job",
        }
    }

    /// Key used for this kind's collection in snapshot payloads.
    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Node => "nodes",
            ResourceKind::Namespace => "namespaces",
            ResourceKind::Pod => "pods",
            ResourceKind::Deployment => "deployments",
            ResourceKind::StatefulSet => "statefulsets",
            ResourceKind::DaemonSet => "daemonsets",
            ResourceKind::Service => "services",
            ResourceKind::Ingress => "ingresses",
            ResourceKind::Job => "jobs",
        }
    }

    /// Whether records of this kind belong to a scoping group.
    pub fn namespaced(&self) -> bool {
        !matches!(self, ResourceKind::Node | ResourceKind::Namespace)
    }

    /// Whether the diff engine reflects upstream removals for this kind.
    ///
    /// Upserts run for every kind; only deletion-aware kinds get the
    /// existing-minus-current delete pass.
    pub fn deletion_aware(&self) -> bool {
        matches!(self, ResourceKind::Pod)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Records and keys
// ---------------------------------------------------------------------------

/// The diffable identity of a record within one cluster and kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Resolved scoping-group id; `None` for cluster-scoped kinds.
    pub namespace: Option<NamespaceId>,
    pub name: String,
}

/// One mirrored inventory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    pub cluster: ClusterId,
    /// Scoping-group name as reported by the source; `None` for
    /// cluster-scoped kinds.
    pub namespace: Option<String>,
    /// Resolved surrogate id. A namespaced record is only handed to the sink
    /// once this is `Some`.
    pub namespace_id: Option<NamespaceId>,
    pub name: String,
    /// Kind-specific attributes, flattened as collected from the source.
    pub attributes: Map<String, Value>,
    pub source_created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            namespace: self.namespace_id,
            name: self.name.clone(),
        }
    }
}

/// A live change notification, forwarded append-only. Duplicates are
/// acceptable; dedup is not a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_type: String,
    pub reason: String,
    pub message: String,
    pub involved_kind: String,
    pub involved_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub involved_namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_component: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Connection status of the mirrored cluster as recorded in the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    Connected,
    Disconnected,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterState::Connected => write!(f, "connected"),
            ClusterState::Disconnected => write!(f, "disconnected"),
        }
    }
}

// ---------------------------------------------------------------------------
// Cycle results
// ---------------------------------------------------------------------------

/// Outcome of one kind within a reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSyncResult {
    pub kind: ResourceKind,
    /// Records successfully upserted this cycle.
    pub collected: usize,
    /// Keys deleted because they vanished from the collection.
    pub deleted: usize,
    /// Records skipped because their scoping group had no resolved id.
    pub skipped: usize,
    /// Collection or apply failed for this kind; counts are partial.
    pub error: bool,
}

impl KindSyncResult {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            collected: 0,
            deleted: 0,
            skipped: 0,
            error: false,
        }
    }

    pub fn failed(kind: ResourceKind) -> Self {
        Self {
            error: true,
            ..Self::new(kind)
        }
    }
}

/// Outcome of one full collect → diff → apply pass across all kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCycleResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub kinds: Vec<KindSyncResult>,
    /// The per-cycle sink commit failed; collected counts were not credited
    /// to the sink side.
    pub commit_error: bool,
}

impl SyncCycleResult {
    pub fn kind(&self, kind: ResourceKind) -> Option<&KindSyncResult> {
        self.kinds.iter().find(|k| k.kind == kind)
    }

    pub fn total_collected(&self) -> usize {
        self.kinds.iter().map(|k| k.collected).sum()
    }

    pub fn total_deleted(&self) -> usize {
        self.kinds.iter().map(|k| k.deleted).sum()
    }

    pub fn error_kinds(&self) -> usize {
        self.kinds.iter().filter(|k| k.error).count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
