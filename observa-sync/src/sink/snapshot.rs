//! Remote snapshot sink.
//!
//! Upserts and events accumulate in an in-memory buffer; `commit_cycle`
//! drains it into one POST. The endpoint owns deduplication and diffing, so
//! `existing_keys` reports an empty set and the deletion branch never runs
//! against this sink. Scoping-group ids are synthesized per cycle; the
//! endpoint owns real identity.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use observa_core::types::{
    ClusterId, ClusterState, EventRecord, NamespaceId, ResourceKey, ResourceKind, ResourceRecord,
};

use crate::error::SinkError;
use crate::sink::{SinkAdapter, SyncMode};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct SnapshotBuffer {
    records: BTreeMap<ResourceKind, Vec<Value>>,
    namespace_ids: BTreeMap<String, NamespaceId>,
    next_namespace_id: i64,
    events: Vec<Value>,
}

impl SnapshotBuffer {
    fn push(&mut self, record: &ResourceRecord) {
        if record.kind == ResourceKind::Namespace && !self.namespace_ids.contains_key(&record.name)
        {
            self.next_namespace_id += 1;
            self.namespace_ids
                .insert(record.name.clone(), NamespaceId(self.next_namespace_id));
        }
        self.records
            .entry(record.kind)
            .or_default()
            .push(record_payload(record));
    }
}

/// One flat object per record, the shape the snapshot endpoint ingests.
fn record_payload(record: &ResourceRecord) -> Value {
    let mut payload = Map::new();
    payload.insert("name".to_string(), json!(record.name));
    if let Some(namespace) = &record.namespace {
        payload.insert("namespace".to_string(), json!(namespace));
    }
    if let Some(created) = record.source_created_at {
        payload.insert("created".to_string(), json!(created.to_rfc3339()));
    }
    for (key, value) in &record.attributes {
        payload.insert(key.clone(), value.clone());
    }
    Value::Object(payload)
}

fn event_payload(event: &EventRecord) -> Value {
    json!({
        "event_type": event.event_type,
        "reason": event.reason,
        "message": event.message,
        "involved_kind": event.involved_kind,
        "involved_name": event.involved_name,
        "involved_namespace": event.involved_namespace,
        "source_component": event.source_component,
        "first_seen_at": event.first_seen_at.to_rfc3339(),
        "last_seen_at": event.last_seen_at.to_rfc3339(),
    })
}

fn snapshot_body(mut buffer: SnapshotBuffer, collected_at: DateTime<Utc>) -> Value {
    let mut body = Map::new();
    for kind in ResourceKind::all() {
        body.insert(
            kind.plural().to_string(),
            Value::Array(buffer.records.remove(kind).unwrap_or_default()),
        );
    }
    body.insert("events".to_string(), Value::Array(buffer.events));
    body.insert("collected_at".to_string(), json!(collected_at.to_rfc3339()));
    Value::Object(body)
}

/// Sink that pushes one whole-inventory request per cycle.
pub struct RemoteSnapshot {
    agent: ureq::Agent,
    api_url: String,
    agent_token: String,
    buffer: Mutex<SnapshotBuffer>,
}

impl RemoteSnapshot {
    pub fn new(api_url: &str, agent_token: &str) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().build(),
            api_url: api_url.trim_end_matches('/').to_string(),
            agent_token: agent_token.to_string(),
            buffer: Mutex::new(SnapshotBuffer::default()),
        }
    }

    fn with_buffer<T>(
        &self,
        f: impl FnOnce(&mut SnapshotBuffer) -> T,
    ) -> Result<T, SinkError> {
        let mut buffer = self.buffer.lock().map_err(|_| SinkError::LockPoisoned)?;
        Ok(f(&mut buffer))
    }
}

impl SinkAdapter for RemoteSnapshot {
    fn upsert(&self, record: &ResourceRecord) -> Result<(), SinkError> {
        self.with_buffer(|buffer| buffer.push(record))
    }

    fn delete(
        &self,
        _cluster: &ClusterId,
        _kind: ResourceKind,
        _key: &ResourceKey,
    ) -> Result<(), SinkError> {
        // Never reached: existing_keys is empty, so the diff has nothing to
        // delete. The endpoint reconciles removals from the snapshot itself.
        Ok(())
    }

    fn existing_keys(
        &self,
        _cluster: &ClusterId,
        _kind: ResourceKind,
    ) -> Result<HashSet<ResourceKey>, SinkError> {
        Ok(HashSet::new())
    }

    fn namespace_index(
        &self,
        _cluster: &ClusterId,
    ) -> Result<BTreeMap<String, NamespaceId>, SinkError> {
        self.with_buffer(|buffer| buffer.namespace_ids.clone())
    }

    fn insert_event(&self, _cluster: &ClusterId, event: &EventRecord) -> Result<(), SinkError> {
        self.with_buffer(|buffer| buffer.events.push(event_payload(event)))
    }

    fn set_cluster_state(
        &self,
        _cluster: &ClusterId,
        state: ClusterState,
    ) -> Result<(), SinkError> {
        // The endpoint marks the cluster disconnected on its own once
        // snapshots stop arriving.
        tracing::info!(state = %state, "cluster state change noted; endpoint tracks liveness");
        Ok(())
    }

    fn commit_cycle(
        &self,
        cluster: &ClusterId,
        collected_at: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        let buffer = self.with_buffer(std::mem::take)?;
        let body = snapshot_body(buffer, collected_at);
        let url = format!("{}/api/clusters/{}/snapshot", self.api_url, cluster.0);

        let response = self
            .agent
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .set("Authorization", &format!("Bearer {}", self.agent_token))
            .send_json(body)
            .map_err(|err| match err {
                ureq::Error::Status(code, _) => SinkError::Status(code),
                ureq::Error::Transport(transport) => SinkError::Transport(transport.to_string()),
            })?;

        tracing::debug!(status = response.status(), "snapshot pushed");
        Ok(())
    }

    fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }

    fn mode(&self) -> SyncMode {
        SyncMode::Snapshot
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
