//! One full reconciliation cycle.
//!
//! Kinds execute in dependency order: scoping groups first (to populate the
//! resolver), then every other kind. A kind whose collection call failed is
//! flagged and skipped entirely; a failed listing must never masquerade as
//! "everything deleted". The whole pass re-runs from scratch each tick, so a
//! failed or partial cycle self-heals on the next successful one.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use observa_core::types::{
    ClusterId, KindSyncResult, NamespaceId, ResourceKind, ResourceRecord, SyncCycleResult,
};
use observa_source::{InventorySource, ResourceDescriptor};

use crate::diff;
use crate::resolver;
use crate::sink::SinkAdapter;

/// Run one collect → resolve → diff → apply pass across all kinds.
///
/// Source and sink failures are contained per record or per kind; this
/// function always returns a result, with reduced counts and error flags
/// standing in for anything that went wrong.
pub fn run_cycle(
    source: &dyn InventorySource,
    sink: &dyn SinkAdapter,
    cluster: &ClusterId,
) -> SyncCycleResult {
    let started_at = Utc::now();
    let mut kinds = Vec::with_capacity(ResourceKind::all().len());

    let (index, namespace_result) = sync_namespaces(source, sink, cluster, started_at);
    kinds.push(namespace_result);

    for kind in ResourceKind::all() {
        let kind = *kind;
        if kind == ResourceKind::Namespace {
            continue;
        }
        match source.list(kind) {
            Err(err) => {
                tracing::warn!(
                    kind = %kind,
                    error = %err,
                    "collection failed; kind skipped this cycle",
                );
                kinds.push(KindSyncResult::failed(kind));
            }
            Ok(descriptors) => {
                let (records, skipped) =
                    build_records(kind, cluster, descriptors, &index, started_at);
                let mut outcome = diff::apply_kind(sink, cluster, kind, &records);
                outcome.skipped = skipped;
                if skipped > 0 {
                    tracing::debug!(
                        kind = %kind,
                        skipped,
                        "records without a resolved scoping group were skipped",
                    );
                }
                kinds.push(outcome);
            }
        }
    }

    let commit_error = match sink.commit_cycle(cluster, started_at) {
        Ok(()) => false,
        Err(err) => {
            tracing::error!(error = %err, "cycle commit failed; counts not credited to sink");
            true
        }
    };

    SyncCycleResult {
        started_at,
        finished_at: Utc::now(),
        kinds,
        commit_error,
    }
}

/// Collect and resolve scoping groups. Even when the listing call fails the
/// resolver still re-reads the sink's index, so children of already-known
/// groups keep syncing.
fn sync_namespaces(
    source: &dyn InventorySource,
    sink: &dyn SinkAdapter,
    cluster: &ClusterId,
    collected_at: DateTime<Utc>,
) -> (BTreeMap<String, NamespaceId>, KindSyncResult) {
    match source.list(ResourceKind::Namespace) {
        Err(err) => {
            tracing::warn!(error = %err, "scoping group collection failed");
            let index = resolver::resolve(sink, cluster, &[]);
            (index, KindSyncResult::failed(ResourceKind::Namespace))
        }
        Ok(descriptors) => {
            let records: Vec<ResourceRecord> = descriptors
                .into_iter()
                .map(|d| to_record(ResourceKind::Namespace, cluster, d, None, collected_at))
                .collect();
            let mut result = KindSyncResult::new(ResourceKind::Namespace);
            result.collected = records.len();
            let index = resolver::resolve(sink, cluster, &records);
            (index, result)
        }
    }
}

/// Attach cluster identity and resolved scoping ids to raw descriptors.
///
/// A namespaced descriptor whose group has no resolved id is dropped, not an
/// error: it will be picked up once the group itself has been upserted.
fn build_records(
    kind: ResourceKind,
    cluster: &ClusterId,
    descriptors: Vec<ResourceDescriptor>,
    index: &BTreeMap<String, NamespaceId>,
    collected_at: DateTime<Utc>,
) -> (Vec<ResourceRecord>, usize) {
    let mut records = Vec::with_capacity(descriptors.len());
    let mut skipped = 0;

    for descriptor in descriptors {
        if kind.namespaced() {
            let resolved = descriptor
                .namespace
                .as_deref()
                .and_then(|name| index.get(name).copied());
            match resolved {
                Some(id) => {
                    records.push(to_record(kind, cluster, descriptor, Some(id), collected_at));
                }
                None => skipped += 1,
            }
        } else {
            records.push(to_record(kind, cluster, descriptor, None, collected_at));
        }
    }

    (records, skipped)
}

fn to_record(
    kind: ResourceKind,
    cluster: &ClusterId,
    descriptor: ResourceDescriptor,
    namespace_id: Option<NamespaceId>,
    collected_at: DateTime<Utc>,
) -> ResourceRecord {
    ResourceRecord {
        kind,
        cluster: cluster.clone(),
        namespace: descriptor.namespace,
        namespace_id,
        name: descriptor.name,
        attributes: descriptor.attributes,
        source_created_at: descriptor.created_at,
        updated_at: collected_at,
    }
}
