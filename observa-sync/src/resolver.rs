//! Scoping-group (namespace) resolution.
//!
//! Child kinds carry a namespace name from the source but the sink keys them
//! by surrogate id. The resolver upserts every collected group and then
//! re-reads the full mapping, so groups created concurrently (by a parallel
//! cycle or an external actor) are reflected too.

use std::collections::BTreeMap;

use observa_core::types::{ClusterId, NamespaceId, ResourceRecord};

use crate::sink::SinkAdapter;

/// Upsert the collected scoping groups and return the cluster's full
/// name → id mapping.
///
/// Never fails: per-record upsert errors and an unreadable index are logged
/// and the caller gets whatever partial mapping was obtainable (possibly
/// empty). Downstream, a missing id means "skip this child record", not a
/// fatal condition.
pub fn resolve(
    sink: &dyn SinkAdapter,
    cluster: &ClusterId,
    namespaces: &[ResourceRecord],
) -> BTreeMap<String, NamespaceId> {
    for record in namespaces {
        if let Err(err) = sink.upsert(record) {
            tracing::warn!(
                namespace = %record.name,
                error = %err,
                "scoping group upsert failed; children may be skipped this cycle",
            );
        }
    }

    match sink.namespace_index(cluster) {
        Ok(index) => index,
        Err(err) => {
            tracing::warn!(error = %err, "scoping group index unavailable");
            BTreeMap::new()
        }
    }
}
