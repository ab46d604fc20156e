//! Key-set diff and apply for one resource kind.
//!
//! ## Algorithm (deletion-aware kinds)
//!
//! 1. Read `existing` = key set currently held by the sink.
//! 2. Upsert every collected record (idempotent, keyed by primary key).
//! 3. Delete `existing − current`, one key at a time.
//!
//! Non-deletion-aware kinds run step 2 only; upstream removals are not
//! reflected for them.

use std::collections::HashSet;

use observa_core::types::{ClusterId, KindSyncResult, ResourceKind, ResourceRecord};

use crate::sink::SinkAdapter;

/// Apply one kind's collection to the sink and return counts.
///
/// Every per-record failure is caught and logged here; one failing record
/// never blocks the rest of its kind. If the existing-keys read fails, the
/// deletion branch is disabled for this cycle: stale rows survive until the
/// next successful pass rather than risking a wipe from a bad baseline.
pub fn apply_kind(
    sink: &dyn SinkAdapter,
    cluster: &ClusterId,
    kind: ResourceKind,
    records: &[ResourceRecord],
) -> KindSyncResult {
    let mut result = KindSyncResult::new(kind);

    let existing = if kind.deletion_aware() {
        match sink.existing_keys(cluster, kind) {
            Ok(keys) => Some(keys),
            Err(err) => {
                tracing::warn!(
                    kind = %kind,
                    error = %err,
                    "existing key set unavailable; skipping deletions this cycle",
                );
                result.error = true;
                None
            }
        }
    } else {
        None
    };

    let mut current = HashSet::with_capacity(records.len());
    for record in records {
        // The key joins `current` even when its upsert fails: a transiently
        // unwritable record must never feed the deletion branch.
        current.insert(record.key());
        match sink.upsert(record) {
            Ok(()) => result.collected += 1,
            Err(err) => {
                tracing::warn!(
                    kind = %kind,
                    name = %record.name,
                    error = %err,
                    "record upsert failed",
                );
                result.error = true;
            }
        }
    }

    if let Some(existing) = existing {
        for key in existing {
            if current.contains(&key) {
                continue;
            }
            match sink.delete(cluster, kind, &key) {
                Ok(()) => result.deleted += 1,
                Err(err) => {
                    tracing::warn!(
                        kind = %kind,
                        name = %key.name,
                        error = %err,
                        "record delete failed",
                    );
                    result.error = true;
                }
            }
        }
    }

    result
}
