//! Direct-store sink over an embedded sqlite database.
//!
//! All access is serialized through a `Mutex<Connection>`, which is fine for
//! SQLite (it serializes writes anyway). WAL mode is enabled for concurrent
//! read performance. Migrations are tracked in a `_migrations` table and
//! applied in order on open.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use observa_core::types::{
    ClusterId, ClusterState, EventRecord, NamespaceId, ResourceKey, ResourceKind, ResourceRecord,
};

use crate::error::{io_err, SinkError};
use crate::sink::{SinkAdapter, SyncMode};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "create_schema",
    sql: include_str!("sql/001_create_schema.sql"),
}];

/// Thread-safe sink over a single rusqlite connection. Cloning is cheap
/// (inner `Arc`).
#[derive(Clone)]
pub struct DirectStore {
    conn: Arc<Mutex<Connection>>,
}

impl DirectStore {
    /// Opens (or creates) the database at the given path and runs all
    /// pending migrations.
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        run_migrations(&conn)?;

        tracing::info!(path = %path.display(), "direct store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database for testing. Runs all migrations.
    pub fn open_in_memory() -> Result<Self, SinkError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, SinkError>,
    ) -> Result<T, SinkError> {
        let conn = self.conn.lock().map_err(|_| SinkError::LockPoisoned)?;
        f(&conn)
    }
}

fn run_migrations(conn: &Connection) -> Result<(), SinkError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;

    for migration in MIGRATIONS {
        let applied: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM _migrations WHERE version = ?1)",
            [migration.version],
            |row| row.get(0),
        )?;
        if applied {
            continue;
        }
        conn.execute_batch(migration.sql)?;
        conn.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            params![
                migration.version,
                migration.description,
                Utc::now().to_rfc3339()
            ],
        )?;
        tracing::debug!(
            version = migration.version,
            description = migration.description,
            "applied migration"
        );
    }
    Ok(())
}

fn upsert_namespace(conn: &Connection, record: &ResourceRecord) -> Result<(), SinkError> {
    let status = record
        .attributes
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("Active");
    conn.execute(
        "INSERT INTO namespaces (cluster_id, name, status, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (cluster_id, name)
         DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
        params![
            record.cluster.0,
            record.name,
            status,
            record.updated_at.to_rfc3339()
        ],
    )?;
    Ok(())
}

fn upsert_resource(conn: &Connection, record: &ResourceRecord) -> Result<(), SinkError> {
    let attributes = serde_json::to_string(&record.attributes)?;
    let namespace_id = record.namespace_id.map(|id| id.0);
    let source_created_at = record.source_created_at.map(|t| t.to_rfc3339());
    let updated_at = record.updated_at.to_rfc3339();

    // UPDATE first, INSERT on miss; the connection mutex serializes the pair.
    let updated = conn.execute(
        "UPDATE resources
         SET attributes = ?1, source_created_at = ?2, updated_at = ?3
         WHERE cluster_id = ?4 AND kind = ?5 AND name = ?6 AND namespace_id IS ?7",
        params![
            attributes,
            source_created_at,
            updated_at,
            record.cluster.0,
            record.kind.label(),
            record.name,
            namespace_id
        ],
    )?;
    if updated == 0 {
        conn.execute(
            "INSERT INTO resources
                 (cluster_id, kind, namespace_id, name, attributes, source_created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.cluster.0,
                record.kind.label(),
                namespace_id,
                record.name,
                attributes,
                source_created_at,
                updated_at
            ],
        )?;
    }
    Ok(())
}

impl SinkAdapter for DirectStore {
    fn upsert(&self, record: &ResourceRecord) -> Result<(), SinkError> {
        self.with_conn(|conn| match record.kind {
            ResourceKind::Namespace => upsert_namespace(conn, record),
            _ => upsert_resource(conn, record),
        })
    }

    fn delete(
        &self,
        cluster: &ClusterId,
        kind: ResourceKind,
        key: &ResourceKey,
    ) -> Result<(), SinkError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM resources
                 WHERE cluster_id = ?1 AND kind = ?2 AND name = ?3 AND namespace_id IS ?4",
                params![
                    cluster.0,
                    kind.label(),
                    key.name,
                    key.namespace.map(|id| id.0)
                ],
            )?;
            Ok(())
        })
    }

    fn existing_keys(
        &self,
        cluster: &ClusterId,
        kind: ResourceKind,
    ) -> Result<HashSet<ResourceKey>, SinkError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT namespace_id, name FROM resources WHERE cluster_id = ?1 AND kind = ?2",
            )?;
            let rows = stmt.query_map(params![cluster.0, kind.label()], |row| {
                let namespace: Option<i64> = row.get(0)?;
                let name: String = row.get(1)?;
                Ok(ResourceKey {
                    namespace: namespace.map(NamespaceId),
                    name,
                })
            })?;
            let mut keys = HashSet::new();
            for key in rows {
                keys.insert(key?);
            }
            Ok(keys)
        })
    }

    fn namespace_index(
        &self,
        cluster: &ClusterId,
    ) -> Result<BTreeMap<String, NamespaceId>, SinkError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT name, id FROM namespaces WHERE cluster_id = ?1")?;
            let rows = stmt.query_map(params![cluster.0], |row| {
                let name: String = row.get(0)?;
                let id: i64 = row.get(1)?;
                Ok((name, NamespaceId(id)))
            })?;
            let mut index = BTreeMap::new();
            for row in rows {
                let (name, id) = row?;
                index.insert(name, id);
            }
            Ok(index)
        })
    }

    fn insert_event(&self, cluster: &ClusterId, event: &EventRecord) -> Result<(), SinkError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events
                     (cluster_id, event_type, reason, message, involved_kind, involved_name,
                      involved_namespace, source_component, first_seen_at, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    cluster.0,
                    event.event_type,
                    event.reason,
                    event.message,
                    event.involved_kind,
                    event.involved_name,
                    event.involved_namespace,
                    event.source_component,
                    event.first_seen_at.to_rfc3339(),
                    event.last_seen_at.to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    fn set_cluster_state(
        &self,
        cluster: &ClusterId,
        state: ClusterState,
    ) -> Result<(), SinkError> {
        self.with_conn(|conn| {
            match state {
                ClusterState::Connected => {
                    conn.execute(
                        "INSERT INTO clusters (id, connection_status, last_seen_at)
                         VALUES (?1, 'connected', ?2)
                         ON CONFLICT (id) DO UPDATE
                         SET connection_status = 'connected', last_seen_at = excluded.last_seen_at",
                        params![cluster.0, Utc::now().to_rfc3339()],
                    )?;
                }
                ClusterState::Disconnected => {
                    // last_seen_at keeps the time of the final successful cycle.
                    conn.execute(
                        "INSERT INTO clusters (id, connection_status)
                         VALUES (?1, 'disconnected')
                         ON CONFLICT (id) DO UPDATE SET connection_status = 'disconnected'",
                        params![cluster.0],
                    )?;
                }
            }
            Ok(())
        })
    }

    fn commit_cycle(
        &self,
        cluster: &ClusterId,
        collected_at: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO clusters (id, connection_status, last_seen_at)
                 VALUES (?1, 'connected', ?2)
                 ON CONFLICT (id) DO UPDATE
                 SET connection_status = 'connected', last_seen_at = excluded.last_seen_at",
                params![cluster.0, collected_at.to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn close(&self) -> Result<(), SinkError> {
        // The connection closes when the last clone drops; nothing to flush.
        tracing::debug!("direct store closed");
        Ok(())
    }

    fn mode(&self) -> SyncMode {
        SyncMode::Direct
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn record(
        kind: ResourceKind,
        namespace_id: Option<i64>,
        name: &str,
        status: &str,
    ) -> ResourceRecord {
        let mut attributes = Map::new();
        attributes.insert("status".to_string(), json!(status));
        ResourceRecord {
            kind,
            cluster: ClusterId::from("c1"),
            namespace: namespace_id.map(|_| "default".to_string()),
            namespace_id: namespace_id.map(NamespaceId),
            name: name.to_string(),
            attributes,
            source_created_at: None,
            updated_at: Utc::now(),
        }
    }

    fn cluster() -> ClusterId {
        ClusterId::from("c1")
    }

    #[test]
    fn migrations_apply_once() {
        let store = DirectStore::open_in_memory().expect("open");
        store
            .with_conn(|conn| {
                let count: u32 =
                    conn.query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))?;
                assert_eq!(count as usize, MIGRATIONS.len());
                // Re-running must be a no-op.
                run_migrations(conn)?;
                let again: u32 =
                    conn.query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))?;
                assert_eq!(count, again);
                Ok(())
            })
            .expect("with_conn");
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data").join("observa.db");
        let _store = DirectStore::open(&path).expect("open");
        assert!(path.exists());
    }

    #[test]
    fn upsert_same_key_updates_in_place() {
        let store = DirectStore::open_in_memory().expect("open");
        store
            .upsert(&record(ResourceKind::Pod, Some(1), "api-0", "Pending"))
            .expect("first upsert");
        store
            .upsert(&record(ResourceKind::Pod, Some(1), "api-0", "Running"))
            .expect("second upsert");

        store
            .with_conn(|conn| {
                let (count, attributes): (u32, String) = conn.query_row(
                    "SELECT COUNT(*), MAX(attributes) FROM resources WHERE kind = 'pod'",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?;
                assert_eq!(count, 1, "upsert must not duplicate the row");
                assert!(attributes.contains("Running"));
                Ok(())
            })
            .expect("with_conn");
    }

    #[test]
    fn cluster_scoped_upsert_does_not_duplicate() {
        let store = DirectStore::open_in_memory().expect("open");
        store
            .upsert(&record(ResourceKind::Node, None, "node-1", "Ready"))
            .expect("first");
        store
            .upsert(&record(ResourceKind::Node, None, "node-1", "NotReady"))
            .expect("second");

        let keys = store
            .existing_keys(&cluster(), ResourceKind::Node)
            .expect("keys");
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn namespace_conflict_keeps_surrogate_id_stable() {
        let store = DirectStore::open_in_memory().expect("open");
        store
            .upsert(&record(ResourceKind::Namespace, None, "default", "Active"))
            .expect("first");
        let first = store.namespace_index(&cluster()).expect("index")["default"];

        store
            .upsert(&record(
                ResourceKind::Namespace,
                None,
                "default",
                "Terminating",
            ))
            .expect("second");
        let second = store.namespace_index(&cluster()).expect("index")["default"];

        assert_eq!(first, second, "conflict must update, not re-create");
    }

    #[test]
    fn delete_removes_only_the_named_key() {
        let store = DirectStore::open_in_memory().expect("open");
        store
            .upsert(&record(ResourceKind::Pod, Some(1), "api-0", "Running"))
            .expect("upsert");
        store
            .upsert(&record(ResourceKind::Pod, Some(1), "api-1", "Running"))
            .expect("upsert");

        store
            .delete(
                &cluster(),
                ResourceKind::Pod,
                &ResourceKey {
                    namespace: Some(NamespaceId(1)),
                    name: "api-0".to_string(),
                },
            )
            .expect("delete");

        let keys = store
            .existing_keys(&cluster(), ResourceKind::Pod)
            .expect("keys");
        assert_eq!(keys.len(), 1);
        assert!(keys.iter().all(|k| k.name == "api-1"));
    }

    #[test]
    fn existing_keys_are_scoped_by_kind() {
        let store = DirectStore::open_in_memory().expect("open");
        store
            .upsert(&record(ResourceKind::Pod, Some(1), "api-0", "Running"))
            .expect("upsert");
        store
            .upsert(&record(ResourceKind::Deployment, Some(1), "api", "x"))
            .expect("upsert");

        let pods = store
            .existing_keys(&cluster(), ResourceKind::Pod)
            .expect("keys");
        assert_eq!(pods.len(), 1);
    }

    #[test]
    fn events_append_and_allow_duplicates() {
        let store = DirectStore::open_in_memory().expect("open");
        let event = EventRecord {
            event_type: "Warning".to_string(),
            reason: "BackOff".to_string(),
            message: "restarting".to_string(),
            involved_kind: "Pod".to_string(),
            involved_name: "api-0".to_string(),
            involved_namespace: Some("default".to_string()),
            source_component: None,
            first_seen_at: Utc::now(),
            last_seen_at: Utc::now(),
        };
        store.insert_event(&cluster(), &event).expect("insert");
        store.insert_event(&cluster(), &event).expect("insert dup");

        store
            .with_conn(|conn| {
                let count: u32 =
                    conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
                assert_eq!(count, 2);
                Ok(())
            })
            .expect("with_conn");
    }

    #[test]
    fn cluster_state_transitions() {
        let store = DirectStore::open_in_memory().expect("open");
        store
            .commit_cycle(&cluster(), Utc::now())
            .expect("commit marks connected");
        store
            .set_cluster_state(&cluster(), ClusterState::Disconnected)
            .expect("disconnect");

        store
            .with_conn(|conn| {
                let (status, last_seen): (String, Option<String>) = conn.query_row(
                    "SELECT connection_status, last_seen_at FROM clusters WHERE id = 'c1'",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?;
                assert_eq!(status, "disconnected");
                assert!(
                    last_seen.is_some(),
                    "disconnect must not erase the last seen time"
                );
                Ok(())
            })
            .expect("with_conn");
    }
}
