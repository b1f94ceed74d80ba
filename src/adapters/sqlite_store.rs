//! SQLite inventory store
//!
//! A small pool of connections to one WAL-mode database. Every upsert runs as
//! a single immediate transaction on a blocking thread, so the generation
//! check, the prior-set read and the replacement commit or roll back
//! together. A writer takes whichever pooled connection is free, so commits
//! for different endpoints never queue behind each other in the process.
//!
//! `parent_id` is NULL for top-level components (parent is the endpoint) and
//! otherwise references another component; deleting a parent deletes its
//! children.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::discovery::aggregate::{ComponentId, ComponentKind, ComponentRecord};
use crate::discovery::DiscoveryStatus;
use crate::domain::ports::InventoryStore;
use crate::error::{Error, Result};
use crate::inventory::{
    plan_upsert, ChangeSet, ComponentFilter, EndpointStatusRecord, InventoryUpdate,
};
use crate::redfish::EndpointId;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS endpoints (
    id            TEXT PRIMARY KEY,
    generation    INTEGER NOT NULL DEFAULT 0,
    status        TEXT,
    last_attempt  TEXT,
    last_success  TEXT,
    message       TEXT
);
CREATE TABLE IF NOT EXISTS components (
    id           TEXT PRIMARY KEY,
    endpoint_id  TEXT NOT NULL REFERENCES endpoints(id) ON DELETE CASCADE,
    parent_id    TEXT REFERENCES components(id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    kind         TEXT NOT NULL,
    ordinal      INTEGER NOT NULL,
    source_path  TEXT NOT NULL,
    status       TEXT NOT NULL,
    attributes   TEXT NOT NULL,
    raw          TEXT
);
CREATE INDEX IF NOT EXISTS idx_components_endpoint ON components(endpoint_id);
CREATE INDEX IF NOT EXISTS idx_components_parent ON components(parent_id);
"#;

const COMPONENT_COLUMNS: &str = "id, endpoint_id, COALESCE(parent_id, endpoint_id), kind, \
     ordinal, source_path, status, attributes, raw";

/// SQLite store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqliteStoreConfig {
    /// Database file; parent directories are created on open
    pub path: PathBuf,
    /// How long to wait for the database (and the connection) before
    /// reporting the store busy
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Pooled connections; at least one is always opened
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_pool_size() -> usize {
    4
}

impl SqliteStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_size: default_pool_size(),
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout_ms = u64::try_from(busy_timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Inventory persisted in a SQLite database.
#[derive(Clone)]
pub struct SqliteInventoryStore {
    connections: Arc<Vec<Mutex<Connection>>>,
    /// Round-robin start for connection selection
    cursor: Arc<AtomicUsize>,
    busy_timeout: Duration,
}

impl std::fmt::Debug for SqliteInventoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteInventoryStore")
            .field("connections", &self.connections.len())
            .field("busy_timeout", &self.busy_timeout)
            .finish_non_exhaustive()
    }
}

impl SqliteInventoryStore {
    /// Open (or create) the database described by `config`.
    pub fn open(config: &SqliteStoreConfig) -> Result<Self> {
        ensure_parent_dir(&config.path)?;
        let busy_timeout = config.busy_timeout();

        let primary = Connection::open(&config.path)?;
        configure(&primary, busy_timeout)?;
        let mode: String =
            primary.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        primary.pragma_update(None, "synchronous", "NORMAL")?;
        primary.execute_batch(SCHEMA)?;

        let mut connections = vec![Mutex::new(primary)];
        for _ in 1..config.pool_size.max(1) {
            let conn = Connection::open(&config.path)?;
            configure(&conn, busy_timeout)?;
            connections.push(Mutex::new(conn));
        }

        info!(
            path = %config.path.display(),
            journal_mode = %mode,
            connections = connections.len(),
            "Opened SQLite inventory store"
        );
        Ok(Self::from_connections(connections, busy_timeout))
    }

    /// Private database that lives as long as the store. A private
    /// in-memory database cannot be shared, so this pool has one connection.
    pub fn open_in_memory() -> Result<Self> {
        let busy_timeout = Duration::from_millis(default_busy_timeout_ms());
        let conn = Connection::open_in_memory()?;
        configure(&conn, busy_timeout)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connections(vec![Mutex::new(conn)], busy_timeout))
    }

    fn from_connections(connections: Vec<Mutex<Connection>>, busy_timeout: Duration) -> Self {
        Self {
            connections: Arc::new(connections),
            cursor: Arc::new(AtomicUsize::new(0)),
            busy_timeout,
        }
    }

    /// Run `f` on the blocking pool against the first free connection,
    /// waiting on one of them when all are taken.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let connections = Arc::clone(&self.connections);
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let waited = self.busy_timeout;
        tokio::task::spawn_blocking(move || {
            let len = connections.len();
            let mut guard = (0..len)
                .find_map(|i| connections[start.wrapping_add(i) % len].try_lock())
                .or_else(|| connections[start % len].try_lock_for(waited))
                .ok_or(Error::StoreBusy { waited })?;
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::Internal(format!("store task failed: {}", e)))?
    }
}

fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

// =============================================================================
// Row Mapping
// =============================================================================

struct ComponentRow {
    id: String,
    endpoint: String,
    parent: String,
    kind: String,
    ordinal: i64,
    source_path: String,
    status: String,
    attributes: String,
    raw: Option<String>,
}

impl ComponentRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            endpoint: row.get(1)?,
            parent: row.get(2)?,
            kind: row.get(3)?,
            ordinal: row.get(4)?,
            source_path: row.get(5)?,
            status: row.get(6)?,
            attributes: row.get(7)?,
            raw: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<ComponentRecord> {
        let kind = ComponentKind::parse(&self.kind)
            .ok_or_else(|| Error::Store(format!("component {} has unknown kind '{}'", self.id, self.kind)))?;
        let status = DiscoveryStatus::parse(&self.status).ok_or_else(|| {
            Error::Store(format!("component {} has unknown status '{}'", self.id, self.status))
        })?;
        let attributes: BTreeMap<String, String> = serde_json::from_str(&self.attributes)?;
        let raw = self.raw.as_deref().map(serde_json::from_str).transpose()?;

        Ok(ComponentRecord {
            id: ComponentId(self.id),
            kind,
            parent: ComponentId(self.parent),
            endpoint: EndpointId(self.endpoint),
            ordinal: u32::try_from(self.ordinal).unwrap_or(0),
            source_path: self.source_path,
            status,
            attributes,
            raw,
        })
    }
}

fn load_endpoint_records(
    conn: &Connection,
    endpoint: &EndpointId,
) -> Result<BTreeMap<ComponentId, ComponentRecord>> {
    let sql = format!(
        "SELECT {} FROM components WHERE endpoint_id = ?1",
        COMPONENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![endpoint.as_str()], ComponentRow::read)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|row| row.into_record().map(|r| (r.id.clone(), r)))
        .collect()
}

fn write_component(conn: &Connection, record: &ComponentRecord) -> Result<()> {
    let attributes = serde_json::to_string(&record.attributes)?;
    let raw = record.raw.as_ref().map(serde_json::to_string).transpose()?;
    let parent = (record.parent.as_str() != record.endpoint.as_str()).then(|| record.parent.as_str());
    conn.execute(
        "INSERT INTO components (id, endpoint_id, parent_id, kind, ordinal, source_path, status, attributes, raw)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
             parent_id = excluded.parent_id,
             kind = excluded.kind,
             ordinal = excluded.ordinal,
             source_path = excluded.source_path,
             status = excluded.status,
             attributes = excluded.attributes,
             raw = excluded.raw",
        params![
            record.id.as_str(),
            record.endpoint.as_str(),
            parent,
            record.kind.as_str(),
            i64::from(record.ordinal),
            record.source_path,
            record.status.as_str(),
            attributes,
            raw,
        ],
    )?;
    Ok(())
}

fn parse_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| Error::Store(format!("bad timestamp '{}': {}", s, e)))
        })
        .transpose()
}

/// Fail when any of `ids` is stored under an endpoint other than `update`'s.
fn check_owners<'a>(
    conn: &Connection,
    update: &InventoryUpdate,
    ids: impl Iterator<Item = &'a ComponentId>,
) -> Result<()> {
    let mut stmt = conn.prepare("SELECT endpoint_id FROM components WHERE id = ?1")?;
    for id in ids {
        let owner: Option<String> = stmt
            .query_row(params![id.as_str()], |row| row.get(0))
            .optional()?;
        if let Some(owner) = owner.filter(|o| o != update.endpoint.as_str()) {
            return Err(update.foreign(id, &EndpointId(owner)));
        }
    }
    Ok(())
}

fn apply_upsert(conn: &mut Connection, update: &InventoryUpdate) -> Result<ChangeSet> {
    update.check_ownership()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let committed: Option<i64> = tx
        .query_row(
            "SELECT generation FROM endpoints WHERE id = ?1",
            params![update.endpoint.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(committed) = committed {
        let committed = committed as u64;
        if update.generation < committed {
            return Err(Error::StoreConflict {
                endpoint: update.endpoint.to_string(),
                reason: format!(
                    "run generation {} is older than committed generation {}",
                    update.generation, committed
                ),
            });
        }
    }

    let prior = load_endpoint_records(&tx, &update.endpoint)?;
    let plan = plan_upsert(&prior, update);
    check_owners(&tx, update, plan.next.keys().filter(|id| !prior.contains_key(*id)))?;

    tx.execute(
        "INSERT INTO endpoints (id, generation) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET generation = excluded.generation",
        params![update.endpoint.as_str(), update.generation as i64],
    )?;

    for record in &plan.changes.removed {
        tx.execute(
            "DELETE FROM components WHERE id = ?1",
            params![record.id.as_str()],
        )?;
    }
    let mut writes = 0usize;
    for record in plan.writes(&prior) {
        write_component(&tx, record)?;
        writes += 1;
    }

    tx.commit()?;
    debug!(
        added = plan.changes.added.len(),
        changed = plan.changes.changed.len(),
        removed = plan.changes.removed.len(),
        preserved = plan.changes.preserved,
        writes,
        "Upsert committed"
    );
    Ok(plan.changes)
}

#[async_trait]
impl InventoryStore for SqliteInventoryStore {
    #[instrument(skip(self, update), fields(endpoint = %update.endpoint, generation = update.generation))]
    async fn upsert(&self, update: InventoryUpdate) -> Result<ChangeSet> {
        self.with_conn(move |conn| apply_upsert(conn, &update)).await
    }

    async fn get(&self, id: &ComponentId) -> Result<Option<ComponentRecord>> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM components WHERE id = ?1", COMPONENT_COLUMNS);
            let row = conn
                .query_row(&sql, params![id.as_str()], ComponentRow::read)
                .optional()?;
            row.map(ComponentRow::into_record).transpose()
        })
        .await
    }

    async fn list(&self, filter: &ComponentFilter) -> Result<Vec<ComponentRecord>> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut clauses = Vec::new();
            let mut values: Vec<String> = Vec::new();
            if let Some(endpoint) = &filter.endpoint {
                values.push(endpoint.to_string());
                clauses.push(format!("endpoint_id = ?{}", values.len()));
            }
            if let Some(kind) = filter.kind {
                values.push(kind.as_str().to_string());
                clauses.push(format!("kind = ?{}", values.len()));
            }
            if let Some(parent) = &filter.parent {
                values.push(parent.to_string());
                clauses.push(format!("COALESCE(parent_id, endpoint_id) = ?{}", values.len()));
            }
            let mut sql = format!("SELECT {} FROM components", COMPONENT_COLUMNS);
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(" ORDER BY id");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), ComponentRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut records = Vec::with_capacity(rows.len());
            for row in rows {
                let record = row.into_record()?;
                if filter.matches(&record) {
                    records.push(record);
                }
            }
            Ok(records)
        })
        .await
    }

    async fn record_endpoint_status(&self, status: EndpointStatusRecord) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO endpoints (id, generation, status, last_attempt, last_success, message)
                 VALUES (?1, 0, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     status = excluded.status,
                     last_attempt = excluded.last_attempt,
                     last_success = COALESCE(excluded.last_success, endpoints.last_success),
                     message = excluded.message",
                params![
                    status.endpoint.as_str(),
                    status.status.as_str(),
                    status.last_attempt.to_rfc3339(),
                    status.last_success.map(|t| t.to_rfc3339()),
                    status.message,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn endpoint_status(&self, endpoint: &EndpointId) -> Result<Option<EndpointStatusRecord>> {
        let endpoint = endpoint.clone();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT status, last_attempt, last_success, message FROM endpoints
                     WHERE id = ?1 AND status IS NOT NULL",
                    params![endpoint.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                        ))
                    },
                )
                .optional()?;

            let Some((status, last_attempt, last_success, message)) = row else {
                return Ok(None);
            };
            let status = DiscoveryStatus::parse(&status)
                .ok_or_else(|| Error::Store(format!("unknown endpoint status '{}'", status)))?;
            Ok(Some(EndpointStatusRecord {
                endpoint,
                status,
                last_attempt: parse_time(last_attempt)?.unwrap_or_else(Utc::now),
                last_success: parse_time(last_success)?,
                message,
            }))
        })
        .await
    }

    async fn health_check(&self) -> Result<bool> {
        self.with_conn(|conn| {
            let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
            Ok(one == 1)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::discovery::aggregate::{ATTR_MAC, ATTR_ROLE};

    fn nic(endpoint: &str, id: &str, path: &str, mac: &str) -> ComponentRecord {
        ComponentRecord::new(
            id,
            ComponentKind::NodeEnetInterface,
            &EndpointId::new(endpoint),
            path,
        )
        .with_attribute(ATTR_MAC, mac)
        .with_raw(serde_json::json!({"PackageInfo": []}))
    }

    #[tokio::test]
    async fn test_upsert_round_trips_records() {
        let store = SqliteInventoryStore::open_in_memory().unwrap();
        let record = nic("x0c0s0b0n0", "x0c0s0b0n0/ncsi-1-1-0", "/n/1/Package/1", "aa:aa:aa:aa:aa:01")
            .with_attribute(ATTR_ROLE, "onboard");

        let changes = store
            .upsert(InventoryUpdate::replace("x0c0s0b0n0", vec![record.clone()]))
            .await
            .unwrap();
        assert_eq!(changes.added.len(), 1);

        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = SqliteStoreConfig::new(dir.path().join("state").join("hsm.db"));

        {
            let store = SqliteInventoryStore::open(&config).unwrap();
            store
                .upsert(InventoryUpdate::replace(
                    "x0c0s0b0n0",
                    vec![nic("x0c0s0b0n0", "x0c0s0b0n0/eth1", "/e/1", "aa:aa:aa:aa:aa:01")],
                ))
                .await
                .unwrap();
        }

        let reopened = SqliteInventoryStore::open(&config).unwrap();
        let listed = reopened
            .list(&ComponentFilter::endpoint("x0c0s0b0n0"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].mac(), Some("aa:aa:aa:aa:aa:01"));
    }

    #[tokio::test]
    async fn test_preserve_and_remove() {
        let store = SqliteInventoryStore::open_in_memory().unwrap();
        store
            .upsert(InventoryUpdate::replace(
                "x0c0s0b0n0",
                vec![
                    nic("x0c0s0b0n0", "a", "/n/1/Package/1", "aa:aa:aa:aa:aa:01"),
                    nic("x0c0s0b0n0", "b", "/n/2/Package/1", "aa:aa:aa:aa:aa:02"),
                ],
            ))
            .await
            .unwrap();

        let changes = store
            .upsert(InventoryUpdate::replace("x0c0s0b0n0", vec![]).preserving(["/n/1"]))
            .await
            .unwrap();
        assert_eq!(changes.preserved, 1);
        assert_eq!(changes.removed.len(), 1);
        assert!(store.get(&"a".into()).await.unwrap().is_some());
        assert!(store.get(&"b".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_generation_leaves_rows_untouched() {
        let store = SqliteInventoryStore::open_in_memory().unwrap();
        store
            .upsert(
                InventoryUpdate::replace(
                    "x0c0s0b0n0",
                    vec![nic("x0c0s0b0n0", "a", "/n/1", "aa:aa:aa:aa:aa:01")],
                )
                .with_generation(3),
            )
            .await
            .unwrap();

        let stale = store
            .upsert(InventoryUpdate::replace("x0c0s0b0n0", vec![]).with_generation(2))
            .await;
        assert_matches!(stale, Err(Error::StoreConflict { .. }));
        assert!(store.get(&"a".into()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_repeat_upsert_is_noop() {
        let store = SqliteInventoryStore::open_in_memory().unwrap();
        let records = vec![nic("x0c0s0b0n0", "a", "/n/1", "aa:aa:aa:aa:aa:01")];
        store
            .upsert(InventoryUpdate::replace("x0c0s0b0n0", records.clone()))
            .await
            .unwrap();
        let second = store
            .upsert(InventoryUpdate::replace("x0c0s0b0n0", records))
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = SqliteInventoryStore::open_in_memory().unwrap();
        store
            .upsert(InventoryUpdate::replace(
                "x0c0s0b0n0",
                vec![nic("x0c0s0b0n0", "a", "/n/1", "aa:aa:aa:aa:aa:01")],
            ))
            .await
            .unwrap();
        store
            .upsert(InventoryUpdate::replace(
                "x0c0s1b0n0",
                vec![nic("x0c0s1b0n0", "b", "/n/1", "aa:aa:aa:aa:aa:02")],
            ))
            .await
            .unwrap();

        let by_mac = store
            .list(&ComponentFilter::all().with_mac("AA:AA:AA:AA:AA:02"))
            .await
            .unwrap();
        assert_eq!(by_mac.len(), 1);
        assert_eq!(by_mac[0].id.as_str(), "b");

        let by_parent = store
            .list(&ComponentFilter::all().with_parent("x0c0s0b0n0"))
            .await
            .unwrap();
        assert_eq!(by_parent.len(), 1);

        let processors = store
            .list(&ComponentFilter::all().with_kind(ComponentKind::Processor))
            .await
            .unwrap();
        assert!(processors.is_empty());
    }

    #[tokio::test]
    async fn test_file_store_uses_wal_and_pool() {
        let dir = tempfile::tempdir().unwrap();
        let config = SqliteStoreConfig::new(dir.path().join("hsm.db"))
            .with_pool_size(2)
            .with_busy_timeout(Duration::from_millis(100));
        let store = SqliteInventoryStore::open(&config).unwrap();
        assert_eq!(store.connections.len(), 2);

        let mode: String = store
            .with_conn(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[tokio::test]
    async fn test_held_connection_does_not_block_other_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = SqliteStoreConfig::new(dir.path().join("hsm.db"))
            .with_pool_size(2)
            .with_busy_timeout(Duration::from_millis(100));
        let store = SqliteInventoryStore::open(&config).unwrap();

        // A long-running writer for one endpoint holds a pooled connection.
        let _held = store.connections[0].lock();
        for _ in 0..2 {
            store
                .upsert(InventoryUpdate::replace(
                    "x0c0s1b0n0",
                    vec![nic("x0c0s1b0n0", "b", "/n/1", "aa:aa:aa:aa:aa:02")],
                ))
                .await
                .unwrap();
        }
        assert!(store.get(&"b".into()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_single_connection_reports_busy() {
        let dir = tempfile::tempdir().unwrap();
        let config = SqliteStoreConfig::new(dir.path().join("hsm.db"))
            .with_pool_size(1)
            .with_busy_timeout(Duration::from_millis(50));
        let store = SqliteInventoryStore::open(&config).unwrap();

        let _held = store.connections[0].lock();
        let result = store.health_check().await;
        assert_matches!(result, Err(Error::StoreBusy { .. }));
    }

    #[tokio::test]
    async fn test_parent_links_are_enforced() {
        let store = SqliteInventoryStore::open_in_memory().unwrap();
        let ep = EndpointId::new("x0c0s0b0n0");
        let parent = nic("x0c0s0b0n0", "x0c0s0b0n0/nic0", "/n/1", "aa:aa:aa:aa:aa:01");
        let mut child = nic("x0c0s0b0n0", "x0c0s0b0n0/nic0/port0", "/n/1/p/0", "aa:aa:aa:aa:aa:02");
        child.parent = parent.id.clone();

        // A child whose parent is not stored never commits.
        let orphan = store
            .upsert(InventoryUpdate::replace(ep.clone(), vec![child.clone()]))
            .await;
        assert_matches!(orphan, Err(Error::Store(_)));
        assert!(store.get(&child.id).await.unwrap().is_none());

        store
            .upsert(InventoryUpdate::replace(ep.clone(), vec![child.clone(), parent.clone()]))
            .await
            .unwrap();
        assert_eq!(store.get(&child.id).await.unwrap().unwrap().parent, parent.id);
        assert_eq!(store.get(&parent.id).await.unwrap().unwrap().parent.as_str(), ep.as_str());

        let children = store
            .list(&ComponentFilter::all().with_parent(parent.id.as_str()))
            .await
            .unwrap();
        assert_eq!(children.len(), 1);

        // Deleting the parent row takes the child with it.
        let id = parent.id.clone();
        store
            .with_conn(move |conn| {
                conn.execute("DELETE FROM components WHERE id = ?1", params![id.as_str()])?;
                Ok(())
            })
            .await
            .unwrap();
        assert!(store.get(&child.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_foreign_records_rejected() {
        let store = SqliteInventoryStore::open_in_memory().unwrap();
        store
            .upsert(InventoryUpdate::replace(
                "x0c0s0b0n0",
                vec![nic("x0c0s0b0n0", "a", "/n/1", "aa:aa:aa:aa:aa:01")],
            ))
            .await
            .unwrap();

        let mislabelled = store
            .upsert(InventoryUpdate::replace(
                "x0c0s1b0n0",
                vec![nic("x0c0s0b0n0", "b", "/n/1", "aa:aa:aa:aa:aa:02")],
            ))
            .await;
        assert_matches!(mislabelled, Err(Error::ForeignComponent { .. }));

        let hijack = store
            .upsert(InventoryUpdate::replace(
                "x0c0s1b0n0",
                vec![nic("x0c0s1b0n0", "a", "/n/1", "aa:aa:aa:aa:aa:03")],
            ))
            .await;
        assert_matches!(
            hijack,
            Err(Error::ForeignComponent { ref owner, .. }) if owner == "x0c0s0b0n0"
        );

        let kept = store.get(&"a".into()).await.unwrap().unwrap();
        assert_eq!(kept.endpoint.as_str(), "x0c0s0b0n0");
        assert_eq!(kept.mac(), Some("aa:aa:aa:aa:aa:01"));
        assert!(store
            .list(&ComponentFilter::endpoint("x0c0s1b0n0"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_status() {
        let store = SqliteInventoryStore::open_in_memory().unwrap();
        let ep = EndpointId::new("x0c0s0b0n0");
        assert!(store.endpoint_status(&ep).await.unwrap().is_none());

        let ok_at = chrono::Utc::now();
        store
            .record_endpoint_status(
                EndpointStatusRecord::new(ep.clone(), DiscoveryStatus::Verified).succeeded_at(ok_at),
            )
            .await
            .unwrap();
        store
            .record_endpoint_status(
                EndpointStatusRecord::new(ep.clone(), DiscoveryStatus::FetchFailed)
                    .with_message("timed out"),
            )
            .await
            .unwrap();

        let status = store.endpoint_status(&ep).await.unwrap().unwrap();
        assert_eq!(status.status, DiscoveryStatus::FetchFailed);
        assert_eq!(
            status.last_success.map(|t| t.timestamp_millis()),
            Some(ok_at.timestamp_millis())
        );
        assert!(store.health_check().await.unwrap());
    }
}
