//! In-memory inventory store
//!
//! The whole inventory is one snapshot behind a `parking_lot::RwLock`. An
//! upsert plans against a read of the endpoint's records and swaps them in
//! under one short write lock, so readers see all of a run or none of it.
//! Writers for the same endpoint queue on a per-endpoint async mutex;
//! writers for different endpoints only meet at the swap.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, instrument};

use crate::discovery::aggregate::{ComponentId, ComponentRecord};
use crate::domain::ports::InventoryStore;
use crate::error::{Error, Result};
use crate::inventory::{
    plan_upsert, ChangeSet, ComponentFilter, EndpointStatusRecord, InventoryUpdate,
};
use crate::redfish::EndpointId;

#[derive(Debug, Default)]
struct Snapshot {
    components: HashMap<ComponentId, ComponentRecord>,
    by_endpoint: HashMap<EndpointId, BTreeSet<ComponentId>>,
    generations: HashMap<EndpointId, u64>,
    statuses: HashMap<EndpointId, EndpointStatusRecord>,
}

impl Snapshot {
    fn endpoint_records(&self, endpoint: &EndpointId) -> BTreeMap<ComponentId, ComponentRecord> {
        self.by_endpoint
            .get(endpoint)
            .into_iter()
            .flatten()
            .filter_map(|id| self.components.get(id).map(|r| (id.clone(), r.clone())))
            .collect()
    }
}

/// Inventory held in process memory.
#[derive(Debug)]
pub struct MemoryInventoryStore {
    snapshot: RwLock<Snapshot>,
    writers: DashMap<EndpointId, Arc<tokio::sync::Mutex<()>>>,
    lock_timeout: Duration,
}

impl Default for MemoryInventoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryInventoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(Duration::from_secs(5))
    }

    /// Store whose snapshot reads and swaps give up after `lock_timeout`.
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            snapshot: RwLock::new(Snapshot::default()),
            writers: DashMap::new(),
            lock_timeout,
        }
    }

    /// Number of stored components across all endpoints.
    pub fn len(&self) -> usize {
        self.snapshot.read().components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Snapshot>> {
        self.snapshot
            .try_read_for(self.lock_timeout)
            .ok_or(Error::StoreBusy {
                waited: self.lock_timeout,
            })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Snapshot>> {
        self.snapshot
            .try_write_for(self.lock_timeout)
            .ok_or(Error::StoreBusy {
                waited: self.lock_timeout,
            })
    }

    fn writer_lock(&self, endpoint: &EndpointId) -> Arc<tokio::sync::Mutex<()>> {
        self.writers
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl InventoryStore for MemoryInventoryStore {
    #[instrument(skip(self, update), fields(endpoint = %update.endpoint, generation = update.generation))]
    async fn upsert(&self, update: InventoryUpdate) -> Result<ChangeSet> {
        update.check_ownership()?;
        let lock = self.writer_lock(&update.endpoint);
        let _serialized = lock.lock().await;

        let (prior, committed_generation) = {
            let snapshot = self.read()?;
            (
                snapshot.endpoint_records(&update.endpoint),
                snapshot.generations.get(&update.endpoint).copied(),
            )
        };

        if let Some(committed) = committed_generation {
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

        let plan = plan_upsert(&prior, &update);
        let writes = plan.writes(&prior).count();

        {
            let mut snapshot = self.write()?;
            // Checked under the write lock: other endpoints' writers do not
            // hold this endpoint's mutex.
            if let Some(owner) = plan.next.keys().find_map(|id| {
                snapshot
                    .components
                    .get(id)
                    .filter(|stored| stored.endpoint != update.endpoint)
            }) {
                return Err(update.foreign(&owner.id, &owner.endpoint));
            }
            for id in prior.keys() {
                if !plan.next.contains_key(id) {
                    snapshot.components.remove(id);
                }
            }
            for record in plan.next.values() {
                snapshot.components.insert(record.id.clone(), record.clone());
            }
            snapshot
                .by_endpoint
                .insert(update.endpoint.clone(), plan.next.keys().cloned().collect());
            snapshot
                .generations
                .insert(update.endpoint.clone(), update.generation);
        }

        debug!(
            added = plan.changes.added.len(),
            changed = plan.changes.changed.len(),
            removed = plan.changes.removed.len(),
            preserved = plan.changes.preserved,
            writes,
            "Upsert applied"
        );
        Ok(plan.changes)
    }

    async fn get(&self, id: &ComponentId) -> Result<Option<ComponentRecord>> {
        Ok(self.read()?.components.get(id).cloned())
    }

    async fn list(&self, filter: &ComponentFilter) -> Result<Vec<ComponentRecord>> {
        let snapshot = self.read()?;
        let mut records: Vec<ComponentRecord> = match &filter.endpoint {
            Some(endpoint) => snapshot.endpoint_records(endpoint).into_values().collect(),
            None => snapshot.components.values().cloned().collect(),
        };
        records.retain(|r| filter.matches(r));
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn record_endpoint_status(&self, status: EndpointStatusRecord) -> Result<()> {
        let mut snapshot = self.write()?;
        let last_success = status.last_success.or_else(|| {
            snapshot
                .statuses
                .get(&status.endpoint)
                .and_then(|s| s.last_success)
        });
        snapshot.statuses.insert(
            status.endpoint.clone(),
            EndpointStatusRecord {
                last_success,
                ..status
            },
        );
        Ok(())
    }

    async fn endpoint_status(&self, endpoint: &EndpointId) -> Result<Option<EndpointStatusRecord>> {
        Ok(self.read()?.statuses.get(endpoint).cloned())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.snapshot.try_read_for(self.lock_timeout).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::discovery::aggregate::{ComponentKind, ATTR_MAC};
    use crate::discovery::DiscoveryStatus;

    fn nic(endpoint: &str, id: &str, mac: &str) -> ComponentRecord {
        ComponentRecord::new(
            id,
            ComponentKind::NodeEnetInterface,
            &EndpointId::new(endpoint),
            "/redfish/v1/Systems/1/EthernetInterfaces/1",
        )
        .with_attribute(ATTR_MAC, mac)
    }

    #[tokio::test]
    async fn test_upsert_and_query() {
        let store = MemoryInventoryStore::new();
        let changes = store
            .upsert(InventoryUpdate::replace(
                "x0c0s0b0n0",
                vec![nic("x0c0s0b0n0", "x0c0s0b0n0/eth1", "aa:aa:aa:aa:aa:01")],
            ))
            .await
            .unwrap();
        assert_eq!(changes.added.len(), 1);

        let found = store.get(&"x0c0s0b0n0/eth1".into()).await.unwrap();
        assert_eq!(found.unwrap().mac(), Some("aa:aa:aa:aa:aa:01"));

        let listed = store
            .list(&ComponentFilter::endpoint("x0c0s0b0n0"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store.get(&"missing".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repeat_upsert_is_noop() {
        let store = MemoryInventoryStore::new();
        let records = vec![nic("x0c0s0b0n0", "x0c0s0b0n0/eth1", "aa:aa:aa:aa:aa:01")];

        store
            .upsert(InventoryUpdate::replace("x0c0s0b0n0", records.clone()))
            .await
            .unwrap();
        let second = store
            .upsert(InventoryUpdate::replace("x0c0s0b0n0", records))
            .await
            .unwrap();

        assert!(second.is_empty());
        assert_eq!(second.unchanged, 1);
    }

    #[tokio::test]
    async fn test_endpoints_are_independent() {
        let store = MemoryInventoryStore::new();
        store
            .upsert(InventoryUpdate::replace(
                "x0c0s0b0n0",
                vec![nic("x0c0s0b0n0", "x0c0s0b0n0/eth1", "aa:aa:aa:aa:aa:01")],
            ))
            .await
            .unwrap();
        store
            .upsert(InventoryUpdate::replace(
                "x0c0s1b0n0",
                vec![nic("x0c0s1b0n0", "x0c0s1b0n0/eth1", "aa:aa:aa:aa:aa:02")],
            ))
            .await
            .unwrap();

        let cleared = store
            .upsert(InventoryUpdate::replace("x0c0s0b0n0", vec![]))
            .await
            .unwrap();
        assert_eq!(cleared.removed.len(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get(&"x0c0s1b0n0/eth1".into()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_generation_rejected() {
        let store = MemoryInventoryStore::new();
        store
            .upsert(InventoryUpdate::replace("x0c0s0b0n0", vec![]).with_generation(5))
            .await
            .unwrap();

        let stale = store
            .upsert(
                InventoryUpdate::replace(
                    "x0c0s0b0n0",
                    vec![nic("x0c0s0b0n0", "x0c0s0b0n0/eth1", "aa:aa:aa:aa:aa:01")],
                )
                .with_generation(4),
            )
            .await;
        assert_matches!(stale, Err(Error::StoreConflict { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_records_rejected() {
        let store = MemoryInventoryStore::new();
        store
            .upsert(InventoryUpdate::replace(
                "x0c0s0b0n0",
                vec![nic("x0c0s0b0n0", "x0c0s0b0n0/eth1", "aa:aa:aa:aa:aa:01")],
            ))
            .await
            .unwrap();

        // Record stamped with another endpoint.
        let mislabelled = store
            .upsert(InventoryUpdate::replace(
                "x0c0s1b0n0",
                vec![nic("x0c0s0b0n0", "x0c0s1b0n0/eth1", "aa:aa:aa:aa:aa:02")],
            ))
            .await;
        assert_matches!(mislabelled, Err(Error::ForeignComponent { .. }));

        // Id already owned by another endpoint.
        let hijack = store
            .upsert(InventoryUpdate::replace(
                "x0c0s1b0n0",
                vec![nic("x0c0s1b0n0", "x0c0s0b0n0/eth1", "aa:aa:aa:aa:aa:03")],
            ))
            .await;
        assert_matches!(
            hijack,
            Err(Error::ForeignComponent { ref owner, .. }) if owner == "x0c0s0b0n0"
        );

        let kept = store.get(&"x0c0s0b0n0/eth1".into()).await.unwrap().unwrap();
        assert_eq!(kept.mac(), Some("aa:aa:aa:aa:aa:01"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_endpoint_status_keeps_last_success() {
        let store = MemoryInventoryStore::new();
        let ep = EndpointId::new("x0c0s0b0n0");
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
                    .with_message("connection refused"),
            )
            .await
            .unwrap();

        let status = store.endpoint_status(&ep).await.unwrap().unwrap();
        assert_eq!(status.status, DiscoveryStatus::FetchFailed);
        assert_eq!(status.last_success, Some(ok_at));
        assert_eq!(status.message.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn test_concurrent_upserts_serialize() {
        let store = Arc::new(MemoryInventoryStore::new());
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mac = format!("aa:aa:aa:aa:aa:{:02x}", i);
                store
                    .upsert(
                        InventoryUpdate::replace(
                            "x0c0s0b0n0",
                            vec![nic("x0c0s0b0n0", "x0c0s0b0n0/eth1", &mac)],
                        )
                        .with_generation(i),
                    )
                    .await
            }));
        }
        for handle in handles {
            let _ = handle.await.unwrap();
        }

        let listed = store.list(&ComponentFilter::all()).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_read_gives_up_when_snapshot_held() {
        let store = MemoryInventoryStore::with_lock_timeout(Duration::from_millis(20));
        let _held = store.snapshot.write();
        let result = store.get(&"x".into()).await;
        assert_matches!(result, Err(Error::StoreBusy { .. }));
    }
}
