//! Recording inventory store (test double)
//!
//! Wraps [`MemoryInventoryStore`] and keeps a log of every operation issued
//! against it, so tests can assert what a run asked the store to do and
//! that an aborted run asked for nothing.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::memory_store::MemoryInventoryStore;
use crate::discovery::aggregate::{ComponentId, ComponentRecord};
use crate::domain::ports::InventoryStore;
use crate::error::{Error, Result};
use crate::inventory::{ChangeSet, ComponentFilter, EndpointStatusRecord, InventoryUpdate};
use crate::redfish::EndpointId;

/// One call made against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOperation {
    Upsert(InventoryUpdate),
    Get(ComponentId),
    List(ComponentFilter),
    RecordStatus(EndpointStatusRecord),
    EndpointStatus(EndpointId),
    HealthCheck,
}

#[derive(Debug, Default)]
pub struct RecordingInventoryStore {
    inner: MemoryInventoryStore,
    operations: Mutex<Vec<StoreOperation>>,
    fail_upserts: AtomicBool,
}

impl RecordingInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following upsert fail with a backend error.
    pub fn fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    pub fn operations(&self) -> Vec<StoreOperation> {
        self.operations.lock().clone()
    }

    /// Upserts issued so far, in call order.
    pub fn upserts(&self) -> Vec<InventoryUpdate> {
        self.operations
            .lock()
            .iter()
            .filter_map(|op| match op {
                StoreOperation::Upsert(update) => Some(update.clone()),
                _ => None,
            })
            .collect()
    }

    /// Status records written so far, in call order.
    pub fn statuses(&self) -> Vec<EndpointStatusRecord> {
        self.operations
            .lock()
            .iter()
            .filter_map(|op| match op {
                StoreOperation::RecordStatus(status) => Some(status.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.operations.lock().clear();
    }

    /// The wrapped store, for reading state without recording.
    pub fn inner(&self) -> &MemoryInventoryStore {
        &self.inner
    }

    fn record(&self, op: StoreOperation) {
        self.operations.lock().push(op);
    }
}

#[async_trait]
impl InventoryStore for RecordingInventoryStore {
    async fn upsert(&self, update: InventoryUpdate) -> Result<ChangeSet> {
        self.record(StoreOperation::Upsert(update.clone()));
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(Error::Store("injected upsert failure".to_string()));
        }
        self.inner.upsert(update).await
    }

    async fn get(&self, id: &ComponentId) -> Result<Option<ComponentRecord>> {
        self.record(StoreOperation::Get(id.clone()));
        self.inner.get(id).await
    }

    async fn list(&self, filter: &ComponentFilter) -> Result<Vec<ComponentRecord>> {
        self.record(StoreOperation::List(filter.clone()));
        self.inner.list(filter).await
    }

    async fn record_endpoint_status(&self, status: EndpointStatusRecord) -> Result<()> {
        self.record(StoreOperation::RecordStatus(status.clone()));
        self.inner.record_endpoint_status(status).await
    }

    async fn endpoint_status(&self, endpoint: &EndpointId) -> Result<Option<EndpointStatusRecord>> {
        self.record(StoreOperation::EndpointStatus(endpoint.clone()));
        self.inner.endpoint_status(endpoint).await
    }

    async fn health_check(&self) -> Result<bool> {
        self.record(StoreOperation::HealthCheck);
        self.inner.health_check().await
    }
}
