//! Store decorator that publishes inventory change events

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::discovery::aggregate::{ComponentId, ComponentRecord};
use crate::domain::ports::{EventPublisher, InventoryStore};
use crate::error::Result;
use crate::inventory::{ChangeSet, ComponentFilter, EndpointStatusRecord, InventoryUpdate};
use crate::redfish::EndpointId;

/// Publishes `ComponentAdded/Changed/Removed` after each committed upsert
/// that changed state. A publish failure is logged; the commit stands.
pub struct PublishingStore<S> {
    inner: S,
    publisher: Arc<dyn EventPublisher>,
}

impl<S: InventoryStore> PublishingStore<S> {
    pub fn new(inner: S, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { inner, publisher }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S> std::fmt::Debug for PublishingStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishingStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl<S: InventoryStore> InventoryStore for PublishingStore<S> {
    async fn upsert(&self, update: InventoryUpdate) -> Result<ChangeSet> {
        let endpoint = update.endpoint.clone();
        let changes = self.inner.upsert(update).await?;

        if changes.is_empty() {
            debug!(endpoint = %endpoint, "No inventory changes to publish");
            return Ok(changes);
        }
        if let Err(e) = self.publisher.publish_all(changes.to_events(&endpoint)).await {
            warn!(endpoint = %endpoint, error = %e, changes = changes.len(), "Failed to publish inventory changes");
        }
        Ok(changes)
    }

    async fn get(&self, id: &ComponentId) -> Result<Option<ComponentRecord>> {
        self.inner.get(id).await
    }

    async fn list(&self, filter: &ComponentFilter) -> Result<Vec<ComponentRecord>> {
        self.inner.list(filter).await
    }

    async fn record_endpoint_status(&self, status: EndpointStatusRecord) -> Result<()> {
        self.inner.record_endpoint_status(status).await
    }

    async fn endpoint_status(&self, endpoint: &EndpointId) -> Result<Option<EndpointStatusRecord>> {
        self.inner.endpoint_status(endpoint).await
    }

    async fn health_check(&self) -> Result<bool> {
        self.inner.health_check().await
    }
}
