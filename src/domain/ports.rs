//! Domain Ports (Port/Adapter Pattern)
//!
//! Abstractions the discovery core depends on. Adapters in
//! [`crate::adapters`] implement them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  InventoryStore │ EventPublisher │ TopologyProvider │    │
//! │  │                 HeartbeatProvider                    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  MemoryInventoryStore │ SqliteInventoryStore │ ...  │    │
//! │  │  SlsTopology │ StaticTopology │ HbtdClient          │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::events::DomainEvent;
use crate::discovery::aggregate::{ComponentId, ComponentRecord};
use crate::error::Result;
use crate::inventory::{ChangeSet, ComponentFilter, EndpointStatusRecord, InventoryUpdate};
use crate::redfish::{EndpointDescriptor, EndpointId};

// =============================================================================
// Value Objects
// =============================================================================

/// Topology facts about one component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub role: Option<String>,
    pub sub_role: Option<String>,
    pub nid: Option<u64>,
    pub parent: Option<String>,
}

impl NodeInfo {
    pub fn is_empty(&self) -> bool {
        self == &NodeInfo::default()
    }
}

/// Liveness of one component as reported by the heartbeat tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatState {
    #[serde(rename = "XName")]
    pub xname: String,
    #[serde(rename = "Heartbeating")]
    pub heartbeating: bool,
}

// =============================================================================
// Inventory Store Port
// =============================================================================

/// Canonical inventory persistence.
///
/// Implementations must:
/// - apply `upsert` atomically per endpoint; concurrent readers see the
///   whole prior set or the whole next set
/// - serialize concurrent upserts for the same endpoint and never block
///   writers of other endpoints
/// - reject an update whose generation is older than the endpoint's last
///   committed generation with `Error::StoreConflict`
/// - return an empty [`ChangeSet`] for an update identical to stored state
/// - bound read waits, failing with `Error::StoreBusy` rather than hanging
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Replace the endpoint's component set.
    async fn upsert(&self, update: InventoryUpdate) -> Result<ChangeSet>;

    /// Look up one component.
    async fn get(&self, id: &ComponentId) -> Result<Option<ComponentRecord>>;

    /// Components matching `filter`, ordered by identifier.
    async fn list(&self, filter: &ComponentFilter) -> Result<Vec<ComponentRecord>>;

    /// Record the outcome of a discovery attempt without touching records.
    async fn record_endpoint_status(&self, status: EndpointStatusRecord) -> Result<()>;

    /// Last recorded discovery outcome.
    async fn endpoint_status(&self, endpoint: &EndpointId) -> Result<Option<EndpointStatusRecord>>;

    /// Backend reachable and usable.
    async fn health_check(&self) -> Result<bool>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing domain events.
///
/// Delivery is best-effort from the engine's side: callers log failures
/// and never undo the change that produced the event.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a single domain event.
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    /// Publish multiple domain events.
    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()>;
}

// =============================================================================
// Topology Port
// =============================================================================

/// Authoritative source of endpoints and their locations.
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    /// Service is up and its data can be trusted.
    async fn is_ready(&self) -> Result<bool>;

    /// Role, NID and parent of one component.
    async fn get_node_info(&self, id: &str) -> Result<NodeInfo>;

    /// Endpoints that should be discovered.
    async fn list_endpoints(&self) -> Result<Vec<EndpointDescriptor>>;
}

// =============================================================================
// Heartbeat Port
// =============================================================================

/// Liveness queries; consumed by health logic, not by discovery.
#[async_trait]
pub trait HeartbeatProvider: Send + Sync {
    async fn get_heartbeat_status(&self, ids: &[String]) -> Result<Vec<HeartbeatState>>;
}
