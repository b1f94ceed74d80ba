//! Hardware State Manager - Redfish Discovery and Inventory Reconciliation
//!
//! Crawls the Redfish management interface of every hardware endpoint listed
//! by the topology service, normalises what it finds into vendor-neutral
//! component records, and reconciles them into a canonical inventory. A run
//! replaces an endpoint's records as one unit or leaves them alone, so the
//! inventory always shows the last fully verified view of each endpoint.
//!
//! # Architecture
//!
//! ```text
//! Topology → Scheduler → DiscoveryEngine (driver per vendor) → InventoryStore → Events
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Store backends, topology and heartbeat clients, event publishers
//! - [`discovery`] - Discovery engine, drivers, per-resource state machine
//! - [`domain`] - Ports and domain events
//! - [`error`] - Error types
//! - [`inventory`] - Store contract types and the upsert diff
//! - [`metrics`] - Prometheus metrics
//! - [`redfish`] - Endpoint descriptors, HTTPS client, payload model, simulator
//! - [`scheduler`] - Run scheduling, concurrency bounds, commit/abort

pub mod adapters;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod inventory;
pub mod metrics;
pub mod redfish;
pub mod scheduler;

// Re-export commonly used types
pub use discovery::{
    ComponentId, ComponentKind, ComponentRecord, DiscoveryConfig, DiscoveryEngine,
    DiscoveryStatus, SystemAggregate,
};
pub use error::{Error, Result};
pub use inventory::{ChangeSet, ComponentFilter, InventoryUpdate};
pub use redfish::{Credentials, EndpointDescriptor, EndpointId};
pub use scheduler::{DiscoveryScheduler, SchedulerConfig};
