//! Domain Layer
//!
//! # Architecture
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for the inventory store,
//!   event delivery and the topology and heartbeat services
//! - **Events** (`events.rs`) - Domain events for inventory changes and
//!   discovery outcomes
//!
//! # Usage
//!
//! ```ignore
//! use hsm::domain::ports::{InventoryStore, TopologyProvider};
//!
//! async fn sweep<S, T>(store: &S, topology: &T) -> Result<()>
//! where
//!     S: InventoryStore,
//!     T: TopologyProvider,
//! {
//!     for endpoint in topology.list_endpoints().await? {
//!         let status = store.endpoint_status(&endpoint.id).await?;
//!         // ...
//!     }
//!     Ok(())
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::DomainEvent;
pub use ports::{
    EventPublisher, HeartbeatProvider, HeartbeatState, InventoryStore, NodeInfo,
    TopologyProvider,
};
