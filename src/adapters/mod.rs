//! Infrastructure Adapters
//!
//! Implementations of the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  InventoryStore │ EventPublisher │ TopologyProvider │ ...   │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ MemoryInventoryStore │ SqliteInventoryStore │ PublishingStore│ │
//! │  │ SlsTopology │ StaticTopology │ HbtdClient                  │ │
//! │  │ LoggingEventPublisher │ CompositeEventPublisher            │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use hsm::adapters::{LoggingEventPublisher, MemoryInventoryStore, PublishingStore};
//! use hsm::domain::ports::InventoryStore;
//!
//! let store = PublishingStore::new(
//!     MemoryInventoryStore::new(),
//!     Arc::new(LoggingEventPublisher::info_level()),
//! );
//! let changes = store.upsert(update).await?;
//! ```

mod event_publisher;
mod heartbeat;
mod memory_store;
mod publishing_store;
mod recording_store;
mod sqlite_store;
mod topology;

#[cfg(test)]
pub(crate) mod test_server;

pub use event_publisher::{CompositeEventPublisher, InMemoryEventCollector, LoggingEventPublisher};
pub use heartbeat::{HbtdClient, DEFAULT_HBTD_URL};
pub use memory_store::MemoryInventoryStore;
pub use publishing_store::PublishingStore;
pub use recording_store::{RecordingInventoryStore, StoreOperation};
pub use sqlite_store::{SqliteInventoryStore, SqliteStoreConfig};
pub use topology::{SlsTopology, StaticTopology, DEFAULT_SLS_URL};
