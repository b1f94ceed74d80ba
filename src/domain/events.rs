//! Domain Events
//!
//! Immutable records of inventory changes and discovery outcomes, published
//! after the fact. Component events are emitted only for committed upserts
//! that changed observable state; run events for every finished run.
//!
//! # Example
//!
//! ```ignore
//! let event = DomainEvent::component_added(&endpoint, &record);
//! event_publisher.publish(event).await?;
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::discovery::aggregate::ComponentRecord;
use crate::discovery::DiscoveryStatus;
use crate::redfish::EndpointId;

/// Domain event representing a significant occurrence in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Component Events
    // =========================================================================
    /// A component appeared in an endpoint's inventory.
    ComponentAdded {
        endpoint: String,
        component_id: String,
        kind: String,
        mac: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A component's content changed.
    ComponentChanged {
        endpoint: String,
        component_id: String,
        kind: String,
        fields: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// A component left an endpoint's inventory.
    ComponentRemoved {
        endpoint: String,
        component_id: String,
        kind: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Discovery Run Events
    // =========================================================================
    /// A run committed its results.
    DiscoveryCompleted {
        endpoint: String,
        run_id: String,
        status: DiscoveryStatus,
        components: usize,
        changes: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A run ended without committing.
    DiscoveryFailed {
        endpoint: String,
        run_id: String,
        status: DiscoveryStatus,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::ComponentAdded { timestamp, .. } => *timestamp,
            DomainEvent::ComponentChanged { timestamp, .. } => *timestamp,
            DomainEvent::ComponentRemoved { timestamp, .. } => *timestamp,
            DomainEvent::DiscoveryCompleted { timestamp, .. } => *timestamp,
            DomainEvent::DiscoveryFailed { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::ComponentAdded { .. } => "ComponentAdded",
            DomainEvent::ComponentChanged { .. } => "ComponentChanged",
            DomainEvent::ComponentRemoved { .. } => "ComponentRemoved",
            DomainEvent::DiscoveryCompleted { .. } => "DiscoveryCompleted",
            DomainEvent::DiscoveryFailed { .. } => "DiscoveryFailed",
        }
    }

    /// Get the endpoint the event concerns.
    pub fn endpoint(&self) -> &str {
        match self {
            DomainEvent::ComponentAdded { endpoint, .. }
            | DomainEvent::ComponentChanged { endpoint, .. }
            | DomainEvent::ComponentRemoved { endpoint, .. }
            | DomainEvent::DiscoveryCompleted { endpoint, .. }
            | DomainEvent::DiscoveryFailed { endpoint, .. } => endpoint,
        }
    }

    /// True for events describing an inventory change.
    pub fn is_inventory_change(&self) -> bool {
        matches!(
            self,
            DomainEvent::ComponentAdded { .. }
                | DomainEvent::ComponentChanged { .. }
                | DomainEvent::ComponentRemoved { .. }
        )
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl DomainEvent {
    /// Create a ComponentAdded event.
    pub fn component_added(endpoint: &EndpointId, record: &ComponentRecord) -> Self {
        DomainEvent::ComponentAdded {
            endpoint: endpoint.to_string(),
            component_id: record.id.to_string(),
            kind: record.kind.to_string(),
            mac: record.mac().map(String::from),
            timestamp: Utc::now(),
        }
    }

    /// Create a ComponentChanged event.
    pub fn component_changed(
        endpoint: &EndpointId,
        record: &ComponentRecord,
        fields: Vec<String>,
    ) -> Self {
        DomainEvent::ComponentChanged {
            endpoint: endpoint.to_string(),
            component_id: record.id.to_string(),
            kind: record.kind.to_string(),
            fields,
            timestamp: Utc::now(),
        }
    }

    /// Create a ComponentRemoved event.
    pub fn component_removed(endpoint: &EndpointId, record: &ComponentRecord) -> Self {
        DomainEvent::ComponentRemoved {
            endpoint: endpoint.to_string(),
            component_id: record.id.to_string(),
            kind: record.kind.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Create a DiscoveryCompleted event.
    pub fn discovery_completed(
        endpoint: &EndpointId,
        run_id: impl Into<String>,
        status: DiscoveryStatus,
        components: usize,
        changes: usize,
        duration: Duration,
    ) -> Self {
        DomainEvent::DiscoveryCompleted {
            endpoint: endpoint.to_string(),
            run_id: run_id.into(),
            status,
            components,
            changes,
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    /// Create a DiscoveryFailed event.
    pub fn discovery_failed(
        endpoint: &EndpointId,
        run_id: impl Into<String>,
        status: DiscoveryStatus,
        reason: impl Into<String>,
    ) -> Self {
        DomainEvent::DiscoveryFailed {
            endpoint: endpoint.to_string(),
            run_id: run_id.into(),
            status,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::aggregate::{ComponentKind, ATTR_MAC};

    fn record() -> ComponentRecord {
        ComponentRecord::new(
            "x0c0s0b0n0/ncsi-1-1-0-node_eth",
            ComponentKind::NodeEnetInterface,
            &EndpointId::new("x0c0s0b0n0"),
            "/redfish/v1/Systems/Self/Oem/Insyde/Ncsi/1/Package/1",
        )
        .with_attribute(ATTR_MAC, "b4:96:91:5f:3a:20")
    }

    #[test]
    fn test_event_serialization() {
        let event = DomainEvent::component_added(&EndpointId::new("x0c0s0b0n0"), &record());

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"ComponentAdded""#));
        assert!(json.contains("b4:96:91:5f:3a:20"));

        let deserialized: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.event_type(), "ComponentAdded");
        assert_eq!(deserialized.endpoint(), "x0c0s0b0n0");
    }

    #[test]
    fn test_inventory_change_classification() {
        let ep = EndpointId::new("x0c0s0b0n0");
        assert!(DomainEvent::component_removed(&ep, &record()).is_inventory_change());
        assert!(DomainEvent::component_changed(&ep, &record(), vec![ATTR_MAC.into()])
            .is_inventory_change());

        let run = DomainEvent::discovery_completed(
            &ep,
            "run-1",
            DiscoveryStatus::Verified,
            1,
            0,
            Duration::from_millis(1500),
        );
        assert!(!run.is_inventory_change());
        assert_eq!(run.event_type(), "DiscoveryCompleted");
        match run {
            DomainEvent::DiscoveryCompleted { duration_ms, .. } => assert_eq!(duration_ms, 1500),
            _ => unreachable!(),
        }
    }
}
