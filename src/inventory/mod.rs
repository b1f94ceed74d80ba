//! Inventory store contract
//!
//! Value types shared by every [`InventoryStore`](crate::domain::ports::InventoryStore)
//! backend, and the merge/diff rule they all apply:
//!
//! ```text
//! next = verified records of this run
//!      ∪ prior records under a failed source path (not re-emitted this run)
//! added   = next − prior
//! changed = next ∩ prior with different content
//! removed = prior − next
//! ```
//!
//! A backend applies `next` as one atomic replacement of the endpoint's set
//! and reports the [`ChangeSet`]. An empty change set means nothing observable
//! happened and no events are published.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::discovery::aggregate::{path_is_under, ComponentId, ComponentKind, ComponentRecord};
use crate::discovery::{DiscoveryStatus, SystemAggregate};
use crate::domain::events::DomainEvent;
use crate::error::{Error, Result};
use crate::redfish::EndpointId;

// =============================================================================
// Update
// =============================================================================

/// Full replacement of one endpoint's component set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryUpdate {
    pub endpoint: EndpointId,
    /// Monotonic run generation; a store rejects updates older than the
    /// last committed one for the endpoint.
    pub generation: u64,
    pub records: Vec<ComponentRecord>,
    /// Source paths that failed this run; prior records under them survive.
    pub preserve: BTreeSet<String>,
}

impl InventoryUpdate {
    /// Replace the endpoint's set with `records`.
    pub fn replace(endpoint: impl Into<EndpointId>, records: Vec<ComponentRecord>) -> Self {
        Self {
            endpoint: endpoint.into(),
            generation: 0,
            records,
            preserve: BTreeSet::new(),
        }
    }

    /// Build from a committable aggregate.
    pub fn from_aggregate(agg: &SystemAggregate, generation: u64) -> Self {
        Self {
            endpoint: agg.endpoint.clone(),
            generation,
            records: agg.records().into_iter().cloned().collect(),
            preserve: agg.failed_sources(),
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn preserving<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preserve.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Every record must belong to the endpoint being replaced.
    pub fn check_ownership(&self) -> Result<()> {
        match self.records.iter().find(|r| r.endpoint != self.endpoint) {
            Some(foreign) => Err(self.foreign(&foreign.id, &foreign.endpoint)),
            None => Ok(()),
        }
    }

    /// Ownership error for `component`, held by `owner`.
    pub fn foreign(&self, component: &ComponentId, owner: &EndpointId) -> Error {
        Error::ForeignComponent {
            endpoint: self.endpoint.to_string(),
            component: component.to_string(),
            owner: owner.to_string(),
        }
    }

    /// True when a prior record at `source_path` must be kept.
    pub fn preserves(&self, source_path: &str) -> bool {
        self.preserve
            .iter()
            .any(|prefix| path_is_under(source_path, prefix))
    }
}

// =============================================================================
// Change Set
// =============================================================================

/// One changed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentChange {
    pub before: ComponentRecord,
    pub after: ComponentRecord,
    pub fields: Vec<String>,
}

/// Observable effect of an upsert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub added: Vec<ComponentRecord>,
    pub changed: Vec<ComponentChange>,
    pub removed: Vec<ComponentRecord>,
    /// Prior records retained because their source failed this run
    pub preserved: usize,
    /// Records identical to what was stored
    pub unchanged: usize,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.changed.len() + self.removed.len()
    }

    /// Change events for publication, in added/changed/removed order.
    pub fn to_events(&self, endpoint: &EndpointId) -> Vec<DomainEvent> {
        let mut events = Vec::with_capacity(self.len());
        events.extend(
            self.added
                .iter()
                .map(|r| DomainEvent::component_added(endpoint, r)),
        );
        events.extend(
            self.changed
                .iter()
                .map(|c| DomainEvent::component_changed(endpoint, &c.after, c.fields.clone())),
        );
        events.extend(
            self.removed
                .iter()
                .map(|r| DomainEvent::component_removed(endpoint, r)),
        );
        events
    }
}

/// Result of planning an upsert against the prior set.
#[derive(Debug, Clone)]
pub struct UpsertPlan {
    /// The endpoint's full set after commit
    pub next: BTreeMap<ComponentId, ComponentRecord>,
    pub changes: ChangeSet,
}

impl UpsertPlan {
    /// Records whose stored row must be written (new or not byte-identical).
    pub fn writes<'a>(
        &'a self,
        prior: &'a BTreeMap<ComponentId, ComponentRecord>,
    ) -> impl Iterator<Item = &'a ComponentRecord> + 'a {
        self.next
            .values()
            .filter(move |r| prior.get(&r.id) != Some(*r))
    }
}

/// Merge `update` over the endpoint's `prior` records.
///
/// Only `Verified` records from the update are eligible; anything else is
/// treated as if the run had not produced it.
pub fn plan_upsert(
    prior: &BTreeMap<ComponentId, ComponentRecord>,
    update: &InventoryUpdate,
) -> UpsertPlan {
    let mut next: BTreeMap<ComponentId, ComponentRecord> = update
        .records
        .iter()
        .filter(|r| r.status == DiscoveryStatus::Verified)
        .map(|r| (r.id.clone(), r.clone()))
        .collect();

    let mut changes = ChangeSet::default();

    let preserved: BTreeSet<ComponentId> = prior
        .iter()
        .filter(|(id, record)| !next.contains_key(*id) && update.preserves(&record.source_path))
        .map(|(id, _)| id.clone())
        .collect();
    for id in &preserved {
        if let Some(record) = prior.get(id) {
            next.insert(id.clone(), record.clone());
        }
    }
    changes.preserved = preserved.len();

    for (id, record) in next.iter().filter(|(id, _)| !preserved.contains(*id)) {
        match prior.get(id) {
            None => changes.added.push(record.clone()),
            Some(before) => {
                let fields = before.changed_fields(record);
                if fields.is_empty() {
                    changes.unchanged += 1;
                } else {
                    changes.changed.push(ComponentChange {
                        before: before.clone(),
                        after: record.clone(),
                        fields,
                    });
                }
            }
        }
    }

    for (id, record) in prior {
        if !next.contains_key(id) {
            changes.removed.push(record.clone());
        }
    }

    UpsertPlan { next, changes }
}

// =============================================================================
// Queries
// =============================================================================

/// Conjunctive filter for `list`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentFilter {
    pub endpoint: Option<EndpointId>,
    pub kind: Option<ComponentKind>,
    pub parent: Option<ComponentId>,
    pub mac: Option<String>,
}

impl ComponentFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn endpoint(endpoint: impl Into<EndpointId>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: ComponentKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_parent(mut self, parent: impl Into<ComponentId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into().to_ascii_lowercase());
        self
    }

    pub fn matches(&self, record: &ComponentRecord) -> bool {
        self.endpoint.as_ref().map_or(true, |e| &record.endpoint == e)
            && self.kind.map_or(true, |k| record.kind == k)
            && self.parent.as_ref().map_or(true, |p| &record.parent == p)
            && self
                .mac
                .as_deref()
                .map_or(true, |m| record.mac().map(str::to_ascii_lowercase).as_deref() == Some(m))
    }
}

// =============================================================================
// Endpoint Status
// =============================================================================

/// Last discovery outcome for an endpoint, kept apart from its records so a
/// failed run is visible without touching committed inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatusRecord {
    pub endpoint: EndpointId,
    pub status: DiscoveryStatus,
    pub last_attempt: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl EndpointStatusRecord {
    pub fn new(endpoint: EndpointId, status: DiscoveryStatus) -> Self {
        Self {
            endpoint,
            status,
            last_attempt: Utc::now(),
            last_success: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn succeeded_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_success = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::aggregate::{ATTR_MAC, ATTR_ROLE};

    fn ep() -> EndpointId {
        EndpointId::new("x0c0s0b0n0")
    }

    fn nic(id: &str, path: &str, mac: &str) -> ComponentRecord {
        ComponentRecord::new(id, ComponentKind::NodeEnetInterface, &ep(), path)
            .with_attribute(ATTR_MAC, mac)
    }

    fn prior(records: &[ComponentRecord]) -> BTreeMap<ComponentId, ComponentRecord> {
        records.iter().map(|r| (r.id.clone(), r.clone())).collect()
    }

    #[test]
    fn test_identical_upsert_is_noop() {
        let records = vec![nic("a", "/n/1", "aa:aa:aa:aa:aa:01"), nic("b", "/n/2", "aa:aa:aa:aa:aa:02")];
        let plan = plan_upsert(&prior(&records), &InventoryUpdate::replace(ep(), records.clone()));

        assert!(plan.changes.is_empty());
        assert_eq!(plan.changes.unchanged, 2);
        assert_eq!(plan.writes(&prior(&records)).count(), 0);
    }

    #[test]
    fn test_added_changed_removed() {
        let before = vec![nic("a", "/n/1", "aa:aa:aa:aa:aa:01"), nic("b", "/n/2", "aa:aa:aa:aa:aa:02")];
        let after = vec![
            nic("a", "/n/1", "aa:aa:aa:aa:aa:01").with_attribute(ATTR_ROLE, "onboard"),
            nic("c", "/n/3", "aa:aa:aa:aa:aa:03"),
        ];
        let plan = plan_upsert(&prior(&before), &InventoryUpdate::replace(ep(), after));

        assert_eq!(plan.changes.added.len(), 1);
        assert_eq!(plan.changes.added[0].id.as_str(), "c");
        assert_eq!(plan.changes.changed.len(), 1);
        assert_eq!(plan.changes.changed[0].fields, vec![ATTR_ROLE.to_string()]);
        assert_eq!(plan.changes.removed.len(), 1);
        assert_eq!(plan.changes.removed[0].id.as_str(), "b");
        assert_eq!(plan.next.len(), 2);
    }

    #[test]
    fn test_failed_source_preserves_prior() {
        let before = vec![nic("a", "/n/1/Package/1", "aa:aa:aa:aa:aa:01"), nic("b", "/n/10/Package/1", "aa:aa:aa:aa:aa:02")];
        let update = InventoryUpdate::replace(ep(), vec![]).preserving(["/n/1"]);
        let plan = plan_upsert(&prior(&before), &update);

        assert!(plan.next.contains_key(&ComponentId::from("a")));
        assert!(!plan.next.contains_key(&ComponentId::from("b")));
        assert_eq!(plan.changes.preserved, 1);
        assert_eq!(plan.changes.unchanged, 0);
        assert_eq!(plan.changes.removed.len(), 1);
        assert!(plan.changes.added.is_empty());
    }

    #[test]
    fn test_ordinal_shift_is_not_a_change() {
        let mut stored = nic("a", "/n/1", "aa:aa:aa:aa:aa:01");
        stored.ordinal = 2;
        let mut fresh = stored.clone();
        fresh.ordinal = 1;

        let plan = plan_upsert(&prior(&[stored.clone()]), &InventoryUpdate::replace(ep(), vec![fresh]));
        assert!(plan.changes.is_empty());
        assert_eq!(plan.writes(&prior(&[stored])).count(), 1);
    }

    #[test]
    fn test_unverified_records_ignored() {
        let mut pending = nic("a", "/n/1", "aa:aa:aa:aa:aa:01");
        pending.status = DiscoveryStatus::Verifying;
        let plan = plan_upsert(&BTreeMap::new(), &InventoryUpdate::replace(ep(), vec![pending]));
        assert!(plan.next.is_empty());
    }

    #[test]
    fn test_filter() {
        let record = nic("a", "/n/1", "aa:bb:cc:dd:ee:ff");
        assert!(ComponentFilter::all().matches(&record));
        assert!(ComponentFilter::endpoint("x0c0s0b0n0")
            .with_kind(ComponentKind::NodeEnetInterface)
            .with_mac("AA:BB:CC:DD:EE:FF")
            .matches(&record));
        assert!(!ComponentFilter::all().with_kind(ComponentKind::Processor).matches(&record));
        assert!(!ComponentFilter::endpoint("x0c0s1b0n0").matches(&record));
        assert!(ComponentFilter::all().with_parent("x0c0s0b0n0").matches(&record));
    }

    #[test]
    fn test_change_events() {
        let changes = ChangeSet {
            added: vec![nic("a", "/n/1", "aa:aa:aa:aa:aa:01")],
            removed: vec![nic("b", "/n/2", "aa:aa:aa:aa:aa:02")],
            ..Default::default()
        };
        let events = changes.to_events(&ep());
        let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["ComponentAdded", "ComponentRemoved"]);
    }
}
