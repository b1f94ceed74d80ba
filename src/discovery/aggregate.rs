//! Component records and the per-run System Aggregate

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::status::{DiscoveryStatus, ResourceState};
use crate::redfish::EndpointId;

// =============================================================================
// Component Identity
// =============================================================================

/// Globally unique component identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId(pub String);

impl ComponentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ComponentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ComponentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ComponentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&EndpointId> for ComponentId {
    fn from(id: &EndpointId) -> Self {
        Self(id.as_str().to_string())
    }
}

/// Component type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    NodeEnetInterface,
    Processor,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::NodeEnetInterface => "NodeEnetInterface",
            ComponentKind::Processor => "Processor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NodeEnetInterface" => Some(ComponentKind::NodeEnetInterface),
            "Processor" => Some(ComponentKind::Processor),
            _ => None,
        }
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// Attribute keys shared by drivers and queries.
pub const ATTR_MAC: &str = "MACAddress";
pub const ATTR_DESCRIPTION: &str = "Description";
pub const ATTR_FIRMWARE_NAME: &str = "FirmwareName";
pub const ATTR_ROLE: &str = "Role";
pub const ATTR_CHANNEL: &str = "ChannelIndex";
pub const ATTR_MODEL: &str = "Model";
pub const ATTR_MANUFACTURER: &str = "Manufacturer";
pub const ATTR_CORES: &str = "TotalCores";

/// `Role` value of the onboard interface.
pub const ROLE_ONBOARD: &str = "onboard";

// =============================================================================
// Component Record
// =============================================================================

/// Canonical, vendor-neutral description of one discovered sub-resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub id: ComponentId,
    pub kind: ComponentKind,
    /// Parent by identifier; the endpoint id for top-level components.
    pub parent: ComponentId,
    pub endpoint: EndpointId,
    /// 1-based position in the run's attribute-stable discovery order
    pub ordinal: u32,
    /// Resource path the record was decoded from
    pub source_path: String,
    pub status: DiscoveryStatus,
    pub attributes: BTreeMap<String, String>,
    /// Vendor payload, kept for diagnostics only
    pub raw: Option<Value>,
}

impl ComponentRecord {
    pub fn new(
        id: impl Into<ComponentId>,
        kind: ComponentKind,
        endpoint: &EndpointId,
        source_path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            parent: ComponentId::from(endpoint),
            endpoint: endpoint.clone(),
            ordinal: 0,
            source_path: source_path.into(),
            status: DiscoveryStatus::Verified,
            attributes: BTreeMap::new(),
            raw: None,
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn mac(&self) -> Option<&str> {
        self.attribute(ATTR_MAC)
    }

    pub fn is_onboard(&self) -> bool {
        self.attribute(ATTR_ROLE) == Some(ROLE_ONBOARD)
    }

    /// True when `self.source_path` lies at or below `prefix`.
    pub fn is_under(&self, prefix: &str) -> bool {
        path_is_under(&self.source_path, prefix)
    }

    /// Attribute keys whose values differ from `other`, plus the names of
    /// differing structural fields. The discovery ordinal is not content.
    pub fn changed_fields(&self, other: &ComponentRecord) -> Vec<String> {
        let mut fields: BTreeSet<String> = BTreeSet::new();
        for key in self.attributes.keys().chain(other.attributes.keys()) {
            if self.attributes.get(key) != other.attributes.get(key) {
                fields.insert(key.clone());
            }
        }
        if self.kind != other.kind {
            fields.insert("kind".to_string());
        }
        if self.parent != other.parent {
            fields.insert("parent".to_string());
        }
        if self.source_path != other.source_path {
            fields.insert("source_path".to_string());
        }
        if self.raw != other.raw {
            fields.insert("raw".to_string());
        }
        fields.into_iter().collect()
    }

    pub fn same_content(&self, other: &ComponentRecord) -> bool {
        self.changed_fields(other).is_empty()
    }
}

/// Boundary-aware prefix test: `/a/1` is under `/a` and `/a/1`, not under `/a/10`.
pub fn path_is_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    path == prefix
        || (path.starts_with(prefix) && path[prefix.len()..].starts_with('/'))
}

// =============================================================================
// Sub-tree Outcome
// =============================================================================

/// Result of walking one collection sub-tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtreeOutcome {
    pub name: String,
    pub collection_path: Option<String>,
    pub status: DiscoveryStatus,
    pub contributed: usize,
}

impl SubtreeOutcome {
    pub fn new(name: impl Into<String>, collection_path: Option<String>) -> Self {
        Self {
            name: name.into(),
            collection_path,
            status: DiscoveryStatus::Verified,
            contributed: 0,
        }
    }

    /// Fold a member or collection status into the sub-tree status.
    pub fn absorb(&mut self, status: DiscoveryStatus) {
        self.status = self.status.worst(status);
    }
}

// =============================================================================
// System Aggregate
// =============================================================================

/// One discovery run's output for one endpoint.
///
/// Records are keyed by identifier; discovery order is the `ordinal`
/// assigned on insert. Parent links are identifiers, never references.
#[derive(Debug, Clone)]
pub struct SystemAggregate {
    pub endpoint: EndpointId,
    pub started_at: DateTime<Utc>,
    status: DiscoveryStatus,
    root: Option<ResourceState>,
    driver: Option<&'static str>,
    manufacturer: Option<String>,
    records: BTreeMap<ComponentId, ComponentRecord>,
    resources: BTreeMap<String, ResourceState>,
    subtrees: Vec<SubtreeOutcome>,
    next_ordinal: u32,
}

impl SystemAggregate {
    pub fn new(endpoint: EndpointId) -> Self {
        Self {
            endpoint,
            started_at: Utc::now(),
            status: DiscoveryStatus::NotAttempted,
            root: None,
            driver: None,
            manufacturer: None,
            records: BTreeMap::new(),
            resources: BTreeMap::new(),
            subtrees: Vec::new(),
            next_ordinal: 1,
        }
    }

    /// Overall endpoint status.
    pub fn status(&self) -> DiscoveryStatus {
        self.status
    }

    /// Root resources (Systems collection, ComputerSystem) were read and
    /// verified, so the record set is complete enough to replace the
    /// endpoint's committed inventory.
    pub fn is_committable(&self) -> bool {
        matches!(&self.root, Some(root) if root.status() == DiscoveryStatus::Verified)
    }

    pub fn root_error(&self) -> Option<&str> {
        self.root.as_ref().and_then(|r| r.error())
    }

    pub fn driver(&self) -> Option<&'static str> {
        self.driver
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.manufacturer.as_deref()
    }

    pub fn set_driver(&mut self, driver: &'static str, manufacturer: Option<String>) {
        self.driver = Some(driver);
        self.manufacturer = manufacturer;
    }

    /// Record the root resource outcome. A failed root ends the run.
    pub fn set_root(&mut self, root: ResourceState) {
        self.track(root.clone());
        self.root = Some(root);
    }

    /// Next discovery ordinal.
    pub fn next_ordinal(&mut self) -> u32 {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        ordinal
    }

    /// Insert a verified record, stamping its ordinal. Duplicate ids keep
    /// the first record.
    pub fn insert(&mut self, mut record: ComponentRecord) -> bool {
        if self.records.contains_key(&record.id) {
            warn!(
                endpoint = %self.endpoint,
                id = %record.id,
                path = %record.source_path,
                "Duplicate component id in one run, keeping first"
            );
            return false;
        }
        record.ordinal = self.next_ordinal();
        self.records.insert(record.id.clone(), record);
        true
    }

    /// Remember the final state of one resource.
    pub fn track(&mut self, state: ResourceState) {
        self.resources.insert(state.path().to_string(), state);
    }

    pub fn finish_subtree(&mut self, outcome: SubtreeOutcome) {
        self.subtrees.push(outcome);
    }

    /// Fold root and sub-tree outcomes into the overall status.
    pub fn conclude(&mut self) {
        self.status = match &self.root {
            Some(root) if root.status() == DiscoveryStatus::Verified => self
                .subtrees
                .iter()
                .map(|s| s.status)
                .fold(DiscoveryStatus::Verified, DiscoveryStatus::worst),
            Some(root) => root.status(),
            None => DiscoveryStatus::NotAttempted,
        };
    }

    pub fn get(&self, id: &ComponentId) -> Option<&ComponentRecord> {
        self.records.get(id)
    }

    /// Records in discovery order.
    pub fn records(&self) -> Vec<&ComponentRecord> {
        let mut records: Vec<&ComponentRecord> = self.records.values().collect();
        records.sort_by_key(|r| r.ordinal);
        records
    }

    pub fn into_records(self) -> Vec<ComponentRecord> {
        let mut records: Vec<ComponentRecord> = self.records.into_values().collect();
        records.sort_by_key(|r| r.ordinal);
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn subtrees(&self) -> &[SubtreeOutcome] {
        &self.subtrees
    }

    pub fn resource_status(&self, path: &str) -> Option<DiscoveryStatus> {
        self.resources.get(path).map(|s| s.status())
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceState> {
        self.resources.values()
    }

    /// Paths whose fetch or decode failed this run.
    pub fn failed_sources(&self) -> BTreeSet<String> {
        self.resources
            .values()
            .filter(|s| s.status().is_failure())
            .map(|s| s.path().to_string())
            .collect()
    }

    /// Count of failed resources by failure status.
    pub fn failure_counts(&self) -> (usize, usize) {
        self.resources
            .values()
            .fold((0, 0), |(fetch, decode), s| match s.status() {
                DiscoveryStatus::FetchFailed => (fetch + 1, decode),
                DiscoveryStatus::DecodeFailed => (fetch, decode + 1),
                _ => (fetch, decode),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> EndpointId {
        EndpointId::new("x0c0s0b0n0")
    }

    fn verified_root() -> ResourceState {
        let mut root = ResourceState::new("/redfish/v1/Systems/1");
        root.fetched();
        root.decoded();
        root.verify_ok();
        root
    }

    #[test]
    fn test_path_is_under() {
        assert!(path_is_under("/a/b/1", "/a/b"));
        assert!(path_is_under("/a/b", "/a/b"));
        assert!(path_is_under("/a/b/1", "/a/b/"));
        assert!(!path_is_under("/a/b10", "/a/b1"));
        assert!(!path_is_under("/a", "/a/b"));
    }

    #[test]
    fn test_insert_assigns_ordinals_and_rejects_duplicates() {
        let ep = endpoint();
        let mut agg = SystemAggregate::new(ep.clone());

        assert!(agg.insert(ComponentRecord::new("x0c0s0b0n0/eth1", ComponentKind::NodeEnetInterface, &ep, "/e/1")));
        assert!(agg.insert(ComponentRecord::new("x0c0s0b0n0p0", ComponentKind::Processor, &ep, "/p/0")));
        assert!(!agg.insert(ComponentRecord::new("x0c0s0b0n0/eth1", ComponentKind::NodeEnetInterface, &ep, "/e/9")));

        let records = agg.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ordinal, 1);
        assert_eq!(records[0].source_path, "/e/1");
        assert_eq!(records[1].ordinal, 2);
        assert_eq!(records[1].parent.as_str(), "x0c0s0b0n0");
    }

    #[test]
    fn test_conclude_takes_worst_subtree() {
        let mut agg = SystemAggregate::new(endpoint());
        agg.set_root(verified_root());

        let ok = SubtreeOutcome::new("Processors", Some("/p".into()));
        let mut bad = SubtreeOutcome::new("EthernetInterfaces", Some("/e".into()));
        bad.absorb(DiscoveryStatus::DecodeFailed);
        agg.finish_subtree(ok);
        agg.finish_subtree(bad);
        agg.conclude();

        assert!(agg.is_committable());
        assert_eq!(agg.status(), DiscoveryStatus::DecodeFailed);
    }

    #[test]
    fn test_failed_root_not_committable() {
        let mut agg = SystemAggregate::new(endpoint());
        let mut root = ResourceState::new("/redfish/v1/Systems");
        root.fetch_failed("connection refused");
        agg.set_root(root);
        agg.conclude();

        assert!(!agg.is_committable());
        assert_eq!(agg.status(), DiscoveryStatus::FetchFailed);
        assert_eq!(agg.root_error(), Some("connection refused"));
        assert_eq!(agg.failure_counts(), (1, 0));
        assert!(agg.failed_sources().contains("/redfish/v1/Systems"));
    }

    #[test]
    fn test_empty_run_is_verified() {
        let mut agg = SystemAggregate::new(endpoint());
        agg.set_root(verified_root());
        agg.finish_subtree(SubtreeOutcome::new("EthernetInterfaces", None));
        agg.conclude();

        assert!(agg.is_empty());
        assert_eq!(agg.status(), DiscoveryStatus::Verified);
    }

    #[test]
    fn test_changed_fields() {
        let ep = endpoint();
        let a = ComponentRecord::new("id", ComponentKind::NodeEnetInterface, &ep, "/e/1")
            .with_attribute(ATTR_MAC, "aa:bb:cc:dd:ee:ff");
        let b = a.clone().with_attribute(ATTR_MAC, "aa:bb:cc:dd:ee:00").with_attribute(ATTR_ROLE, ROLE_ONBOARD);

        assert!(a.changed_fields(&a).is_empty());
        assert_eq!(a.changed_fields(&b), vec![ATTR_MAC.to_string(), ATTR_ROLE.to_string()]);
        assert!(b.is_onboard());
    }
}
