//! Vendor discovery drivers
//!
//! Each driver walks one vendor's resource graph below the ComputerSystem
//! and contributes verified records to the aggregate. Drivers are variants of
//! [`DriverKind`] selected from a [`DriverRegistry`] by the vendor signature
//! found during root discovery; they never return errors, only statuses.

pub mod foxconn;
pub mod standard;

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use super::aggregate::{SubtreeOutcome, SystemAggregate};
use super::status::ResourceState;
use super::DiscoveryContext;
use crate::redfish::model::{Collection, ComputerSystem, ResourceId};

// =============================================================================
// Vendor Signature
// =============================================================================

/// Identifying facts of a ComputerSystem used to choose a driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VendorSignature {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub oem_keys: BTreeSet<String>,
}

impl VendorSignature {
    pub fn from_system(system: &ComputerSystem) -> Self {
        Self {
            manufacturer: system.manufacturer.as_ref().map(|m| m.trim().to_string()),
            model: system.model.as_ref().map(|m| m.trim().to_string()),
            oem_keys: system.oem_keys().into_iter().collect(),
        }
    }
}

/// One registry rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureMatch {
    /// System carries this OEM extension object
    OemKey(String),
    /// Manufacturer equals this (case-insensitive)
    Manufacturer(String),
}

impl SignatureMatch {
    fn matches(&self, signature: &VendorSignature) -> bool {
        match self {
            SignatureMatch::OemKey(key) => signature.oem_keys.contains(key),
            SignatureMatch::Manufacturer(name) => signature
                .manufacturer
                .as_deref()
                .map(|m| m.eq_ignore_ascii_case(name))
                .unwrap_or(false),
        }
    }
}

// =============================================================================
// Driver Dispatch
// =============================================================================

/// Available drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// DMTF-standard EthernetInterfaces and Processors
    Standard,
    /// Foxconn boards exposing NICs through the Insyde NCSI OEM extension
    FoxconnInsyde,
}

impl DriverKind {
    pub fn name(&self) -> &'static str {
        match self {
            DriverKind::Standard => "standard",
            DriverKind::FoxconnInsyde => "foxconn-insyde",
        }
    }

    pub async fn discover(
        &self,
        ctx: &DiscoveryContext<'_>,
        system: &ComputerSystem,
        agg: &mut SystemAggregate,
    ) {
        match self {
            DriverKind::Standard => standard::discover(ctx, system, agg).await,
            DriverKind::FoxconnInsyde => foxconn::discover(ctx, system, agg).await,
        }
    }
}

/// Ordered signature rules; first match wins.
#[derive(Debug, Clone)]
pub struct DriverRegistry {
    rules: Vec<(SignatureMatch, DriverKind)>,
    fallback: DriverKind,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::empty()
            .register(SignatureMatch::OemKey("InsydeNcsi".into()), DriverKind::FoxconnInsyde)
            .register(SignatureMatch::Manufacturer("Foxconn".into()), DriverKind::FoxconnInsyde)
    }
}

impl DriverRegistry {
    /// Registry that always falls back to the standard driver.
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            fallback: DriverKind::Standard,
        }
    }

    pub fn register(mut self, rule: SignatureMatch, driver: DriverKind) -> Self {
        self.rules.push((rule, driver));
        self
    }

    pub fn select(&self, signature: &VendorSignature) -> DriverKind {
        self.rules
            .iter()
            .find(|(rule, _)| rule.matches(signature))
            .map(|(_, driver)| *driver)
            .unwrap_or(self.fallback)
    }
}

// =============================================================================
// Shared Collection Walking
// =============================================================================

/// A collection member in attribute-stable order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Member {
    pub link: ResourceId,
    pub ordinal: Option<u64>,
    key: String,
}

impl Member {
    pub fn path(&self) -> &str {
        &self.link.odata_id
    }

    /// Identifier fragment, unique within the collection.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Trailing decimal digits of `s`, e.g. `CPU12` → 12.
pub(crate) fn trailing_number(s: &str) -> Option<u64> {
    let digits: String = s
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

/// Lowercased path segment with non-alphanumerics dropped.
pub(crate) fn normalized_segment(segment: &str) -> String {
    segment
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Key for one segment: the bare ordinal when the segment's letter prefix is
/// conventional for the collection (`CPU0` among processors), else the
/// whole normalized segment (`gpu0`).
fn member_key(segment: &str, conventional: &[&str]) -> String {
    match trailing_number(segment) {
        Some(n) => {
            let prefix = normalized_segment(segment.trim_end_matches(|c: char| c.is_ascii_digit()));
            if conventional.contains(&prefix.as_str()) {
                n.to_string()
            } else {
                normalized_segment(segment)
            }
        }
        None => normalized_segment(segment),
    }
}

/// Members sorted by (ordinal, path), duplicates and empty links dropped.
/// Response order never influences the result.
///
/// `conventional` lists the letter prefixes (lowercase, `""` for bare
/// numbers) whose members are keyed by ordinal alone. Members whose keys
/// would still coincide fall back to their whole segment.
pub(crate) fn ordered_members(collection: &Collection, conventional: &[&str]) -> Vec<Member> {
    let mut seen = BTreeSet::new();
    let mut members: Vec<Member> = collection
        .linked_members()
        .filter(|link| seen.insert(link.odata_id.clone()))
        .map(|link| Member {
            ordinal: trailing_number(link.last_segment()),
            key: member_key(link.last_segment(), conventional),
            link: link.clone(),
        })
        .collect();
    members.sort_by(|a, b| {
        a.ordinal
            .unwrap_or(u64::MAX)
            .cmp(&b.ordinal.unwrap_or(u64::MAX))
            .then_with(|| a.link.odata_id.cmp(&b.link.odata_id))
    });

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for member in &members {
        *counts.entry(member.key.clone()).or_default() += 1;
    }
    for member in &mut members {
        if counts.get(&member.key).copied().unwrap_or(0) > 1 {
            member.key = normalized_segment(member.link.last_segment());
        }
    }
    members
}

/// Fetch a collection for a sub-tree.
///
/// `None` ends the sub-tree: the collection was absent (no members of this
/// kind, not an error) or failed (status folded into `subtree`).
pub(crate) async fn open_collection(
    ctx: &DiscoveryContext<'_>,
    agg: &mut SystemAggregate,
    subtree: &mut SubtreeOutcome,
    path: &str,
    conventional: &[&str],
) -> Option<Vec<Member>> {
    let mut state = ResourceState::new(path);
    match ctx.fetch::<Collection>(&mut state).await {
        Ok(fetched) => {
            state.verify_ok();
            agg.track(state);
            let members = ordered_members(&fetched.value, conventional);
            if members.is_empty() {
                debug!(subtree = %subtree.name, path = %path, "Collection is empty");
            }
            Some(members)
        }
        Err(e) if e.is_absent() => {
            debug!(subtree = %subtree.name, path = %path, "Collection absent");
            None
        }
        Err(e) => {
            warn!(subtree = %subtree.name, path = %path, error = %e, "Collection fetch failed");
            subtree.absorb(state.status());
            agg.track(state);
            None
        }
    }
}

/// Trimmed, non-empty value.
pub(crate) fn populated(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Verify a MAC address and normalise it to lowercase colon form.
pub(crate) fn normalize_mac(raw: &str) -> std::result::Result<String, String> {
    let trimmed = raw.trim();
    let octets: Vec<&str> = trimmed.split(|c| c == ':' || c == '-').collect();
    let well_formed = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if !well_formed {
        return Err(format!("malformed MAC address '{}'", trimmed));
    }
    Ok(octets.join(":").to_ascii_lowercase())
}
