//! Redfish payload types
//!
//! Only the fields the discovery drivers read are modelled. Unknown fields
//! are ignored; the raw JSON is kept separately by the fetch helper when a
//! record needs it for diagnostics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{"@odata.id": "/redfish/v1/..."}` link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceId {
    #[serde(rename = "@odata.id", default)]
    pub odata_id: String,
}

impl ResourceId {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            odata_id: path.into(),
        }
    }

    /// Last non-empty path segment.
    pub fn last_segment(&self) -> &str {
        self.odata_id
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("")
    }
}

/// Any Redfish collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Collection {
    #[serde(rename = "Members", default)]
    pub members: Vec<ResourceId>,

    #[serde(rename = "Members@odata.count", default)]
    pub members_count: Option<u64>,
}

impl Collection {
    /// Members with a usable link, in response order.
    pub fn linked_members(&self) -> impl Iterator<Item = &ResourceId> {
        self.members.iter().filter(|m| !m.odata_id.trim().is_empty())
    }
}

// =============================================================================
// ComputerSystem
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComputerSystem {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub manufacturer: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub ethernet_interfaces: Option<ResourceId>,

    #[serde(default)]
    pub processors: Option<ResourceId>,

    #[serde(default)]
    pub oem: Option<SystemOem>,
}

impl ComputerSystem {
    /// Path of the Insyde NCSI collection, when the OEM extension is present.
    pub fn insyde_ncsi(&self) -> Option<&ResourceId> {
        self.oem
            .as_ref()
            .and_then(|oem| oem.insyde_ncsi.as_ref())
            .and_then(|ext| ext.ncsi.as_ref())
            .filter(|link| !link.odata_id.is_empty())
    }

    /// Names of all OEM extension objects on the system resource.
    pub fn oem_keys(&self) -> Vec<String> {
        match &self.oem {
            Some(oem) => {
                let mut keys: Vec<String> = oem.other.keys().cloned().collect();
                if oem.insyde_ncsi.is_some() {
                    keys.push("InsydeNcsi".to_string());
                }
                keys.sort();
                keys
            }
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemOem {
    #[serde(rename = "InsydeNcsi", default)]
    pub insyde_ncsi: Option<InsydeNcsiExtension>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsydeNcsiExtension {
    #[serde(rename = "Ncsi", default)]
    pub ncsi: Option<ResourceId>,
}

// =============================================================================
// Standard Leaves
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EthernetInterface {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(rename = "MACAddress", default)]
    pub mac_address: Option<String>,

    #[serde(rename = "PermanentMACAddress", default)]
    pub permanent_mac_address: Option<String>,

    #[serde(default)]
    pub interface_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Processor {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub socket: Option<String>,

    #[serde(default)]
    pub processor_type: Option<String>,

    #[serde(default)]
    pub manufacturer: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub total_cores: Option<u32>,

    #[serde(default)]
    pub total_threads: Option<u32>,

    #[serde(default)]
    pub status: Option<ResourceStatus>,
}

impl Processor {
    /// Redfish reports empty sockets with `Status.State == "Absent"`.
    pub fn is_absent(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.state.as_deref())
            .map(|state| state.eq_ignore_ascii_case("Absent"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceStatus {
    #[serde(default)]
    pub state: Option<String>,

    #[serde(default)]
    pub health: Option<String>,
}

// =============================================================================
// Insyde NCSI OEM Extension
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NcsiMember {
    #[serde(rename = "Id", default)]
    pub id: String,

    #[serde(rename = "DeviceType", default)]
    pub device_type: Option<String>,

    #[serde(rename = "Package", default)]
    pub packages: Vec<ResourceId>,

    #[serde(rename = "VersionID", default)]
    pub version: NcsiVersion,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NcsiVersion {
    #[serde(rename = "FirmwareName", default)]
    pub firmware_name: String,

    #[serde(rename = "FirmwareVersion", default)]
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NcsiPackage {
    #[serde(rename = "Id", default)]
    pub id: String,

    #[serde(rename = "PackageInfo", default)]
    pub channels: Vec<NcsiChannel>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NcsiChannel {
    #[serde(rename = "ChannelIndex", default)]
    pub channel_index: u32,

    #[serde(rename = "MACAddress", default)]
    pub mac_address: Option<String>,
}
