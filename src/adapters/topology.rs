//! Topology providers
//!
//! [`SlsTopology`] asks the system layout service which endpoints exist and
//! what role each node plays. [`StaticTopology`] reads the same facts from a
//! YAML file for labs and tests.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::discovery::xname::XName;
use crate::domain::ports::{NodeInfo, TopologyProvider};
use crate::error::{Error, Result};
use crate::redfish::{Credentials, EndpointDescriptor};

pub const DEFAULT_SLS_URL: &str = "http://cray-sls";

/// Node card type queried when listing management endpoints.
const ENDPOINT_COMPONENT_TYPE: &str = "comptype_ncard";

/// Prefix `http://` when `url` carries no scheme; drop trailing slashes.
pub(crate) fn with_default_scheme(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// Decode a body that may legitimately be `null` or empty.
pub(crate) fn decode_nullable<T: DeserializeOwned>(body: &[u8]) -> serde_json::Result<Option<T>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
}

// =============================================================================
// SLS Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct ReadyResponse {
    ready: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SlsComponent {
    #[serde(default)]
    xname: String,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    extra_properties: Option<SlsExtraProperties>,
}

#[derive(Debug, Default, Deserialize)]
struct SlsExtraProperties {
    #[serde(rename = "Role", default)]
    role: Option<String>,
    #[serde(rename = "SubRole", default)]
    sub_role: Option<String>,
    #[serde(rename = "NID", default)]
    nid: Option<u64>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

impl From<SlsComponent> for NodeInfo {
    fn from(component: SlsComponent) -> Self {
        let extra = component.extra_properties.unwrap_or_default();
        NodeInfo {
            role: non_empty(extra.role),
            sub_role: non_empty(extra.sub_role),
            nid: extra.nid,
            parent: non_empty(component.parent),
        }
    }
}

// =============================================================================
// SLS Client
// =============================================================================

/// HTTP client for the system layout service.
#[derive(Debug, Clone)]
pub struct SlsTopology {
    base_url: String,
    client: Client,
    /// Credentials given to every endpoint the service lists
    credentials: Credentials,
}

impl SlsTopology {
    pub fn new(base_url: &str, credentials: Credentials) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::Topology(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: with_default_scheme(base_url),
            client,
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(&self, path: &str) -> Result<bytes::Bytes> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Topology(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Topology(format!("reading {} failed: {}", url, e)))?;

        if status != StatusCode::OK {
            return Err(Error::Topology(format!(
                "{} returned {}: {}",
                url,
                status,
                String::from_utf8_lossy(&body).trim()
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl TopologyProvider for SlsTopology {
    async fn is_ready(&self) -> Result<bool> {
        let body = self.get("/ready").await?;
        let ready: ReadyResponse = serde_json::from_slice(&body)
            .map_err(|e| Error::Topology(format!("bad readiness payload: {}", e)))?;
        Ok(ready.ready)
    }

    #[instrument(skip(self))]
    async fn get_node_info(&self, id: &str) -> Result<NodeInfo> {
        if id.trim().is_empty() {
            return Err(Error::Topology("empty component id".to_string()));
        }
        let body = self
            .get(&format!("/hardware/{}", urlencoding::encode(id)))
            .await?;
        let component: Option<SlsComponent> = decode_nullable(&body)
            .map_err(|e| Error::Topology(format!("bad hardware payload for {}: {}", id, e)))?;
        Ok(component.map(NodeInfo::from).unwrap_or_default())
    }

    async fn list_endpoints(&self) -> Result<Vec<EndpointDescriptor>> {
        let body = self
            .get(&format!("/search/hardware?type={}", ENDPOINT_COMPONENT_TYPE))
            .await?;
        let components: Option<Vec<SlsComponent>> = decode_nullable(&body)
            .map_err(|e| Error::Topology(format!("bad hardware search payload: {}", e)))?;

        let mut endpoints = Vec::new();
        for component in components.unwrap_or_default() {
            let Ok(xname) = XName::parse(&component.xname) else {
                debug!(xname = %component.xname, "Skipping component with invalid xname");
                continue;
            };
            let id = xname.to_string();
            let info = NodeInfo::from(component);
            let mut descriptor = EndpointDescriptor::new(id.clone(), id, self.credentials.clone());
            descriptor.role = info.role;
            descriptor.nid = info.nid;
            endpoints.push(descriptor);
        }
        endpoints.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(endpoints)
    }
}

// =============================================================================
// Static Topology
// =============================================================================

#[derive(Debug, Deserialize)]
struct EndpointsFile {
    #[serde(default)]
    endpoints: Vec<EndpointEntry>,
}

#[derive(Debug, Deserialize)]
struct EndpointEntry {
    id: String,
    fqdn: String,
    username: String,
    #[serde(default)]
    password: Option<String>,
    /// Environment variable holding the password
    #[serde(default)]
    password_env: Option<String>,
    #[serde(default)]
    system_path: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    nid: Option<u64>,
}

impl EndpointEntry {
    fn into_descriptor(self) -> Result<EndpointDescriptor> {
        let password = match (&self.password, &self.password_env) {
            (Some(password), _) => password.clone(),
            (None, Some(var)) => std::env::var(var).map_err(|_| {
                Error::Config(format!(
                    "endpoint {}: password variable {} is not set",
                    self.id, var
                ))
            })?,
            (None, None) => String::new(),
        };

        let id = XName::parse(&self.id)
            .map(|x| x.to_string())
            .map_err(|e| Error::Config(format!("endpoint id '{}': {}", self.id, e)))?;
        let mut descriptor =
            EndpointDescriptor::new(id, self.fqdn, Credentials::new(self.username, password));
        descriptor.system_path = self.system_path;
        descriptor.role = self.role;
        descriptor.nid = self.nid;
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Fixed endpoint list loaded from YAML.
///
/// ```yaml
/// endpoints:
///   - id: x0c0s0b0
///     fqdn: 10.254.1.5
///     username: root
///     password_env: BMC_PASSWORD
/// ```
///
/// The list can be swapped at runtime; the scheduler picks up the new set on
/// its next tick.
#[derive(Debug, Default)]
pub struct StaticTopology {
    endpoints: RwLock<Vec<EndpointDescriptor>>,
}

impl StaticTopology {
    pub fn new(endpoints: Vec<EndpointDescriptor>) -> Self {
        let topology = Self::default();
        topology.replace(endpoints);
        topology
    }

    /// Swap in a new endpoint list.
    pub fn replace(&self, mut endpoints: Vec<EndpointDescriptor>) {
        endpoints.sort_by(|a, b| a.id.cmp(&b.id));
        *self.endpoints.write() = endpoints;
    }

    /// Drop one endpoint; returns whether it was listed.
    pub fn remove(&self, id: &str) -> bool {
        let mut endpoints = self.endpoints.write();
        let before = endpoints.len();
        endpoints.retain(|e| e.id.as_str() != id);
        endpoints.len() != before
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: EndpointsFile = serde_yaml::from_str(yaml)?;
        let endpoints = file
            .endpoints
            .into_iter()
            .map(EndpointEntry::into_descriptor)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(endpoints))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&yaml)
    }
}

#[async_trait]
impl TopologyProvider for StaticTopology {
    async fn is_ready(&self) -> Result<bool> {
        Ok(true)
    }

    async fn get_node_info(&self, id: &str) -> Result<NodeInfo> {
        if id.trim().is_empty() {
            return Err(Error::Topology("empty component id".to_string()));
        }
        let id = XName::parse(id).map(|x| x.to_string()).unwrap_or_else(|_| id.to_string());
        Ok(self
            .endpoints
            .read()
            .iter()
            .find(|e| e.id.as_str() == id)
            .map(|e| NodeInfo {
                role: e.role.clone(),
                sub_role: None,
                nid: e.nid,
                parent: XName::parse(&id)
                    .ok()
                    .and_then(|x| x.parent())
                    .map(|p| p.to_string()),
            })
            .unwrap_or_default())
    }

    async fn list_endpoints(&self) -> Result<Vec<EndpointDescriptor>> {
        Ok(self.endpoints.read().clone())
    }
}
