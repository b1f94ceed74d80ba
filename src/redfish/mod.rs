//! Redfish Endpoint Access
//!
//! Identity, credentials and base address of one managed hardware controller
//! (usually a BMC), plus the relative-path fetch primitive every discovery
//! driver is built on.
//!
//! # Layers
//!
//! ```text
//! EndpointDescriptor ──(EndpointConnector)──▶ Arc<dyn ResourceFetcher>
//!                                                  │
//!                           RedfishEndpoint (HTTPS) │ SimulatedEndpoint (tests)
//! ```
//!
//! A descriptor is pure data. Connectors turn it into a fetcher; the HTTP
//! connector shares one connection pool across all endpoints and runs.

pub mod client;
pub mod model;
pub mod simulator;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::discovery::xname::XName;
use crate::error::{Error, Result};

pub use client::{FetchConfig, RedfishClient, RedfishEndpoint, TrustPolicy};
pub use simulator::{SimulatedEndpoint, SimulatedFleet, SimulatedResponse};

// =============================================================================
// Endpoint Identity
// =============================================================================

/// Endpoint identifier: the endpoint's xname.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EndpointId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Basic-auth credentials for an endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Endpoint Descriptor
// =============================================================================

/// One managed hardware controller.
///
/// Immutable for the duration of a discovery run. Run bookkeeping (last
/// attempt, last status) lives with the scheduler, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Endpoint xname, e.g. `x0c0s0b0`
    pub id: EndpointId,
    /// Host (and optional port) of the management interface. A scheme may be
    /// given explicitly; `https://` is assumed otherwise.
    pub fqdn: String,
    /// Basic-auth credentials
    pub credentials: Credentials,
    /// Explicit ComputerSystem path; when unset the Systems collection is walked
    #[serde(default)]
    pub system_path: Option<String>,
    /// Role reported by the topology service
    #[serde(default)]
    pub role: Option<String>,
    /// Node id reported by the topology service
    #[serde(default)]
    pub nid: Option<u64>,
}

impl EndpointDescriptor {
    pub fn new(id: impl Into<EndpointId>, fqdn: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            id: id.into(),
            fqdn: fqdn.into(),
            credentials,
            system_path: None,
            role: None,
            nid: None,
        }
    }

    pub fn with_system_path(mut self, path: impl Into<String>) -> Self {
        self.system_path = Some(path.into());
        self
    }

    /// Check identity, address and credentials before any network call.
    pub fn validate(&self) -> Result<()> {
        XName::parse(self.id.as_str()).map_err(|e| {
            Error::Config(format!("endpoint id '{}' is not a valid xname: {}", self.id, e))
        })?;

        let host = self.host();
        if host.is_empty() {
            return Err(Error::Config(format!("endpoint {} has no address", self.id)));
        }
        if host.chars().any(|c| c.is_whitespace() || c == '/' || c == '@') {
            return Err(Error::Config(format!(
                "endpoint {} has malformed address '{}'",
                self.id, self.fqdn
            )));
        }

        if self.credentials.username.trim().is_empty() {
            return Err(Error::Config(format!("endpoint {} has no username", self.id)));
        }

        if let Some(path) = &self.system_path {
            if !path.starts_with('/') {
                return Err(Error::Config(format!(
                    "endpoint {} system path '{}' must be absolute",
                    self.id, path
                )));
            }
        }

        Ok(())
    }

    /// Base URL for relative fetches, without trailing slash.
    pub fn base_url(&self) -> String {
        let trimmed = self.fqdn.trim_end_matches('/');
        if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{}", trimmed)
        }
    }

    fn host(&self) -> &str {
        let without_scheme = match self.fqdn.split_once("://") {
            Some((_, rest)) => rest,
            None => self.fqdn.as_str(),
        };
        without_scheme.trim_end_matches('/')
    }
}

// =============================================================================
// Fetch Ports
// =============================================================================

/// Relative-path GET against one endpoint.
///
/// Implementations distinguish `Error::Transport` / `Error::Timeout`
/// (unreachable) from `Error::AbsentResource` (404). Decoding is left to the
/// caller so malformed payloads surface as `Error::Decode` at one place.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn get_relative(&self, path: &str) -> Result<Bytes>;
}

/// Produces fetchers for endpoint descriptors.
pub trait EndpointConnector: Send + Sync {
    fn connect(&self, endpoint: &EndpointDescriptor) -> Result<Arc<dyn ResourceFetcher>>;
}

/// Ensure a relative path starts with a single `/`.
pub(crate) fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, fqdn: &str) -> EndpointDescriptor {
        EndpointDescriptor::new(id, fqdn, Credentials::new("root", "secret"))
    }

    #[test]
    fn test_validate_accepts_plain_host() {
        assert!(descriptor("x0c0s0b0", "10.5.1.106").validate().is_ok());
        assert!(descriptor("x0c0s0b0n0", "x0c0s0b0:8443").validate().is_ok());
        assert!(descriptor("x0c0s0b0", "http://127.0.0.1:8080").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        assert!(matches!(
            descriptor("node-7", "10.0.0.1").validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            descriptor("x0c0s0b0", "").validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            descriptor("x0c0s0b0", "bad host").validate(),
            Err(Error::Config(_))
        ));

        let mut no_user = descriptor("x0c0s0b0", "10.0.0.1");
        no_user.credentials.username = " ".into();
        assert!(matches!(no_user.validate(), Err(Error::Config(_))));

        let relative = descriptor("x0c0s0b0", "10.0.0.1").with_system_path("Systems/1");
        assert!(matches!(relative.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_base_url() {
        assert_eq!(descriptor("x0c0s0b0", "10.0.0.1").base_url(), "https://10.0.0.1");
        assert_eq!(
            descriptor("x0c0s0b0", "http://127.0.0.1:9000/").base_url(),
            "http://127.0.0.1:9000"
        );
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("root", "hunter2");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("root"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("redfish/v1"), "/redfish/v1");
        assert_eq!(normalize_path("/redfish/v1"), "/redfish/v1");
    }
}
