//! HTTPS Redfish client
//!
//! One `reqwest::Client` (and therefore one connection pool) is shared by
//! every endpoint. Per-endpoint handles only carry base URL and credentials.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, StatusCode};
use tracing::{debug, instrument};

use super::{normalize_path, EndpointConnector, EndpointDescriptor, ResourceFetcher};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// How endpoint certificates are trusted.
///
/// Management networks are internal and BMCs ship self-signed certificates,
/// so public CA validation is never the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustPolicy {
    /// Accept any certificate
    AcceptInvalid,
    /// Trust only certificates chaining to this PEM bundle
    CaBundle(PathBuf),
}

impl Default for TrustPolicy {
    fn default() -> Self {
        TrustPolicy::AcceptInvalid
    }
}

/// Configuration for the shared Redfish client
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Per-request timeout
    pub timeout: Duration,

    /// Connection establishment timeout
    pub connect_timeout: Duration,

    /// Certificate trust policy
    pub trust: TrustPolicy,

    /// Idle connections kept per host
    pub pool_max_idle_per_host: usize,

    /// User-Agent header
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            trust: TrustPolicy::default(),
            pool_max_idle_per_host: 2,
            user_agent: format!("hsm/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

// =============================================================================
// Shared Client
// =============================================================================

/// Connector producing HTTPS fetchers that share one connection pool.
#[derive(Debug, Clone)]
pub struct RedfishClient {
    client: Client,
    config: FetchConfig,
}

impl RedfishClient {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .user_agent(config.user_agent.clone());

        builder = match &config.trust {
            TrustPolicy::AcceptInvalid => builder.danger_accept_invalid_certs(true),
            TrustPolicy::CaBundle(path) => {
                let pem = std::fs::read(path).map_err(|e| {
                    Error::Config(format!("cannot read CA bundle {}: {}", path.display(), e))
                })?;
                let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                    Error::Config(format!("invalid CA bundle {}: {}", path.display(), e))
                })?;
                builder.tls_built_in_root_certs(false).add_root_certificate(cert)
            }
        };

        let client = builder
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Handle bound to one endpoint.
    pub fn endpoint(&self, endpoint: &EndpointDescriptor) -> RedfishEndpoint {
        RedfishEndpoint {
            client: self.client.clone(),
            base_url: endpoint.base_url(),
            username: endpoint.credentials.username.clone(),
            password: endpoint.credentials.password.clone(),
            timeout: self.config.timeout,
        }
    }
}

impl EndpointConnector for RedfishClient {
    fn connect(&self, endpoint: &EndpointDescriptor) -> Result<Arc<dyn ResourceFetcher>> {
        Ok(Arc::new(self.endpoint(endpoint)))
    }
}

// =============================================================================
// Per-Endpoint Handle
// =============================================================================

/// Fetcher for one endpoint.
#[derive(Clone)]
pub struct RedfishEndpoint {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    timeout: Duration,
}

impl std::fmt::Debug for RedfishEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedfishEndpoint")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .finish()
    }
}

#[async_trait]
impl ResourceFetcher for RedfishEndpoint {
    #[instrument(skip(self), fields(base = %self.base_url))]
    async fn get_relative(&self, path: &str) -> Result<Bytes> {
        let path = normalize_path(path);
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout {
                        path: path.clone(),
                        after: self.timeout,
                    }
                } else {
                    Error::transport(path.clone(), e)
                }
            })?;

        let status = response.status();
        debug!(status = %status, "Redfish response");

        if status == StatusCode::NOT_FOUND {
            return Err(Error::AbsentResource { path });
        }
        if !status.is_success() {
            return Err(Error::transport(path, format!("HTTP {}", status)));
        }

        response.bytes().await.map_err(|e| Error::transport(path, e))
    }
}
