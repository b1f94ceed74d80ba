//! Discovery Engine
//!
//! Crawls one endpoint's Redfish graph into a [`SystemAggregate`].
//!
//! # Run shape
//!
//! ```text
//! validate descriptor ──▶ Systems collection ──▶ ComputerSystem (root)
//!                                                   │
//!                                     VendorSignature ──▶ DriverRegistry
//!                                                   │
//!                                       driver sub-trees (per-member isolation)
//!                                                   │
//!                                             SystemAggregate
//! ```
//!
//! Only the network fetches suspend. A failed root means the aggregate is
//! not committable; failures below the root are recorded per resource and
//! folded into the overall status.

pub mod aggregate;
pub mod drivers;
pub mod status;
pub mod xname;

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::redfish::model::{Collection, ComputerSystem};
use crate::redfish::{EndpointDescriptor, ResourceFetcher};

pub use aggregate::{ComponentId, ComponentKind, ComponentRecord, SystemAggregate};
pub use drivers::{DriverKind, DriverRegistry, SignatureMatch, VendorSignature};
pub use status::{DiscoveryStatus, ResourceState};

/// Redfish Systems collection.
pub const SYSTEMS_PATH: &str = "/redfish/v1/Systems";

/// Firmware names identifying the onboard NIC by default.
pub const DEFAULT_ONBOARD_SIGNATURES: &[&str] = &["X550 FW Ver"];

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for discovery runs
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Bound on each individual fetch
    pub fetch_timeout: Duration,

    /// Firmware names marking a member as the onboard NIC, compared after
    /// trimming whitespace on both sides
    pub onboard_signatures: Vec<String>,

    /// ComputerSystem path used when the descriptor does not name one
    pub system_path: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            onboard_signatures: DEFAULT_ONBOARD_SIGNATURES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            system_path: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn is_onboard(&self, firmware_name: &str) -> bool {
        let name = firmware_name.trim();
        !name.is_empty()
            && self
                .onboard_signatures
                .iter()
                .any(|signature| signature.trim() == name)
    }
}

// =============================================================================
// Per-Run Context
// =============================================================================

/// A decoded payload and the JSON it came from.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub value: T,
    pub raw: Value,
}

/// What drivers see of the run: the endpoint, the config and a fetch helper
/// that advances resource states.
pub struct DiscoveryContext<'a> {
    pub endpoint: &'a EndpointDescriptor,
    pub config: &'a DiscoveryConfig,
    fetcher: &'a dyn ResourceFetcher,
}

impl<'a> DiscoveryContext<'a> {
    pub fn new(
        endpoint: &'a EndpointDescriptor,
        config: &'a DiscoveryConfig,
        fetcher: &'a dyn ResourceFetcher,
    ) -> Self {
        Self {
            endpoint,
            config,
            fetcher,
        }
    }

    /// Fetch and decode `state.path()`.
    ///
    /// Leaves `state` at `Decoded` on success. On error the state is failed
    /// (`FetchFailed` for transport, timeout and absent; `DecodeFailed` for
    /// payload problems) and the error returned so the caller can tell an
    /// absent resource from a broken one.
    pub async fn fetch<T: DeserializeOwned>(&self, state: &mut ResourceState) -> Result<Fetched<T>> {
        let path = state.path().to_string();

        let bytes = match tokio::time::timeout(
            self.config.fetch_timeout,
            self.fetcher.get_relative(&path),
        )
        .await
        {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                state.fail(&e);
                return Err(e);
            }
            Err(_) => {
                let e = Error::Timeout {
                    path,
                    after: self.config.fetch_timeout,
                };
                state.fail(&e);
                return Err(e);
            }
        };
        state.fetched();

        let decoded = serde_json::from_slice::<Value>(&bytes)
            .map_err(|e| Error::decode(path.as_str(), e))
            .and_then(|raw| {
                serde_json::from_value::<T>(raw.clone())
                    .map(|value| Fetched { value, raw })
                    .map_err(|e| Error::decode(path.as_str(), e))
            });

        match decoded {
            Ok(fetched) => {
                state.decoded();
                debug!(path = %path, "Decoded resource");
                Ok(fetched)
            }
            Err(e) => {
                state.fail(&e);
                Err(e)
            }
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Stateless discovery engine; one instance serves every run.
#[derive(Debug, Clone)]
pub struct DiscoveryEngine {
    config: DiscoveryConfig,
    registry: DriverRegistry,
}

impl DiscoveryEngine {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            registry: DriverRegistry::default(),
        }
    }

    pub fn with_registry(mut self, registry: DriverRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Crawl one endpoint.
    ///
    /// Returns `Err(Error::Config)` before any fetch when the descriptor is
    /// malformed. Every other problem is reported through the aggregate.
    #[instrument(skip(self, endpoint, fetcher), fields(endpoint = %endpoint.id))]
    pub async fn discover(
        &self,
        endpoint: &EndpointDescriptor,
        fetcher: &dyn ResourceFetcher,
    ) -> Result<SystemAggregate> {
        endpoint.validate()?;

        let ctx = DiscoveryContext::new(endpoint, &self.config, fetcher);
        let mut agg = SystemAggregate::new(endpoint.id.clone());

        let system = match self.discover_root(&ctx, &mut agg).await {
            Some(system) => system,
            None => {
                agg.conclude();
                warn!(
                    status = %agg.status(),
                    error = agg.root_error().unwrap_or("unknown"),
                    "Root discovery failed"
                );
                return Ok(agg);
            }
        };

        let signature = VendorSignature::from_system(&system);
        let driver = self.registry.select(&signature);
        agg.set_driver(driver.name(), signature.manufacturer.clone());
        debug!(driver = driver.name(), manufacturer = ?signature.manufacturer, "Selected driver");

        driver.discover(&ctx, &system, &mut agg).await;
        agg.conclude();

        info!(
            driver = driver.name(),
            status = %agg.status(),
            components = agg.len(),
            "Discovery finished"
        );
        Ok(agg)
    }

    async fn discover_root(
        &self,
        ctx: &DiscoveryContext<'_>,
        agg: &mut SystemAggregate,
    ) -> Option<ComputerSystem> {
        let configured = ctx
            .endpoint
            .system_path
            .clone()
            .or_else(|| self.config.system_path.clone());

        let system_path = match configured {
            Some(path) => path,
            None => {
                let mut state = ResourceState::new(SYSTEMS_PATH);
                let collection = match ctx.fetch::<Collection>(&mut state).await {
                    Ok(fetched) => fetched.value,
                    Err(_) => {
                        agg.set_root(state);
                        return None;
                    }
                };
                match drivers::ordered_members(&collection, &[]).into_iter().next() {
                    Some(first) => {
                        state.verify_ok();
                        agg.track(state);
                        first.link.odata_id
                    }
                    None => {
                        state.verifying();
                        state.decode_failed("Systems collection has no members");
                        agg.set_root(state);
                        return None;
                    }
                }
            }
        };

        let mut root = ResourceState::new(system_path);
        match ctx.fetch::<ComputerSystem>(&mut root).await {
            Ok(fetched) => {
                root.verify_ok();
                agg.set_root(root);
                Some(fetched.value)
            }
            Err(_) => {
                agg.set_root(root);
                None
            }
        }
    }
}
