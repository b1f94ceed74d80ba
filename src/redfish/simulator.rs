//! In-process simulated Redfish endpoints
//!
//! Maps relative paths to canned responses so drivers, the scheduler and the
//! store can be exercised without network I/O. Responses can be swapped while
//! a test runs to model hardware changes or degrading firmware.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;

use super::{normalize_path, EndpointConnector, EndpointDescriptor, ResourceFetcher};
use crate::error::{Error, Result};

/// Canned answer for one path.
#[derive(Debug, Clone)]
pub enum SimulatedResponse {
    /// 200 with this body
    Body(Bytes),
    /// 404
    Absent,
    /// Connection refused / reset
    Unreachable,
    /// Answer after a delay
    Delayed(Duration, Box<SimulatedResponse>),
}

impl SimulatedResponse {
    pub fn json(value: &Value) -> Self {
        SimulatedResponse::Body(Bytes::from(value.to_string()))
    }

    pub fn raw(body: impl Into<String>) -> Self {
        SimulatedResponse::Body(Bytes::from(body.into()))
    }

    pub fn delayed(self, delay: Duration) -> Self {
        SimulatedResponse::Delayed(delay, Box::new(self))
    }
}

/// One simulated endpoint.
#[derive(Debug)]
pub struct SimulatedEndpoint {
    resources: RwLock<HashMap<String, SimulatedResponse>>,
    fallback: SimulatedResponse,
    requests: RwLock<Vec<String>>,
}

impl Default for SimulatedEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEndpoint {
    /// Endpoint answering 404 for every path not registered.
    pub fn new() -> Self {
        Self {
            resources: RwLock::new(HashMap::new()),
            fallback: SimulatedResponse::Absent,
            requests: RwLock::new(Vec::new()),
        }
    }

    /// Endpoint refusing every connection.
    pub fn unreachable() -> Self {
        Self {
            fallback: SimulatedResponse::Unreachable,
            ..Self::new()
        }
    }

    pub fn with_json(self, path: &str, value: Value) -> Self {
        self.set(path, SimulatedResponse::json(&value));
        self
    }

    pub fn with_response(self, path: &str, response: SimulatedResponse) -> Self {
        self.set(path, response);
        self
    }

    pub fn set(&self, path: &str, response: SimulatedResponse) {
        self.resources.write().insert(normalize_path(path), response);
    }

    pub fn set_json(&self, path: &str, value: Value) {
        self.set(path, SimulatedResponse::json(&value));
    }

    pub fn remove(&self, path: &str) {
        self.resources.write().remove(&normalize_path(path));
    }

    /// Paths requested so far, in request order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.read().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.read().len()
    }

    pub fn clear_requests(&self) {
        self.requests.write().clear();
    }

    fn lookup(&self, path: &str) -> SimulatedResponse {
        self.resources
            .read()
            .get(path)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl ResourceFetcher for SimulatedEndpoint {
    async fn get_relative(&self, path: &str) -> Result<Bytes> {
        let path = normalize_path(path);
        self.requests.write().push(path.clone());

        let mut response = self.lookup(&path);
        loop {
            match response {
                SimulatedResponse::Body(body) => return Ok(body),
                SimulatedResponse::Absent => return Err(Error::AbsentResource { path }),
                SimulatedResponse::Unreachable => {
                    return Err(Error::transport(path, "connection refused"))
                }
                SimulatedResponse::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    response = *inner;
                }
            }
        }
    }
}

/// Set of simulated endpoints keyed by endpoint id.
///
/// Endpoints that were never registered behave as unreachable hosts.
#[derive(Debug, Default)]
pub struct SimulatedFleet {
    endpoints: DashMap<String, Arc<SimulatedEndpoint>>,
}

impl SimulatedFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, endpoint_id: &str, endpoint: SimulatedEndpoint) -> Arc<SimulatedEndpoint> {
        let endpoint = Arc::new(endpoint);
        self.endpoints
            .insert(endpoint_id.to_string(), Arc::clone(&endpoint));
        endpoint
    }

    pub fn get(&self, endpoint_id: &str) -> Option<Arc<SimulatedEndpoint>> {
        self.endpoints.get(endpoint_id).map(|e| Arc::clone(e.value()))
    }
}

impl EndpointConnector for SimulatedFleet {
    fn connect(&self, endpoint: &EndpointDescriptor) -> Result<Arc<dyn ResourceFetcher>> {
        match self.get(endpoint.id.as_str()) {
            Some(sim) => Ok(sim),
            None => Ok(Arc::new(SimulatedEndpoint::unreachable())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redfish::Credentials;
    use serde_json::json;

    #[tokio::test]
    async fn test_simulated_responses() {
        let sim = SimulatedEndpoint::new()
            .with_json("/redfish/v1/Systems", json!({"Members": []}))
            .with_response("/redfish/v1/Chassis", SimulatedResponse::Unreachable);

        let body = sim.get_relative("redfish/v1/Systems").await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["Members"], json!([]));

        assert!(sim
            .get_relative("/redfish/v1/Chassis")
            .await
            .unwrap_err()
            .is_transport());
        assert!(sim
            .get_relative("/redfish/v1/Managers")
            .await
            .unwrap_err()
            .is_absent());

        assert_eq!(
            sim.requests(),
            vec!["/redfish/v1/Systems", "/redfish/v1/Chassis", "/redfish/v1/Managers"]
        );
    }

    #[tokio::test]
    async fn test_delayed_response() {
        let sim = SimulatedEndpoint::new().with_response(
            "/slow",
            SimulatedResponse::raw("{}").delayed(Duration::from_millis(20)),
        );

        let started = std::time::Instant::now();
        sim.get_relative("/slow").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_fleet_unknown_endpoint_unreachable() {
        let fleet = SimulatedFleet::new();
        fleet.insert("x0c0s0b0", SimulatedEndpoint::new());

        let known = EndpointDescriptor::new("x0c0s0b0", "sim", Credentials::new("u", "p"));
        let unknown = EndpointDescriptor::new("x0c0s1b0", "sim", Credentials::new("u", "p"));

        let fetcher = fleet.connect(&known).unwrap();
        assert!(fetcher.get_relative("/x").await.unwrap_err().is_absent());

        let fetcher = fleet.connect(&unknown).unwrap();
        assert!(fetcher.get_relative("/x").await.unwrap_err().is_transport());
    }
}
