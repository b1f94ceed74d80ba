//! Heartbeat tracker (HBTD) client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::topology::{decode_nullable, with_default_scheme};
use crate::domain::ports::{HeartbeatProvider, HeartbeatState};
use crate::error::{Error, Result};

pub const DEFAULT_HBTD_URL: &str = "http://cray-hbtd/hmi/v1";

#[derive(Debug, Serialize)]
struct HeartbeatQuery<'a> {
    #[serde(rename = "XNames")]
    xnames: &'a [String],
}

#[derive(Debug, Deserialize)]
struct HeartbeatResponse {
    #[serde(rename = "HBStates", default)]
    states: Vec<HeartbeatState>,
}

#[derive(Debug, Clone)]
pub struct HbtdClient {
    base_url: String,
    client: Client,
}

impl HbtdClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::Heartbeat(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: with_default_scheme(base_url),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl HeartbeatProvider for HbtdClient {
    #[instrument(skip(self), fields(count = ids.len()))]
    async fn get_heartbeat_status(&self, ids: &[String]) -> Result<Vec<HeartbeatState>> {
        if ids.is_empty() {
            return Err(Error::Heartbeat("no component ids to query".to_string()));
        }

        let url = format!("{}/hbstates", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&HeartbeatQuery { xnames: ids })
            .send()
            .await
            .map_err(|e| Error::Heartbeat(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Heartbeat(format!("reading {} failed: {}", url, e)))?;
        if status != StatusCode::OK {
            return Err(Error::Heartbeat(
                String::from_utf8_lossy(&body).trim().to_string(),
            ));
        }

        let decoded: Option<HeartbeatResponse> = decode_nullable(&body)
            .map_err(|e| Error::Heartbeat(format!("bad heartbeat payload: {}", e)))?;
        Ok(decoded.map(|r| r.states).unwrap_or_default())
    }
}
