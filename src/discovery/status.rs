//! Component discovery state machine
//!
//! ```text
//! NotAttempted ──▶ FetchOk ──▶ Decoded ──▶ Verifying ──▶ Verified
//!      │              │                        │
//!      ▼              ▼                        ▼
//!  FetchFailed   DecodeFailed            DecodeFailed
//! ```
//!
//! A fresh `ResourceState` starts in `NotAttempted` on every run. The failure
//! states end the attempt for that resource only; whatever the store already
//! holds under its path stays until a later attempt reaches `Verified`.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Error;

/// Outcome of the most recent attempt to read one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoveryStatus {
    NotAttempted,
    FetchOk,
    FetchFailed,
    Decoded,
    DecodeFailed,
    Verifying,
    Verified,
}

impl DiscoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryStatus::NotAttempted => "NotAttempted",
            DiscoveryStatus::FetchOk => "FetchOk",
            DiscoveryStatus::FetchFailed => "FetchFailed",
            DiscoveryStatus::Decoded => "Decoded",
            DiscoveryStatus::DecodeFailed => "DecodeFailed",
            DiscoveryStatus::Verifying => "Verifying",
            DiscoveryStatus::Verified => "Verified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let status = match s {
            "NotAttempted" => DiscoveryStatus::NotAttempted,
            "FetchOk" => DiscoveryStatus::FetchOk,
            "FetchFailed" => DiscoveryStatus::FetchFailed,
            "Decoded" => DiscoveryStatus::Decoded,
            "DecodeFailed" => DiscoveryStatus::DecodeFailed,
            "Verifying" => DiscoveryStatus::Verifying,
            "Verified" => DiscoveryStatus::Verified,
            _ => return None,
        };
        Some(status)
    }

    /// Terminal for this attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DiscoveryStatus::Verified | DiscoveryStatus::FetchFailed | DiscoveryStatus::DecodeFailed
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, DiscoveryStatus::FetchFailed | DiscoveryStatus::DecodeFailed)
    }

    /// Check if a state transition is valid
    pub fn can_transition_to(&self, next: DiscoveryStatus) -> bool {
        use DiscoveryStatus::*;
        matches!(
            (self, next),
            (NotAttempted, FetchOk)
                | (NotAttempted, FetchFailed)
                | (FetchOk, Decoded)
                | (FetchOk, DecodeFailed)
                | (Decoded, Verifying)
                | (Verifying, Verified)
                | (Verifying, DecodeFailed)
        )
    }

    /// Rank used to fold many statuses into one; higher is worse.
    fn severity(&self) -> u8 {
        match self {
            DiscoveryStatus::Verified => 0,
            DiscoveryStatus::FetchOk
            | DiscoveryStatus::Decoded
            | DiscoveryStatus::Verifying
            | DiscoveryStatus::NotAttempted => 1,
            DiscoveryStatus::DecodeFailed => 2,
            DiscoveryStatus::FetchFailed => 3,
        }
    }

    /// The worse of two statuses.
    pub fn worst(self, other: DiscoveryStatus) -> DiscoveryStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for DiscoveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of one resource (by path) within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    path: String,
    status: DiscoveryStatus,
    error: Option<String>,
}

impl ResourceState {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            status: DiscoveryStatus::NotAttempted,
            error: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn status(&self) -> DiscoveryStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Move to `next`; invalid transitions are logged and ignored.
    pub fn advance(&mut self, next: DiscoveryStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            warn!(
                path = %self.path,
                from = %self.status,
                to = %next,
                "Ignoring invalid discovery state transition"
            );
            false
        }
    }

    pub fn fetched(&mut self) -> bool {
        self.advance(DiscoveryStatus::FetchOk)
    }

    pub fn decoded(&mut self) -> bool {
        self.advance(DiscoveryStatus::Decoded)
    }

    pub fn verifying(&mut self) -> bool {
        self.advance(DiscoveryStatus::Verifying)
    }

    pub fn verified(&mut self) -> bool {
        self.advance(DiscoveryStatus::Verified)
    }

    /// Run the whole success path from a decoded state.
    pub fn verify_ok(&mut self) -> bool {
        self.verifying() && self.verified()
    }

    pub fn fetch_failed(&mut self, reason: impl Into<String>) -> bool {
        self.error = Some(reason.into());
        self.advance(DiscoveryStatus::FetchFailed)
    }

    pub fn decode_failed(&mut self, reason: impl Into<String>) -> bool {
        self.error = Some(reason.into());
        self.advance(DiscoveryStatus::DecodeFailed)
    }

    /// Record a fetch-layer error against the current state.
    ///
    /// Transport errors and absent resources fail the fetch; decode errors
    /// fail the decode. Anything else is treated as a transport problem.
    pub fn fail(&mut self, error: &Error) -> bool {
        if error.is_decode() {
            self.decode_failed(error.to_string())
        } else {
            self.fetch_failed(error.to_string())
        }
    }
}
