//! Discovery scheduler
//!
//! Decides which endpoints to (re)discover, bounds how many runs are in
//! flight, and keeps at most one run per endpoint. A run either commits its
//! aggregate through one `upsert` or records a failed status and leaves the
//! endpoint's committed components alone.

mod engine;

pub use engine::{
    CycleReport, DiscoveryScheduler, DiscoverySchedulerBuilder, EndpointRunState, RunOutcome,
    RunReport, SchedulerConfig,
};
