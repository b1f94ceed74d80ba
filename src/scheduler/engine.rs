//! Scheduler Engine
//!
//! # Run lifecycle
//!
//! ```text
//! validate ──▶ claim endpoint ──▶ permit ──▶ crawl (timeout, cancel)
//!                                                 │
//!                       committable? ── yes ──▶ upsert ──▶ DiscoveryCompleted
//!                            │
//!                            no ──▶ record status ──▶ DiscoveryFailed
//! ```
//!
//! # Guarantees
//!
//! 1. At most one run per endpoint; a second request is refused
//! 2. At most `max_concurrent_runs` runs hold a permit at once
//! 3. A cancelled or timed-out run never reaches `upsert`
//! 4. Runs carry a generation taken at start, so a slow older run cannot
//!    overwrite the result of a newer one
//! 5. [`DiscoveryScheduler::run`] never waits on a run between ticks; runs
//!    whose endpoint leaves the topology are cancelled on the next tick

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::LoggingEventPublisher;
use crate::discovery::{DiscoveryEngine, DiscoveryStatus, SystemAggregate};
use crate::domain::events::DomainEvent;
use crate::domain::ports::{EventPublisher, InventoryStore, TopologyProvider};
use crate::error::{Error, Result};
use crate::inventory::{ChangeSet, EndpointStatusRecord, InventoryUpdate};
use crate::metrics::{outcome, DiscoveryMetrics};
use crate::redfish::{EndpointConnector, EndpointDescriptor, EndpointId};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on runs in flight at once
    pub max_concurrent_runs: usize,

    /// Bound on a whole run, fetches and commit included
    pub run_timeout: Duration,

    /// Minimum age of a successful run before the endpoint is due again
    pub rediscover_interval: Duration,

    /// Minimum age of a failed run before the endpoint is retried
    pub retry_interval: Duration,

    /// Pause between cycles in [`DiscoveryScheduler::run`]
    pub cycle_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 20,
            run_timeout: Duration::from_secs(10 * 60),
            rediscover_interval: Duration::from_secs(60 * 60),
            retry_interval: Duration::from_secs(5 * 60),
            cycle_interval: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Aggregate merged into the store
    Committed { changes: ChangeSet },
    /// Root unreadable or store refused; committed components untouched
    Aborted { reason: String },
    /// A newer run already committed for this endpoint
    Superseded,
    /// Cancelled before commit
    Cancelled,
    /// Exceeded the run timeout
    TimedOut,
}

impl RunOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, RunOutcome::Committed { .. })
    }

    /// Metric label for this outcome.
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Committed { .. } => outcome::COMMITTED,
            RunOutcome::Aborted { .. } => outcome::ABORTED,
            RunOutcome::Superseded => outcome::SUPERSEDED,
            RunOutcome::Cancelled => outcome::CANCELLED,
            RunOutcome::TimedOut => outcome::TIMED_OUT,
        }
    }
}

/// Result of one discovery run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub endpoint: EndpointId,
    pub run_id: String,
    pub generation: u64,
    /// Overall discovery status of the crawl
    pub status: DiscoveryStatus,
    /// Verified components the crawl produced
    pub components: usize,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Result of one scheduling cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// Topology service reported not ready; nothing was started
    pub topology_not_ready: bool,
    /// Endpoints listed by the topology service
    pub listed: usize,
    /// Runs cancelled because their endpoint left the topology
    pub cancelled: usize,
    /// Endpoints skipped because a run was already in flight
    pub in_progress: usize,
    pub reports: Vec<RunReport>,
}

impl CycleReport {
    pub fn committed(&self) -> usize {
        self.reports.iter().filter(|r| r.outcome.is_committed()).count()
    }
}

/// Discovery-run metadata kept per endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointRunState {
    pub last_attempt: DateTime<Utc>,
    pub last_status: DiscoveryStatus,
    /// Outcome label of the last run, as used by the runs metric
    pub last_outcome: &'static str,
    /// Committed inventory reflects a run at least as new as the last attempt
    pub last_committed: bool,
    pub last_success: Option<DateTime<Utc>>,
}

// =============================================================================
// Active Run Tracking
// =============================================================================

#[derive(Debug)]
struct ActiveRun {
    run_id: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// Releases the endpoint claim when the run ends, however it ends.
struct ActiveGuard<'a> {
    active: &'a DashMap<EndpointId, ActiveRun>,
    endpoint: EndpointId,
    run_id: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active
            .remove_if(&self.endpoint, |_, run| run.run_id == self.run_id);
    }
}

/// Keeps the active-runs gauge honest on every exit path.
struct MetricsGuard<'a> {
    metrics: &'a DiscoveryMetrics,
    outcome: &'static str,
}

impl Drop for MetricsGuard<'_> {
    fn drop(&mut self) {
        self.metrics.run_finished(self.outcome);
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Drives discovery runs against the inventory store
pub struct DiscoveryScheduler {
    config: SchedulerConfig,
    engine: DiscoveryEngine,
    connector: Arc<dyn EndpointConnector>,
    store: Arc<dyn InventoryStore>,
    topology: Option<Arc<dyn TopologyProvider>>,
    publisher: Arc<dyn EventPublisher>,
    metrics: DiscoveryMetrics,
    permits: Semaphore,
    active: DashMap<EndpointId, ActiveRun>,
    run_states: DashMap<EndpointId, EndpointRunState>,
    /// Seeded from the wall clock so generations keep rising across restarts
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for DiscoveryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryScheduler")
            .field("config", &self.config)
            .field("active_runs", &self.active.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`DiscoveryScheduler`]
pub struct DiscoverySchedulerBuilder {
    config: SchedulerConfig,
    engine: DiscoveryEngine,
    connector: Arc<dyn EndpointConnector>,
    store: Arc<dyn InventoryStore>,
    topology: Option<Arc<dyn TopologyProvider>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    metrics: Option<DiscoveryMetrics>,
}

impl DiscoverySchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn topology(mut self, topology: Arc<dyn TopologyProvider>) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Sink for run events; defaults to the log.
    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn metrics(mut self, metrics: DiscoveryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Arc<DiscoveryScheduler>> {
        if self.config.max_concurrent_runs == 0 {
            return Err(Error::Config(
                "max_concurrent_runs must be at least 1".to_string(),
            ));
        }
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => DiscoveryMetrics::new()?,
        };
        let seed = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);

        Ok(Arc::new(DiscoveryScheduler {
            permits: Semaphore::new(self.config.max_concurrent_runs),
            config: self.config,
            engine: self.engine,
            connector: self.connector,
            store: self.store,
            topology: self.topology,
            publisher: self
                .publisher
                .unwrap_or_else(|| Arc::new(LoggingEventPublisher::info_level())),
            metrics,
            active: DashMap::new(),
            run_states: DashMap::new(),
            generation: AtomicU64::new(seed),
            shutdown: CancellationToken::new(),
        }))
    }
}

impl DiscoveryScheduler {
    pub fn builder(
        engine: DiscoveryEngine,
        connector: Arc<dyn EndpointConnector>,
        store: Arc<dyn InventoryStore>,
    ) -> DiscoverySchedulerBuilder {
        DiscoverySchedulerBuilder {
            config: SchedulerConfig::default(),
            engine,
            connector,
            store,
            topology: None,
            publisher: None,
            metrics: None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &DiscoveryMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn InventoryStore> {
        &self.store
    }

    /// Check if a run is in flight for `endpoint`
    pub fn is_running(&self, endpoint: &EndpointId) -> bool {
        self.active.contains_key(endpoint)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Endpoints with a run in flight and when each started.
    pub fn active_runs(&self) -> Vec<(EndpointId, DateTime<Utc>)> {
        let mut runs: Vec<_> = self
            .active
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().started_at))
            .collect();
        runs.sort();
        runs
    }

    pub fn run_state(&self, endpoint: &EndpointId) -> Option<EndpointRunState> {
        self.run_states.get(endpoint).map(|s| s.clone())
    }

    /// Cancel the in-flight run for `endpoint`, if any.
    pub fn cancel(&self, endpoint: &EndpointId) -> bool {
        match self.active.get(endpoint) {
            Some(run) => {
                info!(endpoint = %endpoint, run_id = %run.run_id, "Cancelling discovery run");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop the loop and cancel every in-flight run.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Whether `endpoint` should be discovered at `now`.
    pub fn is_due(&self, endpoint: &EndpointId, now: DateTime<Utc>) -> bool {
        if self.is_running(endpoint) {
            return false;
        }
        let Some(state) = self.run_states.get(endpoint) else {
            return true;
        };
        let interval = if state.last_committed {
            self.config.rediscover_interval
        } else {
            self.config.retry_interval
        };
        let elapsed = (now - state.last_attempt).to_std().unwrap_or(Duration::ZERO);
        elapsed >= interval
    }

    // =========================================================================
    // Single Run
    // =========================================================================

    /// Discover one endpoint and commit or abort.
    ///
    /// Fails with `Config` before any network call for a malformed
    /// descriptor, and with `DiscoveryInProgress` when the endpoint already
    /// has a run in flight. Every other ending is reported in the
    /// [`RunReport`].
    #[instrument(skip(self, descriptor), fields(endpoint = %descriptor.id))]
    pub async fn discover(&self, descriptor: EndpointDescriptor) -> Result<RunReport> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled {
                endpoint: descriptor.id.to_string(),
            });
        }
        if let Err(e) = descriptor.validate() {
            warn!(error = %e, "Endpoint rejected before discovery");
            self.record_status(
                EndpointStatusRecord::new(descriptor.id.clone(), DiscoveryStatus::NotAttempted)
                    .with_message(e.to_string()),
            )
            .await;
            return Err(e);
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let cancel = self.shutdown.child_token();
        match self.active.entry(descriptor.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::DiscoveryInProgress {
                    endpoint: descriptor.id.to_string(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ActiveRun {
                    run_id: run_id.clone(),
                    started_at: Utc::now(),
                    cancel: cancel.clone(),
                });
            }
        }
        let _claim = ActiveGuard {
            active: &self.active,
            endpoint: descriptor.id.clone(),
            run_id: run_id.clone(),
        };

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(self
                    .finish_cancelled(&descriptor.id, &run_id, 0, Utc::now(), Instant::now())
                    .await);
            }
            permit = self.permits.acquire() => permit
                .map_err(|e| Error::Internal(format!("run permits closed: {}", e)))?,
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let started_at = Utc::now();
        let clock = Instant::now();
        self.metrics.run_started();
        let mut metrics_guard = MetricsGuard {
            metrics: &self.metrics,
            outcome: outcome::ABORTED,
        };
        debug!(run_id = %run_id, generation, "Discovery run started");

        let fetcher = match self.connector.connect(&descriptor) {
            Ok(fetcher) => fetcher,
            Err(e) => {
                let report = self
                    .finish_aborted(
                        &descriptor.id,
                        &run_id,
                        generation,
                        started_at,
                        clock,
                        DiscoveryStatus::FetchFailed,
                        0,
                        e.to_string(),
                    )
                    .await;
                return Ok(report);
            }
        };

        let crawl = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(
                self.config.run_timeout,
                self.engine.discover(&descriptor, fetcher.as_ref()),
            ) => Some(result),
        };

        let agg = match crawl {
            None => {
                metrics_guard.outcome = RunOutcome::Cancelled.label();
                return Ok(self
                    .finish_cancelled(&descriptor.id, &run_id, generation, started_at, clock)
                    .await);
            }
            Some(Err(_elapsed)) => {
                metrics_guard.outcome = RunOutcome::TimedOut.label();
                let reason = format!("run exceeded {:?}", self.config.run_timeout);
                warn!(run_id = %run_id, "{}", reason);
                self.record_failure(
                    &descriptor.id,
                    DiscoveryStatus::FetchFailed,
                    &reason,
                    outcome::TIMED_OUT,
                )
                .await;
                self.publish(DomainEvent::discovery_failed(
                    &descriptor.id,
                    &run_id,
                    DiscoveryStatus::FetchFailed,
                    reason,
                ))
                .await;
                return Ok(RunReport {
                    endpoint: descriptor.id.clone(),
                    run_id,
                    generation,
                    status: DiscoveryStatus::FetchFailed,
                    components: 0,
                    outcome: RunOutcome::TimedOut,
                    started_at,
                    duration: clock.elapsed(),
                });
            }
            Some(Ok(result)) => result?,
        };

        let (fetch_failed, decode_failed) = agg.failure_counts();
        self.metrics.record_fetch_failures(fetch_failed, decode_failed);

        if !agg.is_committable() {
            let reason = agg
                .root_error()
                .unwrap_or("system resource could not be discovered")
                .to_string();
            return Ok(self
                .finish_aborted(
                    &descriptor.id,
                    &run_id,
                    generation,
                    started_at,
                    clock,
                    agg.status(),
                    agg.len(),
                    reason,
                )
                .await);
        }

        if cancel.is_cancelled() {
            metrics_guard.outcome = RunOutcome::Cancelled.label();
            return Ok(self
                .finish_cancelled(&descriptor.id, &run_id, generation, started_at, clock)
                .await);
        }

        let report = self
            .commit(&agg, &run_id, generation, started_at, clock)
            .await;
        metrics_guard.outcome = match &report.outcome {
            RunOutcome::Aborted { .. } => outcome::STORE_ERROR,
            other => other.label(),
        };
        Ok(report)
    }

    async fn commit(
        &self,
        agg: &SystemAggregate,
        run_id: &str,
        generation: u64,
        started_at: DateTime<Utc>,
        clock: Instant,
    ) -> RunReport {
        let endpoint = agg.endpoint.clone();
        let status = agg.status();
        let mut report = RunReport {
            endpoint: endpoint.clone(),
            run_id: run_id.to_string(),
            generation,
            status,
            components: agg.len(),
            outcome: RunOutcome::Superseded,
            started_at,
            duration: Duration::ZERO,
        };

        match self
            .store
            .upsert(InventoryUpdate::from_aggregate(agg, generation))
            .await
        {
            Ok(changes) => {
                let now = Utc::now();
                self.metrics.record_changes(&changes);
                self.record_status(
                    EndpointStatusRecord::new(endpoint.clone(), status).succeeded_at(now),
                )
                .await;
                self.remember(&endpoint, status, outcome::COMMITTED);
                report.duration = clock.elapsed();
                info!(
                    run_id = %run_id,
                    status = %status,
                    components = agg.len(),
                    added = changes.added.len(),
                    changed = changes.changed.len(),
                    removed = changes.removed.len(),
                    preserved = changes.preserved,
                    "Discovery committed"
                );
                self.publish(DomainEvent::discovery_completed(
                    &endpoint,
                    run_id,
                    status,
                    agg.len(),
                    changes.len(),
                    report.duration,
                ))
                .await;
                report.outcome = RunOutcome::Committed { changes };
            }
            Err(Error::StoreConflict { reason, .. }) => {
                // The newer run owns the stored endpoint status.
                info!(run_id = %run_id, reason = %reason, "Discovery superseded by a newer run");
                self.remember(&endpoint, status, outcome::SUPERSEDED);
                report.duration = clock.elapsed();
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Failed to commit discovery");
                self.record_failure(&endpoint, status, &e.to_string(), outcome::STORE_ERROR)
                    .await;
                self.publish(DomainEvent::discovery_failed(
                    &endpoint,
                    run_id,
                    status,
                    e.to_string(),
                ))
                .await;
                report.duration = clock.elapsed();
                report.outcome = RunOutcome::Aborted {
                    reason: e.to_string(),
                };
            }
        }
        report
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_aborted(
        &self,
        endpoint: &EndpointId,
        run_id: &str,
        generation: u64,
        started_at: DateTime<Utc>,
        clock: Instant,
        status: DiscoveryStatus,
        components: usize,
        reason: String,
    ) -> RunReport {
        warn!(run_id = %run_id, status = %status, reason = %reason, "Discovery aborted");
        self.record_failure(endpoint, status, &reason, outcome::ABORTED)
            .await;
        self.publish(DomainEvent::discovery_failed(
            endpoint,
            run_id,
            status,
            reason.clone(),
        ))
        .await;
        RunReport {
            endpoint: endpoint.clone(),
            run_id: run_id.to_string(),
            generation,
            status,
            components,
            outcome: RunOutcome::Aborted { reason },
            started_at,
            duration: clock.elapsed(),
        }
    }

    async fn finish_cancelled(
        &self,
        endpoint: &EndpointId,
        run_id: &str,
        generation: u64,
        started_at: DateTime<Utc>,
        clock: Instant,
    ) -> RunReport {
        info!(run_id = %run_id, "Discovery cancelled before commit");
        self.publish(DomainEvent::discovery_failed(
            endpoint,
            run_id,
            DiscoveryStatus::NotAttempted,
            "cancelled",
        ))
        .await;
        RunReport {
            endpoint: endpoint.clone(),
            run_id: run_id.to_string(),
            generation,
            status: DiscoveryStatus::NotAttempted,
            components: 0,
            outcome: RunOutcome::Cancelled,
            started_at,
            duration: clock.elapsed(),
        }
    }

    async fn record_failure(
        &self,
        endpoint: &EndpointId,
        status: DiscoveryStatus,
        reason: &str,
        label: &'static str,
    ) {
        self.record_status(
            EndpointStatusRecord::new(endpoint.clone(), status).with_message(reason),
        )
        .await;
        self.remember(endpoint, status, label);
    }

    async fn record_status(&self, status: EndpointStatusRecord) {
        let endpoint = status.endpoint.clone();
        if let Err(e) = self.store.record_endpoint_status(status).await {
            warn!(endpoint = %endpoint, error = %e, "Failed to record endpoint status");
        }
    }

    /// Update the per-endpoint run state. A superseded run still counts as
    /// committed inventory: a newer run for the endpoint got there first.
    fn remember(&self, endpoint: &EndpointId, status: DiscoveryStatus, label: &'static str) {
        let now = Utc::now();
        let committed = label == outcome::COMMITTED || label == outcome::SUPERSEDED;
        let mut state = self
            .run_states
            .entry(endpoint.clone())
            .or_insert_with(|| EndpointRunState {
                last_attempt: now,
                last_status: status,
                last_outcome: label,
                last_committed: committed,
                last_success: None,
            });
        state.last_attempt = now;
        state.last_status = status;
        state.last_outcome = label;
        state.last_committed = committed;
        if label == outcome::COMMITTED {
            state.last_success = Some(now);
        }
    }

    async fn publish(&self, event: DomainEvent) {
        let event_type = event.event_type();
        if let Err(e) = self.publisher.publish(event).await {
            warn!(event_type, error = %e, "Failed to publish event");
        }
    }

    // =========================================================================
    // Cycles
    // =========================================================================

    /// One pass over the topology: cancel runs for endpoints that left it,
    /// then discover every due endpoint with bounded concurrency and wait
    /// for those runs to finish.
    pub async fn run_cycle(self: &Arc<Self>) -> Result<CycleReport> {
        let mut runs = JoinSet::new();
        let mut report = self.schedule(&mut runs).await?;

        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok(Err(Error::DiscoveryInProgress { .. })) => report.in_progress += 1,
                other => report.reports.extend(Self::reap(other)),
            }
        }
        report.reports.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));

        info!(
            listed = report.listed,
            runs = report.reports.len(),
            committed = report.committed(),
            cancelled = report.cancelled,
            "Discovery cycle finished"
        );
        Ok(report)
    }

    /// Diff the topology against in-flight runs and spawn every due run
    /// into `runs` without waiting on it. The returned report carries no
    /// run results.
    async fn schedule(
        self: &Arc<Self>,
        runs: &mut JoinSet<Result<RunReport>>,
    ) -> Result<CycleReport> {
        let topology = self
            .topology
            .as_ref()
            .ok_or_else(|| Error::Config("no topology provider configured".to_string()))?;

        let mut report = CycleReport::default();
        if !topology.is_ready().await? {
            warn!("Topology service not ready; skipping cycle");
            report.topology_not_ready = true;
            return Ok(report);
        }

        let endpoints = topology.list_endpoints().await?;
        report.listed = endpoints.len();

        let listed: HashSet<&EndpointId> = endpoints.iter().map(|e| &e.id).collect();
        let departed: Vec<EndpointId> = self
            .active
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| !listed.contains(id))
            .collect();
        for id in departed {
            if self.cancel(&id) {
                report.cancelled += 1;
            }
        }
        self.run_states.retain(|id, _| listed.contains(id));

        let now = Utc::now();
        for mut descriptor in endpoints {
            if self.is_running(&descriptor.id) {
                report.in_progress += 1;
                continue;
            }
            if !self.is_due(&descriptor.id, now) {
                continue;
            }
            if descriptor.role.is_none() || descriptor.nid.is_none() {
                match topology.get_node_info(descriptor.id.as_str()).await {
                    Ok(info) => {
                        descriptor.role = descriptor.role.or(info.role);
                        descriptor.nid = descriptor.nid.or(info.nid);
                    }
                    Err(e) => debug!(endpoint = %descriptor.id, error = %e, "No node info"),
                }
            }

            let scheduler = Arc::clone(self);
            runs.spawn(async move { scheduler.discover(descriptor).await });
        }
        Ok(report)
    }

    fn reap(joined: std::result::Result<Result<RunReport>, JoinError>) -> Option<RunReport> {
        match joined {
            Ok(Ok(run)) => Some(run),
            Ok(Err(Error::DiscoveryInProgress { endpoint })) => {
                debug!(endpoint = %endpoint, "Run already in flight");
                None
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Discovery run refused");
                None
            }
            Err(e) => {
                error!(error = %e, "Discovery task failed");
                None
            }
        }
    }

    /// Schedule on every tick until [`shutdown`](Self::shutdown).
    ///
    /// Runs stay in flight across ticks, so a slow endpoint never delays the
    /// next topology diff. On shutdown every in-flight run is cancelled and
    /// drained before returning.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.cycle_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut runs = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    if let Some(run) = Self::reap(joined) {
                        debug!(
                            endpoint = %run.endpoint,
                            outcome = run.outcome.label(),
                            "Discovery run reaped"
                        );
                    }
                }
                _ = ticker.tick() => {
                    match self.schedule(&mut runs).await {
                        Ok(report) => debug!(
                            listed = report.listed,
                            cancelled = report.cancelled,
                            in_flight = runs.len(),
                            "Discovery tick"
                        ),
                        Err(e) => error!(error = %e, "Discovery cycle failed"),
                    }
                }
            }
        }

        while let Some(joined) = runs.join_next().await {
            Self::reap(joined);
        }
        info!("Scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::adapters::{InMemoryEventCollector, RecordingInventoryStore, StaticTopology};
    use crate::discovery::DiscoveryConfig;
    use crate::redfish::{Credentials, SimulatedEndpoint, SimulatedFleet, SimulatedResponse};
    use serde_json::json;

    fn descriptor(id: &str) -> EndpointDescriptor {
        EndpointDescriptor::new(id, format!("{}.mgmt", id), Credentials::new("root", "pw"))
    }

    fn healthy_endpoint() -> SimulatedEndpoint {
        SimulatedEndpoint::new()
            .with_json(
                "/redfish/v1/Systems",
                json!({"Members": [{"@odata.id": "/redfish/v1/Systems/1"}]}),
            )
            .with_json(
                "/redfish/v1/Systems/1",
                json!({
                    "Id": "1",
                    "Manufacturer": "Contoso",
                    "EthernetInterfaces": {"@odata.id": "/redfish/v1/Systems/1/EthernetInterfaces"}
                }),
            )
            .with_json(
                "/redfish/v1/Systems/1/EthernetInterfaces",
                json!({"Members": [{"@odata.id": "/redfish/v1/Systems/1/EthernetInterfaces/1"}]}),
            )
            .with_json(
                "/redfish/v1/Systems/1/EthernetInterfaces/1",
                json!({"Id": "1", "MACAddress": "AA:BB:CC:00:00:01"}),
            )
    }

    struct Harness {
        scheduler: Arc<DiscoveryScheduler>,
        fleet: Arc<SimulatedFleet>,
        store: Arc<RecordingInventoryStore>,
        events: Arc<InMemoryEventCollector>,
    }

    fn harness(config: SchedulerConfig, topology: Option<Arc<StaticTopology>>) -> Harness {
        let fleet = Arc::new(SimulatedFleet::new());
        let store = Arc::new(RecordingInventoryStore::new());
        let events = Arc::new(InMemoryEventCollector::new());
        let mut builder = DiscoveryScheduler::builder(
            DiscoveryEngine::new(DiscoveryConfig::default()),
            fleet.clone(),
            store.clone(),
        )
        .config(config)
        .publisher(events.clone());
        if let Some(topology) = topology {
            builder = builder.topology(topology);
        }
        Harness {
            scheduler: builder.build().unwrap(),
            fleet,
            store,
            events,
        }
    }

    #[tokio::test]
    async fn test_commit_records_status_and_event() {
        let h = harness(SchedulerConfig::default(), None);
        h.fleet.insert("x0c0s0b0", healthy_endpoint());

        let report = h.scheduler.discover(descriptor("x0c0s0b0")).await.unwrap();
        assert!(report.outcome.is_committed());
        assert_eq!(report.status, DiscoveryStatus::Verified);
        assert_eq!(report.components, 1);

        assert_eq!(h.store.upserts().len(), 1);
        let status = h.store.statuses().pop().unwrap();
        assert_eq!(status.status, DiscoveryStatus::Verified);
        assert!(status.last_success.is_some());
        assert_eq!(h.events.events_of_type("DiscoveryCompleted").len(), 1);

        let state = h.scheduler.run_state(&"x0c0s0b0".into()).unwrap();
        assert!(state.last_committed);
        assert!(!h.scheduler.is_running(&"x0c0s0b0".into()));
        assert_eq!(h.scheduler.metrics().runs(outcome::COMMITTED), 1);
        assert_eq!(h.scheduler.metrics().active_runs(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_aborts_without_upsert() {
        let h = harness(SchedulerConfig::default(), None);
        h.fleet.insert("x0c0s0b0", SimulatedEndpoint::unreachable());

        let report = h.scheduler.discover(descriptor("x0c0s0b0")).await.unwrap();
        assert_matches!(report.outcome, RunOutcome::Aborted { .. });
        assert_eq!(report.status, DiscoveryStatus::FetchFailed);
        assert!(h.store.upserts().is_empty());
        assert_eq!(h.store.statuses()[0].status, DiscoveryStatus::FetchFailed);
        assert_eq!(h.events.events_of_type("DiscoveryFailed").len(), 1);
    }

    #[tokio::test]
    async fn test_config_error_before_any_fetch() {
        let h = harness(SchedulerConfig::default(), None);
        let sim = h.fleet.insert("x0c0s0b0", healthy_endpoint());

        let mut bad = descriptor("x0c0s0b0");
        bad.fqdn = "bad host".to_string();
        let result = h.scheduler.discover(bad).await;

        assert_matches!(result, Err(Error::Config(_)));
        assert_eq!(sim.request_count(), 0);
        assert!(h.store.upserts().is_empty());
    }

    #[tokio::test]
    async fn test_second_run_for_same_endpoint_refused() {
        let h = harness(SchedulerConfig::default(), None);
        let slow = healthy_endpoint().with_response(
            "/redfish/v1/Systems",
            SimulatedResponse::json(&json!({"Members": [{"@odata.id": "/redfish/v1/Systems/1"}]}))
                .delayed(Duration::from_millis(200)),
        );
        h.fleet.insert("x0c0s0b0", slow);

        let scheduler = Arc::clone(&h.scheduler);
        let first = tokio::spawn(async move { scheduler.discover(descriptor("x0c0s0b0")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = h.scheduler.discover(descriptor("x0c0s0b0")).await;
        assert_matches!(second, Err(Error::DiscoveryInProgress { .. }));

        let first = first.await.unwrap().unwrap();
        assert!(first.outcome.is_committed());
        assert_eq!(h.store.upserts().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_leaves_store_untouched() {
        let h = harness(SchedulerConfig::default(), None);
        let slow = healthy_endpoint().with_response(
            "/redfish/v1/Systems/1/EthernetInterfaces/1",
            SimulatedResponse::json(&json!({"Id": "1", "MACAddress": "AA:BB:CC:00:00:01"}))
                .delayed(Duration::from_millis(500)),
        );
        h.fleet.insert("x0c0s0b0", slow);

        let scheduler = Arc::clone(&h.scheduler);
        let run = tokio::spawn(async move { scheduler.discover(descriptor("x0c0s0b0")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.scheduler.cancel(&"x0c0s0b0".into()));

        let report = run.await.unwrap().unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert!(h.store.upserts().is_empty());
        assert!(h.store.statuses().is_empty());
        assert!(!h.scheduler.is_running(&"x0c0s0b0".into()));
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let config = SchedulerConfig {
            run_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let h = harness(config, None);
        let slow = healthy_endpoint().with_response(
            "/redfish/v1/Systems",
            SimulatedResponse::json(&json!({"Members": []})).delayed(Duration::from_millis(500)),
        );
        h.fleet.insert("x0c0s0b0", slow);

        let report = h.scheduler.discover(descriptor("x0c0s0b0")).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::TimedOut);
        assert!(h.store.upserts().is_empty());
        assert_eq!(h.scheduler.metrics().runs(outcome::TIMED_OUT), 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_reported() {
        let h = harness(SchedulerConfig::default(), None);
        h.fleet.insert("x0c0s0b0", healthy_endpoint());
        h.store.fail_upserts(true);

        let report = h.scheduler.discover(descriptor("x0c0s0b0")).await.unwrap();
        assert_matches!(report.outcome, RunOutcome::Aborted { .. });
        assert!(!h.scheduler.run_state(&"x0c0s0b0".into()).unwrap().last_committed);
    }

    #[tokio::test]
    async fn test_superseded_run_updates_run_state() {
        let h = harness(SchedulerConfig::default(), None);
        h.fleet.insert("x0c0s0b0", healthy_endpoint());
        h.store
            .inner()
            .upsert(InventoryUpdate::replace("x0c0s0b0", vec![]).with_generation(u64::MAX))
            .await
            .unwrap();

        let report = h.scheduler.discover(descriptor("x0c0s0b0")).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Superseded);

        let state = h.scheduler.run_state(&"x0c0s0b0".into()).unwrap();
        assert_eq!(state.last_outcome, outcome::SUPERSEDED);
        assert_eq!(state.last_status, DiscoveryStatus::Verified);
        assert!(state.last_committed);
        assert!(state.last_success.is_none());
        assert!(!h.scheduler.is_due(&"x0c0s0b0".into(), Utc::now()));
        assert!(h.store.statuses().is_empty());
        assert_eq!(h.scheduler.metrics().runs(outcome::SUPERSEDED), 1);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(RunOutcome::Cancelled.label(), outcome::CANCELLED);
        assert_eq!(RunOutcome::Superseded.label(), outcome::SUPERSEDED);
        assert_eq!(
            RunOutcome::Committed {
                changes: ChangeSet::default()
            }
            .label(),
            outcome::COMMITTED
        );
    }

    #[tokio::test]
    async fn test_run_loop_cancels_departed_endpoint() {
        let topology = Arc::new(StaticTopology::new(vec![descriptor("x0c0s0b0")]));
        let config = SchedulerConfig {
            cycle_interval: Duration::from_millis(100),
            ..Default::default()
        };
        let h = harness(config, Some(topology.clone()));
        let slow = healthy_endpoint().with_response(
            "/redfish/v1/Systems/1/EthernetInterfaces/1",
            SimulatedResponse::json(&json!({"Id": "1", "MACAddress": "AA:BB:CC:00:00:01"}))
                .delayed(Duration::from_millis(1500)),
        );
        h.fleet.insert("x0c0s0b0", slow);
        let scheduler = Arc::clone(&h.scheduler);

        let looping = tokio::spawn(Arc::clone(&scheduler).run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(scheduler.is_running(&"x0c0s0b0".into()));

        assert!(topology.remove("x0c0s0b0"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!scheduler.is_running(&"x0c0s0b0".into()));
        assert!(h.store.upserts().is_empty());
        assert_eq!(scheduler.metrics().runs(outcome::CANCELLED), 1);

        scheduler.shutdown();
        looping.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_loop_does_not_wait_on_slow_endpoint() {
        let topology = Arc::new(StaticTopology::new(vec![descriptor("x0c0s0b0")]));
        let config = SchedulerConfig {
            cycle_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let h = harness(config, Some(topology.clone()));
        let slow = healthy_endpoint().with_response(
            "/redfish/v1/Systems",
            SimulatedResponse::json(&json!({"Members": [{"@odata.id": "/redfish/v1/Systems/1"}]}))
                .delayed(Duration::from_secs(5)),
        );
        h.fleet.insert("x0c0s0b0", slow);
        h.fleet.insert("x0c0s1b0", healthy_endpoint());
        let scheduler = Arc::clone(&h.scheduler);

        let looping = tokio::spawn(Arc::clone(&scheduler).run());
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Added while the first endpoint's run is still in flight.
        topology.replace(vec![descriptor("x0c0s0b0"), descriptor("x0c0s1b0")]);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let state = scheduler.run_state(&"x0c0s1b0".into()).unwrap();
        assert!(state.last_committed);
        assert!(scheduler.is_running(&"x0c0s0b0".into()));

        scheduler.shutdown();
        looping.await.unwrap().unwrap();
        assert!(!scheduler.is_running(&"x0c0s0b0".into()));
        assert_eq!(h.store.upserts().len(), 1);
    }

    #[tokio::test]
    async fn test_cycle_discovers_due_endpoints_only() {
        let topology = StaticTopology::new(vec![descriptor("x0c0s0b0"), descriptor("x0c0s1b0")]);
        let h = harness(SchedulerConfig::default(), Some(Arc::new(topology)));
        h.fleet.insert("x0c0s0b0", healthy_endpoint());
        h.fleet.insert("x0c0s1b0", SimulatedEndpoint::unreachable());

        let first = h.scheduler.run_cycle().await.unwrap();
        assert_eq!(first.listed, 2);
        assert_eq!(first.reports.len(), 2);
        assert_eq!(first.committed(), 1);

        // Neither interval has elapsed yet.
        let second = h.scheduler.run_cycle().await.unwrap();
        assert!(second.reports.is_empty());
    }

    #[tokio::test]
    async fn test_is_due_intervals() {
        let config = SchedulerConfig {
            rediscover_interval: Duration::from_secs(3600),
            retry_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let h = harness(config, None);
        let ep = EndpointId::new("x0c0s0b0");
        let now = Utc::now();
        assert!(h.scheduler.is_due(&ep, now));

        h.scheduler.remember(&ep, DiscoveryStatus::FetchFailed, outcome::ABORTED);
        assert!(!h.scheduler.is_due(&ep, now));
        assert!(h.scheduler.is_due(&ep, now + chrono::Duration::seconds(61)));

        h.scheduler.remember(&ep, DiscoveryStatus::Verified, outcome::COMMITTED);
        assert!(!h.scheduler.is_due(&ep, now + chrono::Duration::seconds(61)));
        assert!(h.scheduler.is_due(&ep, now + chrono::Duration::seconds(3601)));
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected() {
        let result = DiscoveryScheduler::builder(
            DiscoveryEngine::new(DiscoveryConfig::default()),
            Arc::new(SimulatedFleet::new()),
            Arc::new(RecordingInventoryStore::new()),
        )
        .config(SchedulerConfig {
            max_concurrent_runs: 0,
            ..Default::default()
        })
        .build();
        assert_matches!(result, Err(Error::Config(_)));
    }
}
