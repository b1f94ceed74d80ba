//! Hardware State Manager
//!
//! Periodically discovers every Redfish endpoint listed by the topology
//! service and reconciles the results into the inventory store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Hardware State Manager                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Topology   │───▶│  Scheduler   │───▶│  Inventory   │       │
//! │  │  (SLS/YAML)  │    │  + Drivers   │    │    Store     │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hsm::adapters::{
    HbtdClient, LoggingEventPublisher, MemoryInventoryStore, PublishingStore, SlsTopology,
    SqliteInventoryStore, SqliteStoreConfig, StaticTopology, DEFAULT_SLS_URL,
};
use hsm::discovery::{DiscoveryConfig, DiscoveryEngine, DEFAULT_ONBOARD_SIGNATURES};
use hsm::domain::ports::{EventPublisher, HeartbeatProvider, InventoryStore, TopologyProvider};
use hsm::error::{Error, Result};
use hsm::metrics::DiscoveryMetrics;
use hsm::redfish::{Credentials, FetchConfig, RedfishClient, TrustPolicy};
use hsm::scheduler::{DiscoveryScheduler, SchedulerConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreBackend {
    Memory,
    Sqlite,
}

/// Hardware State Manager - Redfish discovery and inventory reconciliation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// System layout service URL
    #[arg(long, env = "HSM_SLS_URL", conflicts_with = "endpoints_file")]
    sls_url: Option<String>,

    /// YAML file listing endpoints, used instead of the layout service
    #[arg(long, env = "HSM_ENDPOINTS_FILE")]
    endpoints_file: Option<PathBuf>,

    /// Username for endpoints listed by the layout service
    #[arg(long, env = "HSM_BMC_USERNAME", default_value = "root")]
    bmc_username: String,

    /// Password for endpoints listed by the layout service
    #[arg(long, env = "HSM_BMC_PASSWORD", default_value = "", hide_env_values = true)]
    bmc_password: String,

    /// Inventory store backend
    #[arg(long, env = "HSM_STORE", value_enum, default_value = "memory")]
    store: StoreBackend,

    /// SQLite database path
    #[arg(long, env = "HSM_SQLITE_PATH", default_value = "/var/lib/hsm/inventory.db")]
    sqlite_path: PathBuf,

    /// Maximum concurrent discovery runs
    #[arg(long, env = "HSM_MAX_CONCURRENT_RUNS", default_value = "20")]
    max_concurrent_runs: usize,

    /// Per-fetch timeout in seconds
    #[arg(long, env = "HSM_FETCH_TIMEOUT_SECONDS", default_value = "30")]
    fetch_timeout_seconds: u64,

    /// Per-run timeout in seconds
    #[arg(long, env = "HSM_RUN_TIMEOUT_SECONDS", default_value = "600")]
    run_timeout_seconds: u64,

    /// Seconds before a successfully discovered endpoint is discovered again
    #[arg(long, env = "HSM_REDISCOVER_INTERVAL_SECONDS", default_value = "3600")]
    rediscover_interval_seconds: u64,

    /// Seconds before a failed endpoint is retried
    #[arg(long, env = "HSM_RETRY_INTERVAL_SECONDS", default_value = "300")]
    retry_interval_seconds: u64,

    /// Seconds between scheduling cycles
    #[arg(long, env = "HSM_CYCLE_INTERVAL_SECONDS", default_value = "60")]
    cycle_interval_seconds: u64,

    /// Accept any endpoint certificate (the default unless --ca-bundle is given)
    #[arg(long, env = "HSM_INSECURE_ENDPOINTS", conflicts_with = "ca_bundle")]
    insecure_endpoints: bool,

    /// PEM bundle endpoint certificates must chain to
    #[arg(long, env = "HSM_CA_BUNDLE")]
    ca_bundle: Option<PathBuf>,

    /// Firmware name marking the onboard NIC (repeatable)
    #[arg(long = "onboard-signature", env = "HSM_ONBOARD_SIGNATURES", value_delimiter = ',')]
    onboard_signatures: Vec<String>,

    /// ComputerSystem path to use instead of walking the Systems collection
    #[arg(long, env = "HSM_SYSTEM_PATH")]
    system_path: Option<String>,

    /// Heartbeat tracker URL; queried at startup when set
    #[arg(long, env = "HSM_HBTD_URL")]
    hbtd_url: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HSM_HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "HSM_METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "HSM_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "HSM_LOG_JSON")]
    log_json: bool,

    /// Run a single discovery cycle and exit
    #[arg(long)]
    once: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Hardware State Manager");
    info!("  Store backend: {:?}", args.store);
    info!("  Max concurrent runs: {}", args.max_concurrent_runs);
    info!("  Fetch timeout: {}s", args.fetch_timeout_seconds);

    let publisher: Arc<dyn EventPublisher> = Arc::new(LoggingEventPublisher::info_level());

    let store: Arc<dyn InventoryStore> = match args.store {
        StoreBackend::Memory => Arc::new(PublishingStore::new(
            MemoryInventoryStore::new(),
            publisher.clone(),
        )),
        StoreBackend::Sqlite => Arc::new(PublishingStore::new(
            SqliteInventoryStore::open(&SqliteStoreConfig::new(args.sqlite_path.clone()))?,
            publisher.clone(),
        )),
    };

    let topology: Arc<dyn TopologyProvider> = match &args.endpoints_file {
        Some(path) => {
            info!("  Endpoints file: {}", path.display());
            Arc::new(StaticTopology::from_file(path)?)
        }
        None => {
            let url = args.sls_url.as_deref().unwrap_or(DEFAULT_SLS_URL);
            info!("  Layout service: {}", url);
            Arc::new(SlsTopology::new(
                url,
                Credentials::new(args.bmc_username.clone(), args.bmc_password.clone()),
            )?)
        }
    };

    let trust = match (&args.ca_bundle, args.insecure_endpoints) {
        (Some(bundle), false) => TrustPolicy::CaBundle(bundle.clone()),
        _ => TrustPolicy::AcceptInvalid,
    };
    let fetch_timeout = Duration::from_secs(args.fetch_timeout_seconds);
    let client = RedfishClient::new(FetchConfig {
        timeout: fetch_timeout,
        trust,
        ..Default::default()
    })?;

    let onboard_signatures = if args.onboard_signatures.is_empty() {
        DEFAULT_ONBOARD_SIGNATURES.iter().map(|s| s.to_string()).collect()
    } else {
        args.onboard_signatures.clone()
    };
    let engine = DiscoveryEngine::new(DiscoveryConfig {
        fetch_timeout,
        onboard_signatures,
        system_path: args.system_path.clone(),
    });

    let metrics = DiscoveryMetrics::new()?;
    let scheduler = DiscoveryScheduler::builder(engine, Arc::new(client), store.clone())
        .config(SchedulerConfig {
            max_concurrent_runs: args.max_concurrent_runs,
            run_timeout: Duration::from_secs(args.run_timeout_seconds),
            rediscover_interval: Duration::from_secs(args.rediscover_interval_seconds),
            retry_interval: Duration::from_secs(args.retry_interval_seconds),
            cycle_interval: Duration::from_secs(args.cycle_interval_seconds),
        })
        .topology(topology.clone())
        .publisher(publisher)
        .metrics(metrics.clone())
        .build()?;

    if let Some(url) = &args.hbtd_url {
        check_heartbeats(url, topology.as_ref()).await;
    }

    if args.once {
        let report = scheduler.run_cycle().await?;
        info!(
            listed = report.listed,
            runs = report.reports.len(),
            committed = report.committed(),
            "Single discovery cycle complete"
        );
        return Ok(());
    }

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_topology = topology.clone();
    let health_store = store.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_topology, health_store).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    let shutdown = scheduler.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.shutdown();
        }
    });

    info!("Starting discovery scheduler");
    scheduler.run().await?;

    info!("Hardware State Manager shutdown complete");
    Ok(())
}

/// Log heartbeat status for the listed endpoints; failures are not fatal.
async fn check_heartbeats(url: &str, topology: &dyn TopologyProvider) {
    let hbtd = match HbtdClient::new(url) {
        Ok(client) => client,
        Err(e) => {
            warn!("Heartbeat client unavailable: {}", e);
            return;
        }
    };
    let ids: Vec<String> = match topology.list_endpoints().await {
        Ok(endpoints) => endpoints.into_iter().map(|e| e.id.to_string()).collect(),
        Err(e) => {
            warn!("Cannot list endpoints for heartbeat check: {}", e);
            return;
        }
    };
    if ids.is_empty() {
        return;
    }
    match hbtd.get_heartbeat_status(&ids).await {
        Ok(states) => {
            let beating = states.iter().filter(|s| s.heartbeating).count();
            info!(queried = ids.len(), reported = states.len(), beating, "Heartbeat tracker reachable");
        }
        Err(e) => warn!("Heartbeat check failed - continuing anyway: {}", e),
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "rusqlite=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// HTTP Servers
// =============================================================================

type HttpResponse = hyper::Response<http_body_util::Full<hyper::body::Bytes>>;

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::body::Bytes>) -> HttpResponse {
    let mut response = hyper::Response::new(http_body_util::Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn bind(addr: &str, name: &str) -> Result<tokio::net::TcpListener> {
    let addr: std::net::SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid {} server address: {}", name, e)))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {} server: {}", name, e)))?;

    info!("{} server listening on {}", name, addr);
    Ok(listener)
}

async fn run_health_server(
    addr: &str,
    topology: Arc<dyn TopologyProvider>,
    store: Arc<dyn InventoryStore>,
) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, StatusCode};
    use hyper_util::rt::TokioIo;

    let listener = bind(addr, "Health").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Health server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let topology = topology.clone();
        let store = store.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let topology = topology.clone();
                let store = store.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" => {
                            let topology_ready = topology.is_ready().await.unwrap_or(false);
                            let store_ready = store.health_check().await.unwrap_or(false);
                            if topology_ready && store_ready {
                                text_response(StatusCode::OK, "ok")
                            } else {
                                text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready")
                            }
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

async fn run_metrics_server(addr: &str, metrics: DiscoveryMetrics) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, StatusCode};
    use hyper_util::rt::TokioIo;

    let listener = bind(addr, "Metrics").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok(text) => {
                                let mut response = text_response(StatusCode::OK, text);
                                response.headers_mut().insert(
                                    hyper::header::CONTENT_TYPE,
                                    hyper::header::HeaderValue::from_static(
                                        "text/plain; version=0.0.4",
                                    ),
                                );
                                response
                            }
                            Err(e) => {
                                text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                            }
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
