//! APM Monitoring Sidecar
//!
//! Runs the monitoring port against the Prometheus-backed agent, serves the
//! registry over HTTP and reports a heartbeat transaction on an interval.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      APM Monitoring Sidecar                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  Heartbeat   │───▶│  Monitoring  │───▶│  Prometheus  │       │
//! │  │    Loop      │    │    Adapter   │    │   Registry   │       │
//! │  └──────────────┘    └──────────────┘    └──────┬───────┘       │
//! │                                                  │ /metrics     │
//! └──────────────────────────────────────────────────┴──────────────┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use prometheus::Registry;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use apm_port::domain::Monitoring;
use apm_port::error::{Error, Result};
use apm_port::{
    Capitalized, MonitoringAdapter, MonitoringConfig, PrometheusAgentLoader, SegmentName,
    TracingLogger,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// APM monitoring sidecar - exposes monitored heartbeats as Prometheus metrics
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Deployment environment tagged on the agent
    #[arg(long, env = "APM_ENVIRONMENT", default_value = "development")]
    environment: String,

    /// APM license key; monitoring stays disabled without one
    #[arg(long, env = "APM_LICENSE_KEY", hide_env_values = true)]
    license_key: Option<String>,

    /// Use the no-op adapter regardless of the license key
    #[arg(long, env = "APM_DISABLED")]
    disable_monitoring: bool,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9464")]
    metrics_addr: String,

    /// Seconds between heartbeat transactions
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECONDS", default_value = "15")]
    heartbeat_interval_seconds: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting APM monitoring sidecar");
    info!("  Environment: {}", args.environment);
    info!("  License key configured: {}", args.license_key.is_some());
    info!("  Monitoring disabled by flag: {}", args.disable_monitoring);
    info!(
        "  Heartbeat interval: {} seconds",
        args.heartbeat_interval_seconds
    );

    let registry = Registry::new();
    let mut config = MonitoringConfig::new(args.environment.clone())
        .with_logger(Arc::new(TracingLogger::new()));
    if let Some(license_key) = args.license_key.clone() {
        config = config.with_license_key(license_key);
    }

    let monitoring = MonitoringAdapter::from_config(
        config,
        PrometheusAgentLoader::new(registry.clone()),
        !args.disable_monitoring,
    );
    monitoring.initialize().await;
    info!("Monitoring state: {}", monitoring.state());

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let server_registry = registry.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, server_registry).await {
            error!("Metrics server error: {}", e);
        }
    });

    let names = HeartbeatNames::new()?;
    let mut ticker =
        tokio::time::interval(Duration::from_secs(args.heartbeat_interval_seconds.max(1)));

    loop {
        tokio::select! {
            _ = ticker.tick() => heartbeat(&monitoring, &names).await,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Sidecar shutdown complete");
    Ok(())
}

// =============================================================================
// Heartbeat
// =============================================================================

struct HeartbeatNames {
    domain: Capitalized,
    transaction: Capitalized,
    latency: Capitalized,
    segment: SegmentName,
}

impl HeartbeatNames {
    fn new() -> Result<Self> {
        Ok(Self {
            domain: Capitalized::new("Sidecar")?,
            transaction: Capitalized::new("Heartbeat")?,
            latency: Capitalized::new("HeartbeatLatency")?,
            segment: SegmentName::from_parts("Sidecar", "Heartbeat", "Tick")?,
        })
    }
}

async fn heartbeat<M: Monitoring>(monitoring: &M, names: &HeartbeatNames) {
    let started = Instant::now();

    monitoring
        .monitor_transaction(&names.domain, &names.transaction, || async {
            monitoring
                .monitor_segment(&names.segment, || async {
                    tokio::task::yield_now().await;
                })
                .await;
        })
        .await;

    monitoring.increment(&names.domain, &names.transaction);
    monitoring.record_measurement(
        &names.domain,
        &names.latency,
        started.elapsed().as_secs_f64() * 1000.0,
    );
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let directive = |value: &str| {
        value
            .parse::<tracing_subscriber::filter::Directive>()
            .map_err(|e| Error::Config(format!("Invalid log directive '{}': {}", value, e)))
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(directive("hyper=warn")?);

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

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, registry: Registry) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
        registry: Registry,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                let encoder = TextEncoder::new();
                let mut buffer = Vec::new();
                match encoder.encode(&registry.gather(), &mut buffer) {
                    Ok(()) => {
                        let mut response = respond(StatusCode::OK, buffer);
                        response.headers_mut().insert(
                            CONTENT_TYPE,
                            HeaderValue::from_static(prometheus::TEXT_FORMAT),
                        );
                        response
                    }
                    Err(e) => {
                        error!("Failed to encode metrics: {}", e);
                        respond(StatusCode::INTERNAL_SERVER_ERROR, "encoding error")
                    }
                }
            }
            "/healthz" => respond(StatusCode::OK, "ok"),
            _ => respond(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr).await?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;

        let io = TokioIo::new(stream);
        let registry = registry.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| metrics_handler(req, registry.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
