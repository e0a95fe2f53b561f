use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::clock::{Clock, SystemClock};
use floodgate::config::{FloodgateConfig, StoreConfig};
use floodgate::grpc::GrpcServer;
use floodgate::monitor::{HttpProber, LogAlertSink, SiteMonitor};
use floodgate::ratelimit::AdaptiveLimiter;
use floodgate::store::{Backend, MemoryBackend};
use floodgate::telemetry::{TelemetryHub, DEFAULT_CAPACITY};

/// Adaptive rate limiting and upstream alerting service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Starting Floodgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = FloodgateConfig::load(args.config.as_deref())?;
    info!(grpc_addr = %config.server.grpc_addr, "Configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backend = open_backend(&config.store).await?;
    let telemetry = Arc::new(TelemetryHub::with_backend(backend.clone(), DEFAULT_CAPACITY));

    let limiter = AdaptiveLimiter::new(&config.rate_limiting, backend.clone(), clock.clone())?
        .with_telemetry(telemetry.clone());
    info!("Rate limiter initialized");

    let prober = HttpProber::new(config.monitoring.probe_timeout())?;
    let monitor = SiteMonitor::new(
        Arc::new(prober),
        Arc::new(LogAlertSink),
        clock.clone(),
        config.monitoring.probe_interval(),
    )
    .with_telemetry(telemetry);
    monitor.start(config.monitoring.targets.clone());

    let maintenance = tokio::spawn(run_maintenance(
        backend,
        clock,
        Duration::from_secs(config.server.maintenance_interval_secs.max(1)),
    ));

    let grpc_server = GrpcServer::new(config.server.grpc_addr, Arc::new(limiter));

    info!("Starting gRPC server on {}", config.server.grpc_addr);

    // Run the server with graceful shutdown on Ctrl+C
    let served = grpc_server.serve_with_shutdown(shutdown_signal()).await;

    monitor.stop().await;
    maintenance.abort();
    served?;

    info!("Floodgate stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(feature = "redis")]
async fn open_backend(config: &StoreConfig) -> anyhow::Result<Arc<dyn Backend>> {
    if let Some(url) = &config.redis_url {
        let backend = floodgate::store::RedisBackend::connect(url).await?;
        info!("Using Redis backend");
        return Ok(Arc::new(backend));
    }
    info!("Using in-memory backend");
    Ok(Arc::new(MemoryBackend::new()))
}

#[cfg(not(feature = "redis"))]
async fn open_backend(config: &StoreConfig) -> anyhow::Result<Arc<dyn Backend>> {
    if config.redis_url.is_some() {
        warn!("redis_url is set but Redis support is not compiled in, using in-memory backend");
    } else {
        info!("Using in-memory backend");
    }
    Ok(Arc::new(MemoryBackend::new()))
}

/// Periodically drop expired windows, buckets and attempt records.
async fn run_maintenance(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match backend.sweep(clock.now_ms()).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Swept expired store entries"),
            Err(e) => warn!(error = %e, "Store sweep failed"),
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
