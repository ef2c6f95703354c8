use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use carib_ratelimit::config::CaribConfig;
use carib_ratelimit::api::{HttpServer, ServiceState};
use carib_ratelimit::ratelimit::{EndpointLimits, RateLimiter, Sweeper, SystemClock};

/// Fixed-window rate limiting service for the Carib backend.
#[derive(Parser, Debug)]
#[command(name = "carib-ratelimit", version)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    let instance_id = uuid::Uuid::new_v4();
    info!("Starting Carib Rate Limiting Service");
    info!(instance_id = %instance_id, "Version: {}", env!("CARGO_PKG_VERSION"));

    let config = CaribConfig::load(args.config.as_deref())?;
    info!(
        http_addr = %config.server.http_addr,
        store = ?config.store.backend,
        endpoints = config.limits.endpoints.len(),
        "Configuration loaded"
    );

    // Initialize the store and rate limiter
    let clock = Arc::new(SystemClock);
    let store = config.store.build(clock.clone());
    let rate_limiter = RateLimiter::with_clock(store.clone(), clock);
    info!("Rate limiter initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = config
        .sweep
        .enabled
        .then(|| Sweeper::spawn(store, config.sweep.clone(), shutdown_rx));

    let state = ServiceState::new(rate_limiter, config.limits.clone())
        .with_identifier(config.server.client_ip()?);

    if let (Some(path), Some(secs)) = (config.limits_path.clone(), config.limits_reload_interval_secs) {
        spawn_limits_reload(state.clone(), path, Duration::from_secs(secs.max(1)), shutdown_tx.subscribe());
    }

    let server = HttpServer::new(config.server.http_addr, state);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    let _ = shutdown_tx.send(true);
    if let Some(sweeper) = sweeper {
        sweeper.join().await;
    }

    info!("Carib Rate Limiting Service stopped");
    Ok(())
}

/// Periodically re-read the endpoint limits file. A file that fails to load
/// or validate leaves the current limits in place.
fn spawn_limits_reload(
    state: ServiceState,
    path: String,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick fires immediately and the limits were just loaded.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match EndpointLimits::from_file(&path) {
                        Ok(limits) => {
                            if limits != state.limits() {
                                let endpoints = limits.endpoints.len();
                                match state.set_limits(limits) {
                                    Ok(()) => info!(path = %path, endpoints = endpoints, "Endpoint limits reloaded"),
                                    Err(e) => warn!(path = %path, error = %e, "Rejected reloaded endpoint limits"),
                                }
                            }
                        }
                        Err(e) => warn!(path = %path, error = %e, "Failed to reload endpoint limits"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    });
}

/// Resolve on Ctrl+C or SIGTERM. A handler that cannot be installed is
/// logged and never fires, leaving the other one in charge.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
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
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let received = tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    };
    info!(signal = received, "Shutdown requested, draining connections");
}
