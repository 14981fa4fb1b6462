use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::GatekeeperConfig;
use gatekeeper::gateway::{self, GatewayServer, GatewayState, KeyResolver};
use gatekeeper::ratelimit::BucketRegistry;

/// Token bucket admission control in front of an HTTP application.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "GATEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Override the admin listen address
    #[arg(long)]
    admin_addr: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Gatekeeper admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GatekeeperConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(addr) = args.admin_addr {
        config.server.admin_addr = addr;
    }
    let routes = match config.validate() {
        Ok(routes) => Arc::new(routes),
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };
    info!(
        http_addr = %config.server.http_addr,
        admin_addr = %config.server.admin_addr,
        rules = routes.len(),
        "Configuration loaded"
    );

    warn!("Rate limit state is local to this process; each gateway instance enforces its own budgets");

    let rl = &config.rate_limiting;
    let registry = Arc::new(BucketRegistry::new().with_sample_size(rl.stats_sample_size));
    let maintenance = registry.start_maintenance(rl.maintenance_schedule());

    let state = GatewayState::new(
        Arc::clone(&registry),
        routes,
        KeyResolver::new(rl.trust_forwarded_headers),
    );
    let app = gateway::router(state, upstream());

    let admin = gateway::admin_router(registry);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    tokio::try_join!(
        GatewayServer::new(config.server.http_addr, app)
            .serve_with_shutdown(stopped(stop_rx.clone())),
        GatewayServer::new(config.server.admin_addr, admin).serve_with_shutdown(stopped(stop_rx)),
    )?;

    maintenance.shutdown().await;

    info!("Gatekeeper stopped");
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

/// Application routes served behind the rate limiter.
fn upstream() -> Router {
    Router::new().route(
        "/actuator/health",
        get(|| async { Json(serde_json::json!({ "status": "UP" })) }),
    )
}

/// Resolves once the shutdown flag is raised.
async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|raised| *raised).await;
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
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
