use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use switchboard::config;
use switchboard::hub::Hub;
use switchboard::index::ConnectionIndex;
use switchboard::rate_limit::{self, RateLimiter};
use switchboard::router::MessageRouter;
use switchboard::session_cache::SessionCache;
use switchboard::store::Store;
use switchboard::AppState;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Real-time classroom messaging server.
#[derive(Debug, Parser)]
#[command(name = "switchboard")]
struct Args {
    /// Path to a TOML config file; environment variables and defaults apply
    /// underneath it.
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Total budget for draining the hub and store after ingress stops.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let args = Args::parse();
    let config = match config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    info!(path = %config.database.path.display(), "opening store");
    let store = Arc::new(
        Store::open(&config.database)
            .await
            .expect("failed to open store"),
    );
    let cache = Arc::new(SessionCache::new(store.clone()));
    let active = cache.load().await.expect("failed to load active sessions");
    info!(active_sessions = active, "session cache primed");

    let index = Arc::new(ConnectionIndex::new());
    let limiter = Arc::new(RateLimiter::new());
    let (background_shutdown_tx, background_shutdown_rx) = watch::channel(false);
    let sweeper = rate_limit::spawn_sweeper(limiter.clone(), background_shutdown_rx);

    let router = MessageRouter::new(index.clone(), store.clone(), limiter.clone());
    let hub = Hub::spawn(router, index.clone(), store.clone());

    let state = AppState {
        store: store.clone(),
        cache,
        index,
        hub: hub.clone(),
    };
    let app = switchboard::build_router(state, &config.http);

    let bind_addr = config.http.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Ingress has stopped; drain the hub, then the store.
    let drain = async {
        hub.stop();
        hub.join().await;
        let _ = background_shutdown_tx.send(true);
        let _ = sweeper.await;
        store.close().await;
    };
    if tokio::time::timeout(SHUTDOWN_BUDGET, drain).await.is_err() {
        warn!("shutdown budget exceeded, exiting anyway");
    }
    info!("server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
