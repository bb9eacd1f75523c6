use axum::{http::StatusCode, routing::get, Router};
use monitor::config::Config;
use monitor::feed::Feed;
use monitor::ingest::Monitor;
use monitor::poller::Poller;
use monitor::store::FileStore;
use monitor::{metrics, rest};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Trekker Monitor");
    info!("Feed: {:?} ({:?} every {:?})", config.feed, config.mode, config.poll_interval);
    info!("HTTP server: {}", config.http_addr);
    info!("Alert log directory: {}", config.store_dir.display());

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
        std::process::exit(1);
    }

    let store = match FileStore::new(&config.store_dir) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open alert log store: {}", e);
            std::process::exit(1);
        }
    };

    let feed = match Feed::from_location(&config.feed, config.fetch_timeout) {
        Ok(feed) => feed,
        Err(e) => {
            error!("Failed to set up feed: {}", e);
            std::process::exit(1);
        }
    };

    let monitor = Arc::new(RwLock::new(Monitor::from_config(&config, Box::new(store))));
    let poller = Poller::new(monitor, feed, config.mode);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller_handle = tokio::spawn(poller.clone().run(config.poll_interval, shutdown_rx));

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(poller));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = poller_handle.await {
        error!("Poller task failed: {}", e);
    }

    info!("Shutting down");
}

async fn metrics_handler() -> (StatusCode, String) {
    match metrics::gather_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
