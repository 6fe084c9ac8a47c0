mod accumulator;
mod cli;
mod config;
mod connection;
mod dispatcher;
mod handler;
mod handlers;
mod observer;
mod patch;
mod storage;
mod streaming;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::cli::Cli;
use crate::config::Config;
use crate::connection::ConnectionRegistry;
use crate::handler::SnapshotWaiters;
use crate::handlers::{
    get_snapshot, get_turn, health_check, inject_input, list_agents, send_chat,
};
use crate::observer::ObserverHub;
use crate::storage::RedisTurnStore;
use crate::websocket::{agent_ws_handler, observer_ws_handler, AppState};

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(redis_url) = cli.redis_url {
        config.redis_url = redis_url;
    }

    info!("Starting switchboard relay on port {}", config.port);
    info!("Redis URL: {}", config.redis_url);
    info!(
        "Turn TTL: {}s, flush every {}ms, publish every {}ms",
        config.turn_ttl_seconds, config.flush_interval_ms, config.publish_interval_ms
    );

    let store = match RedisTurnStore::new(&config.redis_url, config.turn_ttl_seconds).await {
        Ok(store) => store,
        Err(err) => {
            error!("Failed to connect to Redis: {}", err);
            std::process::exit(1);
        }
    };

    let state = AppState {
        registry: ConnectionRegistry::new(),
        hub: ObserverHub::new(),
        store: Arc::new(store),
        snapshots: SnapshotWaiters::new(),
        flush_interval: Duration::from_millis(config.flush_interval_ms),
        publish_interval: Duration::from_millis(config.publish_interval_ms),
        flush_retry_backoff: Duration::from_millis(config.flush_retry_backoff_ms),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/agents", get(list_agents))
        .route("/agents/:agent_name/chat", post(send_chat))
        .route("/agents/:agent_name/input", post(inject_input))
        .route("/agents/:agent_name/snapshot", get(get_snapshot))
        .route("/turns/:turn_id", get(get_turn))
        .route("/ws/agent/:agent_name", get(agent_ws_handler))
        .route("/ws/observe/:turn_id", get(observer_ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed to bind {}: {}", addr, err);
            std::process::exit(1);
        }
    };

    info!("Switchboard listening on {}", addr);

    if let Err(err) = axum::serve(listener, app).await {
        error!("Server error: {}", err);
        std::process::exit(1);
    }
}
