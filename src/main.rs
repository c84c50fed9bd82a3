//! lamrelay - session and turn orchestration between game clients and an
//! LLM inference backend
//!
//! The relay:
//! - Keeps per-session dialog history with bounded trimming
//! - Queues turns and processes them on a worker pool, one turn per session
//! - Talks to the backend over direct HTTP or a pub/sub broker link
//! - Serves a thin HTTP/WebSocket API for clients

mod application;
mod domain;
mod infrastructure;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::infrastructure::config::AppConfig;
use crate::infrastructure::http;
use crate::infrastructure::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lamrelay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting lamrelay");

    // Load configuration
    let config = AppConfig::load()?;
    tracing::info!("Configuration loaded");
    tracing::info!("  Transport: {:?}", config.transport.mode);
    tracing::info!(
        "  Queue: {} slots, {} workers",
        config.queue.capacity,
        config.queue.workers
    );
    tracing::info!(
        "  Sessions: {} max, {}s idle timeout",
        config.session.max_sessions,
        config.session.idle_timeout_secs
    );

    // Initialize application state
    let state = Arc::new(AppState::new(config));
    tracing::info!("Application state initialized");

    // Start the queue workers
    let worker_handles = state.spawn_workers();

    // Upkeep worker (evicts idle sessions, purges dead queue entries)
    let upkeep_worker = {
        let relay = state.relay.clone();
        let sweep_interval = state.config.session.sweep_interval();
        let idle_timeout = state.config.session.idle_timeout();
        tokio::spawn(async move {
            tracing::info!("Starting session upkeep worker");
            relay.run_upkeep(sweep_interval, idle_timeout).await;
        })
    };

    // Stats worker (periodic load snapshot; link state in broker mode)
    let stats_worker = {
        let relay = state.relay.clone();
        let supervisor = state.link_supervisor.clone();
        let pending = state.broker_pending.clone();
        let interval = state.config.session.sweep_interval();
        let worker_count = state.config.queue.workers;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let sessions = relay.session_count().await;
                let depth = relay.queue_depth().await;
                match (&supervisor, &pending) {
                    (Some(supervisor), Some(pending)) => tracing::info!(
                        "Stats: {} sessions, queue depth {}, {} workers, broker link {:?}, {} pending replies",
                        sessions,
                        depth,
                        worker_count,
                        supervisor.state(),
                        pending.len().await
                    ),
                    _ => tracing::info!(
                        "Stats: {} sessions, queue depth {}, {} workers",
                        sessions,
                        depth,
                        worker_count
                    ),
                }
            }
        })
    };

    tracing::info!("Background workers started");

    // Build the router
    let app = Router::new()
        .route(
            "/ws/{namespace}/{session_id}",
            get(infrastructure::websocket::ws_handler),
        )
        // Merge REST API routes
        .merge(http::create_routes())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    // Start the server
    let addr: SocketAddr =
        format!("{}:{}", state.config.server.host, state.config.server.port).parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Run server with graceful shutdown
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping workers...");
            for handle in &worker_handles {
                handle.abort();
            }
            upkeep_worker.abort();
            stats_worker.abort();
            tracing::info!("Workers stopped");
        }
    }

    Ok(())
}
