//! uvd-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads the layered
//! configuration, boots the pipeline, wires middleware and serves HTTP
//! until ctrl-c. Route handlers live in `routes.rs`, shared state types in
//! `state.rs`, pipeline assembly in `pipeline.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use uvd_daemon::{pipeline::Pipeline, routes, state};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file
    // does not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config = load_config()?;
    let shared = Arc::new(state::AppState::new(config.config_hash.clone()));
    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));

    let pipeline = Pipeline::boot(&config.settings).await?;
    {
        let mut status = shared.status.write().await;
        status.fleet_size = pipeline.fleet.len();
    }

    // Keep the status snapshot fresh on the SSE bus.
    spawn_status_publisher(
        Arc::clone(&shared),
        Arc::clone(&pipeline.dispatcher),
        Arc::clone(&pipeline.observer),
    );

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8877)));
    info!("uvd-daemon listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    pipeline.shutdown().await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// `UVD_CONFIG` is a comma-separated list of YAML files, merged in order.
/// No files means defaults only.
fn load_config() -> anyhow::Result<uvd_config::LoadedConfig> {
    match std::env::var("UVD_CONFIG") {
        Ok(paths) => {
            let files: Vec<&str> = paths.split(',').filter(|p| !p.is_empty()).collect();
            Ok(uvd_config::load_layered_yaml(&files)?)
        }
        Err(_) => Ok(uvd_config::from_value(serde_json::json!({}))?),
    }
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("UVD_DAEMON_ADDR").ok()?.parse().ok()
}

fn spawn_status_publisher(
    shared: Arc<state::AppState>,
    dispatcher: Arc<uvd_dispatch::OrderDispatcher>,
    observer: Arc<uvd_deadletter::DeadLetterObserver>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let snapshot = {
                let mut status = shared.status.write().await;
                status.daemon_uptime_secs = state::uptime_secs();
                status.orders_published = dispatcher.published_total();
                status.dead_letters_stored = observer.stored();
                status.clone()
            };
            let _ = shared.bus.send(state::BusMsg::Status(snapshot));
        }
    });
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET])
        .allow_headers(tower_http::cors::Any)
}
