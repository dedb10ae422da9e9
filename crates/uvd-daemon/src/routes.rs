//! HTTP surface: health, status, SSE events.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::state::{uptime_secs, AppState, BusMsg};

pub fn build_router(shared: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status))
        .route("/v1/events", get(events))
        .with_state(shared)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "service": state.build.service,
        "version": state.build.version,
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut snapshot = state.status.read().await.clone();
    snapshot.daemon_uptime_secs = uptime_secs();
    Json(snapshot)
}

async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bus.subscribe();
    Sse::new(broadcast_to_sse(rx)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        let msg = msg.ok()?;
        let event = match &msg {
            BusMsg::Heartbeat { .. } => "heartbeat",
            BusMsg::Status(_) => "status",
        };
        let data = serde_json::to_string(&msg).ok()?;
        Some(Ok(Event::default().event(event).data(data)))
    })
}
