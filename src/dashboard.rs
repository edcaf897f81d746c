//! Read-only HTTP view of the published snapshot.
//!
//! `GET /api/state` returns the current snapshot plus staleness flags, `GET /api/config`
//! the effective configuration. `GET /stream` is a server-sent event feed with one
//! `update` event per position change. Rendering is left to whatever consumes it.

use crate::config::SystemConfig;
use crate::snapshot::{Snapshot, SnapshotStore};
use anyhow::Result;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use futures::{Stream, StreamExt};
use log::{debug, info};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::WatchStream;

#[derive(Clone)]
pub struct DashboardState {
    pub store: Arc<SnapshotStore>,
    pub config: Arc<SystemConfig>,
    pub poll_interval: Duration,
    /// Cleared on shutdown. Open streams end when it is.
    pub running: Arc<AtomicBool>,
}

#[derive(Serialize)]
struct StateResponse {
    #[serde(flatten)]
    snapshot: Snapshot,
    /// No successful cycle within the last two poll intervals.
    stale: bool,
    gps_stale: bool,
    source_url: String,
}

async fn state_handler(State(state): State<DashboardState>) -> Json<StateResponse> {
    let snapshot = state.store.read();
    let stale = snapshot.is_stale(Utc::now(), state.poll_interval * 2);
    let gps_stale = snapshot.is_gps_stale(state.poll_interval);
    Json(StateResponse {
        snapshot,
        stale,
        gps_stale,
        source_url: state.config.source.target_url.clone(),
    })
}

async fn config_handler(State(state): State<DashboardState>) -> Json<SystemConfig> {
    Json(state.config.as_ref().clone())
}

/// Current position first (when there is one), then one event per change.
async fn stream_handler(
    State(state): State<DashboardState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    debug!("[Dashboard] Stream client connected");
    let updates = WatchStream::new(state.store.subscribe())
        .filter_map(std::future::ready)
        .map(|update| Event::default().event("update").json_data(update))
        .take_until(stopped(state.running.clone()));
    Sse::new(updates).keep_alive(KeepAlive::default())
}

async fn stopped(running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/api/state", get(state_handler))
        .route("/api/config", get(config_handler))
        .route("/stream", get(stream_handler))
        .with_state(state)
}

/// Serve until `state.running` is cleared.
pub async fn serve(listener: tokio::net::TcpListener, state: DashboardState) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("[Dashboard] Serving snapshot at http://{}/api/state", addr);
    let running = state.running.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(stopped(running))
        .await?;
    info!("[Dashboard] Shutting down");
    Ok(())
}
