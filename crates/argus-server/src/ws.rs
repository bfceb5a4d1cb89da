//! Live statistics over WebSocket.
//!
//! Each connection gets a snapshot immediately, one after every committed
//! transaction, and a heartbeat snapshot every [`HEARTBEAT_INTERVAL`] when
//! traffic is idle.

use std::time::Duration;

use argus_core::StatsUpdate;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::models::StatsEvent;
use crate::state::AppState;

/// Maximum gap between two pushes on an open connection.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// GET /ws - Upgrades to a stats stream.
pub async fn stats_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_stats(socket, state))
}

async fn stream_stats(mut socket: WebSocket, state: AppState) {
    let mut updates = state.recorder.subscribe();
    // The first tick completes immediately and provides the on-connect snapshot.
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    debug!("Stats subscriber connected");

    loop {
        let update = tokio::select! {
            _ = heartbeat.tick() => match current_snapshot(&state).await {
                Some(update) => update,
                None => continue,
            },
            received = updates.recv() => match received {
                Ok(update) => {
                    heartbeat.reset();
                    update
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Stats subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!("Stats subscriber error: {}", e);
                    break;
                }
            },
        };

        let frame = match encode_update(&update) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode stats update: {}", e);
                continue;
            }
        };
        if socket.send(Message::Text(frame.into())).await.is_err() {
            break;
        }
    }

    debug!("Stats subscriber disconnected");
}

async fn current_snapshot(state: &AppState) -> Option<StatsUpdate> {
    let recorder = state.recorder.clone();
    match tokio::task::spawn_blocking(move || recorder.snapshot()).await {
        Ok(Ok(update)) => Some(update),
        Ok(Err(e)) => {
            warn!("Failed to build stats snapshot: {}", e);
            None
        }
        Err(e) => {
            warn!("Snapshot task failed: {}", e);
            None
        }
    }
}

/// Serializes a `stats_update` frame.
pub fn encode_update(update: &StatsUpdate) -> serde_json::Result<String> {
    serde_json::to_string(&StatsEvent::stats_update(update))
}
