//! Live lead feed over WebSocket.
//!
//! Pushes each [`LeadEvent`] for the tenant as JSON. A `{"type":"resync"}`
//! frame is sent on connect and whenever the subscriber lagged, telling the
//! client to reload the leads table over REST.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{ApiError, AppState};
use crate::events::TenantSubscription;

const RESYNC: &str = r#"{"type":"resync"}"#;

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws/tenants/{tenant_id}/events", get(ws_handler))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.get_tenant(tenant_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("tenant not found: {tenant_id}")));
    }
    // Subscribe before the upgrade so nothing published in between is missed.
    let feed = state.bus.subscribe_tenant(tenant_id);
    info!(%tenant_id, "Lead feed client connecting");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, feed)))
}

async fn handle_socket(mut socket: WebSocket, mut feed: TenantSubscription) {
    let tenant_id = feed.tenant_id();

    if socket.send(Message::Text(RESYNC.into())).await.is_err() {
        warn!(%tenant_id, "Failed to send initial resync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = feed.recv() => {
                match result {
                    Ok(event) => {
                        let Ok(json) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            debug!(%tenant_id, "Client disconnected during send");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(%tenant_id, missed = n, "Lead feed client lagged behind");
                        if socket.send(Message::Text(RESYNC.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Event bus closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(%tenant_id, "Lead feed client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(%tenant_id, error = %e, "WebSocket error");
                        break;
                    }
                    // The feed is push-only.
                    _ => {}
                }
            }
        }
    }

    debug!(%tenant_id, "Lead feed connection closed");
}
