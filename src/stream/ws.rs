//! Downstream WebSocket endpoint.
//!
//! Bridges each connected socket onto the hub: outbound frames drain from
//! the client's hub queue, inbound frames parse as control messages.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::error::Result;

use super::hub::{ControlMessage, StreamHub};

pub fn router(hub: Arc<StreamHub>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(hub)
}

/// Bind and serve until the task is dropped.
pub async fn serve(hub: Arc<StreamHub>, bind_addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "stream endpoint listening");
    axum::serve(listener, router(hub)).await?;
    Ok(())
}

async fn health(State(hub): State<Arc<StreamHub>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "health": hub.health(),
        "clients": hub.client_count(),
        "dropped_events": hub.dropped_events(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<StreamHub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<StreamHub>) {
    let (client_id, mut queue) = hub.register_client();
    let (mut sink, mut source) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "outbound frame serialization failed");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ControlMessage>(&text) {
                            Ok(control) => hub.handle_control(client_id, control),
                            Err(err) => {
                                debug!(client_id = %client_id, error = %err, "bad control frame")
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(client_id = %client_id, error = %err, "client read error");
                        break;
                    }
                }
            }
            _ = &mut send_task => break,
        }
    }

    hub.unregister_client(client_id);
    send_task.abort();
}
