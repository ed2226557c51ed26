use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crossflow_core::StatusUpdate;

use crate::server::AppState;

/// Client → server frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    /// Subscribe to one flow's updates.
    Subscribe {
        #[serde(rename = "flowId")]
        flow_id: Uuid,
    },
    /// Drop a subscription.
    Unsubscribe {
        #[serde(rename = "flowId")]
        flow_id: Uuid,
    },
}

/// Server → client frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ServerMessage {
    /// Greeting carrying the connection id.
    #[serde(rename = "connected")]
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: Uuid,
        message: String,
    },
    /// One status update for a subscribed flow.
    #[serde(rename = "status-update")]
    StatusUpdate { data: StatusUpdate },
}

/// WebSocket upgrade on the API port.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();
    state.metrics.ws_connections.inc();
    debug!(%connection_id, "websocket connected");

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let _ = out_tx.send(ServerMessage::Connected {
        connection_id,
        message: "subscribe with {\"type\":\"subscribe\",\"flowId\":\"...\"}".to_owned(),
    });

    // One writer task serializes all outbound frames.
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // flow id → forwarding task; unsubscribe aborts the forwarder.
    let mut subscriptions: HashMap<Uuid, JoinHandle<()>> = HashMap::new();

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Subscribe { flow_id }) => {
                    if subscriptions.contains_key(&flow_id) {
                        continue;
                    }
                    trace!(%connection_id, %flow_id, "subscribing");
                    let mut receiver = state.bus.subscribe(flow_id);
                    let forward_tx = out_tx.clone();
                    let forwarder = tokio::spawn(async move {
                        // Lagging subscribers miss events by design; they
                        // reconcile by re-reading flow status.
                        while let Ok(update) = receiver.recv().await {
                            if forward_tx
                                .send(ServerMessage::StatusUpdate { data: update })
                                .is_err()
                            {
                                break;
                            }
                        }
                    });
                    subscriptions.insert(flow_id, forwarder);
                }
                Ok(ClientMessage::Unsubscribe { flow_id }) => {
                    trace!(%connection_id, %flow_id, "unsubscribing");
                    if let Some(forwarder) = subscriptions.remove(&flow_id) {
                        forwarder.abort();
                    }
                }
                Err(err) => {
                    warn!(%connection_id, error = %err, "unparseable websocket frame");
                }
            },
            Message::Close(_) => break,
            // Axum answers pings automatically.
            _ => {}
        }
    }

    for (_, forwarder) in subscriptions {
        forwarder.abort();
    }
    drop(out_tx);
    let _ = writer.await;
    state.metrics.ws_connections.dec();
    debug!(%connection_id, "websocket closed");
}
