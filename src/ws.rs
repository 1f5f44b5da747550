//! WebSocket endpoint for dashboard clients.
//!
//! Clients join or leave per-instance monitoring rooms and receive every
//! complete reply broadcast for the instances they watch. One socket may
//! watch any number of instances; closing the socket releases all of its
//! subscriptions.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::ReplyEvent;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    JoinMonitoring {
        instance_id: String,
    },
    LeaveMonitoring {
        instance_id: String,
    },
    SendMessage {
        instance_ids: Vec<String>,
        message: String,
    },
    GetInstances,
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // Single writer task; the request loop and every reply forwarder feed it.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        while let Some(value) = out_rx.recv().await {
            if sink.send(Message::Text(value.to_string())).await.is_err() {
                break;
            }
        }
    });

    let _ = out_tx.send(json!({
        "type": "connected",
        "message": "websocket connected",
    }));
    info!("websocket client connected");

    // instance id → forwarder task pumping that room's broadcast into the
    // writer.
    let mut monitors: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::JoinMonitoring { instance_id }) => {
                if !monitors.contains_key(&instance_id) {
                    let receiver = state.bridge.subscribe(&instance_id);
                    let forwarder = spawn_reply_forwarder(receiver, out_tx.clone());
                    monitors.insert(instance_id.clone(), forwarder);
                    info!(instance = %instance_id, "client joined monitoring");
                }
                let _ = out_tx.send(json!({
                    "type": "monitoring_started",
                    "instance_id": instance_id,
                }));
            }
            Ok(ClientMessage::LeaveMonitoring { instance_id }) => {
                if let Some(forwarder) = monitors.remove(&instance_id) {
                    forwarder.abort();
                    state.bridge.unsubscribe(&instance_id);
                    info!(instance = %instance_id, "client left monitoring");
                }
                let _ = out_tx.send(json!({
                    "type": "monitoring_stopped",
                    "instance_id": instance_id,
                }));
            }
            Ok(ClientMessage::SendMessage {
                instance_ids,
                message,
            }) => {
                if instance_ids.is_empty() || message.is_empty() {
                    let _ = out_tx.send(json!({
                        "type": "error",
                        "message": "missing instance_ids or message",
                    }));
                    continue;
                }

                let mut sent = 0;
                let mut errors = Vec::new();
                for id in &instance_ids {
                    match state.manager.send(id, &message).await {
                        Ok(()) => sent += 1,
                        Err(e) => errors.push(format!("{id}: {e}")),
                    }
                }

                let result = if errors.is_empty() {
                    json!({
                        "type": "message_result",
                        "success": true,
                        "message": format!("sent to {sent} instance(s)"),
                    })
                } else {
                    json!({
                        "type": "message_result",
                        "success": false,
                        "message": format!("sent to {sent} instance(s), {} failed", errors.len()),
                        "errors": errors,
                    })
                };
                let _ = out_tx.send(result);
            }
            Ok(ClientMessage::GetInstances) => {
                let instances = state.manager.list().await;
                let _ = out_tx.send(json!({
                    "type": "instances_list",
                    "instances": instances,
                }));
            }
            Err(e) => {
                debug!(error = %e, "unparseable websocket message");
                let _ = out_tx.send(json!({
                    "type": "error",
                    "message": format!("invalid message: {e}"),
                }));
            }
        }
    }

    // Socket gone: release every room this client joined.
    for (instance_id, forwarder) in monitors {
        forwarder.abort();
        state.bridge.unsubscribe(&instance_id);
    }
    writer.abort();
    info!("websocket client disconnected");
}

fn spawn_reply_forwarder(
    mut receiver: tokio::sync::broadcast::Receiver<ReplyEvent>,
    out_tx: mpsc::UnboundedSender<Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let payload = json!({
                        "type": "instance_complete_response",
                        "instance_id": event.instance_id,
                        "content": event.content,
                        "raw_content": event.raw_content,
                        "timestamp": event.timestamp,
                        "is_markdown": event.is_markdown,
                    });
                    if out_tx.send(payload).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "reply forwarder lagged, client missed replies");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
