use std::borrow::Cow;
use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::registry::Outbound;
use crate::AppState;

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: AppState, remote_addr: SocketAddr) {
    let signaling = state.signaling;
    let (connection_id, mut rx) = signaling.connect(Some(remote_addr));
    let (mut sender, mut receiver) = socket.split();

    info!(connection_id = %connection_id, %remote_addr, "websocket connected");

    // Single writer per connection keeps relayed frames in send order.
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let message = match outbound {
                Outbound::Event(event) => match serde_json::to_string(&event) {
                    Ok(json) => Message::Text(json),
                    Err(err) => {
                        warn!(error = %err, "failed to encode server message");
                        continue;
                    }
                },
                Outbound::Relay(raw) => Message::Text(raw),
                Outbound::Close(reason) => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: Cow::Borrowed(reason),
                        })))
                        .await;
                    break;
                }
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
        debug!(connection_id = %connection_id, "writer task finished");
    });

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "websocket error");
                break;
            }
        };

        match frame {
            Message::Text(text) => signaling.handle_frame(connection_id, &text),
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => signaling.handle_frame(connection_id, text),
                Err(_) => debug!(
                    connection_id = %connection_id,
                    len = data.len(),
                    "ignoring non-UTF8 binary frame"
                ),
            },
            Message::Ping(_) | Message::Pong(_) => signaling.registry().touch(connection_id),
            Message::Close(frame) => {
                debug!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
        }
    }

    signaling.disconnect(connection_id);
    writer.abort();

    info!(connection_id = %connection_id, "websocket disconnected");
}
