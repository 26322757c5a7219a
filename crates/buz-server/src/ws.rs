//! WebSocket transport: turns an upgraded socket into a [`Connection`] and
//! drives its [`ConnectionSupervisor`].
//!
//! One reader loop per socket processes inbound frames strictly in order; a
//! separate writer task drains the connection's outbound queue so that fan-out
//! from other connections never waits on this socket.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::connection::{Connection, Outbound};
use crate::relay::Relay;
use crate::supervisor::ConnectionSupervisor;

/// How long the writer gets to flush the close frame after the reader ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// axum's own ceiling for one WebSocket message.
const DEFAULT_TRANSPORT_LIMIT: usize = 64 << 20;

/// Transport ceiling for one message. Kept well above the relay's own limit
/// so an oversized frame still reaches the decoder and is answered with
/// `message_too_large` instead of tearing down the socket.
fn transport_limit(max_message_bytes: usize) -> usize {
    max_message_bytes
        .saturating_mul(2)
        .max(DEFAULT_TRANSPORT_LIMIT)
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let limit = transport_limit(state.config.max_message_bytes);
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, state.relay, state.config))
}

async fn handle_socket(socket: WebSocket, relay: Relay, config: Arc<ServerConfig>) {
    let (conn, outbound) = Connection::new(config.outbound_queue);
    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, outbound));

    let mut supervisor = ConnectionSupervisor::new(relay, conn);
    let conn_id = supervisor.connection().id();
    info!(conn = %conn_id, "WebSocket connected");

    let mut heartbeat = tokio::time::interval(config.ping_interval);
    heartbeat.reset(); // skip immediate first tick

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if !supervisor.heartbeat_tick() {
                    break;
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        supervisor.handle_frame(text.as_bytes()).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        supervisor.handle_frame(&bytes).await;
                    }
                    // axum answers pings itself; both directions prove liveness.
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        supervisor.mark_alive();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(conn = %conn_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }

    debug!(conn = %conn_id, state = ?supervisor.state(), "Reader loop finished");
    supervisor.close().await;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    info!(conn = %conn_id, "WebSocket disconnected");
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
) {
    while let Some(frame) = outbound.recv().await {
        let result = match frame {
            Outbound::Text(text) => sink.send(Message::Text(text.to_string())).await,
            Outbound::Ping => sink.send(Message::Ping(Vec::new())).await,
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        };
        if result.is_err() {
            // Dropping the receiver marks the connection broken for senders.
            break;
        }
    }
}
