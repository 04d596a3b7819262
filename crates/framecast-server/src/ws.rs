//! WebSocket connection lifecycle, from upgrade through disconnect.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use framecast_core::messages::now_timestamp;
use framecast_core::{RelayError, ServerMessage};

use crate::heartbeat;
use crate::registry::Connection;
use crate::server::AppState;

/// Register an upgraded socket and run it, or reject it when the registry
/// is full.
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    match state.registry.register() {
        Ok((connection, outbound)) => run_ws_session(socket, connection, outbound, state).await,
        Err(err) => reject(socket, &err).await,
    }
}

async fn reject(mut socket: WebSocket, err: &RelayError) {
    let message = ServerMessage::error(None, err.error_kind(), err.to_string());
    if let Ok(json) = serde_json::to_string(&message) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

/// Run one registered connection.
///
/// 1. Queues `connection_established`
/// 2. Spawns the writer that drains the outbound queue into the socket
/// 3. Spawns the heartbeat monitor
/// 4. Routes inbound frames until close, error, eviction, or shutdown
/// 5. Unregisters the connection; the session pacers are left alone
#[instrument(skip_all, fields(conn_id = %connection.id))]
pub async fn run_ws_session(
    socket: WebSocket,
    connection: Arc<Connection>,
    mut outbound: mpsc::Receiver<Arc<str>>,
    state: AppState,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let close = connection.close_token();
    info!("client connected");

    connection.send_message(&ServerMessage::ConnectionEstablished {
        connection_id: connection.id.clone(),
        timestamp: now_timestamp(),
    });

    let writer_close = close.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                text = outbound.recv() => match text {
                    Some(text) => {
                        if let Err(err) = ws_tx.send(Message::Text(text.to_string().into())).await {
                            let err = transport_failure(err);
                            debug!(code = err.error_kind(), error = %err, "socket write failed");
                            break;
                        }
                    }
                    None => break,
                },
                () = writer_close.cancelled() => break,
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let monitor = tokio::spawn(heartbeat::monitor(
        Arc::clone(&state.registry),
        Arc::clone(&connection),
        state.heartbeat.interval(),
        state.heartbeat.timeout(),
    ));

    loop {
        let frame = tokio::select! {
            () = close.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                let err = transport_failure(err);
                debug!(code = err.error_kind(), error = %err, "socket read failed");
                break;
            }
            None => break,
        };

        connection.mark_alive();
        match message {
            Message::Text(text) => state.router.handle_text(&connection.id, text.as_str()).await,
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => state.router.handle_text(&connection.id, text).await,
                Err(_) => state.router.malformed(&connection.id, "binary frame is not UTF-8"),
            },
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    state.registry.unregister(&connection.id);
    let _ = writer.await;
    let _ = monitor.await;
    info!(dropped = connection.drop_count(), "client disconnected");
}

fn transport_failure(err: axum::Error) -> RelayError {
    RelayError::Transport(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_errors_are_unrecoverable_transport_failures() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let err = transport_failure(axum::Error::new(io));
        assert_eq!(err.error_kind(), "transport_failure");
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("peer reset"), "{err}");
    }
}
