use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use beacon_core::{AuthRequest, ConnectionId, HubError, InboundFrame, OutboundMessage, Principal, PrincipalResolver};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::handler::HandlerMap;
use crate::server::AppState;

/// Drive one WebSocket connection through its whole life: authenticate the
/// first frame, register, run the reader and writer loops, deregister.
///
/// Everything that goes wrong in here stays in here — a failed connection
/// removes itself from the registry and never touches its neighbors.
pub async fn serve(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let principal = match authenticate(
        &mut ws_rx,
        state.resolver.as_ref(),
        state.socket.auth_deadline,
    )
    .await
    {
        Ok(principal) => principal,
        Err(err) => {
            warn!(error = %err, "rejecting connection");
            let frame =
                OutboundMessage::new("error", serde_json::json!({"error": err.error_kind()}));
            if let Ok(text) = frame.to_text() {
                let _ = ws_tx.send(WsMessage::Text(text.into())).await;
            }
            let _ = ws_tx.close().await;
            return;
        }
    };

    let conn = Arc::new(Connection::new(
        ConnectionId::new(),
        principal,
        state.socket.queue_capacity,
    ));
    if let Err(err) = state.hub.registry().add(Arc::clone(&conn)) {
        warn!(error = %err, "failed to register connection");
        let _ = ws_tx.close().await;
        return;
    }
    conn.activate();
    info!(connection = %conn.id(), subject = %conn.principal().subject, "client connected");

    conn.enqueue(OutboundMessage::new(
        "welcome",
        serde_json::json!({
            "connection_id": conn.id().as_str(),
            "subject": conn.principal().subject,
        }),
    ));

    let mut writer = tokio::spawn(writer_loop(
        ws_tx,
        Arc::clone(&conn),
        state.socket.heartbeat_interval,
    ));
    let mut reader = tokio::spawn(reader_loop(
        ws_rx,
        Arc::clone(&conn),
        Arc::clone(&state.handlers),
    ));

    // Whichever loop exits first, cancel the other and wait for it.
    tokio::select! {
        _ = &mut writer => {
            conn.force_close();
            let _ = reader.await;
        }
        _ = &mut reader => {
            conn.force_close();
            let _ = writer.await;
        }
    }

    conn.mark_closed();
    state.hub.registry().remove(conn.id());
    info!(connection = %conn.id(), "client disconnected");
}

/// Read the first frame as `{"token": ...}` and resolve it to a principal.
async fn authenticate(
    ws_rx: &mut SplitStream<WebSocket>,
    resolver: &dyn PrincipalResolver,
    deadline: Duration,
) -> Result<Principal, HubError> {
    let first = tokio::time::timeout(deadline, ws_rx.next())
        .await
        .map_err(|_| HubError::Unauthenticated("no auth frame before deadline".into()))?;

    let message = match first {
        Some(Ok(message)) => message,
        _ => {
            return Err(HubError::Unauthenticated(
                "connection closed during auth".into(),
            ))
        }
    };

    let WsMessage::Text(text) = message else {
        return Err(HubError::Unauthenticated("expected text auth frame".into()));
    };
    let request: AuthRequest = serde_json::from_str(text.as_str())
        .map_err(|_| HubError::Unauthenticated("malformed auth frame".into()))?;

    resolver.authenticate(&request.token).await
}

/// Sole writer to this connection's transport. Serializes queued messages in
/// FIFO order and sends heartbeat pings; a failed write ends the connection.
async fn writer_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    conn: Arc<Connection>,
    heartbeat: Duration,
) {
    let cancel = conn.cancel_token();
    let mut ping = tokio::time::interval(heartbeat);
    ping.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = conn.queue().recv() => {
                match message {
                    Some(message) => {
                        let text = match message.to_text() {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(connection = %conn.id(), error = %err, "unencodable outbound message, skipping");
                                continue;
                            }
                        };
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Queue closed and fully drained: clean close.
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Decode incoming frames and route them to the handler registered for
/// their topic. Exits on close, transport error, or cancellation.
async fn reader_loop(
    mut ws_rx: SplitStream<WebSocket>,
    conn: Arc<Connection>,
    handlers: Arc<HandlerMap>,
) {
    let cancel = conn.cancel_token();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                dispatch_frame(&conn, &handlers, text.as_str()).await;
            }
            Some(Ok(WsMessage::Pong(_))) => conn.record_pong(),
            Some(Ok(WsMessage::Ping(_))) => {} // axum replies automatically
            Some(Ok(WsMessage::Binary(_))) => {
                debug!(connection = %conn.id(), "ignoring binary frame");
            }
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
        }
    }
}

async fn dispatch_frame(conn: &Connection, handlers: &HandlerMap, text: &str) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(connection = %conn.id(), error = %err, "undecodable frame");
            conn.enqueue(OutboundMessage::new(
                "error",
                serde_json::json!({"error": "malformed_frame"}),
            ));
            return;
        }
    };

    match handlers.get(&frame.topic) {
        Some(handler) => handler.handle(conn.id(), conn.principal(), frame.payload).await,
        None => {
            debug!(connection = %conn.id(), topic = %frame.topic, "no handler for topic");
            conn.enqueue(OutboundMessage::new(
                "error",
                serde_json::json!({"error": "unknown_topic", "topic": frame.topic}),
            ));
        }
    }
}
