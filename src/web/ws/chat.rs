//! Chat WebSocket handler.
//!
//! One task per connection: the handshake runs under a deadline, then a
//! `select!` loop interleaves inbound frames with the session's outbound
//! queue.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::time::Instant;
use uuid::Uuid;

use crate::chat::{
    AuthError, AuthRequest, ConnectionManager, ConnectionPhase, ConnectionState, Outbound,
    SessionHandle, POLICY_VIOLATION,
};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::web::handlers::AppState;

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

/// WebSocket chat handler.
///
/// GET /ws
pub async fn chat_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let manager = Arc::clone(&state.manager);
    ws.on_upgrade(move |socket| handle_socket(socket, manager))
}

/// Serialize and send one event. Returns false if the socket is gone.
async fn send_event(ws_sender: &mut WsSender, event: &ServerMessage) -> bool {
    match event.to_json() {
        Ok(json) => ws_sender.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize server message");
            true
        }
    }
}

async fn send_close(ws_sender: &mut WsSender, code: u16, reason: String) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = ws_sender.send(Message::Close(Some(frame))).await;
}

/// Wait for the `auth` frame until `deadline`.
async fn read_auth(ws_receiver: &mut WsReceiver, deadline: Instant) -> Result<AuthRequest, AuthError> {
    loop {
        let frame = match tokio::time::timeout_at(deadline, ws_receiver.next()).await {
            Err(_) => return Err(AuthError::Timeout),
            Ok(None) => return Err(AuthError::Disconnected),
            Ok(Some(frame)) => frame,
        };

        match frame {
            Ok(Message::Text(text)) => return AuthRequest::parse_frame(&text),
            Ok(Message::Binary(_)) => return Err(AuthError::Malformed),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return Err(AuthError::Disconnected),
        }
    }
}

async fn reject(ws_sender: &mut WsSender, error: &AuthError) {
    if *error == AuthError::Disconnected {
        return;
    }
    send_event(
        ws_sender,
        &ServerMessage::AuthFailed {
            reason: error.to_string(),
        },
    )
    .await;
    send_close(ws_sender, POLICY_VIOLATION, error.to_string()).await;
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, manager: Arc<ConnectionManager>) {
    let connection_id = Uuid::new_v4();
    let mut phase = ConnectionPhase::new(connection_id.to_string());
    let (mut ws_sender, mut ws_receiver) = socket.split();

    phase.transition(ConnectionState::Authenticating);
    let deadline = Instant::now() + manager.settings().auth_timeout;

    let (handle, mut outbound) = SessionHandle::channel();
    let admitted = match read_auth(&mut ws_receiver, deadline).await {
        Ok(request) => manager.authenticate(request, handle).await,
        Err(e) => Err(e),
    };

    let session = match admitted {
        Ok(session) => session,
        Err(e) => {
            tracing::info!(connection = %connection_id, reason = %e, "Authentication failed");
            reject(&mut ws_sender, &e).await;
            phase.transition(ConnectionState::Closed);
            return;
        }
    };

    phase.transition(ConnectionState::Active);
    manager.activate(&session).await;

    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match ClientMessage::parse(&text) {
                        Ok(message) => {
                            tracing::trace!(user = %session.name, kind = message.kind(), "Inbound event");
                            manager.handle_event(session.id, message).await;
                        }
                        Err(e) => {
                            tracing::debug!(session_id = %session.id, error = %e, "Rejected client frame");
                            session.handle.send(ServerMessage::error(e.code(), e.to_string()));
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!(session_id = %session.id, "WebSocket closed by client");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(session_id = %session.id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }

            item = outbound.recv() => {
                match item {
                    Some(Outbound::Event(event)) => {
                        if !send_event(&mut ws_sender, &event).await {
                            break;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        send_close(&mut ws_sender, code, reason).await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    manager.disconnect(session.id).await;
    phase.transition(ConnectionState::Closed);
    tracing::debug!(session_id = %session.id, "WebSocket session ended");
}
