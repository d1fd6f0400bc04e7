// src/websocket.rs

use crate::{
    error::ChatError,
    models::{ClientFrame, ServerFrame},
    registry::{Connection, Outbound},
    session::EvictReason,
    state::ChatState,
};
use axum::{
    body::Bytes,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub user_id: Option<String>,
}

/// The main handler for WebSocket connections: `GET /ws?user_id=...`.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<ChatState>,
    Query(params): Query<ConnectParams>,
) -> Result<impl IntoResponse, ChatError> {
    let user_id = params
        .user_id
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ChatError::Validation("user_id is required".into()))?;

    info!(user_id, "new WebSocket connection");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user_id)))
}

/// Manages the lifecycle of one client socket.
async fn handle_socket(socket: WebSocket, state: ChatState, user_id: String) {
    let (conn, outbound) = match state.chat.connect(&user_id).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(user_id, error = %e, "connection refused");
            return;
        }
    };
    let (sender, receiver) = socket.split();
    let config = state.chat.config();

    let mut send_task = tokio::spawn(write_to_client(
        sender,
        outbound,
        conn.clone(),
        config.write_timeout,
    ));
    let mut receive_task = tokio::spawn(read_from_client(
        receiver,
        conn.clone(),
        state.clone(),
        config.read_timeout,
    ));

    // Whichever side finishes first takes the other down with it.
    tokio::select! {
        _ = &mut send_task => receive_task.abort(),
        _ = &mut receive_task => send_task.abort(),
    }

    state.chat.disconnect(&conn, EvictReason::Closed).await;
    info!(user_id, connection_id = %conn.id, "client disconnected");
}

/// Drains the connection's outbound queue into the socket.
async fn write_to_client(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    conn: Arc<Connection>,
    write_timeout: Duration,
) {
    loop {
        let item = tokio::select! {
            item = outbound.recv() => item,
            _ = conn.closed() => None,
        };
        let message = match item {
            Some(Outbound::Frame(frame)) => match serde_json::to_string(&frame) {
                Ok(json) => Message::Text(json.into()),
                Err(e) => {
                    warn!(error = %e, "failed to serialize server frame");
                    continue;
                }
            },
            Some(Outbound::Ping) => Message::Ping(Bytes::new()),
            None => break,
        };

        match timeout(write_timeout, sender.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(user_id = %conn.user_id, error = %e, "socket write failed");
                return;
            }
            Err(_) => {
                warn!(user_id = %conn.user_id, "socket write timed out");
                return;
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

/// Reads frames from a client until it disconnects, goes quiet past the read
/// deadline, or its connection is closed elsewhere.
async fn read_from_client(
    mut receiver: SplitStream<WebSocket>,
    conn: Arc<Connection>,
    state: ChatState,
    read_timeout: Duration,
) {
    loop {
        let next = tokio::select! {
            next = timeout(read_timeout, receiver.next()) => next,
            _ = conn.closed() => return,
        };
        let msg = match next {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                debug!(user_id = %conn.user_id, error = %e, "socket read failed");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                info!(user_id = %conn.user_id, "read deadline exceeded");
                return;
            }
        };

        // Any traffic at all counts as a sign of life.
        conn.mark_alive();

        let frame = match msg {
            Message::Text(text) => serde_json::from_str::<ClientFrame>(text.as_str()),
            Message::Binary(bytes) => serde_json::from_slice::<ClientFrame>(&bytes),
            Message::Close(_) => return,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match frame {
            Ok(frame) => handle_frame(frame, &conn, &state).await,
            Err(e) => {
                warn!(user_id = %conn.user_id, error = %e, "malformed client frame");
                state
                    .chat
                    .reply(&conn, ServerFrame::error("validation", "malformed frame"))
                    .await;
            }
        }
    }
}

async fn handle_frame(frame: ClientFrame, conn: &Arc<Connection>, state: &ChatState) {
    let chat = &state.chat;
    let user_id = conn.user_id.as_str();

    let result = match frame {
        ClientFrame::Message {
            conversation_id,
            content,
        } => match chat.send_chat_frame(user_id, &conversation_id, &content).await {
            Ok(message) => {
                let ack = ServerFrame::Sent {
                    conversation_id,
                    message_id: message.id,
                    timestamp: message.created_at.timestamp(),
                };
                chat.reply(conn, ack).await;
                Ok(())
            }
            Err(e) => Err(e),
        },
        ClientFrame::Typing { conversation_id } => chat.typing(user_id, &conversation_id).await,
        ClientFrame::Read { conversation_id } => chat.mark_read(user_id, &conversation_id).await,
        ClientFrame::JoinChat { conversation_id } => chat.join(conn, &conversation_id).await,
        ClientFrame::LeaveChat { conversation_id } => {
            chat.leave(conn, &conversation_id);
            Ok(())
        }
        ClientFrame::Ping => {
            chat.reply(conn, ServerFrame::pong()).await;
            Ok(())
        }
        ClientFrame::Pong => Ok(()),
        ClientFrame::Unknown => {
            warn!(user_id, "ignoring unknown frame type");
            Ok(())
        }
    };

    if let Err(e) = result {
        debug!(user_id, error = %e, "frame rejected");
        chat.reply(conn, ServerFrame::error(e.code(), e.client_message()))
            .await;
    }
}
