//! Manages the WebSocket connection lifecycle for a chat session.

use super::protocol::{ClientMessage, ServerMessage};
use crate::{
    models::{ChatMedia, SessionView},
    state::AppState,
};
use anyhow::{Result, anyhow};
use assessor_core::orchestrator::{Channel, InboundMessage};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::sync::Arc;
use tracing::{Instrument, error, info, instrument, warn};
use uuid::Uuid;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Identity of the session bound to a connection by its `init` message.
struct Binding {
    session_key: String,
    user_id: Option<String>,
}

/// Main handler for an individual WebSocket connection.
///
/// The first client message must be `init`. Once the session is bound, every
/// `user_message` runs one orchestrator turn and its reply is sent back.
#[instrument(name = "ws_connection", skip_all, fields(session_key))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("New WebSocket connection. Awaiting initialization...");
    let (mut socket_tx, mut socket_rx) = socket.split();

    let init = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => initialize_session(&text, &state).await,
        Some(Ok(_)) => Err(anyhow!("First message was not a text `init` message.")),
        _ => {
            info!("Client disconnected before sending init message.");
            return;
        }
    };

    let (binding, session) = match init {
        Ok(bound) => bound,
        Err(e) => {
            error!("Session initialization failed: {:?}", e);
            let _ = send_msg(
                &mut socket_tx,
                ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };
    tracing::Span::current().record("session_key", binding.session_key.as_str());

    if send_msg(
        &mut socket_tx,
        ServerMessage::Initialized {
            session_key: binding.session_key.clone(),
            session,
        },
    )
    .await
    .is_err()
    {
        error!("Failed to send Initialized message to client.");
        return;
    }

    let session_span = tracing::info_span!("chat_session", session_key = %binding.session_key);
    if let Err(e) = run_chat_session(state, socket_tx, socket_rx, binding)
        .instrument(session_span)
        .await
    {
        error!(error = ?e, "Chat session terminated with error.");
    }
    info!("Chat session finished.");
}

/// Parses the `init` message and loads the session if it already exists.
async fn initialize_session(
    init_text: &str,
    state: &Arc<AppState>,
) -> Result<(Binding, Option<SessionView>)> {
    let ClientMessage::Init {
        session_key,
        user_id,
    } = serde_json::from_str::<ClientMessage>(init_text)?
    else {
        return Err(anyhow!("First message must be `init`"));
    };

    let session_key = session_key
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .unwrap_or_else(|| format!("web-{}", Uuid::new_v4()));

    let session = match state.orchestrator.session(&session_key).await? {
        Some(session) => {
            info!(%session_key, "Resuming existing session");
            Some(SessionView::from_session(&session)?)
        }
        None => None,
    };

    Ok((
        Binding {
            session_key,
            user_id,
        },
        session,
    ))
}

/// The main event loop for a bound WebSocket session.
async fn run_chat_session(
    state: Arc<AppState>,
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut socket_rx: SplitStream<WebSocket>,
    binding: Binding,
) -> Result<()> {
    while let Some(msg_result) = socket_rx.next().await {
        let ws_msg = match msg_result {
            Ok(ws_msg) => ws_msg,
            Err(e) => {
                error!("Error receiving from client WebSocket: {:?}", e);
                break;
            }
        };

        match ws_msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::UserMessage { text, media }) => {
                    let reply = handle_user_message(&state, &binding, text, media).await;
                    send_msg(&mut socket_tx, reply).await?;
                }
                Ok(ClientMessage::Init { .. }) => {
                    warn!("Ignoring repeated init message.");
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring unparseable client message.");
                    send_msg(
                        &mut socket_tx,
                        ServerMessage::Error {
                            message: format!("Invalid message: {e}"),
                        },
                    )
                    .await?;
                }
            },
            Message::Close(_) => {
                info!("Client sent close frame. Shutting down session.");
                break;
            }
            Message::Binary(_) => warn!("Ignoring binary message."),
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    info!("WebSocket connection closed.");
    Ok(())
}

async fn handle_user_message(
    state: &AppState,
    binding: &Binding,
    text: String,
    media: Vec<ChatMedia>,
) -> ServerMessage {
    let media = match media
        .into_iter()
        .map(|m| m.into_inbound())
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(media) => media,
        Err(message) => return ServerMessage::Error { message },
    };

    let inbound = InboundMessage {
        session_key: binding.session_key.clone(),
        user_id: binding.user_id.clone(),
        channel: Channel::Chat,
        text,
        media,
    };
    match state.orchestrator.handle_turn(inbound).await {
        Ok(reply) => ServerMessage::Reply {
            reply: reply.into(),
        },
        Err(e) => {
            error!(error = %e, "Chat turn failed");
            ServerMessage::Error {
                message: e.reply_text(),
            }
        }
    }
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
