//! Defines the WebSocket message protocol between the browser client and the API server.

use crate::models::{ChatMedia, ChatResponse, SessionView};
use serde::{Deserialize, Serialize};

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens or resumes a session. This must be the first message.
    Init {
        /// The session to resume. A new key is issued when omitted.
        session_key: Option<String>,
        /// Stable user id for saved roles and progress.
        user_id: Option<String>,
    },
    /// A candidate message, optionally with images.
    UserMessage {
        text: String,
        #[serde(default)]
        media: Vec<ChatMedia>,
    },
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms the session; `session` is present when it already existed.
    Initialized {
        session_key: String,
        session: Option<SessionView>,
    },
    /// The assessor's reply to one candidate message.
    Reply { reply: ChatResponse },
    /// Reports an error to the client.
    Error { message: String },
}
