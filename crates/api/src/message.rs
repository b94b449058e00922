//! Frames exchanged with WebSocket clients.

use serde::{Deserialize, Serialize};

/// Messages pushed from the server to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once, right after the connection is registered.
    Connected { user_id: i64, connection_id: String },
    /// A notification row's payload.
    GeneralNotification { message: String },
    Pong,
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
}
