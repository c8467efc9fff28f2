//! WebSocket wire protocol.
//!
//! One JSON object per text frame, discriminated by a `type` tag. The
//! enums here are closed: an unknown `type` fails deserialization at the
//! boundary instead of leaking string-typed messages into the server.

use serde::{Deserialize, Serialize};

/// Role a client requests (and is assigned) during the connect handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientMode {
    Controller,
    Viewer,
}

/// Session transport status, broadcast on state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Error codes reported to a single requesting connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    ControllerExists,
}

/// Messages a client may send to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Handshake. Must be the first message on a connection.
    #[serde(rename_all = "camelCase")]
    Connect {
        mode: ClientMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_identifier: Option<String>,
    },
    /// Keyboard input for the remote terminal (controller only).
    Input { data: String },
    /// Terminal window resize (controller only).
    Resize { cols: u16, rows: u16 },
    /// Heartbeat; answered with `pong`.
    Ping,
}

/// Messages the relay sends to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Handshake reply carrying the assigned role.
    Connected { mode: ClientMode },
    /// Replay of recent terminal output, sent before any live output.
    History { data: String },
    /// Live terminal output.
    Output { data: String },
    /// Session transport status transition.
    Status {
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Session overview, broadcast to every connection on role and
    /// lifecycle changes. `task_identifier` is serialized even when null.
    #[serde(rename_all = "camelCase")]
    SessionInfo {
        has_controller: bool,
        viewer_count: usize,
        active: bool,
        task_identifier: Option<String>,
    },
    /// The controller connection went away; the session may live on.
    ControllerLeft,
    /// Handshake rejection, reported only to the requesting connection.
    Error { code: ErrorCode, message: String },
    /// Heartbeat reply.
    Pong,
}
