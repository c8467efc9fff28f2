//! Client-facing transport: the WebSocket listener.

pub mod websocket;
