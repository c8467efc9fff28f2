//! Gateway: accepts WebSocket connections and drives the per-socket
//! message protocol against the session actor.
//!
//! Each connection gets a bounded outbound queue drained by a writer
//! task; all server→client traffic flows through it, so per-connection
//! ordering is total. The reader side enforces the connect handshake,
//! dispatches steady-state messages, and evicts sockets that stop
//! heartbeating.

use crate::auth::ControllerAuth;
use crate::config::RelayConfig;
use crate::session::{ConnId, SessionHandle, SshTarget};
use crate::transport::websocket::{WebSocketConnection, WebSocketListener};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::protocol::{ClientMessage, ServerMessage};
use tether_core::{TetherError, TetherResult};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Seconds a socket may stay silent before its first `connect` message.
const HANDSHAKE_TIMEOUT_SECS: u64 = 10;
/// Heartbeat check cadence.
const HEARTBEAT_INTERVAL_SECS: u64 = 30;
/// A socket silent longer than this is dead (three missed pings).
const HEARTBEAT_TIMEOUT_SECS: u64 = 90;
/// Per-connection outbound queue depth; overflow evicts the client.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;
/// A single send stalled longer than this evicts the client.
const SEND_TIMEOUT_SECS: u64 = 30;
/// Largest accepted inbound text frame.
const MAX_FRAME_BYTES: usize = 1_048_576;

/// Connection ID source.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// The relay server: one session actor plus the WebSocket accept loop.
pub struct RelayServer {
    config: RelayConfig,
    session: SessionHandle,
}

impl RelayServer {
    /// Create the server and spawn its session actor.
    pub fn new(config: RelayConfig) -> Self {
        let auth = ControllerAuth::new(config.controller_token.clone());
        let target = Arc::new(SshTarget::new(config.ssh.clone()));
        let session = SessionHandle::spawn(target, auth, config.max_history_bytes);
        Self { config, session }
    }

    /// Run the accept loop until the listener fails.
    pub async fn run(self) -> TetherResult<()> {
        let bind_addr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| TetherError::Config(format!("invalid bind address: {e}")))?;
        let mut listener = WebSocketListener::bind(bind_addr).await?;
        info!(addr = %listener.local_addr(), "relay ready");

        while let Some(conn) = listener.accept().await {
            let session = self.session.clone();
            tokio::spawn(async move {
                let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
                handle_connection(id, conn, session).await;
            });
        }
        Ok(())
    }
}

/// Drive one client connection from accept to close.
async fn handle_connection(id: ConnId, conn: WebSocketConnection, session: SessionHandle) {
    debug!(conn_id = id, remote = %conn.remote_addr, "connection open");
    let (sink, mut stream) = conn.ws_stream.split();

    let (out_tx, out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE_CAPACITY);
    tokio::spawn(write_outbound(id, sink, out_rx));
    // The actor's copy of this sender is the only one left after the
    // move, so dropping the client there ends the writer task too.
    session.register(id, out_tx).await;

    // Handshake: the first frame must be `connect`, within the timeout.
    let first = tokio::time::timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        next_client_message(id, &mut stream),
    )
    .await;
    match first {
        Ok(Some(ClientMessage::Connect {
            mode,
            token,
            task_identifier,
        })) => match session.handshake(id, mode, token, task_identifier).await {
            Ok(assigned) => {
                debug!(conn_id = id, role = ?assigned, "handshake complete");
            }
            Err(e) => {
                warn!(conn_id = id, error = %e, "handshake failed");
                session.detach(id).await;
                return;
            }
        },
        Ok(Some(_)) => {
            warn!(conn_id = id, "first message was not connect, closing");
            session.detach(id).await;
            return;
        }
        Ok(None) => {
            debug!(conn_id = id, "socket closed before handshake");
            session.detach(id).await;
            return;
        }
        Err(_) => {
            warn!(conn_id = id, "handshake timeout");
            session.detach(id).await;
            return;
        }
    }

    // Steady state.
    let mut last_heartbeat = Instant::now();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    loop {
        tokio::select! {
            message = next_client_message(id, &mut stream) => {
                let Some(message) = message else { break };
                last_heartbeat = Instant::now();
                match message {
                    ClientMessage::Input { data } => {
                        session.input(id, data.into_bytes()).await;
                    }
                    ClientMessage::Resize { cols, rows } => {
                        session.resize(id, cols, rows).await;
                    }
                    ClientMessage::Ping => {
                        session.heartbeat(id).await;
                    }
                    ClientMessage::Connect { .. } => {
                        debug!(conn_id = id, "duplicate connect ignored");
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_heartbeat.elapsed().as_secs() > HEARTBEAT_TIMEOUT_SECS {
                    info!(conn_id = id, "heartbeat timeout, evicting connection");
                    break;
                }
            }
        }
    }

    session.detach(id).await;
    debug!(conn_id = id, "connection closed");
}

/// Drain the outbound queue into the socket. Ends when the queue closes
/// (client evicted or detached) or a send fails or stalls.
async fn write_outbound(
    id: ConnId,
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut messages: mpsc::Receiver<ServerMessage>,
) {
    while let Some(message) = messages.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                warn!(conn_id = id, error = %e, "failed to encode message");
                continue;
            }
        };
        let send = sink.send(Message::Text(text));
        match tokio::time::timeout(Duration::from_secs(SEND_TIMEOUT_SECS), send).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn_id = id, error = %e, "send failed");
                break;
            }
            Err(_) => {
                warn!(conn_id = id, "send stalled, dropping connection");
                break;
            }
        }
    }
    let _ = sink.close().await;
}

/// Read the next parseable client message. Malformed frames are dropped
/// and the connection stays open; `None` means the socket closed.
async fn next_client_message(
    id: ConnId,
    stream: &mut SplitStream<WebSocketStream<TcpStream>>,
) -> Option<ClientMessage> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_FRAME_BYTES {
                    warn!(conn_id = id, len = text.len(), "oversized frame dropped");
                    continue;
                }
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => return Some(message),
                    Err(e) => {
                        warn!(conn_id = id, error = %e, "malformed message dropped");
                        continue;
                    }
                }
            }
            Some(Ok(Message::Close(_))) => return None,
            // tungstenite answers protocol-level pings on its own.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(conn_id = id, error = %e, "socket error");
                return None;
            }
            None => return None,
        }
    }
}
