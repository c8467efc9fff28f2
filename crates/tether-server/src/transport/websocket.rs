//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts TCP connections and performs the WebSocket upgrade off the
//! accept loop, so one slow client cannot hold up the next accept.

use std::net::SocketAddr;
use std::time::Duration;
use tether_core::{TetherError, TetherResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A client that stalls the upgrade handshake this long is dropped.
const UPGRADE_TIMEOUT_SECS: u64 = 10;

/// An accepted, upgraded WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Listener yielding upgraded WebSocket connections.
pub struct WebSocketListener {
    local_addr: SocketAddr,
    accepted: mpsc::Receiver<WebSocketConnection>,
}

impl WebSocketListener {
    /// Bind the TCP listener and start accepting in the background.
    pub async fn bind(bind_addr: SocketAddr) -> TetherResult<Self> {
        let tcp_listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| TetherError::Transport(format!("bind {bind_addr} failed: {e}")))?;
        let local_addr = tcp_listener
            .local_addr()
            .map_err(|e| TetherError::Transport(format!("local_addr failed: {e}")))?;

        let (tx, accepted) = mpsc::channel::<WebSocketConnection>(64);
        tokio::spawn(accept_loop(tcp_listener, tx));

        Ok(Self {
            local_addr,
            accepted,
        })
    }

    /// The address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next upgraded connection, or `None` if the accept loop died.
    pub async fn accept(&mut self) -> Option<WebSocketConnection> {
        self.accepted.recv().await
    }
}

async fn accept_loop(tcp_listener: TcpListener, tx: mpsc::Sender<WebSocketConnection>) {
    loop {
        let (stream, remote_addr) = match tcp_listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "TCP accept failed");
                continue;
            }
        };
        // Upgrade off the accept loop; a stalled client only costs its
        // own task.
        let tx = tx.clone();
        tokio::spawn(async move {
            let upgrade = tokio_tungstenite::accept_async(stream);
            match tokio::time::timeout(Duration::from_secs(UPGRADE_TIMEOUT_SECS), upgrade).await {
                Ok(Ok(ws_stream)) => {
                    debug!(remote = %remote_addr, "WebSocket connection accepted");
                    let conn = WebSocketConnection {
                        ws_stream,
                        remote_addr,
                    };
                    let _ = tx.send(conn).await;
                }
                Ok(Err(e)) => {
                    warn!(remote = %remote_addr, error = %e, "WebSocket handshake failed");
                }
                Err(_) => {
                    warn!(remote = %remote_addr, "WebSocket handshake timed out");
                }
            }
        });
    }
}
