//! SSH/PTY bridge.
//!
//! Owns the SSH connection and the remote shell's pseudo-terminal. A
//! running bridge is driven through [`BridgeHandle`] commands and reports
//! back through [`BridgeEvent`]s; the [`TerminalTarget`] trait keeps the
//! session manager independent of the underlying transport, so tests can
//! substitute an in-memory terminal.

use crate::config::SshTargetConfig;
use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use std::sync::Arc;
use tether_core::{TetherError, TetherResult};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capacity of a running bridge's command queue.
const COMMAND_QUEUE_CAPACITY: usize = 256;
/// Terminal type requested for the remote PTY.
const TERM: &str = "xterm-256color";

/// Events emitted by a running terminal bridge.
#[derive(Debug)]
pub enum BridgeEvent {
    /// Raw output bytes from the remote terminal.
    Output(Vec<u8>),
    /// The terminal channel closed; `reason` is set on error paths.
    Closed { reason: Option<String> },
}

/// Commands accepted by a running terminal bridge.
#[derive(Debug)]
enum BridgeCommand {
    Write(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Shutdown,
}

/// Handle to a running terminal bridge.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    commands: mpsc::Sender<BridgeCommand>,
}

impl BridgeHandle {
    /// Forward input bytes to the terminal.
    pub fn write(&self, bytes: Vec<u8>) {
        if self.commands.try_send(BridgeCommand::Write(bytes)).is_err() {
            warn!("bridge command queue full or closed, dropping input");
        }
    }

    /// Request a terminal window-size change.
    pub fn resize(&self, cols: u16, rows: u16) {
        if self
            .commands
            .try_send(BridgeCommand::Resize { cols, rows })
            .is_err()
        {
            warn!("bridge command queue full or closed, dropping resize");
        }
    }

    /// Ask the bridge to close the channel and disconnect.
    pub fn shutdown(&self) {
        let _ = self.commands.try_send(BridgeCommand::Shutdown);
    }
}

/// A terminal the session manager can start and drive.
#[async_trait]
pub trait TerminalTarget: Send + Sync {
    /// Start a terminal of the given size. Events flow to `events` until
    /// the terminal closes or the returned handle is shut down.
    async fn start(
        &self,
        cols: u16,
        rows: u16,
        events: mpsc::Sender<BridgeEvent>,
    ) -> TetherResult<BridgeHandle>;
}

/// `TerminalTarget` over an SSH connection with a remote PTY.
pub struct SshTarget {
    config: SshTargetConfig,
}

impl SshTarget {
    pub fn new(config: SshTargetConfig) -> Self {
        Self { config }
    }
}

/// russh client event handler. Host-key checking is open: the relay talks
/// to a single operator-configured host.
struct SshHandler;

#[async_trait]
impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[async_trait]
impl TerminalTarget for SshTarget {
    async fn start(
        &self,
        cols: u16,
        rows: u16,
        events: mpsc::Sender<BridgeEvent>,
    ) -> TetherResult<BridgeHandle> {
        let cfg = &self.config;
        info!(host = %cfg.host, port = cfg.port, username = %cfg.username, "connecting to SSH target");

        let ssh_config = Arc::new(client::Config::default());
        let mut session = client::connect(ssh_config, (cfg.host.as_str(), cfg.port), SshHandler)
            .await
            .map_err(|e| TetherError::Transport(format!("SSH connect failed: {e}")))?;

        let authenticated = if let Some(path) = &cfg.private_key_path {
            let key = russh_keys::load_secret_key(path, None).map_err(|e| {
                TetherError::Transport(format!("cannot load SSH key {}: {e}", path.display()))
            })?;
            session
                .authenticate_publickey(cfg.username.as_str(), Arc::new(key))
                .await
                .map_err(|e| TetherError::Transport(format!("SSH key auth failed: {e}")))?
        } else if let Some(password) = &cfg.password {
            session
                .authenticate_password(cfg.username.as_str(), password.as_str())
                .await
                .map_err(|e| TetherError::Transport(format!("SSH password auth failed: {e}")))?
        } else {
            return Err(TetherError::Transport(
                "no SSH credentials configured".into(),
            ));
        };
        if !authenticated {
            return Err(TetherError::Transport("SSH authentication rejected".into()));
        }

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| TetherError::Transport(format!("SSH channel open failed: {e}")))?;
        channel
            .request_pty(false, TERM, u32::from(cols), u32::from(rows), 0, 0, &[])
            .await
            .map_err(|e| TetherError::Transport(format!("PTY request failed: {e}")))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| TetherError::Transport(format!("shell request failed: {e}")))?;
        info!(cols, rows, "remote shell started");

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        tokio::spawn(run_channel(session, channel, cmd_rx, events));
        Ok(BridgeHandle { commands: cmd_tx })
    }
}

/// Drive one shell channel until it closes or the bridge is shut down.
///
/// The channel is owned here; writes and window changes arrive as
/// commands, output leaves as events.
async fn run_channel(
    session: client::Handle<SshHandler>,
    mut channel: russh::Channel<client::Msg>,
    mut commands: mpsc::Receiver<BridgeCommand>,
    events: mpsc::Sender<BridgeEvent>,
) {
    let mut close_reason: Option<String> = None;
    loop {
        tokio::select! {
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if events.send(BridgeEvent::Output(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, .. }) => {
                        if events.send(BridgeEvent::Output(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        info!(exit_status, "remote shell exited");
                        break;
                    }
                    Some(ChannelMsg::Eof) => {
                        debug!("shell channel EOF");
                    }
                    Some(ChannelMsg::Close) => {
                        break;
                    }
                    Some(_) => {}
                    None => {
                        close_reason = Some("SSH channel closed unexpectedly".to_string());
                        break;
                    }
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(BridgeCommand::Write(bytes)) => {
                        if let Err(e) = channel.data(&bytes[..]).await {
                            close_reason = Some(format!("SSH write failed: {e}"));
                            break;
                        }
                    }
                    Some(BridgeCommand::Resize { cols, rows }) => {
                        if let Err(e) = channel
                            .window_change(u32::from(cols), u32::from(rows), 0, 0)
                            .await
                        {
                            warn!(error = %e, "window-change request failed");
                        }
                    }
                    Some(BridgeCommand::Shutdown) | None => {
                        let _ = channel.eof().await;
                        break;
                    }
                }
            }
        }
    }

    let _ = session
        .disconnect(Disconnect::ByApplication, "session closed", "en")
        .await;
    let _ = events.send(BridgeEvent::Closed { reason: close_reason }).await;
    debug!("bridge channel task finished");
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory terminal target for session tests.

    use super::*;
    use std::sync::Mutex;

    /// Operations observed by the fake terminal.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum TargetOp {
        Write(Vec<u8>),
        Resize { cols: u16, rows: u16 },
        Shutdown,
    }

    /// Records operations and hands the test the event sender of the most
    /// recent start, so output and close events can be scripted.
    pub(crate) struct FakeTarget {
        pub(crate) ops: Arc<Mutex<Vec<TargetOp>>>,
        pub(crate) events: Arc<Mutex<Option<mpsc::Sender<BridgeEvent>>>>,
        pub(crate) starts: Arc<Mutex<u32>>,
        pub(crate) fail_start: bool,
    }

    impl FakeTarget {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                ops: Arc::new(Mutex::new(Vec::new())),
                events: Arc::new(Mutex::new(None)),
                starts: Arc::new(Mutex::new(0)),
                fail_start: false,
            })
        }

        pub(crate) fn failing() -> Arc<Self> {
            Arc::new(Self {
                ops: Arc::new(Mutex::new(Vec::new())),
                events: Arc::new(Mutex::new(None)),
                starts: Arc::new(Mutex::new(0)),
                fail_start: true,
            })
        }

        pub(crate) fn start_count(&self) -> u32 {
            *self.starts.lock().unwrap()
        }

        pub(crate) fn recorded_ops(&self) -> Vec<TargetOp> {
            self.ops.lock().unwrap().clone()
        }

        pub(crate) fn event_sender(&self) -> Option<mpsc::Sender<BridgeEvent>> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TerminalTarget for FakeTarget {
        async fn start(
            &self,
            _cols: u16,
            _rows: u16,
            events: mpsc::Sender<BridgeEvent>,
        ) -> TetherResult<BridgeHandle> {
            *self.starts.lock().unwrap() += 1;
            if self.fail_start {
                return Err(TetherError::Transport("scripted start failure".into()));
            }
            *self.events.lock().unwrap() = Some(events);

            let (cmd_tx, mut cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
            let ops = self.ops.clone();
            tokio::spawn(async move {
                while let Some(cmd) = cmd_rx.recv().await {
                    match cmd {
                        BridgeCommand::Write(bytes) => {
                            ops.lock().unwrap().push(TargetOp::Write(bytes));
                        }
                        BridgeCommand::Resize { cols, rows } => {
                            ops.lock().unwrap().push(TargetOp::Resize { cols, rows });
                        }
                        BridgeCommand::Shutdown => {
                            ops.lock().unwrap().push(TargetOp::Shutdown);
                            break;
                        }
                    }
                }
            });
            Ok(BridgeHandle { commands: cmd_tx })
        }
    }
}
