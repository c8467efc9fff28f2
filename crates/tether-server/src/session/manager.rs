//! Session state owner.
//!
//! A single actor task owns the controller slot, the viewer set, the
//! history buffer, and the bridge to the remote terminal. Every mutation
//! flows through its command channel, so concurrent handshakes, inputs,
//! and disconnects from many sockets serialize without locks. Handshake
//! replies and the history snapshot are enqueued in the same actor turn
//! that assigns the role, which is what guarantees a new client sees the
//! history dump before any live output.

use crate::auth::ControllerAuth;
use crate::session::bridge::{BridgeEvent, BridgeHandle, TerminalTarget};
use crate::session::history::HistoryBuffer;
use std::collections::HashMap;
use std::sync::Arc;
use tether_core::protocol::{ClientMode, ErrorCode, ServerMessage, SessionStatus};
use tether_core::{TetherError, TetherResult};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Connection identifier assigned by the gateway.
pub type ConnId = u64;

/// Capacity of the actor's command queue.
const COMMAND_QUEUE_CAPACITY: usize = 256;
/// Capacity of the bridge event queue.
const EVENT_QUEUE_CAPACITY: usize = 256;
/// Terminal size used until the controller reports its own.
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Role assigned to a connection at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Unassigned,
    Controller,
    Viewer,
}

/// Lifecycle of the PTY session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Starting,
    Active,
}

/// Commands accepted by the session actor.
pub enum SessionCommand {
    /// Register a connection's outbound queue. Must precede its handshake.
    Register {
        id: ConnId,
        sender: mpsc::Sender<ServerMessage>,
    },
    /// Run the connect handshake: role assignment plus reply sequence.
    Handshake {
        id: ConnId,
        mode: ClientMode,
        token: Option<String>,
        task_identifier: Option<String>,
        reply: oneshot::Sender<ClientMode>,
    },
    /// Controller keyboard input.
    Input { id: ConnId, data: Vec<u8> },
    /// Controller window resize.
    Resize { id: ConnId, cols: u16, rows: u16 },
    /// Client heartbeat; answered with `pong` on its queue.
    Heartbeat { id: ConnId },
    /// Connection went away.
    Detach { id: ConnId },
    /// Snapshot of the current session info.
    Info {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// Point-in-time view of the session, mirroring the `session-info`
/// wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub has_controller: bool,
    pub viewer_count: usize,
    pub active: bool,
    pub task_identifier: Option<String>,
}

/// Events flowing from bridge tasks back into the actor, tagged with the
/// epoch of the start attempt that produced them.
enum SessionEvent {
    Started { epoch: u64, bridge: BridgeHandle },
    StartFailed { epoch: u64, error: String },
    Output { epoch: u64, data: Vec<u8> },
    Closed { epoch: u64, reason: Option<String> },
}

/// Cloneable handle to the session actor.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Spawn the session actor.
    pub fn spawn(
        target: Arc<dyn TerminalTarget>,
        auth: ControllerAuth,
        max_history_bytes: usize,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let actor = SessionActor {
            target,
            auth,
            clients: HashMap::new(),
            controller: None,
            state: SessionState::Idle,
            task_identifier: None,
            history: HistoryBuffer::new(max_history_bytes),
            bridge: None,
            epoch: 0,
            pending_size: None,
            events: event_tx,
        };
        tokio::spawn(actor.run(command_rx, event_rx));
        Self {
            commands: command_tx,
        }
    }

    pub async fn register(&self, id: ConnId, sender: mpsc::Sender<ServerMessage>) {
        let _ = self
            .commands
            .send(SessionCommand::Register { id, sender })
            .await;
    }

    /// Run the connect handshake; returns the assigned role.
    pub async fn handshake(
        &self,
        id: ConnId,
        mode: ClientMode,
        token: Option<String>,
        task_identifier: Option<String>,
    ) -> TetherResult<ClientMode> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Handshake {
                id,
                mode,
                token,
                task_identifier,
                reply,
            })
            .await
            .map_err(|_| TetherError::Channel("session actor unavailable".into()))?;
        rx.await
            .map_err(|_| TetherError::Channel("session actor dropped handshake".into()))
    }

    pub async fn input(&self, id: ConnId, data: Vec<u8>) {
        let _ = self.commands.send(SessionCommand::Input { id, data }).await;
    }

    pub async fn resize(&self, id: ConnId, cols: u16, rows: u16) {
        let _ = self
            .commands
            .send(SessionCommand::Resize { id, cols, rows })
            .await;
    }

    pub async fn heartbeat(&self, id: ConnId) {
        let _ = self.commands.send(SessionCommand::Heartbeat { id }).await;
    }

    pub async fn detach(&self, id: ConnId) {
        let _ = self.commands.send(SessionCommand::Detach { id }).await;
    }

    /// Current session info, as broadcast to clients.
    pub async fn info(&self) -> TetherResult<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Info { reply })
            .await
            .map_err(|_| TetherError::Channel("session actor unavailable".into()))?;
        rx.await
            .map_err(|_| TetherError::Channel("session actor dropped info request".into()))
    }
}

struct ClientEntry {
    sender: mpsc::Sender<ServerMessage>,
    role: Role,
}

struct SessionActor {
    target: Arc<dyn TerminalTarget>,
    auth: ControllerAuth,
    clients: HashMap<ConnId, ClientEntry>,
    controller: Option<ConnId>,
    state: SessionState,
    task_identifier: Option<String>,
    history: HistoryBuffer,
    bridge: Option<BridgeHandle>,
    /// Bumped per bridge start attempt; events from older epochs are stale.
    epoch: u64,
    /// Last window size reported by a controller.
    pending_size: Option<(u16, u16)>,
    events: mpsc::Sender<SessionEvent>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut events: mpsc::Receiver<SessionEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    // All handles dropped: the server is shutting down.
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
        if let Some(bridge) = self.bridge.take() {
            bridge.shutdown();
        }
        debug!("session actor stopped");
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Register { id, sender } => {
                debug!(conn_id = id, "connection registered");
                self.clients.insert(
                    id,
                    ClientEntry {
                        sender,
                        role: Role::Unassigned,
                    },
                );
            }
            SessionCommand::Handshake {
                id,
                mode,
                token,
                task_identifier,
                reply,
            } => {
                let assigned = self.handshake(id, mode, token, task_identifier);
                let _ = reply.send(assigned);
            }
            SessionCommand::Input { id, data } => self.input(id, data),
            SessionCommand::Resize { id, cols, rows } => self.resize(id, cols, rows),
            SessionCommand::Heartbeat { id } => self.send_to(id, ServerMessage::Pong),
            SessionCommand::Detach { id } => self.detach(id),
            SessionCommand::Info { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Started { epoch, bridge } => {
                if epoch != self.epoch {
                    // A start that lost the race with teardown; don't leak it.
                    bridge.shutdown();
                    return;
                }
                self.state = SessionState::Active;
                if let Some((cols, rows)) = self.pending_size {
                    bridge.resize(cols, rows);
                }
                self.bridge = Some(bridge);
                info!(epoch, "terminal bridge active");
                self.broadcast(ServerMessage::Status {
                    status: SessionStatus::Connected,
                    message: None,
                });
                self.broadcast_session_info();
            }
            SessionEvent::StartFailed { epoch, error } => {
                if epoch != self.epoch {
                    return;
                }
                warn!(epoch, error = %error, "terminal bridge failed to start");
                self.teardown(Some(error));
            }
            SessionEvent::Output { epoch, data } => {
                if epoch != self.epoch || self.state != SessionState::Active {
                    return;
                }
                self.history.append(&data);
                self.broadcast(ServerMessage::Output {
                    data: String::from_utf8_lossy(&data).into_owned(),
                });
            }
            SessionEvent::Closed { epoch, reason } => {
                if epoch != self.epoch {
                    return;
                }
                info!(epoch, ?reason, "terminal bridge closed");
                self.teardown(reason);
            }
        }
    }

    /// Role assignment. A rejected controller request falls through to the
    /// viewer path, per the handshake contract.
    fn handshake(
        &mut self,
        id: ConnId,
        mode: ClientMode,
        token: Option<String>,
        task_identifier: Option<String>,
    ) -> ClientMode {
        if !self.clients.contains_key(&id) {
            warn!(conn_id = id, "handshake for unregistered connection");
            return ClientMode::Viewer;
        }

        let assigned = match mode {
            ClientMode::Controller => {
                if self.controller.is_some() {
                    info!(conn_id = id, "controller request rejected: slot occupied");
                    self.send_to(
                        id,
                        ServerMessage::Error {
                            code: ErrorCode::ControllerExists,
                            message: "another controller is connected".into(),
                        },
                    );
                    ClientMode::Viewer
                } else if !self.auth.validate(token.as_deref()) {
                    warn!(conn_id = id, "controller request rejected: bad token");
                    self.send_to(
                        id,
                        ServerMessage::Error {
                            code: ErrorCode::AuthFailed,
                            message: "invalid controller token".into(),
                        },
                    );
                    ClientMode::Viewer
                } else {
                    self.assign_controller(id, task_identifier);
                    ClientMode::Controller
                }
            }
            ClientMode::Viewer => ClientMode::Viewer,
        };

        if assigned == ClientMode::Viewer {
            self.assign_viewer(id);
        }
        self.broadcast_session_info();
        assigned
    }

    fn assign_controller(&mut self, id: ConnId, task_identifier: Option<String>) {
        if let Some(entry) = self.clients.get_mut(&id) {
            entry.role = Role::Controller;
        }
        self.controller = Some(id);
        if task_identifier.is_some() {
            self.task_identifier = task_identifier;
        }
        info!(conn_id = id, "controller attached");
        self.send_to(
            id,
            ServerMessage::Connected {
                mode: ClientMode::Controller,
            },
        );
        match self.state {
            SessionState::Idle => self.start_bridge(),
            SessionState::Active => {
                // Reattach to the live shell: bring the controller up to date.
                if !self.history.is_empty() {
                    let dump = self.history.dump();
                    self.send_to(
                        id,
                        ServerMessage::History {
                            data: String::from_utf8_lossy(&dump).into_owned(),
                        },
                    );
                }
            }
            SessionState::Starting => {}
        }
    }

    fn assign_viewer(&mut self, id: ConnId) {
        if let Some(entry) = self.clients.get_mut(&id) {
            entry.role = Role::Viewer;
        }
        let dump = self.history.dump();
        self.send_to(
            id,
            ServerMessage::History {
                data: String::from_utf8_lossy(&dump).into_owned(),
            },
        );
        self.send_to(
            id,
            ServerMessage::Connected {
                mode: ClientMode::Viewer,
            },
        );
        info!(conn_id = id, history_bytes = self.history.len(), "viewer attached");
    }

    /// Kick off an SSH/PTY start attempt without blocking the actor.
    ///
    /// The spawned task forwards bridge events back into the actor's event
    /// queue, tagged with this attempt's epoch.
    fn start_bridge(&mut self) {
        self.epoch += 1;
        let epoch = self.epoch;
        self.state = SessionState::Starting;
        self.broadcast(ServerMessage::Status {
            status: SessionStatus::Connecting,
            message: None,
        });

        let (cols, rows) = self.pending_size.unwrap_or((DEFAULT_COLS, DEFAULT_ROWS));
        let target = self.target.clone();
        let events = self.events.clone();
        info!(epoch, cols, rows, "starting terminal bridge");
        tokio::spawn(async move {
            let (bridge_tx, mut bridge_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
            match target.start(cols, rows, bridge_tx).await {
                Ok(bridge) => {
                    if events
                        .send(SessionEvent::Started { epoch, bridge })
                        .await
                        .is_err()
                    {
                        return;
                    }
                    while let Some(ev) = bridge_rx.recv().await {
                        let mapped = match ev {
                            BridgeEvent::Output(data) => SessionEvent::Output { epoch, data },
                            BridgeEvent::Closed { reason } => {
                                SessionEvent::Closed { epoch, reason }
                            }
                        };
                        if events.send(mapped).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = events
                        .send(SessionEvent::StartFailed {
                            epoch,
                            error: e.to_string(),
                        })
                        .await;
                }
            }
        });
    }

    /// The session ended: drop the bridge, clear session-scoped state, and
    /// tell everyone. The ex-controller connection stays attached as a
    /// viewer.
    fn teardown(&mut self, reason: Option<String>) {
        if let Some(bridge) = self.bridge.take() {
            bridge.shutdown();
        }
        self.state = SessionState::Idle;
        self.history.clear();
        self.task_identifier = None;
        if let Some(id) = self.controller.take() {
            if let Some(entry) = self.clients.get_mut(&id) {
                entry.role = Role::Viewer;
            }
        }
        let status = match reason {
            Some(message) => ServerMessage::Status {
                status: SessionStatus::Error,
                message: Some(message),
            },
            None => ServerMessage::Status {
                status: SessionStatus::Disconnected,
                message: None,
            },
        };
        self.broadcast(status);
        self.broadcast_session_info();
    }

    fn input(&mut self, id: ConnId, data: Vec<u8>) {
        if self.controller != Some(id) {
            debug!(conn_id = id, "ignoring input from non-controller");
            return;
        }
        if self.state != SessionState::Active {
            debug!(conn_id = id, "input while session not active, dropped");
            return;
        }
        if let Some(bridge) = &self.bridge {
            bridge.write(data);
        }
    }

    fn resize(&mut self, id: ConnId, cols: u16, rows: u16) {
        if self.controller != Some(id) {
            debug!(conn_id = id, "ignoring resize from non-controller");
            return;
        }
        if cols == 0 || rows == 0 {
            debug!(conn_id = id, cols, rows, "ignoring degenerate resize");
            return;
        }
        self.pending_size = Some((cols, rows));
        if self.state == SessionState::Active {
            if let Some(bridge) = &self.bridge {
                bridge.resize(cols, rows);
            }
        }
    }

    fn detach(&mut self, id: ConnId) {
        let Some(entry) = self.clients.remove(&id) else {
            return;
        };
        match entry.role {
            Role::Controller => {
                self.controller = None;
                info!(conn_id = id, "controller detached");
                // The PTY stays up; the next controller reattaches to it.
                self.broadcast(ServerMessage::ControllerLeft);
                self.broadcast_session_info();
            }
            Role::Viewer => {
                debug!(conn_id = id, "viewer detached");
                self.broadcast_session_info();
            }
            Role::Unassigned => {
                debug!(conn_id = id, "connection closed before handshake");
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            has_controller: self.controller.is_some(),
            viewer_count: self
                .clients
                .values()
                .filter(|c| c.role == Role::Viewer)
                .count(),
            active: self.state == SessionState::Active,
            task_identifier: self.task_identifier.clone(),
        }
    }

    fn broadcast_session_info(&mut self) {
        let snapshot = self.snapshot();
        self.broadcast(ServerMessage::SessionInfo {
            has_controller: snapshot.has_controller,
            viewer_count: snapshot.viewer_count,
            active: snapshot.active,
            task_identifier: snapshot.task_identifier,
        });
    }

    /// Send to every connection with an assigned role. A full or closed
    /// queue evicts that client rather than stalling the rest.
    fn broadcast(&mut self, message: ServerMessage) {
        let mut dead: Vec<ConnId> = Vec::new();
        for (id, entry) in &self.clients {
            if entry.role == Role::Unassigned {
                continue;
            }
            if entry.sender.try_send(message.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            warn!(conn_id = id, "outbound queue full or closed, evicting client");
            self.detach(id);
        }
    }

    fn send_to(&mut self, id: ConnId, message: ServerMessage) {
        let Some(entry) = self.clients.get(&id) else {
            return;
        };
        if entry.sender.try_send(message).is_err() {
            warn!(conn_id = id, "outbound queue full or closed, evicting client");
            self.detach(id);
        }
    }
}
