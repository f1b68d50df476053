//! WebSocket session client.
//!
//! Provides:
//! - Connection lifecycle with exponential-backoff reconnect
//! - Explicit room re-join after every reconnect (the server keeps no
//!   memory of a dropped connection's rooms)
//! - Status change and server event delivery over one channel
//! - Project snapshot bootstrap for an empty workspace
//!
//! ```text
//!  app ──send()──► outgoing ──► supervisor task ──► WebSocket
//!  app ◄─events()─ SessionEvent ◄──────┘  (reads, reconnects, re-joins)
//! ```

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{ClientEvent, ConnectionId, ProtocolError, RoomId, ServerEvent};
use crate::reconcile::{ClientStore, ConnectionStatus};
use crate::snapshot::{answer_request, SnapshotError, SnapshotSync, Workspace, DEFAULT_SNAPSHOT_TIMEOUT};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// Reconnect attempts after a transport drop before giving up
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubles each attempt
    pub backoff_min: Duration,
    /// Upper bound on the reconnect delay
    pub backoff_max: Duration,
    /// How long an empty workspace waits for a snapshot
    pub snapshot_timeout: Duration,
    /// Buffered events for the application
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            max_reconnect_attempts: 10,
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(5),
            snapshot_timeout: DEFAULT_SNAPSHOT_TIMEOUT,
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff_min
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("Not in a room")]
    NotInRoom,
    #[error("Connection closed")]
    Closed,
}

/// What the client reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged(ConnectionStatus),
    Server(ServerEvent),
}

#[derive(Debug, Clone)]
struct RoomMembership {
    room_id: RoomId,
    user_name: Option<String>,
}

/// State shared between the handle and the supervisor task.
struct Shared {
    status: RwLock<ConnectionStatus>,
    room: RwLock<Option<RoomMembership>>,
    events: mpsc::Sender<SessionEvent>,
}

impl Shared {
    async fn set_status(&self, status: ConnectionStatus) {
        {
            let mut current = self.status.write().await;
            if *current == status {
                return;
            }
            *current = status.clone();
        }
        log::debug!("Client status: {:?}", status);
        let _ = self.events.send(SessionEvent::StatusChanged(status)).await;
    }
}

/// The session client.
pub struct SessionClient {
    config: ClientConfig,
    shared: Arc<Shared>,
    outgoing_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    supervisor: JoinHandle<()>,
}

impl SessionClient {
    /// Connect to the server. A failed first connect is fatal.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let shared = Arc::new(Shared {
            status: RwLock::new(ConnectionStatus::Disconnected),
            room: RwLock::new(None),
            events: event_tx,
        });

        let socket = match tokio_tungstenite::connect_async(config.server_url.as_str()).await {
            Ok((socket, _)) => socket,
            Err(e) => {
                let reason = e.to_string();
                shared.set_status(ConnectionStatus::Error(reason.clone())).await;
                return Err(ClientError::Connect {
                    url: config.server_url.clone(),
                    reason,
                });
            }
        };
        log::info!("Connected to {}", config.server_url);
        shared.set_status(ConnectionStatus::Connected).await;

        let (outgoing_tx, outgoing_rx) = mpsc::channel(256);
        let supervisor = tokio::spawn(supervise(config.clone(), shared.clone(), socket, outgoing_rx));

        Ok(Self {
            config,
            shared,
            outgoing_tx,
            event_rx: Some(event_rx),
            supervisor,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.shared.status.read().await.clone()
    }

    /// Room this client joined last, if it has not left it.
    pub async fn room_id(&self) -> Option<RoomId> {
        self.shared.room.read().await.as_ref().map(|m| m.room_id.clone())
    }

    /// Send any client event.
    pub async fn send(&self, event: ClientEvent) -> Result<(), ClientError> {
        event.validate()?;
        self.outgoing_tx
            .send(event)
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Join a room and ask for its chat history. The room is remembered and
    /// re-joined after every reconnect.
    pub async fn join_room(
        &self,
        room_id: impl Into<RoomId>,
        user_name: Option<String>,
    ) -> Result<(), ClientError> {
        let membership = RoomMembership {
            room_id: room_id.into(),
            user_name,
        };
        for event in join_events(&membership) {
            self.send(event).await?;
        }
        *self.shared.room.write().await = Some(membership);
        Ok(())
    }

    pub async fn leave_room(&self) -> Result<(), ClientError> {
        let membership = self.shared.room.write().await.take().ok_or(ClientError::NotInRoom)?;
        self.send(ClientEvent::RoomLeave {
            room_id: membership.room_id,
        })
        .await
    }

    /// Answer a peer's snapshot request if `workspace` has files.
    pub async fn respond_to_sync<W: Workspace>(
        &self,
        requester: ConnectionId,
        workspace: &W,
    ) -> Result<bool, ClientError> {
        let room_id = self.room_id().await.ok_or(ClientError::NotInRoom)?;
        match answer_request(&room_id, requester, workspace)? {
            Some(event) => {
                self.send(event).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Populate an empty workspace from a peer.
    ///
    /// Sends a snapshot request if `workspace` is empty and waits for the
    /// first response, folding any other events into `store` meanwhile.
    /// Returns `Ok(false)` when the workspace already had files.
    pub async fn bootstrap_workspace<W: Workspace>(
        &self,
        events: &mut mpsc::Receiver<SessionEvent>,
        store: &mut ClientStore,
        workspace: &mut W,
    ) -> Result<bool, ClientError> {
        let room_id = self.room_id().await.ok_or(ClientError::NotInRoom)?;
        let mut sync = SnapshotSync::new(self.config.snapshot_timeout);
        let Some(request) = sync.begin(&room_id, workspace.is_empty()?, Instant::now()) else {
            return Ok(false);
        };
        self.send(request).await?;

        loop {
            let remaining = sync.remaining(Instant::now()).unwrap_or_default();
            let next = match tokio::time::timeout(remaining, events.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    sync.poll(Instant::now())?;
                    continue;
                }
            };
            match next {
                Some(SessionEvent::Server(ServerEvent::ProjectSyncData { files })) => {
                    sync.receive(&files, workspace)?;
                    log::info!("Workspace populated with {} files", files.file_count());
                    return Ok(true);
                }
                Some(SessionEvent::Server(event)) => store.apply(&event),
                Some(SessionEvent::StatusChanged(status)) => {
                    store.set_status(status);
                }
                None => return Err(ClientError::Closed),
            }
        }
    }

    /// Close the connection and wait for the supervisor to finish.
    pub async fn disconnect(self) {
        let Self {
            outgoing_tx,
            supervisor,
            ..
        } = self;
        drop(outgoing_tx);
        if let Err(e) = supervisor.await {
            log::warn!("Client supervisor ended abnormally: {e}");
        }
    }
}

fn join_events(membership: &RoomMembership) -> [ClientEvent; 2] {
    [
        ClientEvent::RoomJoin {
            room_id: membership.room_id.clone(),
            user_name: membership.user_name.clone(),
        },
        ClientEvent::ChatGetHistory {
            room_id: membership.room_id.clone(),
        },
    ]
}

// ───────────────────────────────────────────────────────────────────
// Supervisor
// ───────────────────────────────────────────────────────────────────

enum SessionEnd {
    /// The application dropped the client.
    Local,
    /// The transport went away.
    Dropped,
}

async fn supervise(
    config: ClientConfig,
    shared: Arc<Shared>,
    mut socket: Socket,
    mut outgoing: mpsc::Receiver<ClientEvent>,
) {
    loop {
        match drive(&mut socket, &mut outgoing, &shared).await {
            SessionEnd::Local => {
                let _ = socket.close(None).await;
                shared.set_status(ConnectionStatus::Disconnected).await;
                return;
            }
            SessionEnd::Dropped => log::warn!("Connection to {} lost", config.server_url),
        }

        match reconnect(&config, &shared).await {
            Some(fresh) => socket = fresh,
            None => {
                shared
                    .set_status(ConnectionStatus::Error(format!(
                        "gave up after {} reconnect attempts",
                        config.max_reconnect_attempts
                    )))
                    .await;
                return;
            }
        }

        // Re-join before anything queued while we were away.
        let membership = shared.room.read().await.clone();
        if let Some(membership) = membership {
            log::info!("Re-joining room {}", membership.room_id);
            for event in join_events(&membership) {
                if let Err(e) = send_event(&mut socket, &event).await {
                    log::warn!("Re-join of {} failed: {e}", membership.room_id);
                    break;
                }
            }
        }
    }
}

async fn drive(
    socket: &mut Socket,
    outgoing: &mut mpsc::Receiver<ClientEvent>,
    shared: &Shared,
) -> SessionEnd {
    loop {
        tokio::select! {
            msg = socket.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            log::trace!("Received {}", event.name());
                            let _ = shared.events.send(SessionEvent::Server(event)).await;
                        }
                        Err(e) => log::warn!("Dropping server frame: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {e}");
                        return SessionEnd::Dropped;
                    }
                    Some(Ok(_)) => {}
                }
            }
            event = outgoing.recv() => {
                match event {
                    Some(event) => {
                        if let Err(e) = send_event(socket, &event).await {
                            log::warn!("Send of {} failed: {e}", event.name());
                            return SessionEnd::Dropped;
                        }
                    }
                    None => return SessionEnd::Local,
                }
            }
        }
    }
}

async fn send_event(socket: &mut Socket, event: &ClientEvent) -> Result<(), ClientError> {
    let text = event.encode()?;
    socket
        .send(Message::text(text))
        .await
        .map_err(|_| ClientError::Closed)
}

async fn reconnect(config: &ClientConfig, shared: &Shared) -> Option<Socket> {
    for attempt in 1..=config.max_reconnect_attempts {
        shared.set_status(ConnectionStatus::Reconnecting { attempt }).await;
        tokio::time::sleep(config.backoff(attempt)).await;

        match tokio_tungstenite::connect_async(config.server_url.as_str()).await {
            Ok((socket, _)) => {
                log::info!("Reconnected to {} on attempt {}", config.server_url, attempt);
                shared.set_status(ConnectionStatus::Connected).await;
                return Some(socket);
            }
            Err(e) => log::debug!("Reconnect attempt {} failed: {e}", attempt),
        }
    }
    None
}
