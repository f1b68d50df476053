//! WebSocket session server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                  ┌──► outbox A ──► Client A
//! Client B ──┼── conn task ── HubCommand ──► SessionHub ──► outbox B ──► Client B
//! Client C ──┘   (select!)                      └──► outbox C ──► Client C
//!                                                   │
//!                                                   └── DurableStore (RocksDB, optional)
//! ```
//!
//! Each connection task decodes JSON text frames into [`ClientEvent`]s and
//! forwards them to the hub, while draining its own outbox to the socket.
//! When the socket closes, the task sends `Disconnect` after every event it
//! forwarded, so the hub sees the connection's events in order.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{AtomicBroadcastStats, Frame};
use crate::history::{HistoryLimits, CHAT_HISTORY_LIMIT, STROKE_HISTORY_LIMIT};
use crate::hub::{AtomicHubStats, HubCommand, HubConfig, SessionHub};
use crate::presence::DEFAULT_MAX_PARTICIPANTS;
use crate::protocol::{ClientEvent, ConnectionId};
use crate::storage::{DurableStore, RoomStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Participant cap for rooms without a durable record
    pub max_participants: usize,
    /// Frames buffered per connection before new ones are dropped
    pub outbox_capacity: usize,
    /// Commands buffered in front of the hub
    pub hub_queue_capacity: usize,
    /// RocksDB path (None = in-memory history only)
    pub storage_path: Option<PathBuf>,
    /// Refuse joins for codes that have no durable record
    pub strict_rooms: bool,
    pub chat_history_limit: usize,
    pub stroke_history_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            outbox_capacity: 256,
            hub_queue_capacity: 1024,
            storage_path: None,
            strict_rooms: false,
            chat_history_limit: CHAT_HISTORY_LIMIT,
            stroke_history_limit: STROKE_HISTORY_LIMIT,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `COWORK_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`. Unparseable values are
    /// ignored with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(addr) = lookup("COWORK_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("COWORK_STORAGE_PATH").filter(|p| !p.is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        parse_into(&lookup, "COWORK_MAX_PARTICIPANTS", &mut config.max_participants);
        parse_into(&lookup, "COWORK_OUTBOX_CAPACITY", &mut config.outbox_capacity);
        parse_into(&lookup, "COWORK_HUB_QUEUE_CAPACITY", &mut config.hub_queue_capacity);
        parse_into(&lookup, "COWORK_STRICT_ROOMS", &mut config.strict_rooms);
        parse_into(&lookup, "COWORK_CHAT_HISTORY_LIMIT", &mut config.chat_history_limit);
        parse_into(&lookup, "COWORK_STROKE_HISTORY_LIMIT", &mut config.stroke_history_limit);
        config
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            default_max_participants: self.max_participants,
            strict_rooms: self.strict_rooms,
            limits: HistoryLimits {
                chat: self.chat_history_limit,
                strokes: self.stroke_history_limit,
            },
        }
    }
}

fn parse_into<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => log::warn!("Ignoring invalid {}={:?}", key, raw),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Session hub is gone")]
    HubClosed,
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub events_handled: u64,
    pub events_rejected: u64,
    pub active_rooms: u64,
    pub durable_writes: u64,
    pub fallback_writes: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
}

#[derive(Debug, Default)]
struct ConnectionCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
    malformed_frames: AtomicU64,
}

/// Cloneable view of a server's counters, usable while it runs.
#[derive(Clone)]
pub struct StatsHandle {
    connections: Arc<ConnectionCounters>,
    hub: Arc<AtomicHubStats>,
    broadcast: Arc<AtomicBroadcastStats>,
}

impl StatsHandle {
    pub fn snapshot(&self) -> ServerStats {
        let hub = self.hub.snapshot();
        let broadcast = self.broadcast.snapshot();
        ServerStats {
            total_connections: self.connections.total_connections.load(Ordering::Relaxed),
            active_connections: self.connections.active_connections.load(Ordering::Relaxed),
            frames_received: self.connections.frames_received.load(Ordering::Relaxed),
            malformed_frames: self.connections.malformed_frames.load(Ordering::Relaxed),
            events_handled: hub.events_handled,
            events_rejected: hub.events_rejected,
            active_rooms: hub.active_rooms,
            durable_writes: hub.durable_writes,
            fallback_writes: hub.fallback_writes,
            frames_delivered: broadcast.frames_delivered,
            frames_dropped: broadcast.frames_dropped,
        }
    }
}

/// The session server.
pub struct SessionServer {
    config: ServerConfig,
    hub: SessionHub,
    store: Option<Arc<dyn DurableStore>>,
    counters: Arc<ConnectionCounters>,
}

impl SessionServer {
    /// Create a server, opening the RocksDB store if a path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Some(Arc::new(RoomStore::open(store_config)?) as Arc<dyn DurableStore>)
            }
            None => None,
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server backed by an existing store.
    pub fn with_store(config: ServerConfig, store: Option<Arc<dyn DurableStore>>) -> Self {
        let hub = SessionHub::new(config.hub_config(), store.clone());
        Self {
            config,
            hub,
            store,
            counters: Arc::new(ConnectionCounters::default()),
        }
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), None)
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn store(&self) -> Option<&Arc<dyn DurableStore>> {
        self.store.as_ref()
    }

    pub fn stats_handle(&self) -> StatsHandle {
        StatsHandle {
            connections: self.counters.clone(),
            hub: self.hub.stats_handle(),
            broadcast: self.hub.broadcast_stats_handle(),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Session server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let Self {
            config,
            hub,
            counters,
            ..
        } = self;

        let (hub_tx, hub_rx) = mpsc::channel(config.hub_queue_capacity.max(1));
        tokio::spawn(hub.run(hub_rx));

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub_tx = hub_tx.clone();
            let counters = counters.clone();
            let outbox_capacity = config.outbox_capacity.max(1);

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, addr, hub_tx, outbox_capacity, counters).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Drive one WebSocket connection until it closes.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: mpsc::Sender<HubCommand>,
    outbox_capacity: usize,
    counters: Arc<ConnectionCounters>,
) -> Result<(), ServerError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let id = ConnectionId::new();
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<Frame>(outbox_capacity);
    hub.send(HubCommand::Connect { id, outbox: outbox_tx })
        .await
        .map_err(|_| ServerError::HubClosed)?;

    counters.total_connections.fetch_add(1, Ordering::Relaxed);
    counters.active_connections.fetch_add(1, Ordering::Relaxed);
    log::info!("WebSocket connection {id} established from {addr}");

    let result = pump(id, addr, &hub, &mut ws_sender, &mut ws_receiver, &mut outbox_rx, &counters).await;

    counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    if hub.send(HubCommand::Disconnect { id }).await.is_err() {
        log::warn!("Hub gone before disconnect of {id}");
    }
    log::info!("Connection {id} from {addr} closed");
    result
}

async fn pump<S, R>(
    id: ConnectionId,
    addr: SocketAddr,
    hub: &mpsc::Sender<HubCommand>,
    ws_sender: &mut S,
    ws_receiver: &mut R,
    outbox: &mut mpsc::Receiver<Frame>,
    counters: &ConnectionCounters,
) -> Result<(), ServerError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        counters.frames_received.fetch_add(1, Ordering::Relaxed);
                        match ClientEvent::decode(text.as_str()) {
                            Ok(event) => {
                                hub.send(HubCommand::Event { id, event })
                                    .await
                                    .map_err(|_| ServerError::HubClosed)?;
                            }
                            Err(e) => {
                                counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
                                log::warn!("Dropping frame from {addr}: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Dropping binary frame from {addr}");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                }
            }
            frame = outbox.recv() => {
                match frame {
                    Some(frame) => ws_sender.send(Message::text(frame.to_string())).await?,
                    // Hub dropped the outbox: the connection was unregistered.
                    None => return Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_participants, 10);
        assert_eq!(config.outbox_capacity, 256);
        assert_eq!(config.chat_history_limit, 500);
        assert_eq!(config.stroke_history_limit, 10_000);
        assert!(config.storage_path.is_none());
        assert!(!config.strict_rooms);
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("COWORK_BIND_ADDR", "0.0.0.0:8080"),
            ("COWORK_MAX_PARTICIPANTS", "4"),
            ("COWORK_STRICT_ROOMS", "true"),
            ("COWORK_STORAGE_PATH", "/var/lib/cowork"),
            ("COWORK_OUTBOX_CAPACITY", "lots"),
        ]
        .into_iter()
        .collect();

        let config = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.max_participants, 4);
        assert!(config.strict_rooms);
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/cowork")));
        // Invalid values keep the default.
        assert_eq!(config.outbox_capacity, 256);
    }

    #[test]
    fn test_hub_config_mirrors_server_config() {
        let config = ServerConfig {
            max_participants: 3,
            chat_history_limit: 7,
            ..ServerConfig::default()
        };
        let hub = config.hub_config();
        assert_eq!(hub.default_max_participants, 3);
        assert_eq!(hub.limits.chat, 7);
        assert_eq!(hub.limits.strokes, STROKE_HISTORY_LIMIT);
    }

    #[test]
    fn test_server_creation() {
        let server = SessionServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(server.store().is_none());
        assert_eq!(server.stats_handle().snapshot(), ServerStats::default());
    }

    #[test]
    fn test_server_with_storage_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = SessionServer::new(config).unwrap();
        assert!(server.store().is_some());
    }
}
