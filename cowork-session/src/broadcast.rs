//! Event fan-out with per-connection bounded outboxes.
//!
//! Each connection owns one bounded mpsc outbox. An event is encoded once
//! and the shared frame is pushed into every target outbox with `try_send`,
//! so a slow consumer never stalls the hub: when its outbox is full the
//! frame is dropped for that consumer and counted.
//!
//! Audience is decided by [`ServerEvent::delivery`]:
//!
//! | Delivery        | Targets                         |
//! |-----------------|---------------------------------|
//! | `ExcludeSender` | room members except the origin  |
//! | `IncludeSender` | all room members                |
//! | `Direct`        | one connection via `send_to`    |

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::protocol::{ConnectionId, Delivery, ServerEvent};

/// An encoded text frame shared between all recipients.
pub type Frame = Arc<str>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub active_connections: usize,
}

/// Lock-free counters shared with whoever reports stats.
#[derive(Debug, Default)]
pub struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
    active_connections: AtomicU64,
}

impl AtomicBroadcastStats {
    pub fn snapshot(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed) as usize,
        }
    }
}

/// Delivers server events to connection outboxes.
pub struct Broadcaster {
    outboxes: HashMap<ConnectionId, mpsc::Sender<Frame>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            outboxes: HashMap::new(),
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Register a connection's outbox. Replaces any previous outbox.
    pub fn register(&mut self, id: ConnectionId, outbox: mpsc::Sender<Frame>) {
        if self.outboxes.insert(id, outbox).is_none() {
            self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn unregister(&mut self, id: ConnectionId) -> bool {
        let removed = self.outboxes.remove(&id).is_some();
        if removed {
            self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.outboxes.contains_key(&id)
    }

    /// Deliver a room-scoped event to `members` according to its delivery
    /// class. Returns the number of outboxes that accepted the frame.
    ///
    /// `Direct` events are never fanned out; use [`Broadcaster::send_to`].
    pub fn publish(&self, members: &[ConnectionId], origin: ConnectionId, event: &ServerEvent) -> usize {
        let include_origin = match event.delivery() {
            Delivery::ExcludeSender => false,
            Delivery::IncludeSender => true,
            Delivery::Direct => {
                log::warn!("Refusing to fan out direct event {}", event.name());
                return 0;
            }
        };

        let Some(frame) = self.encode(event) else {
            return 0;
        };

        members
            .iter()
            .filter(|id| include_origin || **id != origin)
            .map(|id| self.push(*id, frame.clone()))
            .filter(|sent| *sent)
            .count()
    }

    /// Deliver an event to exactly one connection.
    pub fn send_to(&self, id: ConnectionId, event: &ServerEvent) -> bool {
        match self.encode(event) {
            Some(frame) => self.push(id, frame),
            None => false,
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats.snapshot()
    }

    /// Shared counters, readable without access to the broadcaster itself.
    pub fn stats_handle(&self) -> Arc<AtomicBroadcastStats> {
        self.stats.clone()
    }

    fn encode(&self, event: &ServerEvent) -> Option<Frame> {
        match event.encode() {
            Ok(text) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                Some(Arc::from(text))
            }
            Err(e) => {
                log::error!("Failed to encode {}: {}", event.name(), e);
                None
            }
        }
    }

    fn push(&self, id: ConnectionId, frame: Frame) -> bool {
        let Some(outbox) = self.outboxes.get(&id) else {
            log::trace!("No outbox for {}", id);
            return false;
        };
        match outbox.try_send(frame) {
            Ok(()) => {
                self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Outbox full for {}, dropping frame", id);
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Outbox closed for {}", id);
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(broadcaster: &mut Broadcaster, capacity: usize) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(capacity);
        broadcaster.register(id, tx);
        (id, rx)
    }

    #[test]
    fn test_exclude_sender() {
        let mut b = Broadcaster::new();
        let (a, mut rx_a) = connect(&mut b, 8);
        let (c, mut rx_c) = connect(&mut b, 8);

        let event = ServerEvent::WhiteboardCursor {
            participant_id: a,
            x: 1.0,
            y: 2.0,
        };
        assert_eq!(b.publish(&[a, c], a, &event), 1);
        assert!(rx_a.try_recv().is_err());
        let frame = rx_c.try_recv().unwrap();
        assert!(frame.contains("whiteboard:cursor"));
    }

    #[test]
    fn test_include_sender() {
        let mut b = Broadcaster::new();
        let (a, mut rx_a) = connect(&mut b, 8);
        let (c, mut rx_c) = connect(&mut b, 8);

        assert_eq!(b.publish(&[a, c], a, &ServerEvent::WhiteboardUndo), 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());
    }

    #[test]
    fn test_direct_events_not_fanned_out() {
        let mut b = Broadcaster::new();
        let (a, mut rx_a) = connect(&mut b, 8);
        let (c, mut rx_c) = connect(&mut b, 8);

        let event = ServerEvent::ChatHistory(Vec::new());
        assert_eq!(b.publish(&[a, c], a, &event), 0);
        assert!(b.send_to(c, &event));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_ok());
    }

    #[test]
    fn test_full_outbox_drops_and_counts() {
        let mut b = Broadcaster::new();
        let (a, _rx_a) = connect(&mut b, 1);

        assert!(b.send_to(a, &ServerEvent::WhiteboardClear));
        assert!(!b.send_to(a, &ServerEvent::WhiteboardClear));

        let stats = b.stats();
        assert_eq!(stats.frames_delivered, 1);
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.active_connections, 1);
    }

    #[test]
    fn test_unregister() {
        let mut b = Broadcaster::new();
        let (a, _rx) = connect(&mut b, 4);
        assert!(b.is_connected(a));
        assert!(b.unregister(a));
        assert!(!b.unregister(a));
        assert!(!b.send_to(a, &ServerEvent::WhiteboardUndo));
        assert_eq!(b.stats().active_connections, 0);
    }
}
