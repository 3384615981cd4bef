use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::protocol::{ConnectionId, ServerMessage};

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerMessage),
    /// A client frame forwarded verbatim to its partner.
    Relay(String),
    /// Close the socket with the given reason.
    Close(&'static str),
}

/// Live connections and the channels their writer tasks drain.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<ConnectionId, ConnectionEntry>>,
}

struct ConnectionEntry {
    sender: mpsc::UnboundedSender<Outbound>,
    remote_addr: Option<SocketAddr>,
    connected_at: u64,
    last_activity: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: u64,
    pub last_activity: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        remote_addr: Option<SocketAddr>,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection_id = ConnectionId::generate();
        let now = now_millis();
        self.connections.insert(
            connection_id,
            ConnectionEntry {
                sender,
                remote_addr,
                connected_at: now,
                last_activity: AtomicU64::new(now),
            },
        );
        (connection_id, receiver)
    }

    /// Queues `message` for `connection_id`. Unknown or closed connections
    /// swallow the message; the return value says whether it was queued.
    pub fn send(&self, connection_id: ConnectionId, message: Outbound) -> bool {
        let Some(entry) = self.connections.get(&connection_id) else {
            return false;
        };
        entry.sender.send(message).is_ok()
    }

    pub fn unregister(&self, connection_id: ConnectionId) -> bool {
        self.connections.remove(&connection_id).is_some()
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.connections.contains_key(&connection_id)
    }

    pub fn touch(&self, connection_id: ConnectionId) {
        if let Some(entry) = self.connections.get(&connection_id) {
            entry.last_activity.store(now_millis(), Ordering::Relaxed);
        }
    }

    /// Connections whose last inbound activity is older than `timeout` at
    /// `now` (milliseconds since the Unix epoch).
    pub fn idle_since(&self, now: u64, timeout: Duration) -> Vec<ConnectionId> {
        let timeout = timeout.as_millis() as u64;
        self.connections
            .iter()
            .filter(|entry| {
                now.saturating_sub(entry.last_activity.load(Ordering::Relaxed)) > timeout
            })
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn info(&self, connection_id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(&connection_id).map(|entry| ConnectionInfo {
            connection_id,
            remote_addr: entry.remote_addr,
            connected_at: entry.connected_at,
            last_activity: entry.last_activity.load(Ordering::Relaxed),
        })
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
