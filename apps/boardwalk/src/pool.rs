use std::collections::VecDeque;

use crate::protocol::{ConnectionId, Identity};

#[derive(Debug, Clone, PartialEq)]
pub struct WaitingEntry {
    pub connection_id: ConnectionId,
    pub identity: Identity,
}

/// Connections with no partner, oldest first.
///
/// The pool is small and scanned linearly; membership checks and removals
/// only happen on search, stop and teardown.
#[derive(Debug, Default)]
pub struct WaitingPool {
    entries: VecDeque<WaitingEntry>,
}

impl WaitingPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `connection_id` unless it is already waiting. Returns whether
    /// a new entry was added.
    pub fn enqueue(&mut self, connection_id: ConnectionId, identity: Identity) -> bool {
        if self.contains(connection_id) {
            return false;
        }
        self.entries.push_back(WaitingEntry {
            connection_id,
            identity,
        });
        true
    }

    pub fn dequeue_oldest(&mut self) -> Option<WaitingEntry> {
        self.entries.pop_front()
    }

    pub fn remove(&mut self, connection_id: ConnectionId) -> Option<WaitingEntry> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.connection_id == connection_id)?;
        self.entries.remove(index)
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.connection_id == connection_id)
    }

    /// Replaces the identity of an entry that is already waiting.
    pub fn refresh(&mut self, connection_id: ConnectionId, identity: Identity) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.connection_id == connection_id)
        {
            entry.identity = identity;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.entries.iter().map(|entry| entry.connection_id).collect()
    }
}
