//! Pairing state machine.
//!
//! The waiting pool, the partnership table, the set of live connections and
//! the last identity each connection searched with live behind one mutex. Every operation runs as a
//! single critical section and returns the messages it wants sent; the caller
//! delivers them after the lock is released, so no socket write ever happens
//! while the lobby is held.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::partners::{PartnershipError, PartnershipTable};
use crate::pool::WaitingPool;
use crate::protocol::{ConnectionId, Identity, MatchedEvent, MatchedPeer, ServerMessage};

/// A message the matchmaker wants delivered once the lobby is unlocked.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: ConnectionId,
    pub message: ServerMessage,
}

impl Delivery {
    fn new(to: ConnectionId, message: ServerMessage) -> Self {
        Self { to, message }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Searching,
    Paired(ConnectionId),
}

/// Where a negotiation message from a connection should go.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayRoute {
    Forward(ConnectionId),
    NotPaired,
    /// The partnership was found inconsistent and has been torn down.
    Broken(Vec<Delivery>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LobbySnapshot {
    pub waiting: Vec<ConnectionId>,
    pub partnerships: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LobbyCounts {
    pub waiting: usize,
    pub partnerships: usize,
}

struct Lobby {
    pool: WaitingPool,
    partners: PartnershipTable,
    identities: HashMap<ConnectionId, Identity>,
    /// Connections between `on_connect` and `on_disconnect`. Anything else
    /// may not enter the pool.
    live: HashSet<ConnectionId>,
}

pub struct Matchmaker {
    lobby: Mutex<Lobby>,
    matched_event: MatchedEvent,
}

impl Matchmaker {
    pub fn new(matched_event: MatchedEvent) -> Self {
        Self {
            lobby: Mutex::new(Lobby {
                pool: WaitingPool::new(),
                partners: PartnershipTable::new(),
                identities: HashMap::new(),
                live: HashSet::new(),
            }),
            matched_event,
        }
    }

    pub fn on_connect(&self, id: ConnectionId) {
        self.lobby.lock().live.insert(id);
    }

    pub fn on_search(&self, id: ConnectionId, identity: Identity) -> Vec<Delivery> {
        let mut lobby = self.lobby.lock();
        let mut deliveries = Vec::new();
        lobby.search(id, identity, self.matched_event, &mut deliveries);
        deliveries
    }

    pub fn on_stop_search(&self, id: ConnectionId) -> bool {
        let removed = self.lobby.lock().pool.remove(id).is_some();
        if removed {
            debug!(connection_id = %id, "left waiting pool");
        }
        removed
    }

    /// Drops the current partner (if any) and searches again with the last
    /// identity this connection searched with, falling back to `fallback`.
    pub fn on_skip(&self, id: ConnectionId, fallback: Identity) -> Vec<Delivery> {
        let mut lobby = self.lobby.lock();
        let mut deliveries = Vec::new();
        if !lobby.live.contains(&id) {
            debug!(connection_id = %id, "skip from departed connection ignored");
            return deliveries;
        }
        if let Some(partner) = lobby.dissolve(id, &mut deliveries) {
            debug!(connection_id = %id, partner_id = %partner, "skipped partner");
        }
        let identity = lobby.identities.get(&id).cloned().unwrap_or(fallback);
        lobby.search(id, identity, self.matched_event, &mut deliveries);
        deliveries
    }

    /// Removes every trace of `id`. The surviving partner, if any, is told to
    /// move on; `id` itself receives nothing.
    pub fn on_disconnect(&self, id: ConnectionId) -> Vec<Delivery> {
        let mut lobby = self.lobby.lock();
        let mut deliveries = Vec::new();
        lobby.live.remove(&id);
        lobby.pool.remove(id);
        lobby.identities.remove(&id);
        lobby.dissolve(id, &mut deliveries);
        deliveries.retain(|delivery| delivery.to != id);
        deliveries
    }

    pub fn route_relay(&self, id: ConnectionId) -> RelayRoute {
        let mut lobby = self.lobby.lock();
        match lobby.partners.partner_of(id) {
            Ok(Some(partner)) => RelayRoute::Forward(partner),
            Ok(None) => RelayRoute::NotPaired,
            Err(err) => {
                let mut deliveries = Vec::new();
                lobby.force_teardown(id, err, &mut deliveries);
                RelayRoute::Broken(deliveries)
            }
        }
    }

    pub fn state(&self, id: ConnectionId) -> PeerState {
        let lobby = self.lobby.lock();
        match lobby.partners.partner_of(id) {
            Ok(Some(partner)) => PeerState::Paired(partner),
            _ if lobby.pool.contains(id) => PeerState::Searching,
            _ => PeerState::Idle,
        }
    }

    pub fn snapshot(&self) -> LobbySnapshot {
        let lobby = self.lobby.lock();
        LobbySnapshot {
            waiting: lobby.pool.ids(),
            partnerships: lobby.partners.len(),
        }
    }

    pub fn counts(&self) -> LobbyCounts {
        let lobby = self.lobby.lock();
        LobbyCounts {
            waiting: lobby.pool.len(),
            partnerships: lobby.partners.len(),
        }
    }

    /// Verifies pool/table exclusivity and table symmetry.
    pub fn check_invariants(&self) -> Result<(), String> {
        let lobby = self.lobby.lock();
        lobby
            .partners
            .check_symmetry()
            .map_err(|err| err.to_string())?;
        for id in lobby.pool.ids() {
            if lobby.partners.contains(id) {
                return Err(format!("connection {id} is both waiting and paired"));
            }
            if !lobby.live.contains(&id) {
                return Err(format!("connection {id} is waiting after disconnect"));
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn corrupt_link(&self, from: ConnectionId, to: ConnectionId) {
        self.lobby.lock().partners.insert_directed(from, to);
    }
}

impl Lobby {
    fn search(
        &mut self,
        id: ConnectionId,
        identity: Identity,
        matched_event: MatchedEvent,
        deliveries: &mut Vec<Delivery>,
    ) {
        if !self.live.contains(&id) {
            debug!(connection_id = %id, "search from departed connection ignored");
            return;
        }
        if self.partners.contains(id) {
            debug!(connection_id = %id, "search ignored while paired");
            return;
        }
        self.identities.insert(id, identity.clone());
        if self.pool.contains(id) {
            self.pool.refresh(id, identity);
            debug!(connection_id = %id, "duplicate search ignored");
            return;
        }

        let Some(waiting) = self.pool.dequeue_oldest() else {
            self.pool.enqueue(id, identity);
            deliveries.push(Delivery::new(id, ServerMessage::Searching));
            return;
        };

        if let Err(err) = self.partners.link(id, waiting.connection_id) {
            // `id` was checked above, so the waiting entry is the corrupt side.
            self.force_teardown(waiting.connection_id, err, deliveries);
            self.pool.enqueue(id, identity);
            deliveries.push(Delivery::new(id, ServerMessage::Searching));
            return;
        }

        debug!(
            initiator = %id,
            responder = %waiting.connection_id,
            "paired connections"
        );
        deliveries.push(Delivery::new(
            id,
            matched_event.message(MatchedPeer::new(&waiting.identity, true)),
        ));
        deliveries.push(Delivery::new(
            waiting.connection_id,
            matched_event.message(MatchedPeer::new(&identity, false)),
        ));
    }

    /// Unlinks `id` from its partner and notifies the partner. Returns the
    /// former partner.
    fn dissolve(
        &mut self,
        id: ConnectionId,
        deliveries: &mut Vec<Delivery>,
    ) -> Option<ConnectionId> {
        match self.partners.unlink(id) {
            Ok(Some(partner)) => {
                deliveries.push(Delivery::new(partner, ServerMessage::SkipToNext));
                Some(partner)
            }
            Ok(None) => None,
            Err(err) => {
                self.force_teardown(id, err, deliveries);
                None
            }
        }
    }

    fn force_teardown(
        &mut self,
        id: ConnectionId,
        err: PartnershipError,
        deliveries: &mut Vec<Delivery>,
    ) {
        error!(
            connection_id = %id,
            error = %err,
            "partnership table inconsistent; tearing down"
        );
        let affected = self.partners.force_remove(id);
        for target in std::iter::once(id).chain(affected) {
            deliveries.push(Delivery::new(target, ServerMessage::SkipToNext));
        }
    }
}
