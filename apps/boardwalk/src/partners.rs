use std::collections::HashMap;

use thiserror::Error;

use crate::protocol::ConnectionId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartnershipError {
    #[error("connection {0} cannot partner with itself")]
    SelfPairing(ConnectionId),
    #[error("connection {0} is already paired")]
    AlreadyPaired(ConnectionId),
    #[error("partnership {id} -> {partner} has reverse entry {reverse:?}")]
    Asymmetric {
        id: ConnectionId,
        partner: ConnectionId,
        reverse: Option<ConnectionId>,
    },
}

/// Symmetric pairing table stored as two directed entries.
///
/// Both directions are written and removed by the same call, so the table is
/// symmetric whenever the caller's lock is released.
#[derive(Debug, Default)]
pub struct PartnershipTable {
    links: HashMap<ConnectionId, ConnectionId>,
}

impl PartnershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&mut self, a: ConnectionId, b: ConnectionId) -> Result<(), PartnershipError> {
        if a == b {
            return Err(PartnershipError::SelfPairing(a));
        }
        for id in [a, b] {
            if self.links.contains_key(&id) {
                return Err(PartnershipError::AlreadyPaired(id));
            }
        }
        self.links.insert(a, b);
        self.links.insert(b, a);
        Ok(())
    }

    /// Looks up the partner of `id`, verifying the reverse direction.
    pub fn partner_of(&self, id: ConnectionId) -> Result<Option<ConnectionId>, PartnershipError> {
        let Some(&partner) = self.links.get(&id) else {
            return Ok(None);
        };
        match self.links.get(&partner) {
            Some(&reverse) if reverse == id => Ok(Some(partner)),
            reverse => Err(PartnershipError::Asymmetric {
                id,
                partner,
                reverse: reverse.copied(),
            }),
        }
    }

    /// Dissolves the partnership containing `id`, returning the former
    /// partner.
    pub fn unlink(&mut self, id: ConnectionId) -> Result<Option<ConnectionId>, PartnershipError> {
        let partner = self.partner_of(id)?;
        if let Some(partner) = partner {
            self.links.remove(&id);
            self.links.remove(&partner);
        }
        Ok(partner)
    }

    /// Drops every directed entry touching `id`, consistent or not. Returns
    /// the other ids that lost an entry.
    pub fn force_remove(&mut self, id: ConnectionId) -> Vec<ConnectionId> {
        let mut affected = Vec::new();
        if let Some(partner) = self.links.remove(&id) {
            affected.push(partner);
        }
        let pointing_here: Vec<ConnectionId> = self
            .links
            .iter()
            .filter(|(_, target)| **target == id)
            .map(|(source, _)| *source)
            .collect();
        for source in pointing_here {
            self.links.remove(&source);
            if !affected.contains(&source) {
                affected.push(source);
            }
        }
        for other in affected.clone() {
            if let Some(target) = self.links.remove(&other) {
                if target != id && !affected.contains(&target) {
                    affected.push(target);
                }
            }
        }
        affected
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.links.contains_key(&id)
    }

    /// Number of partnerships (not directed entries).
    pub fn len(&self) -> usize {
        self.links.len() / 2
    }

    pub fn check_symmetry(&self) -> Result<(), PartnershipError> {
        for &id in self.links.keys() {
            self.partner_of(id)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn insert_directed(&mut self, from: ConnectionId, to: ConnectionId) {
        self.links.insert(from, to);
    }
}
