//! A node's local directory of which peers belong to which committee.
//!
//! The view is a cache. It converges through idempotent add/remove notifications and full
//! refreshes from other nodes, and is never used to decide consensus membership.

use crate::{Address, CommitteeId, PeerDescriptor};
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

pub struct NetworkView {
    me: Address,
    entries: BTreeMap<CommitteeId, BTreeMap<Address, PeerDescriptor>>,
}

impl NetworkView {
    pub fn new(me: Address) -> Self {
        Self {
            me,
            entries: BTreeMap::new(),
        }
    }

    pub fn me(&self) -> &Address {
        &self.me
    }

    /// Known members of `id`, ordered by address.
    pub fn neighbors(&self, id: &CommitteeId) -> Vec<PeerDescriptor> {
        self.entries
            .get(id)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Record `peer` as a member of `id`.
    ///
    /// Returns `false` (and leaves the view unchanged) if the address is already recorded
    /// for `id` or is this node itself.
    pub fn add(&mut self, id: &CommitteeId, peer: PeerDescriptor) -> bool {
        let address = peer.address();
        if address == self.me {
            return false;
        }
        let entry = self.entries.entry(id.clone()).or_default();
        if entry.contains_key(&address) {
            return false;
        }
        trace!(committee = %id, %address, "added peer");
        entry.insert(address, peer);
        true
    }

    /// Forget `address` as a member of `id`. Returns `false` if it was not recorded.
    pub fn remove(&mut self, id: &CommitteeId, address: &Address) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        let removed = entry.remove(address).is_some();
        if entry.is_empty() {
            self.entries.remove(id);
        }
        if removed {
            trace!(committee = %id, %address, "removed peer");
        }
        removed
    }

    /// Replace everything known about `id` with `peers`.
    pub fn replace(&mut self, id: &CommitteeId, peers: impl IntoIterator<Item = PeerDescriptor>) {
        self.entries.remove(id);
        for peer in peers {
            self.add(id, peer);
        }
    }

    /// Committees with at least one known member.
    pub fn committees(&self) -> Vec<CommitteeId> {
        self.entries.keys().cloned().collect()
    }

    /// Every distinct peer address in the view.
    pub fn hosts(&self) -> BTreeSet<Address> {
        self.entries
            .values()
            .flat_map(|entry| entry.keys().cloned())
            .collect()
    }

    /// Pick the peer to forward a request for `id` to.
    ///
    /// The first recorded member of `id` wins. Failing that, any recorded peer that bridges
    /// to `id` is itself a member of `id`.
    pub fn route(&self, id: &CommitteeId) -> Option<PeerDescriptor> {
        if let Some(peer) = self.entries.get(id).and_then(|e| e.values().next()) {
            return Some(peer.clone());
        }
        self.entries
            .iter()
            .flat_map(|(committee, entry)| entry.values().map(move |p| (committee, p)))
            .find(|(_, p)| p.committee_id.as_ref() == Some(id))
            .map(|(committee, p)| {
                let mut peer = p.clone();
                peer.committee_id = Some(committee.clone());
                peer
            })
    }

    /// Full table, optionally restricted to one committee.
    pub fn table(&self, only: Option<&CommitteeId>) -> BTreeMap<CommitteeId, Vec<PeerDescriptor>> {
        self.entries
            .iter()
            .filter(|(id, _)| only.map_or(true, |only| only == *id))
            .map(|(id, entry)| (id.clone(), entry.values().cloned().collect()))
            .collect()
    }
}
