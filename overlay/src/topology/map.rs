//! Point-in-time snapshot of how many peers bridge each pair of committees.

use crate::{wire, Address, CommitteeId, Error, PeerDescriptor};
use std::collections::{BTreeMap, BTreeSet};

/// Committee pairs and the peers bridging them, keyed canonically (`a <= b`).
///
/// Built from one or more committee tables (as served at `/quorum+info`). Not authoritative
/// and never cached: callers rebuild it whenever they need a decision.
#[derive(Clone, Debug, Default)]
pub struct IntersectionMap {
    pairs: BTreeMap<CommitteeId, BTreeMap<CommitteeId, BTreeSet<Address>>>,
    endpoints: BTreeMap<(CommitteeId, Address), String>,
}

fn canonical<'a>(x: &'a CommitteeId, y: &'a CommitteeId) -> (&'a CommitteeId, &'a CommitteeId) {
    if x <= y {
        (x, y)
    } else {
        (y, x)
    }
}

impl IntersectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `peer` (listed as a member of `committee`) bridges to its other committee.
    ///
    /// Peers that bridge nowhere are ignored.
    pub fn insert(&mut self, committee: &CommitteeId, peer: &PeerDescriptor) {
        let address = peer.address();
        if let Some(docker_ip) = &peer.docker_ip {
            self.endpoints
                .insert((committee.clone(), address.clone()), docker_ip.clone());
        }
        let Some(other) = &peer.committee_id else {
            return;
        };
        if other == committee {
            return;
        }
        let (a, b) = canonical(committee, other);
        self.pairs
            .entry(a.clone())
            .or_default()
            .entry(b.clone())
            .or_default()
            .insert(address);
    }

    /// Merge a committee table into the map.
    pub fn merge(&mut self, table: &wire::QuorumInfo) {
        for (committee, peers) in table {
            for peer in peers {
                self.insert(committee, peer);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Every pair with its bridging peers, in canonical order.
    pub fn pairs(&self) -> impl Iterator<Item = (&CommitteeId, &CommitteeId, &BTreeSet<Address>)> {
        self.pairs
            .iter()
            .flat_map(|(a, row)| row.iter().map(move |(b, peers)| (a, b, peers)))
    }

    /// Peers bridging `x` and `y` (in either order).
    pub fn peers(&self, x: &CommitteeId, y: &CommitteeId) -> BTreeSet<Address> {
        let (a, b) = canonical(x, y);
        self.pairs
            .get(a)
            .and_then(|row| row.get(b))
            .cloned()
            .unwrap_or_default()
    }

    fn select(&self, better: impl Fn(usize, usize) -> bool) -> Result<(CommitteeId, CommitteeId), Error> {
        let mut best: Option<(&CommitteeId, &CommitteeId, usize)> = None;
        for (a, b, peers) in self.pairs() {
            match best {
                Some((_, _, count)) if !better(peers.len(), count) => {}
                _ => best = Some((a, b, peers.len())),
            }
        }
        best.map(|(a, b, _)| (a.clone(), b.clone()))
            .ok_or(Error::NoIntersections)
    }

    /// The pair with the fewest bridging peers. Ties go to the first pair in canonical order.
    pub fn min(&self) -> Result<(CommitteeId, CommitteeId), Error> {
        self.select(|candidate, best| candidate < best)
    }

    /// The pair with the most bridging peers. Ties go to the first pair in canonical order.
    pub fn max(&self) -> Result<(CommitteeId, CommitteeId), Error> {
        self.select(|candidate, best| candidate > best)
    }

    /// Every known member of `id`, annotated with the committee it bridges to.
    pub fn members(&self, id: &CommitteeId) -> Vec<PeerDescriptor> {
        let mut members: BTreeMap<Address, PeerDescriptor> = BTreeMap::new();
        for (a, b, peers) in self.pairs() {
            let other = if a == id {
                b
            } else if b == id {
                a
            } else {
                continue;
            };
            for address in peers {
                let docker_ip = self.endpoints.get(&(id.clone(), address.clone())).cloned();
                members.entry(address.clone()).or_insert_with(|| {
                    PeerDescriptor::new(address, Some(other.clone())).with_docker_ip(docker_ip)
                });
            }
        }
        members.into_values().collect()
    }

    pub fn committee_size(&self, id: &CommitteeId) -> usize {
        self.members(id).len()
    }

    /// Wire form: `{a: {b: {address: 0}}}`.
    pub fn to_wire(&self) -> wire::IntersectionTable {
        self.pairs
            .iter()
            .map(|(a, row)| {
                let row = row
                    .iter()
                    .map(|(b, peers)| (b.clone(), peers.iter().map(|p| (p.clone(), 0)).collect()))
                    .collect();
                (a.clone(), row)
            })
            .collect()
    }
}
