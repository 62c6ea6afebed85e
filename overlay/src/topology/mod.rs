//! Static assignment of committee pairs to peers.
//!
//! For `n` committees and `k` intersections per pair, every unordered pair `(i, j)` with
//! `i < j` is bridged by exactly `k` peers, so every committee has `k * (n - 1)` members.

use crate::{CommitteeId, Error, BFT_MINIMUM};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

pub mod map;

/// A planned peer and the two committees it bridges.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub index: usize,
    pub a: CommitteeId,
    pub b: CommitteeId,
}

/// Output of [Planner::plan].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub committees: usize,
    pub intersections: usize,
    pub peers: Vec<Peer>,
    pub members: BTreeMap<CommitteeId, Vec<usize>>,
}

impl Topology {
    /// Indices of the planned members of `id`, in allocation order.
    pub fn members(&self, id: &CommitteeId) -> &[usize] {
        self.members.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Indices of the peers bridging `a` and `b` (in either order).
    pub fn bridging(&self, a: &CommitteeId, b: &CommitteeId) -> Vec<usize> {
        self.peers
            .iter()
            .filter(|p| (&p.a == a && &p.b == b) || (&p.a == b && &p.b == a))
            .map(|p| p.index)
            .collect()
    }
}

/// Computes committee pair assignments.
#[derive(Clone, Copy, Debug)]
pub struct Planner {
    committees: usize,
    intersections: usize,
}

impl Planner {
    pub fn new(committees: usize, intersections: usize) -> Self {
        Self {
            committees,
            intersections,
        }
    }

    /// Size of every committee under this plan, if it fits in a `usize`.
    pub fn committee_size(&self) -> Option<usize> {
        self.intersections
            .checked_mul(self.committees.saturating_sub(1))
    }

    /// Number of planned peers, if it fits in a `usize`.
    fn peer_count(&self) -> Option<usize> {
        let pairs = self.committees.checked_mul(self.committees.saturating_sub(1))? / 2;
        pairs.checked_mul(self.intersections)
    }

    pub fn plan(&self) -> Result<Topology, Error> {
        if self.committees < 2 {
            return Err(Error::InvalidTopology(format!(
                "need at least 2 committees, got {}",
                self.committees
            )));
        }
        if self.intersections == 0 {
            return Err(Error::InvalidTopology(
                "need at least 1 intersection per pair".into(),
            ));
        }
        let (Some(size), Some(_)) = (self.committee_size(), self.peer_count()) else {
            return Err(Error::InvalidTopology(format!(
                "{} committees with {} intersections overflows",
                self.committees, self.intersections
            )));
        };
        if size < BFT_MINIMUM {
            return Err(Error::InsufficientMembers(size));
        }

        let mut peers = Vec::new();
        let mut members: BTreeMap<CommitteeId, Vec<usize>> = (0..self.committees)
            .map(|i| (CommitteeId::from(i as u64), Vec::new()))
            .collect();
        for i in 0..self.committees - 1 {
            for j in i + 1..self.committees {
                let (a, b) = (CommitteeId::from(i as u64), CommitteeId::from(j as u64));
                for _ in 0..self.intersections {
                    let index = peers.len();
                    members.entry(a.clone()).or_default().push(index);
                    members.entry(b.clone()).or_default().push(index);
                    peers.push(Peer {
                        index,
                        a: a.clone(),
                        b: b.clone(),
                    });
                }
            }
        }
        debug!(
            committees = self.committees,
            intersections = self.intersections,
            peers = peers.len(),
            "planned topology"
        );
        Ok(Topology {
            committees: self.committees,
            intersections: self.intersections,
            peers,
            members,
        })
    }
}
