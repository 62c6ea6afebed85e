//! A peer holding membership in up to two committees.
//!
//! Which committee sits on side A and which on side B is arbitrary. Every operation is
//! addressed by [CommitteeId] and never by side.

use crate::{
    committee::{Committee, UpdatePolicy},
    consensus::{Consensus, Members},
    Address, CommitteeId, Error, PeerDescriptor, Transaction, BFT_MINIMUM,
};
use tracing::info;

pub struct IntersectionPeer<C: Consensus> {
    a: Option<Committee<C>>,
    b: Option<Committee<C>>,
}

impl<C: Consensus> IntersectionPeer<C> {
    /// Create a peer bridging two distinct committees.
    pub fn new(a: Committee<C>, b: Committee<C>) -> Result<Self, Error> {
        if a.id() == b.id() {
            return Err(Error::DuplicateCommittee(a.id().clone()));
        }
        Ok(Self {
            a: Some(a),
            b: Some(b),
        })
    }

    fn sides(&self) -> impl Iterator<Item = &Committee<C>> {
        self.a.iter().chain(self.b.iter())
    }

    /// Committees this peer holds, in side order.
    pub fn ids(&self) -> Vec<CommitteeId> {
        self.sides().map(|c| c.id().clone()).collect()
    }

    pub fn in_committee(&self, id: &CommitteeId) -> bool {
        self.sides().any(|c| c.id() == id)
    }

    /// The committee bridged to from `id`, if this peer holds both.
    pub fn other(&self, id: &CommitteeId) -> Option<&CommitteeId> {
        if !self.in_committee(id) {
            return None;
        }
        self.sides().map(|c| c.id()).find(|other| *other != id)
    }

    pub fn is_dual(&self) -> bool {
        self.a.is_some() && self.b.is_some()
    }

    /// A peer with no side left is terminal and must be dropped by its owner.
    pub fn is_empty(&self) -> bool {
        self.a.is_none() && self.b.is_none()
    }

    pub fn committee(&self, id: &CommitteeId) -> Result<&Committee<C>, Error> {
        self.sides()
            .find(|c| c.id() == id)
            .ok_or_else(|| Error::UnknownCommittee(id.clone()))
    }

    pub async fn make_genesis(
        &self,
        id: &CommitteeId,
        validators: impl IntoIterator<Item = String>,
        users: impl IntoIterator<Item = String>,
    ) -> Result<(), Error> {
        let committee = self.committee(id)?;
        committee.genesis(Members::new(validators, users)).await?;
        info!(committee = %id, "created genesis");
        Ok(())
    }

    pub async fn submit(&self, tx: &Transaction) -> Result<(), Error> {
        self.committee(tx.id())?.submit(&tx.key, &tx.value).await
    }

    pub async fn get(&self, tx: &Transaction) -> Result<String, Error> {
        self.committee(tx.id())?.get(&tx.key).await
    }

    pub async fn block_count(&self, id: &CommitteeId) -> Result<u64, Error> {
        self.committee(id)?.block_count().await
    }

    /// Bring the side matching `id` into an existing committee.
    ///
    /// `neighbours` lists the current members of the committee and may include this peer
    /// (identified by `me`). At least [BFT_MINIMUM] other members are required.
    pub async fn peer_join(
        &self,
        id: &CommitteeId,
        neighbours: &[PeerDescriptor],
        me: &Address,
    ) -> Result<(), Error> {
        let committee = self.committee(id)?;
        let peers: Vec<String> = neighbours
            .iter()
            .filter(|n| n.address() != *me)
            .map(|n| n.docker_ip.clone().unwrap_or_else(|| n.ip.clone()))
            .collect();
        if peers.len() < BFT_MINIMUM {
            return Err(Error::InsufficientMembers(peers.len()));
        }
        committee.join(peers).await?;
        info!(committee = %id, "joined committee");
        Ok(())
    }

    pub async fn update_committee(
        &self,
        id: &CommitteeId,
        validators: impl IntoIterator<Item = String>,
        users: impl IntoIterator<Item = String>,
        policy: UpdatePolicy,
    ) -> Result<(), Error> {
        self.committee(id)?
            .update_members(Members::new(validators, users), policy)
            .await
    }

    /// Give up the side matching `id` and stop its consensus node.
    ///
    /// Returns `true` if no side remains.
    pub async fn vacate_side(&mut self, id: &CommitteeId) -> Result<bool, Error> {
        let side = if self.a.as_ref().is_some_and(|c| c.id() == id) {
            &mut self.a
        } else if self.b.as_ref().is_some_and(|c| c.id() == id) {
            &mut self.b
        } else {
            return Err(Error::UnknownCommittee(id.clone()));
        };
        if let Some(committee) = side.take() {
            committee.shutdown().await;
        }
        info!(committee = %id, terminal = self.is_empty(), "vacated side");
        Ok(self.is_empty())
    }

    /// Stop every remaining side.
    pub async fn shutdown(&mut self) {
        for side in [&mut self.a, &mut self.b] {
            if let Some(committee) = side.take() {
                committee.shutdown().await;
            }
        }
    }
}
