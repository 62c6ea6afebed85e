//! Interfaces to the consensus engine a committee runs on.
//!
//! The overlay never looks inside consensus. Each side of an [crate::peer::IntersectionPeer]
//! holds one [Consensus] handle provisioned by a [Runtime] and only ever submits, reads, or
//! proposes membership changes through it.

use crate::{CommitteeId, Error};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, future::Future};

/// Validator and user keys admitted to a committee.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Members {
    pub validators: BTreeSet<String>,
    pub users: BTreeSet<String>,
}

impl Members {
    pub fn new(
        validators: impl IntoIterator<Item = String>,
        users: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            validators: validators.into_iter().collect(),
            users: users.into_iter().collect(),
        }
    }
}

/// A handle to one consensus node participating in one committee.
pub trait Consensus: Send + Sync + 'static {
    /// Key this node votes with.
    fn validator_key(&self) -> String;

    /// Key this node submits transactions with.
    fn user_key(&self) -> String;

    /// Network address of the consensus node itself.
    fn endpoint(&self) -> String;

    /// Bootstrap a brand-new committee whose initial membership is `members`.
    ///
    /// Every initial member is expected to call this with identical `members`.
    fn genesis(&self, members: Members) -> impl Future<Output = Result<(), Error>> + Send;

    /// Connect to an existing committee through the consensus endpoints of its members.
    fn join(&self, peers: Vec<String>) -> impl Future<Output = Result<(), Error>> + Send;

    /// Submit a key/value write.
    fn submit(&self, key: &str, value: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Read the latest committed value of `key`.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, Error>> + Send;

    /// Number of committed blocks.
    fn block_count(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Membership as currently applied by the committee.
    fn members(&self) -> impl Future<Output = Result<Members, Error>> + Send;

    /// Propose replacing the membership `expected` with `members`. Returns once the proposal
    /// is submitted, not once it is confirmed.
    ///
    /// Fails with [Error::MembershipConflict] if the applied membership is no longer
    /// `expected`, so concurrent writers cannot overwrite each other's changes.
    fn update_members(
        &self,
        expected: Members,
        members: Members,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Stop the consensus node and release everything it holds.
    fn shutdown(&self) -> impl Future<Output = ()> + Send;
}

/// Factory for consensus nodes.
pub trait Runtime: Clone + Send + Sync + 'static {
    type Consensus: Consensus;

    /// Provision a fresh consensus node bound to `committee`.
    fn provision(
        &self,
        committee: &CommitteeId,
    ) -> impl Future<Output = Result<Self::Consensus, Error>> + Send;
}
