//! One side of a peer: a committee id bound to a consensus handle.

use crate::{
    consensus::{Consensus, Members},
    CommitteeId, Error,
};
use std::{sync::Mutex, time::Duration};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// How long to wait for a proposed membership change to be applied.
#[derive(Clone, Copy, Debug)]
pub struct UpdatePolicy {
    /// Give up on a proposal that is not applied after this long.
    pub timeout: Duration,

    /// Interval between reads of the applied membership.
    pub poll_interval: Duration,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Fresh,
    Genesis,
    Joined,
}

/// A committee as seen by one of its members.
pub struct Committee<C: Consensus> {
    id: CommitteeId,
    consensus: C,
    phase: Mutex<Phase>,

    /// Serializes this member's read-modify-write of the key sets. Writers on other members
    /// are fenced by the conditional update.
    membership: tokio::sync::Mutex<()>,
}

impl<C: Consensus> Committee<C> {
    pub fn new(id: CommitteeId, consensus: C) -> Self {
        Self {
            id,
            consensus,
            phase: Mutex::new(Phase::Fresh),
            membership: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &CommitteeId {
        &self.id
    }

    pub fn consensus(&self) -> &C {
        &self.consensus
    }

    /// Create the committee with its initial membership.
    ///
    /// Only valid once, before this side has created or joined anything.
    pub async fn genesis(&self, members: Members) -> Result<(), Error> {
        self.advance(Phase::Genesis)?;
        if let Err(err) = self.consensus.genesis(members).await {
            *self.phase.lock().unwrap() = Phase::Fresh;
            return Err(err);
        }
        Ok(())
    }

    /// Connect to an existing committee through the consensus endpoints of its members.
    pub async fn join(&self, peers: Vec<String>) -> Result<(), Error> {
        self.consensus.join(peers).await?;
        *self.phase.lock().unwrap() = Phase::Joined;
        Ok(())
    }

    fn advance(&self, next: Phase) -> Result<(), Error> {
        let mut phase = self.phase.lock().unwrap();
        if *phase != Phase::Fresh {
            return Err(Error::GenesisAlreadyCreated(self.id.clone()));
        }
        *phase = next;
        Ok(())
    }

    pub async fn submit(&self, key: &str, value: &str) -> Result<(), Error> {
        self.consensus.submit(key, value).await
    }

    pub async fn get(&self, key: &str) -> Result<String, Error> {
        self.consensus
            .get(key)
            .await?
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    pub async fn block_count(&self) -> Result<u64, Error> {
        self.consensus.block_count().await
    }

    pub async fn member_keys(&self) -> Result<Members, Error> {
        self.consensus.members().await
    }

    /// Replace the membership with `members` and wait until the committee applies it.
    ///
    /// Fails closed: if the change is not observed within `policy.timeout` the caller must
    /// assume it did not take effect.
    pub async fn update_members(&self, members: Members, policy: UpdatePolicy) -> Result<(), Error> {
        self.modify(
            policy,
            |current| {
                if *current == members {
                    return false;
                }
                *current = members.clone();
                true
            },
            |applied| *applied == members,
        )
        .await?;
        Ok(())
    }

    /// Add keys to the membership. Returns `false` if they were already present.
    pub async fn add_member(
        &self,
        validator: &str,
        user: Option<&str>,
        policy: UpdatePolicy,
    ) -> Result<bool, Error> {
        self.modify(
            policy,
            |members| {
                let mut changed = members.validators.insert(validator.to_string());
                if let Some(user) = user {
                    changed |= members.users.insert(user.to_string());
                }
                changed
            },
            |members| {
                members.validators.contains(validator)
                    && user.map_or(true, |user| members.users.contains(user))
            },
        )
        .await
    }

    /// Remove keys from the membership. Returns `false` if they were already absent.
    pub async fn remove_member(
        &self,
        validator: &str,
        user: Option<&str>,
        policy: UpdatePolicy,
    ) -> Result<bool, Error> {
        self.modify(
            policy,
            |members| {
                let mut changed = members.validators.remove(validator);
                if let Some(user) = user {
                    changed |= members.users.remove(user);
                }
                changed
            },
            |members| {
                !members.validators.contains(validator)
                    && user.map_or(true, |user| !members.users.contains(user))
            },
        )
        .await
    }

    /// Apply `change` to the latest membership and wait until `applied` holds.
    ///
    /// Returns `false` without proposing anything if `change` reports no difference. Every
    /// proposal is conditional on the membership it was computed from, so a proposal that
    /// loses a race with another member is recomputed from a fresh read instead of
    /// overwriting the other change.
    async fn modify(
        &self,
        policy: UpdatePolicy,
        change: impl Fn(&mut Members) -> bool,
        applied: impl Fn(&Members) -> bool,
    ) -> Result<bool, Error> {
        let _guard = self.membership.lock().await;
        let deadline = Instant::now() + policy.timeout;
        loop {
            let current = self.consensus.members().await?;
            let mut next = current.clone();
            if !change(&mut next) {
                return Ok(false);
            }
            match self.consensus.update_members(current, next).await {
                Ok(()) => break,
                Err(Error::MembershipConflict(_)) if Instant::now() < deadline => {
                    debug!(committee = %self.id, "membership changed concurrently, recomputing");
                }
                Err(err) => return Err(err),
            }
        }
        loop {
            let members = self.consensus.members().await?;
            if applied(&members) {
                debug!(committee = %self.id, validators = members.validators.len(), "membership applied");
                return Ok(true);
            }
            if Instant::now() >= deadline {
                warn!(committee = %self.id, "membership update not confirmed");
                return Err(Error::MembershipUpdateTimeout(self.id.clone()));
            }
            sleep(policy.poll_interval).await;
        }
    }

    /// Stop the consensus node backing this side.
    pub async fn shutdown(&self) {
        self.consensus.shutdown().await;
    }
}
