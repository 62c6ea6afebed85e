//! In-memory consensus engine shared by every node of a process.
//!
//! A [Network] holds one ledger per committee. Every [Consensus] handle attached to a
//! committee reads and writes the same ledger, so a value submitted through one member is
//! visible through every other member of that committee and through no other committee.

use crate::{
    consensus::{self, Members},
    CommitteeId, Error,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::sleep;
use tracing::debug;

#[derive(Default)]
struct Ledger {
    members: Members,
    data: BTreeMap<String, String>,
    blocks: u64,
    nodes: BTreeSet<String>,
}

#[derive(Default)]
struct State {
    next: u64,
    ledgers: HashMap<CommitteeId, Ledger>,
    stalled: HashSet<CommitteeId>,
    latency: Duration,
}

/// Shared registry of committee ledgers.
#[derive(Clone, Default)]
pub struct Network {
    state: Arc<Mutex<State>>,
}

impl Network {
    /// Delay every membership read by `latency` after it is taken, so callers act on a
    /// snapshot that may already be stale.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    /// Stop applying membership changes proposed to `committee`.
    pub fn stall(&self, committee: &CommitteeId) {
        self.state.lock().unwrap().stalled.insert(committee.clone());
    }

    /// Resume applying membership changes proposed to `committee`.
    pub fn resume(&self, committee: &CommitteeId) {
        self.state.lock().unwrap().stalled.remove(committee);
    }

    /// Applied membership of `committee`, if it exists.
    pub fn members(&self, committee: &CommitteeId) -> Option<Members> {
        let state = self.state.lock().unwrap();
        state.ledgers.get(committee).map(|l| l.members.clone())
    }

    /// Committed value of `key` in `committee`.
    pub fn value(&self, committee: &CommitteeId, key: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.ledgers.get(committee)?.data.get(key).cloned()
    }

    /// Consensus endpoints currently attached to `committee`.
    pub fn nodes(&self, committee: &CommitteeId) -> BTreeSet<String> {
        let state = self.state.lock().unwrap();
        state
            .ledgers
            .get(committee)
            .map(|l| l.nodes.clone())
            .unwrap_or_default()
    }

    fn with_ledger<T>(
        &self,
        committee: &CommitteeId,
        f: impl FnOnce(&mut Ledger, bool) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut state = self.state.lock().unwrap();
        let stalled = state.stalled.contains(committee);
        let ledger = state
            .ledgers
            .get_mut(committee)
            .ok_or_else(|| Error::Consensus(format!("committee {committee} has no ledger")))?;
        f(ledger, stalled)
    }
}

/// Provisions [Consensus] handles on a [Network].
#[derive(Clone, Default)]
pub struct Runtime {
    network: Network,
}

impl Runtime {
    pub fn network(&self) -> &Network {
        &self.network
    }
}

impl consensus::Runtime for Runtime {
    type Consensus = Consensus;

    async fn provision(&self, committee: &CommitteeId) -> Result<Consensus, Error> {
        let index = {
            let mut state = self.network.state.lock().unwrap();
            state.next += 1;
            state.next
        };
        debug!(%committee, index, "provisioned consensus node");
        Ok(Consensus {
            network: self.network.clone(),
            committee: committee.clone(),
            index,
            status: Mutex::new(Status::Detached),
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Status {
    Detached,
    Attached,
    Stopped,
}

/// A consensus node backed by a [Network] ledger.
pub struct Consensus {
    network: Network,
    committee: CommitteeId,
    index: u64,
    status: Mutex<Status>,
}

impl Consensus {
    fn alive(&self) -> Result<(), Error> {
        if *self.status.lock().unwrap() == Status::Stopped {
            return Err(Error::Consensus("node stopped".into()));
        }
        Ok(())
    }

    fn attach(&self) {
        *self.status.lock().unwrap() = Status::Attached;
    }

    fn attached(&self) -> Result<(), Error> {
        match *self.status.lock().unwrap() {
            Status::Attached => Ok(()),
            Status::Detached => Err(Error::Consensus(format!(
                "node not attached to committee {}",
                self.committee
            ))),
            Status::Stopped => Err(Error::Consensus("node stopped".into())),
        }
    }
}

impl consensus::Consensus for Consensus {
    fn validator_key(&self) -> String {
        format!("val-{}", self.index)
    }

    fn user_key(&self) -> String {
        format!("user-{}", self.index)
    }

    fn endpoint(&self) -> String {
        format!("172.17.{}.{}", self.index / 256, self.index % 256)
    }

    async fn genesis(&self, members: Members) -> Result<(), Error> {
        self.alive()?;
        {
            let mut state = self.network.state.lock().unwrap();
            let ledger = state.ledgers.entry(self.committee.clone()).or_default();
            if ledger.nodes.is_empty() && ledger.blocks == 0 {
                ledger.members = members;
            } else if ledger.members.validators != members.validators {
                return Err(Error::Consensus(format!(
                    "genesis of committee {} does not match existing ledger",
                    self.committee
                )));
            }
            ledger.nodes.insert(self.endpoint());
        }
        self.attach();
        Ok(())
    }

    async fn join(&self, peers: Vec<String>) -> Result<(), Error> {
        self.alive()?;
        let endpoint = self.endpoint();
        self.network.with_ledger(&self.committee, |ledger, _| {
            if !peers.iter().any(|p| ledger.nodes.contains(p)) {
                return Err(Error::Consensus("no reachable committee member".into()));
            }
            ledger.nodes.insert(endpoint);
            Ok(())
        })?;
        self.attach();
        Ok(())
    }

    async fn submit(&self, key: &str, value: &str) -> Result<(), Error> {
        self.attached()?;
        self.network.with_ledger(&self.committee, |ledger, _| {
            ledger.data.insert(key.to_string(), value.to_string());
            ledger.blocks += 1;
            Ok(())
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.attached()?;
        self.network
            .with_ledger(&self.committee, |ledger, _| Ok(ledger.data.get(key).cloned()))
    }

    async fn block_count(&self) -> Result<u64, Error> {
        self.attached()?;
        self.network
            .with_ledger(&self.committee, |ledger, _| Ok(ledger.blocks))
    }

    async fn members(&self) -> Result<Members, Error> {
        self.attached()?;
        let members = self
            .network
            .with_ledger(&self.committee, |ledger, _| Ok(ledger.members.clone()))?;
        let latency = self.network.state.lock().unwrap().latency;
        if !latency.is_zero() {
            sleep(latency).await;
        }
        Ok(members)
    }

    async fn update_members(&self, expected: Members, members: Members) -> Result<(), Error> {
        self.attached()?;
        self.network.with_ledger(&self.committee, |ledger, stalled| {
            if ledger.members != expected {
                return Err(Error::MembershipConflict(self.committee.clone()));
            }
            if stalled {
                debug!(committee = %self.committee, "membership update stalled");
                return Ok(());
            }
            ledger.members = members;
            ledger.blocks += 1;
            Ok(())
        })
    }

    async fn shutdown(&self) {
        let endpoint = self.endpoint();
        let mut status = self.status.lock().unwrap();
        if *status == Status::Stopped {
            return;
        }
        *status = Status::Stopped;
        let mut state = self.network.state.lock().unwrap();
        if let Some(ledger) = state.ledgers.get_mut(&self.committee) {
            ledger.nodes.remove(&endpoint);
        }
        debug!(committee = %self.committee, index = self.index, "consensus node stopped");
    }
}
