//! Per-host state: the intersection peer, its network view, and the membership lock.

use crate::{
    client::Client,
    committee::UpdatePolicy,
    consensus::{Consensus, Runtime},
    metrics::Metrics,
    peer::IntersectionPeer,
    topology::map::IntersectionMap,
    view::NetworkView,
    wire, Address, CommitteeId, Error, PeerDescriptor,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

/// Node configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Attempts made for each add/remove host notification.
    pub notify_attempts: usize,

    /// Delay between notification attempts.
    pub notify_delay: Duration,

    /// Attempts made for each validator set change.
    pub update_attempts: usize,

    /// Time allowed for a membership change to be applied.
    pub update_timeout: Duration,

    /// Interval between reads of the applied membership.
    pub update_poll_interval: Duration,

    /// Timeout of every outbound call.
    pub request_timeout: Duration,

    /// If set, refresh the view of held committees at this interval.
    pub refresh_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            notify_attempts: 5,
            notify_delay: Duration::from_secs(5),
            update_attempts: 5,
            update_timeout: Duration::from_secs(90),
            update_poll_interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
            refresh_interval: None,
        }
    }
}

impl Config {
    pub fn update_policy(&self) -> UpdatePolicy {
        UpdatePolicy {
            timeout: self.update_timeout,
            poll_interval: self.update_poll_interval,
        }
    }
}

/// Lifecycle of the peer hosted by a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Unstarted,
    SingleSided,
    DualSided,
    Leaving,
    Terminated,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Unstarted => "unstarted",
            Status::SingleSided => "single_sided",
            Status::DualSided => "dual_sided",
            Status::Leaving => "leaving",
            Status::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// A host running (at most) one intersection peer.
pub struct Node<R: Runtime> {
    pub(crate) config: Config,
    pub(crate) address: Address,
    pub(crate) runtime: R,
    pub(crate) client: Client,
    pub(crate) peer: RwLock<Option<IntersectionPeer<R::Consensus>>>,
    pub(crate) view: Mutex<NetworkView>,
    pub(crate) status: Mutex<Status>,

    /// Held for the whole of a join or leave.
    pub(crate) membership: tokio::sync::Mutex<()>,

    pub(crate) metrics: Metrics,
}

/// Keys and endpoint of one side of the local peer.
#[derive(Clone, Debug)]
pub struct Identity {
    pub validator_key: String,
    pub user_key: String,
    pub endpoint: String,
    pub other: Option<CommitteeId>,
}

impl<R: Runtime> Node<R> {
    pub fn new(config: Config, address: Address, runtime: R) -> Result<Self, Error> {
        let client = Client::new(&config)?;
        Ok(Self {
            view: Mutex::new(NetworkView::new(address.clone())),
            config,
            address,
            runtime,
            client,
            peer: RwLock::new(None),
            status: Mutex::new(Status::Unstarted),
            membership: tokio::sync::Mutex::new(()),
            metrics: Metrics::default(),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn status(&self) -> Status {
        *self.status.lock().unwrap()
    }

    pub(crate) fn set_status(&self, status: Status) {
        let mut current = self.status.lock().unwrap();
        if *current != status {
            debug!(from = %*current, to = %status, "status changed");
            *current = status;
        }
    }

    /// Run `f` against the network view.
    pub fn with_view<T>(&self, f: impl FnOnce(&mut NetworkView) -> T) -> T {
        let mut view = self.view.lock().unwrap();
        let result = f(&mut view);
        self.metrics.known_peers.set(view.hosts().len() as i64);
        result
    }

    /// Read access to the started peer.
    pub(crate) async fn started(
        &self,
    ) -> Result<RwLockReadGuard<'_, IntersectionPeer<R::Consensus>>, Error> {
        let guard = self.peer.read().await;
        RwLockReadGuard::try_map(guard, |peer| peer.as_ref()).map_err(|_| Error::NotStarted)
    }

    /// Committees held by the local peer.
    pub async fn committees(&self) -> Vec<CommitteeId> {
        match self.started().await {
            Ok(peer) => peer.ids(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn identity(&self, id: &CommitteeId) -> Result<Identity, Error> {
        let peer = self.started().await?;
        let consensus = peer.committee(id)?.consensus();
        Ok(Identity {
            validator_key: consensus.validator_key(),
            user_key: consensus.user_key(),
            endpoint: consensus.endpoint(),
            other: peer.other(id).cloned(),
        })
    }

    /// Validator keys applied by committee `id`.
    pub async fn committee_val_keys(&self, id: &CommitteeId) -> Result<Vec<String>, Error> {
        let peer = self.started().await?;
        let members = peer.committee(id)?.member_keys().await?;
        Ok(members.validators.into_iter().collect())
    }

    /// Consensus endpoints of every known member of `id`, this node included.
    pub async fn committee_ips(&self, id: &CommitteeId) -> Result<Vec<String>, Error> {
        let own = self.identity(id).await?.endpoint;
        let mut ips: Vec<String> = self.with_view(|view| {
            view.neighbors(id)
                .into_iter()
                .map(|n| n.docker_ip.unwrap_or(n.ip))
                .collect()
        });
        ips.push(own);
        Ok(ips)
    }

    /// How this node appears in its own entry for `id`.
    pub async fn descriptor(&self, id: &CommitteeId) -> Result<PeerDescriptor, Error> {
        let identity = self.identity(id).await?;
        Ok(PeerDescriptor::new(&self.address, identity.other).with_docker_ip(Some(identity.endpoint)))
    }

    /// Answer `/info`. Without an id, report the lowest held committee.
    pub async fn info(&self, id: Option<&CommitteeId>) -> wire::Info {
        let held = self.committees().await;
        let committee = match id {
            Some(id) => held.iter().find(|c| *c == id).cloned(),
            None => held.iter().min().cloned(),
        };
        let member_count = match &committee {
            Some(id) => Some(self.with_view(|view| view.neighbors(id).len()) + 1),
            None => None,
        };
        wire::Info {
            ip: self.address.ip.clone(),
            port: self.address.port,
            committee_id: committee,
            member_count,
        }
    }

    /// Answer `/quorum+info`.
    pub async fn quorum_info(&self, only: Option<&CommitteeId>, include_self: bool) -> wire::QuorumInfo {
        let mut table = self.with_view(|view| view.table(only));
        if include_self {
            for id in self.committees().await {
                if only.is_some_and(|only| *only != id) {
                    continue;
                }
                if let Ok(descriptor) = self.descriptor(&id).await {
                    table.entry(id).or_default().push(descriptor);
                }
            }
        }
        table
    }

    /// Build an intersection map from this node's view and one hop of its neighbours' views.
    pub async fn survey(&self) -> IntersectionMap {
        let mut map = IntersectionMap::new();
        map.merge(&self.quorum_info(None, true).await);
        let hosts: Vec<Address> = self.with_view(|view| view.hosts().into_iter().collect());
        let tables = join_all(
            hosts
                .iter()
                .map(|host| self.client.quorum_info(host, None, true)),
        )
        .await;
        for (host, table) in hosts.iter().zip(tables) {
            match table {
                Ok(table) => map.merge(&table),
                Err(err) => debug!(%host, ?err, "skipping neighbour in survey"),
            }
        }
        map
    }

    /// Apply an `/add+host` notification.
    pub fn add_host(&self, notice: &wire::HostNotice) -> bool {
        self.with_view(|view| view.add(&notice.quorum, notice.descriptor()))
    }

    /// Apply a `/remove+host` notification.
    pub fn remove_host(&self, notice: &wire::HostNotice) -> bool {
        self.with_view(|view| view.remove(&notice.quorum, &notice.host))
    }

    /// Record `neighbours` as members of `id`.
    pub fn add_neighbours(&self, id: &CommitteeId, neighbours: &[PeerDescriptor]) {
        self.with_view(|view| {
            for neighbour in neighbours {
                view.add(id, neighbour.clone());
            }
        });
    }

    pub async fn genesis(&self, id: &CommitteeId, body: wire::Genesis) -> Result<(), Error> {
        let peer = self.started().await?;
        peer.make_genesis(id, body.validators, body.users).await
    }

    /// Bring the local side for `id` into the committee formed by `neighbours`.
    pub async fn join_committee(&self, id: &CommitteeId, neighbours: &[PeerDescriptor]) -> Result<(), Error> {
        {
            let peer = self.started().await?;
            peer.peer_join(id, neighbours, &self.address).await?;
        }
        self.add_neighbours(id, neighbours);
        Ok(())
    }

    /// Apply an `/add+validator` or `/remove+validator` request with bounded retries.
    ///
    /// Returns `false` if the membership already reflected the change.
    pub async fn change_validator(&self, notice: &wire::ValidatorNotice, add: bool) -> Result<bool, Error> {
        let peer = self.started().await?;
        let committee = peer.committee(&notice.quorum_id)?;
        let policy = self.config.update_policy();
        let user = notice.user_key.as_deref();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = if add {
                committee.add_member(&notice.val_key, user, policy).await
            } else {
                committee.remove_member(&notice.val_key, user, policy).await
            };
            match result {
                Ok(changed) => {
                    if changed {
                        self.metrics.membership_updates.inc();
                        info!(committee = %notice.quorum_id, key = %notice.val_key, add, "updated validators");
                    }
                    return Ok(changed);
                }
                Err(Error::MembershipUpdateTimeout(id) | Error::MembershipConflict(id))
                    if attempt < self.config.update_attempts =>
                {
                    warn!(committee = %id, attempt, "retrying membership update");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Replace the entry for `id` with what `host` reports.
    pub async fn refresh(&self, id: &CommitteeId, host: &Address) -> Result<(), Error> {
        let mut table = self.client.quorum_info(host, Some(id), true).await?;
        let peers = table.remove(id).unwrap_or_default();
        debug!(committee = %id, %host, peers = peers.len(), "refreshed view");
        self.with_view(|view| view.replace(id, peers));
        Ok(())
    }

    /// Refresh every held committee from its first known neighbour.
    pub async fn refresh_all(&self) -> Result<(), Error> {
        for id in self.committees().await {
            let Some(host) = self.with_view(|view| view.neighbors(&id).first().map(|n| n.address())) else {
                continue;
            };
            self.refresh(&id, &host).await?;
        }
        Ok(())
    }

    /// Refresh held committees every `interval` until the node is dropped.
    pub async fn run_refresh(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.refresh_all().await {
                warn!(?err, "periodic refresh failed");
            }
        }
    }
}
