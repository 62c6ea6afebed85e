//! Multi-step membership changes: start, join, leave, vacate, and topology deployment.
//!
//! Every step of a join or leave gates the next one. A node runs at most one join or leave
//! at a time ([Error::Busy] otherwise). Failures leave the peer in its prior stable state
//! where possible and are surfaced to the caller, never retried indefinitely.

use crate::{
    client::Client,
    committee::Committee,
    consensus::{Consensus, Runtime},
    node::{Node, Status},
    peer::IntersectionPeer,
    topology::{map::IntersectionMap, Topology},
    wire::{self, HostNotice, Neighbours, ValidatorNotice},
    Address, CommitteeId, Error, PeerDescriptor, BFT_MINIMUM,
};
use futures::future::{join_all, try_join_all};
use std::collections::BTreeMap;
use tracing::{info, warn};

impl<R: Runtime> Node<R> {
    /// Provision a consensus node for each of `a` and `b` and bind them to a fresh peer.
    ///
    /// A previously started peer is torn down first.
    pub async fn start(&self, a: CommitteeId, b: CommitteeId) -> Result<(), Error> {
        self.bind(a, b, Status::DualSided).await
    }

    /// Replace any prior peer with a fresh one for `a` and `b`, published with `status`.
    async fn bind(&self, a: CommitteeId, b: CommitteeId, status: Status) -> Result<(), Error> {
        if a == b {
            return Err(Error::DuplicateCommittee(a));
        }
        let mut slot = self.peer.write().await;
        if let Some(mut prior) = slot.take() {
            warn!(committees = ?prior.ids(), "peer already started, tearing down");
            prior.shutdown().await;
            self.set_status(Status::Unstarted);
        }
        let ca = self.runtime.provision(&a).await?;
        let cb = match self.runtime.provision(&b).await {
            Ok(cb) => cb,
            Err(err) => {
                ca.shutdown().await;
                return Err(err);
            }
        };
        *slot = Some(IntersectionPeer::new(
            Committee::new(a.clone(), ca),
            Committee::new(b.clone(), cb),
        )?);
        self.set_status(status);
        drop(slot);
        info!(%a, %b, %status, "started peer");
        Ok(())
    }

    /// Tear down a peer whose join did not complete.
    async fn abort_start(&self) {
        if let Some(mut peer) = self.peer.write().await.take() {
            peer.shutdown().await;
        }
        self.set_status(Status::Unstarted);
    }

    /// Known members of `id` other than this node, from the view and (optionally) a survey.
    fn neighbours(&self, map: Option<&IntersectionMap>, id: &CommitteeId) -> Vec<PeerDescriptor> {
        let mut all: BTreeMap<Address, PeerDescriptor> = self
            .with_view(|view| view.neighbors(id))
            .into_iter()
            .map(|n| (n.address(), n))
            .collect();
        if let Some(map) = map {
            for member in map.members(id) {
                all.entry(member.address()).or_insert(member);
            }
        }
        all.remove(&self.address);
        all.into_values().collect()
    }

    /// Send a host notice to every neighbour and apply it locally.
    ///
    /// Best-effort: unreachable neighbours are logged and skipped.
    async fn announce(&self, neighbours: &[PeerDescriptor], notice: &HostNotice, add: bool) {
        let results = join_all(neighbours.iter().map(|neighbour| async move {
            let host = neighbour.address();
            let result = if add {
                self.client.add_host(&host, notice).await
            } else {
                self.client.remove_host(&host, notice).await
            };
            (host, result)
        }))
        .await;
        for (host, result) in results {
            if let Err(err) = result {
                self.metrics.notifications_failed.inc();
                warn!(%host, ?err, "host notification failed");
            }
        }
        if add {
            self.add_host(notice);
        } else {
            self.remove_host(notice);
        }
    }

    /// Ask every neighbour to apply a validator set change.
    ///
    /// Unreachable neighbours are skipped, but any neighbour reporting a failure aborts and
    /// at least one neighbour must confirm.
    async fn propagate(
        &self,
        neighbours: &[PeerDescriptor],
        notice: &ValidatorNotice,
        add: bool,
    ) -> Result<(), Error> {
        let mut confirmed = 0;
        for neighbour in neighbours {
            let host = neighbour.address();
            let result = if add {
                self.client.add_validator(&host, notice).await
            } else {
                self.client.remove_validator(&host, notice).await
            };
            match result {
                Ok(()) => confirmed += 1,
                Err(Error::Http(err)) => {
                    warn!(%host, committee = %notice.quorum_id, ?err, "validator update unreachable");
                }
                Err(err) => return Err(err),
            }
        }
        if confirmed == 0 {
            return Err(Error::MembershipUpdateTimeout(notice.quorum_id.clone()));
        }
        Ok(())
    }

    async fn validator_notice(&self, id: &CommitteeId) -> Result<ValidatorNotice, Error> {
        let identity = self.identity(id).await?;
        Ok(ValidatorNotice {
            quorum_id: id.clone(),
            val_key: identity.validator_key,
            user_key: Some(identity.user_key),
        })
    }

    /// Join the least populated intersection known to `known_host`.
    pub async fn join(&self, known_host: &Address) -> Result<(CommitteeId, CommitteeId), Error> {
        let _guard = self.membership.try_lock().map_err(|_| Error::Busy)?;

        // Pick the intersection and learn its members
        let selection = self.client.min_intersection(known_host).await?;
        let (a, b) = selection.pair().cloned().ok_or(Error::NoIntersections)?;
        info!(%known_host, %a, %b, "joining least populated intersection");
        let table = self.client.quorum_info(known_host, None, true).await?;
        self.with_view(|view| {
            for (id, peers) in table {
                for peer in peers {
                    view.add(&id, peer);
                }
            }
        });

        // Bring up both sides
        self.bind(a.clone(), b.clone(), Status::SingleSided).await?;
        for id in [&a, &b] {
            let neighbours = selection.peers.get(id).cloned().unwrap_or_default();
            if let Err(err) = self.join_committee(id, &neighbours).await {
                warn!(committee = %id, ?err, "join failed");
                self.abort_start().await;
                return Err(err);
            }
        }
        self.set_status(Status::DualSided);

        // Make ourselves known
        for (id, other) in [(&a, &b), (&b, &a)] {
            let identity = self.identity(id).await?;
            let notice = HostNotice {
                host: self.address.clone(),
                host_quorum: Some(other.clone()),
                quorum: id.clone(),
                docker_ip: Some(identity.endpoint),
            };
            self.announce(&self.neighbours(None, id), &notice, true).await;
        }

        // Become a validator
        for id in [&a, &b] {
            let notice = self.validator_notice(id).await?;
            if let Err(err) = self.propagate(&self.neighbours(None, id), &notice, true).await {
                warn!(committee = %id, ?err, "joined but not admitted as validator");
                return Err(err);
            }
        }
        self.metrics.joins.inc();
        info!(%a, %b, "joined");
        Ok((a, b))
    }

    /// Leave the network cooperatively.
    ///
    /// If the most populated intersection has strictly more peers than this peer's own, one
    /// of its peers is moved into this peer's place first. Refused without side effects if any
    /// affected committee would drop below [BFT_MINIMUM].
    pub async fn leave(&self) -> Result<(), Error> {
        let _guard = self.membership.try_lock().map_err(|_| Error::Busy)?;
        let own = self.committees().await;
        if own.is_empty() {
            return Err(Error::NotStarted);
        }

        let map = self.survey().await;
        let replacement = match (map.max(), own.as_slice()) {
            (Ok((x, y)), [a, b]) if map.peers(&x, &y).len() > map.peers(a, b).len() => Some((x, y)),
            _ => None,
        };
        let affected = match &replacement {
            Some((x, y)) => vec![x.clone(), y.clone()],
            None => own.clone(),
        };
        for id in &affected {
            let size = self.neighbours(Some(&map), id).len() + usize::from(own.contains(id));
            if size <= BFT_MINIMUM {
                self.metrics.refused_leaves.inc();
                warn!(committee = %id, size, "refusing leave");
                return Err(Error::InvalidLeaveWouldBreakQuorum(id.clone()));
            }
        }

        let prior = self.status();
        self.set_status(Status::Leaving);
        let result = match replacement {
            Some(pair) => match self.replace_with(&map, pair, &own).await {
                Ok(()) => self.withdraw(&own).await,
                Err(err) => Err(err),
            },
            None => self.withdraw(&own).await,
        };
        if let Err(err) = result {
            warn!(?err, "leave aborted, staying");
            self.set_status(prior);
            return Err(err);
        }

        if let Some(mut peer) = self.peer.write().await.take() {
            peer.shutdown().await;
        }
        self.set_status(Status::Terminated);
        self.metrics.leaves.inc();
        info!(committees = ?own, "left");
        Ok(())
    }

    /// Move a peer bridging `(x, y)` into the committees this peer is leaving.
    async fn replace_with(
        &self,
        map: &IntersectionMap,
        (x, y): (CommitteeId, CommitteeId),
        own: &[CommitteeId],
    ) -> Result<(), Error> {
        let [a, b] = own else {
            return Err(Error::NotStarted);
        };
        let replacement = map
            .peers(&x, &y)
            .into_iter()
            .find(|p| *p != self.address)
            .ok_or(Error::NoIntersections)?;
        info!(%replacement, %x, %y, "moving replacement peer");

        // Detach the replacement from its committees
        for (id, other) in [(&x, &y), (&y, &x)] {
            let notice = ValidatorNotice {
                quorum_id: id.clone(),
                val_key: self.client.val_key(&replacement, id).await?,
                user_key: Some(self.client.user_key(&replacement, id).await?),
            };
            let neighbours: Vec<_> = self
                .neighbours(Some(map), id)
                .into_iter()
                .filter(|n| n.address() != replacement)
                .collect();
            self.propagate(&neighbours, &notice, false).await?;
            let host = HostNotice {
                host: replacement.clone(),
                host_quorum: Some(other.clone()),
                quorum: id.clone(),
                docker_ip: None,
            };
            self.announce(&neighbours, &host, false).await;
        }

        // Attach it in our place
        self.client.start(&replacement, a, b).await?;
        for id in [a, b] {
            let mut neighbours = self.neighbours(None, id);
            neighbours.push(self.descriptor(id).await?);
            let body = Neighbours { neighbours };
            self.client.join(&replacement, id, &body).await?;
            self.client.add(&replacement, id, &body).await?;
        }
        for (id, other) in [(a, b), (b, a)] {
            let neighbours: Vec<_> = self
                .neighbours(None, id)
                .into_iter()
                .filter(|n| n.address() != replacement)
                .collect();
            let host = HostNotice {
                host: replacement.clone(),
                host_quorum: Some(other.clone()),
                quorum: id.clone(),
                docker_ip: Some(self.client.ip(&replacement, id).await?),
            };
            self.announce(&neighbours, &host, true).await;
            let notice = ValidatorNotice {
                quorum_id: id.clone(),
                val_key: self.client.val_key(&replacement, id).await?,
                user_key: Some(self.client.user_key(&replacement, id).await?),
            };
            self.propagate(&neighbours, &notice, true).await?;
        }
        Ok(())
    }

    /// Remove this peer from every committee it holds.
    ///
    /// If removal from a later committee fails, earlier removals are reverted.
    async fn withdraw(&self, own: &[CommitteeId]) -> Result<(), Error> {
        let mut removed: Vec<(Vec<PeerDescriptor>, ValidatorNotice)> = Vec::new();
        for id in own {
            let neighbours = self.neighbours(None, id);
            let notice = self.validator_notice(id).await?;
            if let Err(err) = self.propagate(&neighbours, &notice, false).await {
                for (neighbours, notice) in &removed {
                    if let Err(err) = self.propagate(neighbours, notice, true).await {
                        warn!(committee = %notice.quorum_id, ?err, "failed to restore validator");
                    }
                }
                return Err(err);
            }
            removed.push((neighbours, notice));
        }
        for (neighbours, notice) in &removed {
            let other = self
                .identity(&notice.quorum_id)
                .await
                .ok()
                .and_then(|identity| identity.other);
            let host = HostNotice {
                host: self.address.clone(),
                host_quorum: other,
                quorum: notice.quorum_id.clone(),
                docker_ip: None,
            };
            self.announce(neighbours, &host, false).await;
        }
        Ok(())
    }

    /// Give up the side for `id` without leaving the other one.
    ///
    /// Removing this peer's keys from the vacated committee is left to its surviving
    /// members. Returns `true` if no side remains.
    pub async fn vacate(&self, id: &CommitteeId) -> Result<bool, Error> {
        let _guard = self.membership.try_lock().map_err(|_| Error::Busy)?;
        let mut slot = self.peer.write().await;
        let peer = slot.as_mut().ok_or(Error::NotStarted)?;
        let terminal = peer.vacate_side(id).await?;
        if terminal {
            *slot = None;
            self.set_status(Status::Terminated);
        } else {
            self.set_status(Status::SingleSided);
        }
        Ok(terminal)
    }
}

/// Stand up a planned topology on `hosts`, where `hosts[i]` runs planned peer `i`.
pub async fn deploy(client: &Client, topology: &Topology, hosts: &[Address]) -> Result<(), Error> {
    if hosts.len() != topology.peers.len() {
        return Err(Error::InvalidTopology(format!(
            "{} hosts for {} peers",
            hosts.len(),
            topology.peers.len()
        )));
    }
    try_join_all(
        topology
            .peers
            .iter()
            .zip(hosts)
            .map(|(peer, host)| client.start(host, &peer.a, &peer.b)),
    )
    .await?;

    for (id, members) in &topology.members {
        let mut genesis = wire::Genesis::default();
        let mut directory = Vec::with_capacity(members.len());
        for &index in members {
            let (Some(peer), Some(host)) = (topology.peers.get(index), hosts.get(index)) else {
                return Err(Error::InvalidTopology(format!("unknown peer {index}")));
            };
            genesis.validators.push(client.val_key(host, id).await?);
            genesis.users.push(client.user_key(host, id).await?);
            let other = if &peer.a == id { &peer.b } else { &peer.a };
            let docker_ip = client.ip(host, id).await?;
            directory.push(PeerDescriptor::new(host, Some(other.clone())).with_docker_ip(Some(docker_ip)));
        }
        try_join_all(members.iter().map(|&index| client.genesis(&hosts[index], id, &genesis))).await?;
        let body = Neighbours {
            neighbours: directory,
        };
        try_join_all(hosts.iter().map(|host| client.add(host, id, &body))).await?;
        info!(committee = %id, members = members.len(), "deployed committee");
    }
    Ok(())
}
