//! JSON bodies and response markers exchanged between nodes.

use crate::{Address, CommitteeId, PeerDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of every successful call that carries no payload.
pub const SUCCESS: &str = "SUCCESS!";

/// Prefix of every error body.
pub const ERROR_PREFIX: &str = "ERROR: ";

/// Format an error body.
pub fn error(msg: impl std::fmt::Display) -> String {
    format!("{ERROR_PREFIX}{msg}")
}

/// Committee tables as served at `/quorum+info`.
pub type QuorumInfo = BTreeMap<CommitteeId, Vec<PeerDescriptor>>;

/// Intersection map as served at `/intersection+map`.
pub type IntersectionTable = BTreeMap<CommitteeId, BTreeMap<CommitteeId, BTreeMap<Address, u8>>>;

/// Body of `/join/{id}` and `/add/{id}`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Neighbours {
    pub neighbours: Vec<PeerDescriptor>,
}

/// Body of `/add+host` and `/remove+host`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HostNotice {
    /// `ip:port` of the peer being added or removed.
    pub host: Address,
    /// The other committee that peer bridges to.
    pub host_quorum: Option<CommitteeId>,
    /// Committee whose entry changes on the receiver.
    pub quorum: CommitteeId,
    #[serde(default)]
    pub docker_ip: Option<String>,
}

impl HostNotice {
    pub fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor::new(&self.host, self.host_quorum.clone()).with_docker_ip(self.docker_ip.clone())
    }
}

/// Body of `/add+validator` and `/remove+validator`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ValidatorNotice {
    pub quorum_id: CommitteeId,
    pub val_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_key: Option<String>,
}

/// Body of `/request+join`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JoinRequest {
    pub known_host: Address,
}

/// Body of `/genesis/{id}`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Genesis {
    pub validators: Vec<String>,
    pub users: Vec<String>,
}

/// Response of `/info`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Info {
    pub ip: String,
    pub port: u16,
    pub committee_id: Option<CommitteeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_count: Option<usize>,
}

/// Response of `/min+intersection` and `/max+intersection`.
///
/// Only one of the two pair fields is present, depending on the route.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Selection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_intersection: Option<(CommitteeId, CommitteeId)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_intersection: Option<(CommitteeId, CommitteeId)>,
    pub peers: QuorumInfo,
}

impl Selection {
    pub fn pair(&self) -> Option<&(CommitteeId, CommitteeId)> {
        self.min_intersection
            .as_ref()
            .or(self.max_intersection.as_ref())
    }
}

/// Response of `/vacate/{id}`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Vacated {
    pub terminal: bool,
}

/// Query of `/quorum+info`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct IncludeSelf {
    #[serde(default)]
    pub include_self: bool,
}
