//! Identifiers and records exchanged between peers.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// Identifier of a committee.
///
/// Identifiers are kept in a single canonical form (a string) so that `2` and `"2"`
/// received over the wire refer to the same committee. Ordering is the ordering of the
/// canonical string.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommitteeId(String);

impl CommitteeId {
    /// Create a committee identifier from anything that renders to its canonical form.
    pub fn new(id: impl fmt::Display) -> Self {
        Self(id.to_string())
    }

    /// Canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitteeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommitteeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CommitteeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for CommitteeId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl Serialize for CommitteeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CommitteeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = CommitteeId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a committee id (string or integer)")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(CommitteeId::from(v))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
                Ok(CommitteeId::from(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(CommitteeId::new(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(CommitteeId::new(v))
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// A transaction addressed to one committee.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "quorum_id", alias = "destination_committee")]
    pub destination_committee: CommitteeId,
    pub key: String,
    #[serde(default)]
    pub value: String,
}

impl Transaction {
    pub fn new(
        destination_committee: CommitteeId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            destination_committee,
            key: key.into(),
            value: value.into(),
        }
    }

    /// The committee that owns this transaction.
    pub fn id(&self) -> &CommitteeId {
        &self.destination_committee
    }
}

/// Error returned when parsing an [Address] from `ip:port`.
#[derive(Debug, thiserror::Error)]
#[error("invalid address: {0}")]
pub struct InvalidAddress(pub String);

/// HTTP endpoint of a node (`ip:port`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    pub ip: String,
    pub port: u16,
}

impl Address {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Address {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s
            .trim()
            .trim_start_matches("http://")
            .trim_end_matches('/');
        let (ip, port) = s.rsplit_once(':').ok_or_else(|| InvalidAddress(s.into()))?;
        if ip.is_empty() {
            return Err(InvalidAddress(s.into()));
        }
        let port = port.parse().map_err(|_| InvalidAddress(s.into()))?;
        Ok(Self::new(ip, port))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A known member of some committee, annotated with the other committee it bridges to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub ip: String,
    pub port: u16,
    /// The other committee this peer is a member of (if any).
    #[serde(default)]
    pub committee_id: Option<CommitteeId>,
    /// Address of the peer's consensus node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_ip: Option<String>,
}

impl PeerDescriptor {
    pub fn new(address: &Address, other: Option<CommitteeId>) -> Self {
        Self {
            ip: address.ip.clone(),
            port: address.port,
            committee_id: other,
            docker_ip: None,
        }
    }

    pub fn with_docker_ip(mut self, docker_ip: Option<String>) -> Self {
        self.docker_ip = docker_ip;
        self
    }

    pub fn address(&self) -> Address {
        Address::new(self.ip.clone(), self.port)
    }
}
