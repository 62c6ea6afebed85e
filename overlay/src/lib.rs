//! Route transactions across committees through peers that sit in two of them.
//!
//! The network is partitioned into committees, each running its own Byzantine fault tolerant
//! consensus instance. Some peers (intersection peers) are members of exactly two committees
//! and bridge them: a transaction for any committee can enter the network at any node and is
//! either served locally or forwarded to a node that is a member of its destination.
//!
//! # Architecture
//!
//! ```txt
//!   +-----------+      plan       +----------------+   start/genesis/add   +-------------+
//!   |  Planner  +---------------->|  Coordinator   +---------------------->|    Node     |
//!   +-----------+                 +-------+--------+                       |  +-------+  |
//!                                         | join / leave / vacate          |  | Peer  |  |
//!                                         v                                |  | A | B |  |
//!                                 +----------------+    local / forward    |  +-------+  |
//!                                 |  NetworkView   |<----------------------+   Router    |
//!                                 +----------------+                       +-------------+
//! ```
//!
//! * [topology::Planner] assigns committee pairs to peers. [topology::map::IntersectionMap]
//!   selects the least and most populated intersections of a live network.
//! * [peer::IntersectionPeer] owns one [committee::Committee] per side and dispatches every
//!   operation by [CommitteeId].
//! * [coordinator] runs the multi-step join and leave sequences across nodes.
//! * [router] serves a request locally or forwards it to a member of its committee.
//! * [view::NetworkView] is each node's cache of which peers belong to which committee.
//!
//! Consensus is opaque: every committee side talks to a [consensus::Consensus] handle
//! provisioned by a [consensus::Runtime]. [mocks] provides an in-memory engine.
//!
//! # Status
//!
//! `intersect-overlay` is **ALPHA** software and is not yet recommended for production use.

use thiserror::Error;

pub mod client;
pub mod committee;
pub mod consensus;
pub mod coordinator;
pub mod metrics;
pub mod mocks;
pub mod node;
pub mod peer;
pub mod router;
pub mod server;
pub mod topology;
mod types;
pub use types::{Address, CommitteeId, InvalidAddress, PeerDescriptor, Transaction};
pub mod view;
pub mod wire;

/// Smallest committee size that tolerates a Byzantine fault (`n = 3f + 1` with `f = 1`).
pub const BFT_MINIMUM: usize = 4;

/// Errors that can occur when interacting with the overlay.
#[derive(Error, Debug)]
pub enum Error {
    #[error("peer not in quorum {0}")]
    UnknownCommittee(CommitteeId),
    #[error("insufficient members: {0} < {min}", min = BFT_MINIMUM)]
    InsufficientMembers(usize),
    #[error("membership update of committee {0} not confirmed")]
    MembershipUpdateTimeout(CommitteeId),
    #[error("membership of committee {0} changed concurrently")]
    MembershipConflict(CommitteeId),
    #[error("notification to {0} failed")]
    NotificationUnreachable(String),
    #[error("no known peer in quorum {0}")]
    UnroutableCommittee(CommitteeId),
    #[error("leave would drop committee {0} below quorum")]
    InvalidLeaveWouldBreakQuorum(CommitteeId),
    #[error("peer not started")]
    NotStarted,
    #[error("peer already bridges committee {0}")]
    DuplicateCommittee(CommitteeId),
    #[error("genesis already created for committee {0}")]
    GenesisAlreadyCreated(CommitteeId),
    #[error("another membership change is in progress")]
    Busy,
    #[error("no intersections known")]
    NoIntersections,
    #[error("invalid topology: {0}")]
    InvalidTopology(String),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("consensus: {0}")]
    Consensus(String),
    #[error("remote: {0}")]
    Remote(String),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid address: {0}")]
    Address(#[from] InvalidAddress),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
