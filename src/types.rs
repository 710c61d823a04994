//! Core type definitions for the Tessera cluster coordinator.
//!
//! This module contains the fundamental data types shared across the
//! coordinator: member identity and status, protocol topics, cluster
//! identifiers, and the event structs delivered to listeners.
//!
//! # Key Types
//!
//! - [`MemberInfo`]: identity, type, and liveness of one cluster member
//! - [`Topic`]: the six symbolic addresses multiplexing Raft traffic
//! - [`MembershipEvent`]: join/leave notification from a cluster
//! - [`LeaderChangeEvent`]: leadership transition notification
//!
//! # Type Aliases
//!
//! - [`Uri`] = `String`: member address, the primary key across the system
//! - [`ClusterId`] = `u32`: cluster identifier (0 for the global cluster)
//! - [`Term`] = `u64`: Raft term number
//! - [`LogIndex`] = `u64`: Raft log position

use serde::{Deserialize, Serialize};

/// Member address. The primary key for members across the whole system.
pub type Uri = String;

/// Cluster identifier. The global cluster is always id 0; resource clusters
/// use [`cluster_id`] of the resource name.
pub type ClusterId = u32;

/// Raft term number.
pub type Term = u64;

/// Raft log index.
pub type LogIndex = u64;

/// Compute the cluster id for a resource name.
///
/// FNV-1a over the name bytes: stable across runs and platforms, unlike
/// the standard library hasher.
pub fn cluster_id(name: &str) -> ClusterId {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;
    let mut hash = FNV_OFFSET;
    for byte in name.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Member participation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberType {
    /// Participates in the Raft quorum.
    Active,
    /// Observes replication without voting.
    Passive,
}

/// Member liveness status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    /// Responding within the expected window.
    Alive,
    /// Missed recent heartbeats; not yet considered gone.
    Suspicious,
    /// Considered failed or departed.
    Dead,
}

/// Identity and status of one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Member address.
    pub uri: Uri,
    /// Quorum participation type.
    pub member_type: MemberType,
    /// Current liveness status.
    pub status: MemberStatus,
}

impl MemberInfo {
    pub fn new(uri: impl Into<Uri>, member_type: MemberType) -> Self {
        Self {
            uri: uri.into(),
            member_type,
            status: MemberStatus::Alive,
        }
    }

    pub fn is_active(&self) -> bool {
        self.member_type == MemberType::Active
    }
}

/// Symbolic address used to multiplex protocol traffic on one transport.
///
/// The set is fixed: exactly these six topics carry all Raft traffic for a
/// cluster, and at most one protocol engine is bound per (topic, protocol
/// id) pair on a member at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Membership gossip and status dissemination.
    Sync,
    /// Pre-vote round ahead of an election.
    Poll,
    /// Election ballot.
    Vote,
    /// Heartbeat and log replication.
    Append,
    /// Read path.
    Query,
    /// Client command submission.
    Commit,
}

impl Topic {
    /// All six topics, in routing order.
    pub const ALL: [Topic; 6] = [
        Topic::Sync,
        Topic::Poll,
        Topic::Vote,
        Topic::Append,
        Topic::Query,
        Topic::Commit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Sync => "sync",
            Topic::Poll => "poll",
            Topic::Vote => "vote",
            Topic::Append => "append",
            Topic::Query => "query",
            Topic::Commit => "commit",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Membership change type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipEventType {
    /// A member joined the cluster.
    Join,
    /// A member left the cluster or was declared dead.
    Leave,
}

/// Membership change notification delivered to cluster listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    /// Join or leave.
    pub event_type: MembershipEventType,
    /// The member the event concerns.
    pub member: MemberInfo,
}

impl MembershipEvent {
    pub fn join(member: MemberInfo) -> Self {
        Self {
            event_type: MembershipEventType::Join,
            member,
        }
    }

    pub fn leave(member: MemberInfo) -> Self {
        Self {
            event_type: MembershipEventType::Leave,
            member,
        }
    }
}

/// Leadership transition notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderChangeEvent {
    /// The previous leader, if any.
    pub old_leader: Option<Uri>,
    /// The new leader; `None` when leadership was lost without a successor.
    pub new_leader: Option<Uri>,
    /// Term in which the transition happened.
    pub term: Term,
}
