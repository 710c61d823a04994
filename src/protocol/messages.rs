//! Raft protocol message definitions.
//!
//! One request/response pair per topic. Every request is target-addressed:
//! the `uri` field names the member the request must be delivered to, and
//! the router refuses to send when that URI is not a known member.

use serde::{Deserialize, Serialize};

use super::LogEntry;
use crate::types::{LogIndex, MemberInfo, Term, Uri};

/// Membership gossip request.
///
/// Carries the sender's current view of the membership so receivers can
/// learn about joins, refresh liveness, and observe explicit departures
/// (a member gossiping itself as `Dead` is a graceful leave).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Target member.
    pub uri: Uri,
    /// Sending member.
    pub from: Uri,
    /// Sender's current term.
    pub term: Term,
    /// Sender's current leader, if known.
    pub leader: Option<Uri>,
    /// Sender's membership view.
    pub members: Vec<MemberInfo>,
}

/// Membership gossip response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Receiver's current term.
    pub term: Term,
    /// Receiver's membership view.
    pub members: Vec<MemberInfo>,
}

/// Pre-vote request sent before incrementing the term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRequest {
    /// Target member.
    pub uri: Uri,
    /// Prospective candidate.
    pub from: Uri,
    /// The term the candidate would campaign in.
    pub term: Term,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// Pre-vote response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    /// Receiver's current term.
    pub term: Term,
    /// Whether the receiver would grant a vote in that term.
    pub accepted: bool,
}

/// Election ballot request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Target member.
    pub uri: Uri,
    /// Candidate requesting the vote.
    pub from: Uri,
    /// Candidate's term.
    pub term: Term,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// Election ballot response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Receiver's current term, for the candidate to update itself.
    pub term: Term,
    /// Whether the vote was granted.
    pub voted: bool,
}

/// Heartbeat and log replication request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    /// Target member.
    pub uri: Uri,
    /// Leader sending the request.
    pub from: Uri,
    /// Leader's term.
    pub term: Term,
    /// Index of the log entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// Entries to store; empty for a pure heartbeat.
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub commit_index: LogIndex,
}

/// Heartbeat and log replication response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    /// Receiver's current term, for the leader to update itself.
    pub term: Term,
    /// Whether the receiver's log matched at `prev_log_index`.
    pub succeeded: bool,
    /// The receiver's last log index, as a catch-up hint for the leader.
    pub last_log_index: LogIndex,
}

/// Read request forwarded to the leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Target member.
    pub uri: Uri,
    /// Requesting member.
    pub from: Uri,
    /// Serialized read command for the state machine.
    #[serde(with = "serde_bytes")]
    pub command: Vec<u8>,
}

/// Read response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Responder's current term.
    pub term: Term,
    /// Serialized read result.
    #[serde(with = "serde_bytes")]
    pub result: Vec<u8>,
}

/// Command submission forwarded to the leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    /// Target member.
    pub uri: Uri,
    /// Submitting member.
    pub from: Uri,
    /// Serialized command for the state machine.
    #[serde(with = "serde_bytes")]
    pub command: Vec<u8>,
}

/// Command submission response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitResponse {
    /// Responder's current term.
    pub term: Term,
    /// Log index the command was committed at.
    pub index: LogIndex,
    /// Serialized state machine result.
    #[serde(with = "serde_bytes")]
    pub result: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::Serializer;
    use crate::types::MemberType;

    #[test]
    fn test_append_request_roundtrip() {
        let request = AppendRequest {
            uri: "tcp://test-2".into(),
            from: "tcp://test-1".into(),
            term: 3,
            prev_log_index: 7,
            prev_log_term: 2,
            entries: vec![LogEntry::new(3, 8, vec![1, 2, 3])],
            commit_index: 7,
        };
        let bytes = Serializer::Bincode.serialize(&request).unwrap();
        let back: AppendRequest = Serializer::Bincode.deserialize(&bytes).unwrap();
        assert_eq!(back.term, 3);
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.entries[0].data_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn test_sync_request_carries_membership_view() {
        let request = SyncRequest {
            uri: "tcp://test-2".into(),
            from: "tcp://test-1".into(),
            term: 1,
            leader: Some("tcp://test-1".into()),
            members: vec![MemberInfo::new("tcp://test-1", MemberType::Active)],
        };
        let bytes = Serializer::Json.serialize(&request).unwrap();
        let back: SyncRequest = Serializer::Json.deserialize(&bytes).unwrap();
        assert_eq!(back.members.len(), 1);
        assert_eq!(back.leader.as_deref(), Some("tcp://test-1"));
    }
}
