//! Raft protocol engine.
//!
//! This module hosts the reusable consensus engine the coordinator owns one
//! instance of per resource, plus one for global membership. The engine is
//! deliberately self-contained: it speaks to the outside world only through
//! the six-topic handler surface ([`RaftContext::handle_sync`] and friends
//! inbound, the sender slots outbound), which the resource router binds to
//! the member transport. It never touches sockets, registries, or endpoints
//! itself.

mod context;
mod log;
mod messages;

pub use context::{RaftContext, RaftOptions, RaftRole, SenderFn};
pub use log::{BufferedLog, LogEntry};
pub use messages::{
    AppendRequest, AppendResponse, CommitRequest, CommitResponse, PollRequest, PollResponse,
    QueryRequest, QueryResponse, SyncRequest, SyncResponse, VoteRequest, VoteResponse,
};

/// State machine driven by a Raft group.
///
/// Commands are opaque bytes; the resource layer owns their encoding.
pub trait StateMachine: Send + 'static {
    /// Apply a committed command and return its serialized result.
    fn apply(&mut self, command: &[u8]) -> Vec<u8>;

    /// Evaluate a read-only command against current state.
    fn query(&self, command: &[u8]) -> Vec<u8>;
}
