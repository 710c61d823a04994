//! Error types for the Tessera cluster coordinator.
//!
//! This module provides a unified error type [`TesseraError`] for all
//! coordinator operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Configuration**: invalid settings, bad resource definitions
//! - **Lifecycle**: operations against a closed coordinator or executor
//! - **Routing**: requests addressed to members the local node does not know
//! - **Transport**: per-peer send/receive failures
//! - **Protocol**: consensus-level failures surfaced by the Raft engine
//! - **Serialization**: wire encoding/decoding failures

use std::io;
use thiserror::Error;

use crate::types::Uri;

/// Main error type for Tessera operations.
#[derive(Error, Debug)]
pub enum TesseraError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Lifecycle errors
    #[error("Coordinator not open")]
    NotOpen,

    #[error("Executor {0} is shut down")]
    ExecutorShutdown(String),

    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    // Routing errors
    #[error("Invalid member URI: {0}")]
    InvalidMember(Uri),

    #[error("No peer at {0}")]
    NoPeer(Uri),

    // Protocol errors
    #[error("Not the leader. Leader is: {leader:?}")]
    NotLeader { leader: Option<Uri> },

    #[error("Quorum not reached: got {got}, need {need}")]
    QuorumNotReached { got: usize, need: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Log error: {0}")]
    Log(String),

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Check if error is retryable by the protocol layer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TesseraError::NotLeader { .. }
                | TesseraError::Timeout(_)
                | TesseraError::Transport(_)
                | TesseraError::NoPeer(_)
                | TesseraError::QuorumNotReached { .. }
        )
    }
}

impl From<bincode::Error> for TesseraError {
    fn from(e: bincode::Error) -> Self {
        TesseraError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for TesseraError {
    fn from(e: serde_json::Error) -> Self {
        TesseraError::Serialization(e.to_string())
    }
}

/// Result type alias for Tessera operations.
pub type Result<T> = std::result::Result<T, TesseraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TesseraError::NotLeader { leader: None }.is_retryable());
        assert!(TesseraError::NoPeer("tcp://test-1".into()).is_retryable());
        assert!(TesseraError::Transport("connection reset".into()).is_retryable());
        assert!(!TesseraError::NotOpen.is_retryable());
        assert!(!TesseraError::UnknownResource("missing".into()).is_retryable());
        assert!(!TesseraError::Configuration("bad".into()).is_retryable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = TesseraError::InvalidMember("tcp://test-9".into());
        assert!(err.to_string().contains("tcp://test-9"));

        let err = TesseraError::InvalidConfig {
            field: "heartbeat_interval".into(),
            reason: "must be non-zero".into(),
        };
        assert!(err.to_string().contains("heartbeat_interval"));
    }
}
