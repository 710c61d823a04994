//! Tessera - cluster coordination for replicated resources.
//!
//! Tessera is the per-node coordinator of a distributed replicated-resource
//! platform. Each node runs one [`Coordinator`] that maintains a durable,
//! strongly-consistent membership view through a global Raft group, hosts
//! an open-ended set of named replicated resources (atomic values,
//! collections, state logs) each backed by its own independent Raft group,
//! and multiplexes all inter-node protocol traffic over a single transport
//! surface by topic-tagged routing.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Coordinator                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Resources: AtomicBoolean | AtomicReference | Map | Set |    │
//! │             StateLog  (one Raft group per resource)          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Global Cluster: membership view | join/leave events         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Routing: six topics per group bound to member endpoints     │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Members: per-peer endpoints | one serialized scheduler each │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use tessera::config::CoordinatorConfig;
//! use tessera::cluster::Coordinator;
//! use tessera::transport::LocalTransport;
//!
//! #[tokio::main]
//! async fn main() -> tessera::Result<()> {
//!     let config = CoordinatorConfig::new(
//!         "tcp://node-1",
//!         ["tcp://node-1", "tcp://node-2", "tcp://node-3"],
//!     );
//!     let coordinator = Coordinator::new(config, LocalTransport::new())?;
//!     coordinator.open().await?;
//!
//!     coordinator.get_resource("flags")?;
//!     coordinator.acquire_resource("flags").await?;
//!
//!     coordinator.close().await
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod executor;
pub mod protocol;
pub mod resource;
pub mod serializer;
pub mod transport;
pub mod types;

// Re-exports
pub use cluster::Coordinator;
pub use error::{Result, TesseraError};
pub use types::*;
