//! Member transport abstraction.
//!
//! The coordinator touches the wire only through the [`Transport`] trait:
//! per-URI connect/disconnect for outbound traffic, a bound [`Dispatcher`]
//! for inbound traffic, and a single topic-tagged request/response
//! primitive. Socket-level framing lives behind implementations of this
//! trait; the crate ships the in-process [`LocalTransport`] used by tests
//! and single-process deployments.

mod local;

pub use local::{LocalTransport, TransportRegistry};

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{ClusterId, Topic, Uri};

/// Inbound request dispatcher bound to a URI.
///
/// Receives the target cluster, topic, protocol id, and serialized
/// request; returns the serialized response. The cluster id is part of the
/// routing key because one member endpoint carries the traffic of every
/// Raft group hosted on the node.
pub type Dispatcher = Arc<
    dyn Fn(ClusterId, Topic, u32, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync,
>;

/// Per-peer send/receive surface keyed by URI.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind the local URI to an inbound dispatcher. Rebinding replaces.
    async fn bind(&self, uri: &str, dispatcher: Dispatcher) -> Result<()>;

    /// Remove the binding for a URI. Safe if absent.
    async fn unbind(&self, uri: &str) -> Result<()>;

    /// Prepare an outbound path to a peer. Idempotent.
    async fn connect(&self, uri: &str) -> Result<()>;

    /// Tear down the outbound path to a peer. Idempotent.
    async fn disconnect(&self, uri: &str) -> Result<()>;

    /// Send a topic-tagged request to a peer and await the response.
    ///
    /// Fails with [`TesseraError::NoPeer`](crate::TesseraError::NoPeer)
    /// when the target URI is unknown or unreachable.
    async fn request(
        &self,
        uri: &Uri,
        cluster: ClusterId,
        topic: Topic,
        protocol_id: u32,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>>;
}
