//! Per-peer member endpoints and the member registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::error::{Result, TesseraError};
use crate::executor::TaskExecutor;
use crate::serializer::Serializer;
use crate::transport::{Dispatcher, Transport};
use crate::types::{ClusterId, MemberInfo, Topic, Uri};

type ByteHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;

/// Per-peer send/receive surface.
///
/// Every endpoint owns one cooperative scheduler; all inbound handler
/// invocations and outbound sends bound to the peer serialize on it.
/// Handlers are keyed by `(cluster, topic, protocol id)` with at most one
/// handler per key; re-registration replaces. The cluster address keeps
/// the traffic of co-resident Raft groups apart on the shared endpoint.
pub struct MemberEndpoint {
    info: RwLock<MemberInfo>,
    transport: Arc<dyn Transport>,
    executor: Arc<TaskExecutor>,
    handlers: Arc<RwLock<HashMap<(ClusterId, Topic, u32), ByteHandler>>>,
    local: bool,
    open: AtomicBool,
}

impl MemberEndpoint {
    /// Create an endpoint for the local member. Its handler table is bound
    /// to the transport as the inbound dispatcher on open.
    pub fn local(info: MemberInfo, transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::build(info, transport, true)
    }

    /// Create an endpoint for a remote member.
    pub fn remote(info: MemberInfo, transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::build(info, transport, false)
    }

    fn build(info: MemberInfo, transport: Arc<dyn Transport>, local: bool) -> Arc<Self> {
        let executor = Arc::new(TaskExecutor::new(format!("member-{}", info.uri)));
        Arc::new(Self {
            info: RwLock::new(info),
            transport,
            executor,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            local,
            open: AtomicBool::new(false),
        })
    }

    pub fn uri(&self) -> Uri {
        self.info.read().uri.clone()
    }

    pub fn info(&self) -> MemberInfo {
        self.info.read().clone()
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Establish the transport path. Idempotent.
    pub async fn open(&self) -> Result<()> {
        if self.open.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let uri = self.uri();
        if self.local {
            self.transport.bind(&uri, self.dispatcher()).await?;
        } else {
            self.transport.connect(&uri).await?;
        }
        debug!(uri = %uri, local = self.local, "Member endpoint opened");
        Ok(())
    }

    /// Tear the transport path down and stop the endpoint scheduler.
    /// Idempotent; pending sends fail once the scheduler stops.
    pub async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let uri = self.uri();
        if self.local {
            self.transport.unbind(&uri).await?;
        } else {
            self.transport.disconnect(&uri).await?;
        }
        self.executor.shutdown();
        debug!(uri = %uri, "Member endpoint closed");
        Ok(())
    }

    /// Install a handler under `(cluster, topic, protocol_id)`. Replaces
    /// any existing handler for the key.
    pub fn register_handler<Req, Resp, H>(
        &self,
        cluster: ClusterId,
        topic: Topic,
        protocol_id: u32,
        handler: H,
        serializer: Serializer,
    ) where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        H: Fn(Req) -> BoxFuture<'static, Result<Resp>> + Send + Sync + 'static,
    {
        let wrapped: ByteHandler = Arc::new(move |payload: Vec<u8>| {
            let request: Result<Req> = serializer.deserialize(&payload);
            let response = request.map(&handler);
            async move {
                let response = response?.await?;
                serializer.serialize(&response)
            }
            .boxed()
        });
        let replaced = self
            .handlers
            .write()
            .insert((cluster, topic, protocol_id), wrapped)
            .is_some();
        trace!(
            uri = %self.uri(),
            cluster,
            %topic,
            protocol_id,
            replaced,
            "Registered handler"
        );
    }

    /// Remove the handler for `(cluster, topic, protocol_id)`. Safe if
    /// absent.
    pub fn unregister_handler(&self, cluster: ClusterId, topic: Topic, protocol_id: u32) {
        self.handlers.write().remove(&(cluster, topic, protocol_id));
    }

    /// Number of installed handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Send a topic-tagged request to this member and await the response.
    ///
    /// The send is serialized on the endpoint scheduler. Fails with
    /// `NoPeer` when the peer is unknown to the transport and with
    /// `ExecutorShutdown` once the endpoint has been closed.
    pub async fn send<Req, Resp>(
        &self,
        cluster: ClusterId,
        topic: Topic,
        protocol_id: u32,
        request: &Req,
        serializer: Serializer,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serializer.serialize(request)?;
        let transport = Arc::clone(&self.transport);
        let uri = self.uri();

        let response = self
            .executor
            .run(async move {
                transport
                    .request(&uri, cluster, topic, protocol_id, payload)
                    .await
            })
            .await??;
        serializer.deserialize(&response)
    }

    /// The inbound dispatcher: looks up the handler for the key and runs it
    /// on the endpoint scheduler.
    fn dispatcher(&self) -> Dispatcher {
        let handlers = Arc::clone(&self.handlers);
        let executor = Arc::clone(&self.executor);
        let uri = self.uri();

        Arc::new(move |cluster, topic, protocol_id, payload| {
            let handler = handlers.read().get(&(cluster, topic, protocol_id)).cloned();
            let executor = Arc::clone(&executor);
            let uri = uri.clone();
            async move {
                let handler = handler.ok_or_else(|| {
                    warn!(
                        uri = %uri,
                        cluster,
                        %topic,
                        protocol_id,
                        "No handler for inbound request"
                    );
                    TesseraError::Protocol(format!(
                        "no handler for cluster {} topic {} protocol {}",
                        cluster, topic, protocol_id
                    ))
                })?;
                executor.run(handler(payload)).await?
            }
            .boxed()
        })
    }
}

impl std::fmt::Debug for MemberEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberEndpoint")
            .field("info", &self.info())
            .field("local", &self.local)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Concurrent mapping of member URI to endpoint.
///
/// Shared between the coordinator and every cluster it creates; clusters
/// hold the registry handle rather than the coordinator itself.
#[derive(Default)]
pub struct MemberRegistry {
    members: RwLock<HashMap<Uri, Arc<MemberEndpoint>>>,
}

impl MemberRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert an endpoint if the URI is not already present. Returns
    /// whether the endpoint was inserted.
    pub fn insert(&self, endpoint: Arc<MemberEndpoint>) -> bool {
        let uri = endpoint.uri();
        let mut members = self.members.write();
        if members.contains_key(&uri) {
            return false;
        }
        members.insert(uri, endpoint);
        true
    }

    pub fn remove(&self, uri: &str) -> Option<Arc<MemberEndpoint>> {
        self.members.write().remove(uri)
    }

    pub fn get(&self, uri: &str) -> Option<Arc<MemberEndpoint>> {
        self.members.read().get(uri).cloned()
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.members.read().contains_key(uri)
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn uris(&self) -> Vec<Uri> {
        self.members.read().keys().cloned().collect()
    }

    /// Snapshot of all endpoints.
    pub fn snapshot(&self) -> Vec<Arc<MemberEndpoint>> {
        self.members.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportRegistry;
    use crate::types::MemberType;
    use futures::FutureExt;

    fn endpoint_pair() -> (Arc<MemberEndpoint>, Arc<MemberEndpoint>) {
        let registry = TransportRegistry::new();
        let transport = registry.transport();
        let local = MemberEndpoint::local(
            MemberInfo::new("tcp://test-1", MemberType::Active),
            Arc::clone(&transport),
        );
        let remote = MemberEndpoint::remote(
            MemberInfo::new("tcp://test-1", MemberType::Active),
            transport,
        );
        (local, remote)
    }

    #[tokio::test]
    async fn test_send_reaches_registered_handler() {
        let (local, remote) = endpoint_pair();
        local.register_handler(
            0,
            Topic::Query,
            1,
            |request: String| async move { Ok(format!("echo:{request}")) }.boxed(),
            Serializer::Bincode,
        );
        local.open().await.unwrap();
        remote.open().await.unwrap();

        let response: String = remote
            .send(0, Topic::Query, 1, &"hi".to_string(), Serializer::Bincode)
            .await
            .unwrap();
        assert_eq!(response, "echo:hi");
    }

    #[tokio::test]
    async fn test_send_without_handler_fails() {
        let (local, remote) = endpoint_pair();
        local.open().await.unwrap();
        remote.open().await.unwrap();

        let result: Result<String> = remote
            .send(0, Topic::Vote, 1, &"hi".to_string(), Serializer::Bincode)
            .await;
        assert!(matches!(result, Err(TesseraError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_clusters_route_independently_on_one_endpoint() {
        let (local, remote) = endpoint_pair();
        local.register_handler(
            0,
            Topic::Query,
            1,
            |_: String| async move { Ok("global".to_string()) }.boxed(),
            Serializer::Bincode,
        );
        local.register_handler(
            42,
            Topic::Query,
            1,
            |_: String| async move { Ok("resource".to_string()) }.boxed(),
            Serializer::Bincode,
        );
        assert_eq!(local.handler_count(), 2);

        local.open().await.unwrap();
        remote.open().await.unwrap();

        let global: String = remote
            .send(0, Topic::Query, 1, &"x".to_string(), Serializer::Bincode)
            .await
            .unwrap();
        assert_eq!(global, "global");
        let resource: String = remote
            .send(42, Topic::Query, 1, &"x".to_string(), Serializer::Bincode)
            .await
            .unwrap();
        assert_eq!(resource, "resource");
    }

    #[tokio::test]
    async fn test_reregistration_replaces_handler() {
        let (local, remote) = endpoint_pair();
        local.register_handler(
            0,
            Topic::Query,
            1,
            |_: String| async move { Ok("first".to_string()) }.boxed(),
            Serializer::Bincode,
        );
        local.register_handler(
            0,
            Topic::Query,
            1,
            |_: String| async move { Ok("second".to_string()) }.boxed(),
            Serializer::Bincode,
        );
        assert_eq!(local.handler_count(), 1);

        local.open().await.unwrap();
        remote.open().await.unwrap();
        let response: String = remote
            .send(0, Topic::Query, 1, &"x".to_string(), Serializer::Bincode)
            .await
            .unwrap();
        assert_eq!(response, "second");
    }

    #[tokio::test]
    async fn test_unregister_is_safe_when_absent() {
        let (local, _) = endpoint_pair();
        local.unregister_handler(0, Topic::Sync, 1);
        assert_eq!(local.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails_no_peer() {
        let transport = TransportRegistry::new().transport();
        let remote = MemberEndpoint::remote(
            MemberInfo::new("tcp://test-9", MemberType::Active),
            transport,
        );
        remote.open().await.unwrap();

        let result: Result<String> = remote
            .send(0, Topic::Append, 1, &"hi".to_string(), Serializer::Bincode)
            .await;
        assert!(matches!(result, Err(TesseraError::NoPeer(_))));
    }

    #[tokio::test]
    async fn test_closed_endpoint_fails_sends() {
        let (local, remote) = endpoint_pair();
        local.open().await.unwrap();
        remote.open().await.unwrap();
        remote.close().await.unwrap();
        remote.close().await.unwrap(); // idempotent

        let result: Result<String> = remote
            .send(0, Topic::Sync, 1, &"hi".to_string(), Serializer::Bincode)
            .await;
        assert!(matches!(result, Err(TesseraError::ExecutorShutdown(_))));
    }

    #[tokio::test]
    async fn test_registry_insert_is_idempotent() {
        let registry = MemberRegistry::new();
        let (local, _) = endpoint_pair();

        assert!(registry.insert(Arc::clone(&local)));
        assert!(!registry.insert(local));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("tcp://test-1"));

        let removed = registry.remove("tcp://test-1");
        assert!(removed.is_some());
        assert!(registry.is_empty());
        assert!(registry.remove("tcp://test-1").is_none());
    }
}
