//! Local view of one named Raft group.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

use crate::cluster::member::{MemberEndpoint, MemberRegistry};
use crate::cluster::router::ResourceRouter;
use crate::error::Result;
use crate::executor::TaskExecutor;
use crate::protocol::RaftContext;
use crate::serializer::Serializer;
use crate::types::{ClusterId, MembershipEvent};

/// Handle for removing a registered membership listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(MembershipEvent) + Send + Sync>;

/// Manages the local view of one Raft group: its member registry handle,
/// the routing that binds its protocol engine to the member transport, and
/// membership event delivery.
///
/// `open` installs routes and starts event delivery; the protocol engine
/// itself is opened by the owner afterwards, so no message can arrive
/// before its handlers exist. `close` runs after the engine closed and
/// removes the routes, so no handler outlives the engine.
pub struct ClusterManager {
    id: ClusterId,
    name: String,
    registry: Arc<MemberRegistry>,
    local_member: Arc<MemberEndpoint>,
    context: Arc<RaftContext>,
    router: ResourceRouter,
    executor: Arc<TaskExecutor>,
    listeners: Arc<RwLock<HashMap<ListenerId, Listener>>>,
    next_listener_id: AtomicU64,
    pump_stop: Mutex<Option<oneshot::Sender<()>>>,
    open: AtomicBool,
}

impl ClusterManager {
    pub fn new(
        id: ClusterId,
        name: impl Into<String>,
        registry: Arc<MemberRegistry>,
        local_member: Arc<MemberEndpoint>,
        context: Arc<RaftContext>,
        serializer: Serializer,
        executor: Arc<TaskExecutor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            registry,
            local_member,
            context,
            router: ResourceRouter::new(serializer),
            executor,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_listener_id: AtomicU64::new(0),
            pump_stop: Mutex::new(None),
            open: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ClusterId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    /// The cluster's protocol engine.
    pub fn context(&self) -> &Arc<RaftContext> {
        &self.context
    }

    pub(crate) fn registry(&self) -> Arc<MemberRegistry> {
        Arc::clone(&self.registry)
    }

    /// Endpoint of a member by URI, if currently known.
    pub fn member(&self, uri: &str) -> Option<Arc<MemberEndpoint>> {
        self.registry.get(uri)
    }

    /// The local member's endpoint.
    pub fn local_member(&self) -> Arc<MemberEndpoint> {
        Arc::clone(&self.local_member)
    }

    /// Install routes and start membership event delivery. Idempotent.
    ///
    /// Must complete before the protocol engine opens.
    pub async fn open(&self) -> Result<()> {
        if self.open.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.router.create_routes(self, &self.context);
        self.start_event_pump();

        info!(cluster = self.id, name = %self.name, "Cluster opened");
        Ok(())
    }

    /// Stop event delivery and destroy routes. Idempotent.
    ///
    /// Must run after the protocol engine closed.
    pub async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(stop) = self.pump_stop.lock().take() {
            let _ = stop.send(());
        }
        self.router.destroy_routes(self, &self.context);

        info!(cluster = self.id, name = %self.name, "Cluster closed");
        Ok(())
    }

    /// Register a membership listener. Events are delivered in FIFO order,
    /// serialized on the cluster's executor.
    pub fn add_membership_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(MembershipEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().insert(id, Arc::new(listener));
        id
    }

    /// Remove a membership listener. Safe if already removed.
    pub fn remove_membership_listener(&self, id: ListenerId) {
        self.listeners.write().remove(&id);
    }

    /// Forward the engine's membership deltas to listeners on the cluster
    /// executor.
    fn start_event_pump(&self) {
        let mut events = self.context.subscribe_membership();
        let listeners = Arc::clone(&self.listeners);
        let executor = Arc::clone(&self.executor);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        *self.pump_stop.lock() = Some(stop_tx);
        let cluster_id = self.id;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            let snapshot: Vec<Listener> =
                                listeners.read().values().cloned().collect();
                            let delivery = async move {
                                for listener in snapshot {
                                    listener(event.clone());
                                }
                            };
                            if executor.execute(delivery).is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            debug!(cluster = cluster_id, missed, "Membership pump lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            trace!(cluster = cluster_id, "Membership pump exited");
        });
    }
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BufferedLog, RaftOptions};
    use crate::transport::TransportRegistry;
    use crate::types::{MemberInfo, MemberType, MembershipEventType, Topic};
    use std::time::Duration;

    fn test_cluster() -> (Arc<ClusterManager>, Arc<RaftContext>) {
        let transports = TransportRegistry::new();
        let registry = MemberRegistry::new();
        let local = MemberEndpoint::local(
            MemberInfo::new("tcp://test-1", MemberType::Active),
            transports.transport(),
        );
        registry.insert(Arc::clone(&local));

        let context = Arc::new(RaftContext::new(
            "test",
            "tcp://test-1",
            RaftOptions {
                election_timeout: Duration::from_millis(100),
                heartbeat_interval: Duration::from_millis(25),
                replicas: ["tcp://test-1".to_string()].into_iter().collect(),
                log: BufferedLog::new(),
            },
        ));
        let cluster = ClusterManager::new(
            0,
            "test",
            registry,
            local,
            Arc::clone(&context),
            Serializer::Bincode,
            Arc::new(TaskExecutor::new("cluster-test")),
        );
        (cluster, context)
    }

    #[tokio::test]
    async fn test_open_installs_all_six_routes() {
        let (cluster, context) = test_cluster();
        assert_eq!(cluster.local_member().handler_count(), 0);

        cluster.open().await.unwrap();
        assert!(cluster.is_open());
        assert_eq!(cluster.local_member().handler_count(), Topic::ALL.len());

        // Idempotent.
        cluster.open().await.unwrap();
        assert_eq!(cluster.local_member().handler_count(), Topic::ALL.len());

        context.open().await.unwrap();
        context.close().await.unwrap();
        cluster.close().await.unwrap();
        assert!(cluster.is_closed());
        assert_eq!(cluster.local_member().handler_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (cluster, _context) = test_cluster();
        cluster.open().await.unwrap();
        cluster.close().await.unwrap();
        cluster.close().await.unwrap();
        assert!(cluster.is_closed());
    }

    #[tokio::test]
    async fn test_membership_listener_receives_events() {
        let (cluster, context) = test_cluster();
        cluster.open().await.unwrap();
        context.open().await.unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = cluster.add_membership_listener(move |event| {
            sink.lock().push(event);
        });

        // A gossip notice about an unknown member produces a join.
        context
            .handle_sync(crate::protocol::SyncRequest {
                uri: "tcp://test-1".into(),
                from: "tcp://test-2".into(),
                term: 0,
                leader: None,
                members: vec![MemberInfo::new("tcp://test-7", MemberType::Active)],
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        {
            let events = seen.lock();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].event_type, MembershipEventType::Join);
            assert_eq!(events[0].member.uri, "tcp://test-7");
        }

        cluster.remove_membership_listener(id);
        cluster.remove_membership_listener(id); // safe if absent

        context.close().await.unwrap();
        cluster.close().await.unwrap();
    }
}
