//! The per-node cluster coordinator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::cluster::manager::{ClusterManager, ListenerId};
use crate::cluster::member::{MemberEndpoint, MemberRegistry};
use crate::config::{CoordinatorConfig, ResourceConfig};
use crate::error::{Result, TesseraError};
use crate::executor::TaskExecutor;
use crate::protocol::{BufferedLog, RaftContext, RaftOptions};
use crate::resource::{Resource, ResourceManager};
use crate::transport::Transport;
use crate::types::{cluster_id, MemberInfo, MemberType, MembershipEvent, MembershipEventType};

/// Binds one resource to its private cluster and protocol engine.
///
/// The holder exclusively owns all three; the coordinator exclusively owns
/// the holder. Created by `get_resource`, opened lazily by
/// `acquire_resource`, closed by `release_resource` or coordinator
/// shutdown.
pub struct ResourceHolder {
    resource: Arc<dyn Resource>,
    cluster: Arc<ClusterManager>,
    state: Arc<RaftContext>,
    executor: Arc<TaskExecutor>,
}

impl ResourceHolder {
    pub fn resource(&self) -> &Arc<dyn Resource> {
        &self.resource
    }

    pub fn cluster(&self) -> &Arc<ClusterManager> {
        &self.cluster
    }

    pub fn state(&self) -> &Arc<RaftContext> {
        &self.state
    }
}

/// Per-node top-level component: owns the member registry, the global
/// membership cluster, and every replicated resource hosted on this node.
///
/// All Raft traffic for all hosted groups is multiplexed over the one
/// transport this coordinator was built with.
pub struct Coordinator {
    config: CoordinatorConfig,
    transport: Arc<dyn Transport>,
    executor: Arc<TaskExecutor>,
    local_member: Arc<MemberEndpoint>,
    members: Arc<MemberRegistry>,
    global_cluster: Arc<ClusterManager>,
    global_context: Arc<RaftContext>,
    resources: RwLock<HashMap<String, Arc<ResourceHolder>>>,
    membership_listener: Mutex<Option<ListenerId>>,
    lifecycle: tokio::sync::Mutex<()>,
    open: AtomicBool,
}

impl Coordinator {
    /// Build a coordinator from a validated configuration.
    ///
    /// The configuration is deep-copied; the local endpoint is `Active`
    /// iff the local URI appears in the configured member set, and a
    /// remote endpoint is created for every other configured URI.
    pub fn new(config: CoordinatorConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        config.validate()?;
        let config = config.clone();

        let executor = Arc::new(TaskExecutor::new(format!("coordinator-{}", config.name)));
        let members = MemberRegistry::new();

        let local_type = if config.members.contains(&config.local_member) {
            MemberType::Active
        } else {
            MemberType::Passive
        };
        let local_member = MemberEndpoint::local(
            MemberInfo::new(config.local_member.clone(), local_type),
            Arc::clone(&transport),
        );
        members.insert(Arc::clone(&local_member));

        for uri in &config.members {
            if *uri != config.local_member {
                members.insert(MemberEndpoint::remote(
                    MemberInfo::new(uri.clone(), MemberType::Active),
                    Arc::clone(&transport),
                ));
            }
        }

        let global_context = Arc::new(RaftContext::new(
            config.name.clone(),
            config.local_member.clone(),
            RaftOptions {
                election_timeout: config.election_timeout,
                heartbeat_interval: config.heartbeat_interval,
                replicas: config.members.clone(),
                log: BufferedLog::new(),
            },
        ));
        let global_cluster = ClusterManager::new(
            0,
            config.name.clone(),
            Arc::clone(&members),
            Arc::clone(&local_member),
            Arc::clone(&global_context),
            crate::serializer::Serializer::default(),
            Arc::clone(&executor),
        );

        Ok(Arc::new(Self {
            config,
            transport,
            executor,
            local_member,
            members,
            global_cluster,
            global_context,
            resources: RwLock::new(HashMap::new()),
            membership_listener: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            open: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    /// The global membership cluster.
    pub fn cluster(&self) -> &Arc<ClusterManager> {
        &self.global_cluster
    }

    /// The global membership protocol engine.
    pub fn context(&self) -> &Arc<RaftContext> {
        &self.global_context
    }

    /// The local member's endpoint.
    pub fn local_member(&self) -> Arc<MemberEndpoint> {
        Arc::clone(&self.local_member)
    }

    /// Endpoint of a member by URI, if currently known.
    pub fn member(&self, uri: &str) -> Option<Arc<MemberEndpoint>> {
        self.members.get(uri)
    }

    /// Snapshot of all known member endpoints.
    pub fn members(&self) -> Vec<Arc<MemberEndpoint>> {
        self.members.snapshot()
    }

    /// Open the coordinator. Idempotent.
    ///
    /// Opens every member endpoint in parallel, installs the membership
    /// listener, then opens the global cluster and global context on the
    /// coordinator executor, in that order. The open flag is set last; on
    /// any failure the coordinator stays closed.
    pub async fn open(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_open() {
            return Ok(());
        }

        let opens = self
            .members
            .snapshot()
            .into_iter()
            .map(|member| async move { member.open().await });
        for result in join_all(opens).await {
            result?;
        }

        let listener_id = self
            .global_cluster
            .add_membership_listener(self.membership_handler());
        *self.membership_listener.lock() = Some(listener_id);

        // Cluster before context, both pinned to the coordinator executor:
        // the engine must find its routes installed when it starts.
        let cluster = Arc::clone(&self.global_cluster);
        let context = Arc::clone(&self.global_context);
        self.executor
            .run(async move {
                cluster.open().await?;
                context.open().await
            })
            .await??;

        self.open.store(true, Ordering::Release);
        info!(
            local = %self.config.local_member,
            members = self.members.len(),
            "Coordinator opened"
        );
        Ok(())
    }

    /// Close the coordinator. Idempotent.
    ///
    /// Clears the open flag first so new operations fail fast, starts the
    /// endpoint closes, removes the membership listener, tears down every
    /// resource, closes the global context and cluster on the coordinator
    /// executor, awaits the endpoint closes, and finally shuts the
    /// coordinator executor down.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let member_closes: Vec<_> = self
            .members
            .snapshot()
            .into_iter()
            .map(|member| tokio::spawn(async move { member.close().await }))
            .collect();

        if let Some(id) = self.membership_listener.lock().take() {
            self.global_cluster.remove_membership_listener(id);
        }

        self.close_resources().await?;

        let cluster = Arc::clone(&self.global_cluster);
        let context = Arc::clone(&self.global_context);
        self.executor
            .run(async move {
                context.close().await?;
                cluster.close().await
            })
            .await??;

        for handle in member_closes {
            handle
                .await
                .map_err(|e| TesseraError::Internal(format!("member close task failed: {e}")))??;
        }

        self.executor.shutdown();
        info!(local = %self.config.local_member, "Coordinator closed");
        Ok(())
    }

    /// Get or create the named resource with the default configuration.
    pub fn get_resource(&self, name: &str) -> Result<Arc<dyn Resource>> {
        self.get_resource_with(name, ResourceConfig::default())
    }

    /// Get or create the named resource.
    ///
    /// The first call builds the resource's private protocol engine,
    /// cluster, and executor and registers the holder; every subsequent
    /// call returns the same resource instance regardless of the config
    /// passed.
    pub fn get_resource_with(
        &self,
        name: &str,
        config: ResourceConfig,
    ) -> Result<Arc<dyn Resource>> {
        if let Some(holder) = self.resources.read().get(name) {
            return Ok(Arc::clone(holder.resource()));
        }

        let mut resources = self.resources.write();
        if let Some(holder) = resources.get(name) {
            return Ok(Arc::clone(holder.resource()));
        }

        let replicas = config.resolve(&self.config)?;
        let executor = Arc::new(TaskExecutor::new(format!("resource-{name}")));
        let state = Arc::new(RaftContext::new(
            name,
            self.config.local_member.clone(),
            RaftOptions {
                election_timeout: config
                    .election_timeout
                    .unwrap_or(self.config.election_timeout),
                heartbeat_interval: config
                    .heartbeat_interval
                    .unwrap_or(self.config.heartbeat_interval),
                replicas,
                log: BufferedLog::new(),
            },
        ));
        let cluster = ClusterManager::new(
            cluster_id(name),
            name,
            Arc::clone(&self.members),
            Arc::clone(&self.local_member),
            Arc::clone(&state),
            config.serializer,
            Arc::clone(&executor),
        );

        let manager = ResourceManager::new(name, config.serializer, Arc::clone(&state));
        let resource = config.kind.construct(manager);

        info!(resource = name, kind = ?config.kind, "Resource registered");
        let holder = Arc::new(ResourceHolder {
            resource: Arc::clone(&resource),
            cluster,
            state,
            executor,
        });
        resources.insert(name.to_string(), holder);
        Ok(resource)
    }

    /// Look up a resource holder by name.
    pub fn resource_holder(&self, name: &str) -> Option<Arc<ResourceHolder>> {
        self.resources.read().get(name).cloned()
    }

    /// Open a registered resource's cluster and protocol engine.
    ///
    /// No-op when the resource is already acquired.
    pub async fn acquire_resource(&self, name: &str) -> Result<()> {
        if !self.is_open() {
            return Err(TesseraError::NotOpen);
        }
        let holder = self
            .resources
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| TesseraError::UnknownResource(name.to_string()))?;

        if holder.cluster.is_closed() {
            holder.cluster.open().await?;
            holder.state.open().await?;
            info!(resource = name, "Resource acquired");
        }
        Ok(())
    }

    /// Close a registered resource's protocol engine and cluster.
    ///
    /// No-op when the resource is not acquired.
    pub async fn release_resource(&self, name: &str) -> Result<()> {
        let holder = self
            .resources
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| TesseraError::UnknownResource(name.to_string()))?;

        if holder.cluster.is_open() {
            holder.state.close().await?;
            holder.cluster.close().await?;
            info!(resource = name, "Resource released");
        }
        Ok(())
    }

    /// Close every open resource holder concurrently: protocol engine,
    /// then cluster, then the holder's executor.
    async fn close_resources(&self) -> Result<()> {
        let holders: Vec<Arc<ResourceHolder>> = self.resources.read().values().cloned().collect();
        let closes = holders
            .into_iter()
            .filter(|holder| holder.cluster.is_open())
            .map(|holder| async move {
                holder.state.close().await?;
                holder.cluster.close().await?;
                holder.executor.shutdown();
                Ok::<(), TesseraError>(())
            });
        for result in join_all(closes).await {
            result?;
        }
        Ok(())
    }

    /// Membership handler installed on the global cluster.
    ///
    /// A join for an unknown URI builds a fresh endpoint from the event's
    /// member info and inserts it once open; joins for known URIs are
    /// ignored, so rejoins are idempotent. A leave removes the endpoint;
    /// pending sends to it fail naturally.
    fn membership_handler(&self) -> impl Fn(MembershipEvent) + Send + Sync + 'static {
        let registry = Arc::clone(&self.members);
        let transport = Arc::clone(&self.transport);
        let local_uri = self.config.local_member.clone();

        move |event| {
            let uri = event.member.uri.clone();
            if uri == local_uri {
                return;
            }
            match event.event_type {
                MembershipEventType::Join => {
                    if registry.contains(&uri) {
                        return;
                    }
                    let endpoint =
                        MemberEndpoint::remote(event.member.clone(), Arc::clone(&transport));
                    let registry = Arc::clone(&registry);
                    tokio::spawn(async move {
                        match endpoint.open().await {
                            Ok(()) => {
                                if !registry.insert(Arc::clone(&endpoint)) {
                                    // Lost the race with a concurrent join.
                                    let _ = endpoint.close().await;
                                }
                            }
                            Err(error) => {
                                warn!(
                                    member = %uri,
                                    %error,
                                    "Ignoring join without usable endpoint"
                                );
                            }
                        }
                    });
                }
                MembershipEventType::Leave => {
                    if let Some(endpoint) = registry.remove(&uri) {
                        info!(member = %uri, "Member left");
                        tokio::spawn(async move {
                            let _ = endpoint.close().await;
                        });
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("local", &self.config.local_member)
            .field("members", &self.members.len())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;
    use crate::transport::TransportRegistry;
    use std::time::Duration;

    fn single_node() -> Arc<Coordinator> {
        let config = CoordinatorConfig::new("tcp://solo-1", ["tcp://solo-1"])
            .with_election_timeout(Duration::from_millis(150))
            .with_heartbeat_interval(Duration::from_millis(30));
        Coordinator::new(config, TransportRegistry::new().transport()).unwrap()
    }

    #[tokio::test]
    async fn test_new_registers_configured_members() {
        let config = CoordinatorConfig::new(
            "tcp://test-1",
            ["tcp://test-1", "tcp://test-2", "tcp://test-3"],
        );
        let coordinator = Coordinator::new(config, TransportRegistry::new().transport()).unwrap();

        assert_eq!(coordinator.members().len(), 3);
        assert!(coordinator.member("tcp://test-2").is_some());
        assert!(coordinator.member("tcp://test-9").is_none());
        assert!(coordinator.local_member().info().is_active());
        assert!(coordinator.is_closed());
    }

    #[tokio::test]
    async fn test_local_member_passive_when_not_configured() {
        let config = CoordinatorConfig::new("tcp://observer", ["tcp://test-1", "tcp://test-2"]);
        let coordinator = Coordinator::new(config, TransportRegistry::new().transport()).unwrap();
        assert_eq!(
            coordinator.local_member().info().member_type,
            MemberType::Passive
        );
        assert_eq!(coordinator.members().len(), 3);
    }

    #[tokio::test]
    async fn test_get_resource_identity() {
        let coordinator = single_node();
        let first = coordinator.get_resource("alpha").unwrap();
        let second = coordinator.get_resource("alpha").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "alpha");
    }

    #[tokio::test]
    async fn test_get_resource_rejects_foreign_replicas() {
        let coordinator = single_node();
        let config = ResourceConfig::new(ResourceKind::Map).with_replicas(["tcp://test-99"]);
        let result = coordinator.get_resource_with("bad", config);
        assert!(matches!(result, Err(TesseraError::Configuration(_))));
        assert!(coordinator.resource_holder("bad").is_none());
    }

    #[tokio::test]
    async fn test_acquire_requires_open_coordinator() {
        let coordinator = single_node();
        coordinator.get_resource("alpha").unwrap();
        let result = coordinator.acquire_resource("alpha").await;
        assert!(matches!(result, Err(TesseraError::NotOpen)));
    }

    #[tokio::test]
    async fn test_acquire_unknown_resource_fails() {
        let coordinator = single_node();
        coordinator.open().await.unwrap();
        let result = coordinator.acquire_resource("never-registered").await;
        assert!(matches!(result, Err(TesseraError::UnknownResource(_))));
        coordinator.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_unknown_resource_fails() {
        let coordinator = single_node();
        let result = coordinator.release_resource("never-registered").await;
        assert!(matches!(result, Err(TesseraError::UnknownResource(_))));
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let coordinator = single_node();
        coordinator.open().await.unwrap();
        coordinator.open().await.unwrap(); // idempotent

        coordinator.get_resource("alpha").unwrap();
        let holder = coordinator.resource_holder("alpha").unwrap();
        assert!(holder.cluster().is_closed());

        coordinator.acquire_resource("alpha").await.unwrap();
        assert!(holder.cluster().is_open());
        assert!(holder.state().is_open());

        // Acquire twice is one acquire.
        coordinator.acquire_resource("alpha").await.unwrap();
        assert!(holder.cluster().is_open());

        coordinator.release_resource("alpha").await.unwrap();
        assert!(holder.cluster().is_closed());
        assert!(!holder.state().is_open());

        // Release twice is one release.
        coordinator.release_resource("alpha").await.unwrap();

        // Re-acquire after release works.
        coordinator.acquire_resource("alpha").await.unwrap();
        assert!(holder.cluster().is_open());

        coordinator.close().await.unwrap();
        assert!(coordinator.is_closed());
        assert!(holder.cluster().is_closed());
    }

    #[tokio::test]
    async fn test_close_closes_endpoints_and_is_idempotent() {
        let coordinator = single_node();
        coordinator.open().await.unwrap();
        coordinator.close().await.unwrap();
        coordinator.close().await.unwrap();

        assert!(coordinator.is_closed());
        for member in coordinator.members() {
            assert!(!member.is_open());
        }
    }
}
