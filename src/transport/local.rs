//! In-memory transport over a shared process-wide registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use crate::error::{Result, TesseraError};
use crate::types::{ClusterId, Topic, Uri};

use super::{Dispatcher, Transport};

/// Shared registry of bound dispatchers, one entry per member URI.
///
/// All coordinators in a process share one registry; a request is a direct
/// async call into the target's dispatcher.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    dispatchers: Arc<RwLock<HashMap<Uri, Dispatcher>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport handle over this registry.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            registry: self.clone(),
        })
    }
}

/// In-memory [`Transport`] implementation.
pub struct LocalTransport {
    registry: TransportRegistry,
}

impl LocalTransport {
    /// Convenience constructor for a transport over a fresh registry.
    ///
    /// Coordinators that must reach each other have to share a registry;
    /// use [`TransportRegistry::transport`] for that.
    pub fn new() -> Arc<dyn Transport> {
        TransportRegistry::new().transport()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn bind(&self, uri: &str, dispatcher: Dispatcher) -> Result<()> {
        self.registry
            .dispatchers
            .write()
            .await
            .insert(uri.to_string(), dispatcher);
        trace!(uri, "Bound local transport dispatcher");
        Ok(())
    }

    async fn unbind(&self, uri: &str) -> Result<()> {
        self.registry.dispatchers.write().await.remove(uri);
        trace!(uri, "Unbound local transport dispatcher");
        Ok(())
    }

    async fn connect(&self, _uri: &str) -> Result<()> {
        // Connections are implicit for in-process delivery.
        Ok(())
    }

    async fn disconnect(&self, _uri: &str) -> Result<()> {
        Ok(())
    }

    async fn request(
        &self,
        uri: &Uri,
        cluster: ClusterId,
        topic: Topic,
        protocol_id: u32,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let dispatcher = {
            let dispatchers = self.registry.dispatchers.read().await;
            dispatchers
                .get(uri)
                .cloned()
                .ok_or_else(|| TesseraError::NoPeer(uri.clone()))?
        };
        dispatcher(cluster, topic, protocol_id, payload).await
    }
}
