//! Adapter between a resource and its Raft protocol engine.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::protocol::{RaftContext, StateMachine};
use crate::serializer::Serializer;

/// Adapts a resource to the protocol engine that replicates it.
///
/// Write commands go through [`submit`](ResourceManager::submit) (leader
/// append + quorum replication); reads go through
/// [`query`](ResourceManager::query) (leader-evaluated, forwarded when the
/// local member is a follower). Both encode with the resource's serializer.
pub struct ResourceManager {
    name: String,
    serializer: Serializer,
    context: Arc<RaftContext>,
}

impl ResourceManager {
    pub(crate) fn new(
        name: impl Into<String>,
        serializer: Serializer,
        context: Arc<RaftContext>,
    ) -> Self {
        Self {
            name: name.into(),
            serializer,
            context,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// Install the resource's state machine on the protocol engine.
    pub(crate) fn install(&self, machine: Box<dyn StateMachine>) {
        self.context.set_state_machine(machine);
    }

    /// Replicate a command and return its decoded apply result.
    pub async fn submit<C, R>(&self, command: &C) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        let payload = self.serializer.serialize(command)?;
        let result = self.context.submit(payload).await?;
        self.serializer.deserialize(&result)
    }

    /// Evaluate a read-only command and return its decoded result.
    pub async fn query<C, R>(&self, command: &C) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        let payload = self.serializer.serialize(command)?;
        let result = self.context.query(payload).await?;
        self.serializer.deserialize(&result)
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("name", &self.name)
            .field("serializer", &self.serializer)
            .finish()
    }
}
