//! Configuration for the Tessera coordinator and its resources.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::resource::ResourceKind;
use crate::serializer::Serializer;
use crate::types::Uri;

/// Top-level configuration for one coordinator node.
///
/// Deep-copied at coordinator construction; immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Logical name of the coordinator, used for the global Raft group.
    pub name: String,
    /// URI of this node.
    pub local_member: Uri,
    /// Configured ACTIVE member URIs.
    pub members: BTreeSet<Uri>,
    /// Global Raft election timeout.
    pub election_timeout: Duration,
    /// Global Raft heartbeat interval.
    pub heartbeat_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            name: "tessera".to_string(),
            local_member: String::new(),
            members: BTreeSet::new(),
            election_timeout: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(75),
        }
    }
}

impl CoordinatorConfig {
    /// Create a configuration for the given local URI and member set.
    pub fn new<I, S>(local_member: impl Into<Uri>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Uri>,
    {
        Self {
            local_member: local_member.into(),
            members: members.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.local_member.is_empty() {
            return Err(TesseraError::InvalidConfig {
                field: "local_member".to_string(),
                reason: "local member URI must be non-empty".to_string(),
            });
        }

        if self.election_timeout.is_zero() {
            return Err(TesseraError::InvalidConfig {
                field: "election_timeout".to_string(),
                reason: "election timeout must be non-zero".to_string(),
            });
        }

        if self.heartbeat_interval.is_zero() {
            return Err(TesseraError::InvalidConfig {
                field: "heartbeat_interval".to_string(),
                reason: "heartbeat interval must be non-zero".to_string(),
            });
        }

        if self.heartbeat_interval >= self.election_timeout {
            return Err(TesseraError::InvalidConfig {
                field: "heartbeat_interval".to_string(),
                reason: "heartbeat interval must be shorter than the election timeout"
                    .to_string(),
            });
        }

        Ok(())
    }
}

/// Per-resource configuration.
///
/// One flat record covers every resource kind; `Clone` is the structural
/// copy contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Concrete resource kind to instantiate.
    pub kind: ResourceKind,
    /// Replica URIs for this resource. Must be a subset of the cluster
    /// members, or empty to replicate on all of them.
    pub replicas: BTreeSet<Uri>,
    /// Serializer override for this resource's commands.
    pub serializer: Serializer,
    /// Election timeout override; falls back to the coordinator's value.
    pub election_timeout: Option<Duration>,
    /// Heartbeat interval override; falls back to the coordinator's value.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            kind: ResourceKind::AtomicReference,
            replicas: BTreeSet::new(),
            serializer: Serializer::default(),
            election_timeout: None,
            heartbeat_interval: None,
        }
    }
}

impl ResourceConfig {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn with_replicas<I, S>(mut self, replicas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Uri>,
    {
        self.replicas = replicas.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    /// Resolve this resource config against the cluster configuration.
    ///
    /// The replica set must contain only configured cluster members; an
    /// empty set means the resource replicates on every member.
    pub fn resolve(&self, cluster: &CoordinatorConfig) -> Result<BTreeSet<Uri>> {
        if self.replicas.is_empty() {
            return Ok(cluster.members.clone());
        }
        for replica in &self.replicas {
            if !cluster.members.contains(replica) {
                return Err(TesseraError::Configuration(format!(
                    "resource replica {} is not a configured cluster member",
                    replica
                )));
            }
        }
        Ok(self.replicas.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_node_config() -> CoordinatorConfig {
        CoordinatorConfig::new(
            "tcp://test-1",
            ["tcp://test-1", "tcp://test-2", "tcp://test-3"],
        )
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(three_node_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_local_member() {
        let config = CoordinatorConfig::default();
        assert!(matches!(
            config.validate(),
            Err(TesseraError::InvalidConfig { field, .. }) if field == "local_member"
        ));
    }

    #[test]
    fn test_validate_rejects_heartbeat_not_shorter_than_election() {
        let config = three_node_config()
            .with_election_timeout(Duration::from_millis(100))
            .with_heartbeat_interval(Duration::from_millis(100));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_empty_replicas_means_all_members() {
        let cluster = three_node_config();
        let resolved = ResourceConfig::default().resolve(&cluster).unwrap();
        assert_eq!(resolved, cluster.members);
    }

    #[test]
    fn test_resolve_rejects_unknown_replica() {
        let cluster = three_node_config();
        let config = ResourceConfig::default().with_replicas(["tcp://test-99"]);
        assert!(matches!(
            config.resolve(&cluster),
            Err(TesseraError::Configuration(_))
        ));
    }

    #[test]
    fn test_resolve_accepts_subset() {
        let cluster = three_node_config();
        let config = ResourceConfig::default().with_replicas(["tcp://test-1", "tcp://test-2"]);
        let resolved = config.resolve(&cluster).unwrap();
        assert_eq!(resolved.len(), 2);
    }
}
