//! Replicated resources hosted by the coordinator.
//!
//! Each resource is backed by its own Raft group and reached through a
//! [`ResourceManager`] that round-trips commands through the group's
//! protocol engine. Concrete resource kinds form a closed enumeration
//! dispatched through [`ResourceKind::construct`]; unknown kind names
//! surface a configuration error.

mod atomic;
mod collections;
mod manager;
mod state_log;

pub use atomic::{AtomicBoolean, AtomicReference};
pub use collections::{ReplicatedMap, ReplicatedSet};
pub use manager::ResourceManager;
pub use state_log::StateLog;

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

/// A replicated object backed by its own Raft group.
pub trait Resource: Send + Sync {
    /// The resource's registered name.
    fn name(&self) -> &str;

    /// The concrete kind this resource was instantiated as.
    fn kind(&self) -> ResourceKind;

    /// Downcast support for typed access to the concrete resource.
    fn as_any(&self) -> &dyn Any;
}

/// Closed enumeration of instantiable resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    AtomicBoolean,
    AtomicReference,
    StateLog,
    Map,
    Set,
}

impl ResourceKind {
    /// Resolve a configured kind name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "atomic_boolean" => Ok(ResourceKind::AtomicBoolean),
            "atomic_reference" => Ok(ResourceKind::AtomicReference),
            "state_log" => Ok(ResourceKind::StateLog),
            "map" => Ok(ResourceKind::Map),
            "set" => Ok(ResourceKind::Set),
            other => Err(TesseraError::Configuration(format!(
                "unknown resource kind: {other}"
            ))),
        }
    }

    /// Instantiate the concrete resource over its manager.
    pub(crate) fn construct(&self, manager: ResourceManager) -> Arc<dyn Resource> {
        match self {
            ResourceKind::AtomicBoolean => Arc::new(AtomicBoolean::new(manager)),
            ResourceKind::AtomicReference => Arc::new(AtomicReference::new(manager)),
            ResourceKind::StateLog => Arc::new(StateLog::new(manager)),
            ResourceKind::Map => Arc::new(ReplicatedMap::new(manager)),
            ResourceKind::Set => Arc::new(ReplicatedSet::new(manager)),
        }
    }
}

/// Downcast a dynamic resource handle to its concrete type.
pub fn downcast<T: Resource + 'static>(resource: &Arc<dyn Resource>) -> Option<&T> {
    resource.as_any().downcast_ref::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name_resolves_all_kinds() {
        assert_eq!(
            ResourceKind::from_name("atomic_boolean").unwrap(),
            ResourceKind::AtomicBoolean
        );
        assert_eq!(ResourceKind::from_name("map").unwrap(), ResourceKind::Map);
        assert_eq!(ResourceKind::from_name("set").unwrap(), ResourceKind::Set);
        assert_eq!(
            ResourceKind::from_name("state_log").unwrap(),
            ResourceKind::StateLog
        );
    }

    #[test]
    fn test_from_name_rejects_unknown_kind() {
        let result = ResourceKind::from_name("lock");
        assert!(matches!(result, Err(TesseraError::Configuration(_))));
    }
}
