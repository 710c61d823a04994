//! Replicated collections.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::StateMachine;
use crate::serializer::Serializer;

use super::{Resource, ResourceKind, ResourceManager};

#[derive(Debug, Serialize, Deserialize)]
enum MapCommand {
    Put {
        key: String,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },
    Remove {
        key: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
enum MapQuery {
    Get { key: String },
    ContainsKey { key: String },
    Len,
}

#[derive(Debug, Serialize, Deserialize)]
enum MapQueryResult {
    Value(Option<Vec<u8>>),
    Contains(bool),
    Len(u64),
}

struct MapMachine {
    serializer: Serializer,
    entries: BTreeMap<String, Vec<u8>>,
}

impl StateMachine for MapMachine {
    fn apply(&mut self, command: &[u8]) -> Vec<u8> {
        let command: MapCommand = match self.serializer.deserialize(command) {
            Ok(command) => command,
            Err(_) => return Vec::new(),
        };
        let previous = match command {
            MapCommand::Put { key, value } => self.entries.insert(key, value),
            MapCommand::Remove { key } => self.entries.remove(&key),
        };
        self.serializer.serialize(&previous).unwrap_or_default()
    }

    fn query(&self, command: &[u8]) -> Vec<u8> {
        let query: MapQuery = match self.serializer.deserialize(command) {
            Ok(query) => query,
            Err(_) => return Vec::new(),
        };
        let result = match query {
            MapQuery::Get { key } => MapQueryResult::Value(self.entries.get(&key).cloned()),
            MapQuery::ContainsKey { key } => {
                MapQueryResult::Contains(self.entries.contains_key(&key))
            }
            MapQuery::Len => MapQueryResult::Len(self.entries.len() as u64),
        };
        self.serializer.serialize(&result).unwrap_or_default()
    }
}

/// A replicated key-value map with string keys and opaque byte values.
pub struct ReplicatedMap {
    manager: ResourceManager,
}

impl ReplicatedMap {
    pub(crate) fn new(manager: ResourceManager) -> Self {
        manager.install(Box::new(MapMachine {
            serializer: manager.serializer(),
            entries: BTreeMap::new(),
        }));
        Self { manager }
    }

    /// Insert a value, returning the previous one for the key.
    pub async fn put(&self, key: impl Into<String>, value: Vec<u8>) -> Result<Option<Vec<u8>>> {
        self.manager
            .submit(&MapCommand::Put {
                key: key.into(),
                value,
            })
            .await
    }

    /// Remove a key, returning the previous value.
    pub async fn remove(&self, key: impl Into<String>) -> Result<Option<Vec<u8>>> {
        self.manager
            .submit(&MapCommand::Remove { key: key.into() })
            .await
    }

    /// Read the value for a key.
    pub async fn get(&self, key: impl Into<String>) -> Result<Option<Vec<u8>>> {
        let result: MapQueryResult = self
            .manager
            .query(&MapQuery::Get { key: key.into() })
            .await?;
        match result {
            MapQueryResult::Value(value) => Ok(value),
            _ => Ok(None),
        }
    }

    pub async fn contains_key(&self, key: impl Into<String>) -> Result<bool> {
        let result: MapQueryResult = self
            .manager
            .query(&MapQuery::ContainsKey { key: key.into() })
            .await?;
        match result {
            MapQueryResult::Contains(contains) => Ok(contains),
            _ => Ok(false),
        }
    }

    pub async fn len(&self) -> Result<u64> {
        let result: MapQueryResult = self.manager.query(&MapQuery::Len).await?;
        match result {
            MapQueryResult::Len(len) => Ok(len),
            _ => Ok(0),
        }
    }
}

impl Resource for ReplicatedMap {
    fn name(&self) -> &str {
        self.manager.name()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Map
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum SetCommand {
    Add(String),
    Remove(String),
}

#[derive(Debug, Serialize, Deserialize)]
enum SetQuery {
    Contains(String),
    Len,
}

#[derive(Debug, Serialize, Deserialize)]
enum SetQueryResult {
    Contains(bool),
    Len(u64),
}

struct SetMachine {
    serializer: Serializer,
    entries: BTreeSet<String>,
}

impl StateMachine for SetMachine {
    fn apply(&mut self, command: &[u8]) -> Vec<u8> {
        let command: SetCommand = match self.serializer.deserialize(command) {
            Ok(command) => command,
            Err(_) => return Vec::new(),
        };
        let changed = match command {
            SetCommand::Add(value) => self.entries.insert(value),
            SetCommand::Remove(value) => self.entries.remove(&value),
        };
        self.serializer.serialize(&changed).unwrap_or_default()
    }

    fn query(&self, command: &[u8]) -> Vec<u8> {
        let query: SetQuery = match self.serializer.deserialize(command) {
            Ok(query) => query,
            Err(_) => return Vec::new(),
        };
        let result = match query {
            SetQuery::Contains(value) => SetQueryResult::Contains(self.entries.contains(&value)),
            SetQuery::Len => SetQueryResult::Len(self.entries.len() as u64),
        };
        self.serializer.serialize(&result).unwrap_or_default()
    }
}

/// A replicated set of strings.
pub struct ReplicatedSet {
    manager: ResourceManager,
}

impl ReplicatedSet {
    pub(crate) fn new(manager: ResourceManager) -> Self {
        manager.install(Box::new(SetMachine {
            serializer: manager.serializer(),
            entries: BTreeSet::new(),
        }));
        Self { manager }
    }

    /// Add a value. Returns whether the set changed.
    pub async fn add(&self, value: impl Into<String>) -> Result<bool> {
        self.manager.submit(&SetCommand::Add(value.into())).await
    }

    /// Remove a value. Returns whether the set changed.
    pub async fn remove(&self, value: impl Into<String>) -> Result<bool> {
        self.manager.submit(&SetCommand::Remove(value.into())).await
    }

    pub async fn contains(&self, value: impl Into<String>) -> Result<bool> {
        let result: SetQueryResult = self
            .manager
            .query(&SetQuery::Contains(value.into()))
            .await?;
        match result {
            SetQueryResult::Contains(contains) => Ok(contains),
            _ => Ok(false),
        }
    }

    pub async fn len(&self) -> Result<u64> {
        let result: SetQueryResult = self.manager.query(&SetQuery::Len).await?;
        match result {
            SetQueryResult::Len(len) => Ok(len),
            _ => Ok(0),
        }
    }
}

impl Resource for ReplicatedSet {
    fn name(&self) -> &str {
        self.manager.name()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Set
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_machine_put_get_remove() {
        let serializer = Serializer::Bincode;
        let mut machine = MapMachine {
            serializer,
            entries: BTreeMap::new(),
        };

        let result = machine.apply(
            &serializer
                .serialize(&MapCommand::Put {
                    key: "k".into(),
                    value: vec![1],
                })
                .unwrap(),
        );
        let previous: Option<Vec<u8>> = serializer.deserialize(&result).unwrap();
        assert!(previous.is_none());

        let result = machine.query(&serializer.serialize(&MapQuery::Get { key: "k".into() }).unwrap());
        let value: MapQueryResult = serializer.deserialize(&result).unwrap();
        assert!(matches!(value, MapQueryResult::Value(Some(v)) if v == vec![1]));

        let result = machine.apply(
            &serializer
                .serialize(&MapCommand::Remove { key: "k".into() })
                .unwrap(),
        );
        let previous: Option<Vec<u8>> = serializer.deserialize(&result).unwrap();
        assert_eq!(previous, Some(vec![1]));

        let result = machine.query(&serializer.serialize(&MapQuery::Len).unwrap());
        let len: MapQueryResult = serializer.deserialize(&result).unwrap();
        assert!(matches!(len, MapQueryResult::Len(0)));
    }

    #[test]
    fn test_set_machine_add_is_idempotent() {
        let serializer = Serializer::Bincode;
        let mut machine = SetMachine {
            serializer,
            entries: BTreeSet::new(),
        };

        let add = serializer.serialize(&SetCommand::Add("a".into())).unwrap();
        let changed: bool = serializer.deserialize(&machine.apply(&add)).unwrap();
        assert!(changed);
        let changed: bool = serializer.deserialize(&machine.apply(&add)).unwrap();
        assert!(!changed);

        let result = machine.query(&serializer.serialize(&SetQuery::Contains("a".into())).unwrap());
        let contains: SetQueryResult = serializer.deserialize(&result).unwrap();
        assert!(matches!(contains, SetQueryResult::Contains(true)));
    }
}
