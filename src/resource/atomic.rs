//! Replicated atomic values.

use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::StateMachine;
use crate::serializer::Serializer;

use super::{Resource, ResourceKind, ResourceManager};

#[derive(Debug, Serialize, Deserialize)]
enum BooleanCommand {
    Get,
    Set(bool),
    CompareAndSet { expect: bool, update: bool },
}

struct BooleanMachine {
    serializer: Serializer,
    value: bool,
}

impl StateMachine for BooleanMachine {
    fn apply(&mut self, command: &[u8]) -> Vec<u8> {
        let command: BooleanCommand = match self.serializer.deserialize(command) {
            Ok(command) => command,
            Err(_) => return Vec::new(),
        };
        let result = match command {
            BooleanCommand::Get => self.value,
            BooleanCommand::Set(value) => {
                self.value = value;
                value
            }
            BooleanCommand::CompareAndSet { expect, update } => {
                if self.value == expect {
                    self.value = update;
                    true
                } else {
                    false
                }
            }
        };
        self.serializer.serialize(&result).unwrap_or_default()
    }

    fn query(&self, _command: &[u8]) -> Vec<u8> {
        self.serializer.serialize(&self.value).unwrap_or_default()
    }
}

/// A replicated atomic boolean.
pub struct AtomicBoolean {
    manager: ResourceManager,
}

impl AtomicBoolean {
    pub(crate) fn new(manager: ResourceManager) -> Self {
        manager.install(Box::new(BooleanMachine {
            serializer: manager.serializer(),
            value: false,
        }));
        Self { manager }
    }

    /// Read the current value.
    pub async fn get(&self) -> Result<bool> {
        self.manager.query(&BooleanCommand::Get).await
    }

    /// Set the value.
    pub async fn set(&self, value: bool) -> Result<()> {
        let _: bool = self.manager.submit(&BooleanCommand::Set(value)).await?;
        Ok(())
    }

    /// Set the value iff it currently equals `expect`. Returns whether the
    /// update was applied.
    pub async fn compare_and_set(&self, expect: bool, update: bool) -> Result<bool> {
        self.manager
            .submit(&BooleanCommand::CompareAndSet { expect, update })
            .await
    }
}

impl Resource for AtomicBoolean {
    fn name(&self) -> &str {
        self.manager.name()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::AtomicBoolean
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum ReferenceCommand {
    Get,
    Set(#[serde(with = "serde_bytes")] Vec<u8>),
    Clear,
}

struct ReferenceMachine {
    serializer: Serializer,
    value: Option<Vec<u8>>,
}

impl StateMachine for ReferenceMachine {
    fn apply(&mut self, command: &[u8]) -> Vec<u8> {
        let command: ReferenceCommand = match self.serializer.deserialize(command) {
            Ok(command) => command,
            Err(_) => return Vec::new(),
        };
        let previous = match command {
            ReferenceCommand::Get => self.value.clone(),
            ReferenceCommand::Set(value) => self.value.replace(value),
            ReferenceCommand::Clear => self.value.take(),
        };
        self.serializer.serialize(&previous).unwrap_or_default()
    }

    fn query(&self, _command: &[u8]) -> Vec<u8> {
        self.serializer.serialize(&self.value).unwrap_or_default()
    }
}

/// A replicated atomic reference over opaque bytes.
pub struct AtomicReference {
    manager: ResourceManager,
}

impl AtomicReference {
    pub(crate) fn new(manager: ResourceManager) -> Self {
        manager.install(Box::new(ReferenceMachine {
            serializer: manager.serializer(),
            value: None,
        }));
        Self { manager }
    }

    /// Read the current value.
    pub async fn get(&self) -> Result<Option<Vec<u8>>> {
        self.manager.query(&ReferenceCommand::Get).await
    }

    /// Replace the value, returning the previous one.
    pub async fn set(&self, value: Vec<u8>) -> Result<Option<Vec<u8>>> {
        self.manager.submit(&ReferenceCommand::Set(value)).await
    }

    /// Clear the value, returning the previous one.
    pub async fn clear(&self) -> Result<Option<Vec<u8>>> {
        self.manager.submit(&ReferenceCommand::Clear).await
    }
}

impl Resource for AtomicReference {
    fn name(&self) -> &str {
        self.manager.name()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::AtomicReference
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boolean_machine_set_and_cas() {
        let serializer = Serializer::Bincode;
        let mut machine = BooleanMachine {
            serializer,
            value: false,
        };

        let result = machine.apply(&serializer.serialize(&BooleanCommand::Set(true)).unwrap());
        let set: bool = serializer.deserialize(&result).unwrap();
        assert!(set);

        let result = machine.apply(
            &serializer
                .serialize(&BooleanCommand::CompareAndSet {
                    expect: true,
                    update: false,
                })
                .unwrap(),
        );
        let swapped: bool = serializer.deserialize(&result).unwrap();
        assert!(swapped);

        let result = machine.apply(
            &serializer
                .serialize(&BooleanCommand::CompareAndSet {
                    expect: true,
                    update: false,
                })
                .unwrap(),
        );
        let swapped: bool = serializer.deserialize(&result).unwrap();
        assert!(!swapped);

        let value: bool = serializer.deserialize(&machine.query(&[])).unwrap();
        assert!(!value);
    }

    #[test]
    fn test_boolean_machine_ignores_garbage() {
        let mut machine = BooleanMachine {
            serializer: Serializer::Bincode,
            value: false,
        };
        assert!(machine.apply(&[0xff, 0xee]).is_empty());
        assert!(!machine.value);
    }

    #[test]
    fn test_reference_machine_returns_previous() {
        let serializer = Serializer::Bincode;
        let mut machine = ReferenceMachine {
            serializer,
            value: None,
        };

        let result = machine.apply(
            &serializer
                .serialize(&ReferenceCommand::Set(vec![1, 2]))
                .unwrap(),
        );
        let previous: Option<Vec<u8>> = serializer.deserialize(&result).unwrap();
        assert!(previous.is_none());

        let result = machine.apply(
            &serializer
                .serialize(&ReferenceCommand::Set(vec![3]))
                .unwrap(),
        );
        let previous: Option<Vec<u8>> = serializer.deserialize(&result).unwrap();
        assert_eq!(previous, Some(vec![1, 2]));

        let result = machine.apply(&serializer.serialize(&ReferenceCommand::Clear).unwrap());
        let previous: Option<Vec<u8>> = serializer.deserialize(&result).unwrap();
        assert_eq!(previous, Some(vec![3]));
        assert!(machine.value.is_none());
    }
}
