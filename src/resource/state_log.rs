//! Replicated append-only state log.

use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::StateMachine;
use crate::serializer::Serializer;

use super::{Resource, ResourceKind, ResourceManager};

#[derive(Debug, Serialize, Deserialize)]
enum LogCommand {
    Append(#[serde(with = "serde_bytes")] Vec<u8>),
}

#[derive(Debug, Serialize, Deserialize)]
enum LogQuery {
    Len,
    Entry(u64),
}

#[derive(Debug, Serialize, Deserialize)]
enum LogQueryResult {
    Len(u64),
    Entry(Option<Vec<u8>>),
}

struct LogMachine {
    serializer: Serializer,
    entries: Vec<Vec<u8>>,
}

impl StateMachine for LogMachine {
    fn apply(&mut self, command: &[u8]) -> Vec<u8> {
        let command: LogCommand = match self.serializer.deserialize(command) {
            Ok(command) => command,
            Err(_) => return Vec::new(),
        };
        let LogCommand::Append(entry) = command;
        self.entries.push(entry);
        let position = self.entries.len() as u64;
        self.serializer.serialize(&position).unwrap_or_default()
    }

    fn query(&self, command: &[u8]) -> Vec<u8> {
        let query: LogQuery = match self.serializer.deserialize(command) {
            Ok(query) => query,
            Err(_) => return Vec::new(),
        };
        let result = match query {
            LogQuery::Len => LogQueryResult::Len(self.entries.len() as u64),
            LogQuery::Entry(position) => LogQueryResult::Entry(
                position
                    .checked_sub(1)
                    .and_then(|i| self.entries.get(i as usize))
                    .cloned(),
            ),
        };
        self.serializer.serialize(&result).unwrap_or_default()
    }
}

/// A replicated append-only log of opaque byte entries.
///
/// Positions are 1-based in append order.
pub struct StateLog {
    manager: ResourceManager,
}

impl StateLog {
    pub(crate) fn new(manager: ResourceManager) -> Self {
        manager.install(Box::new(LogMachine {
            serializer: manager.serializer(),
            entries: Vec::new(),
        }));
        Self { manager }
    }

    /// Append an entry, returning its position.
    pub async fn append(&self, entry: Vec<u8>) -> Result<u64> {
        self.manager.submit(&LogCommand::Append(entry)).await
    }

    /// Number of entries.
    pub async fn len(&self) -> Result<u64> {
        let result: LogQueryResult = self.manager.query(&LogQuery::Len).await?;
        match result {
            LogQueryResult::Len(len) => Ok(len),
            _ => Ok(0),
        }
    }

    /// Read the entry at a position.
    pub async fn entry(&self, position: u64) -> Result<Option<Vec<u8>>> {
        let result: LogQueryResult = self.manager.query(&LogQuery::Entry(position)).await?;
        match result {
            LogQueryResult::Entry(entry) => Ok(entry),
            _ => Ok(None),
        }
    }
}

impl Resource for StateLog {
    fn name(&self) -> &str {
        self.manager.name()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::StateLog
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_machine_appends_in_order() {
        let serializer = Serializer::Bincode;
        let mut machine = LogMachine {
            serializer,
            entries: Vec::new(),
        };

        for (i, entry) in [vec![1u8], vec![2], vec![3]].into_iter().enumerate() {
            let result = machine.apply(&serializer.serialize(&LogCommand::Append(entry)).unwrap());
            let position: u64 = serializer.deserialize(&result).unwrap();
            assert_eq!(position, i as u64 + 1);
        }

        let result = machine.query(&serializer.serialize(&LogQuery::Entry(2)).unwrap());
        let entry: LogQueryResult = serializer.deserialize(&result).unwrap();
        assert!(matches!(entry, LogQueryResult::Entry(Some(e)) if e == vec![2]));

        let result = machine.query(&serializer.serialize(&LogQuery::Entry(9)).unwrap());
        let entry: LogQueryResult = serializer.deserialize(&result).unwrap();
        assert!(matches!(entry, LogQueryResult::Entry(None)));
    }
}
