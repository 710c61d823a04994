//! Buffered in-memory Raft log.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::types::{LogIndex, Term};

/// A single entry in the replicated log.
///
/// The payload is `Arc`-wrapped so replication fan-out clones are O(1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when the entry was appended.
    pub term: Term,
    /// The index of this entry in the log.
    pub index: LogIndex,
    /// The command payload.
    #[serde(with = "arc_bytes")]
    pub data: Arc<Vec<u8>>,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        Self {
            term,
            index,
            data: Arc::new(data),
        }
    }

    #[inline]
    pub fn data_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Serde helper for `Arc<Vec<u8>>` payloads: raw bytes on the wire.
mod arc_bytes {
    use serde::{Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(data.as_slice(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Arc::new(bytes))
    }
}

/// Buffered log holding the entries of one Raft group.
///
/// Entries live in memory; indices are 1-based and contiguous.
#[derive(Debug, Default)]
pub struct BufferedLog {
    entries: VecDeque<LogEntry>,
}

impl BufferedLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the last entry, or 0 for an empty log.
    pub fn last_index(&self) -> LogIndex {
        self.entries.back().map(|e| e.index).unwrap_or(0)
    }

    /// Term of the last entry, or 0 for an empty log.
    pub fn last_term(&self) -> Term {
        self.entries.back().map(|e| e.term).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a new entry at the tail, assigning the next index.
    pub fn append(&mut self, term: Term, data: Vec<u8>) -> LogIndex {
        let index = self.last_index() + 1;
        self.entries.push_back(LogEntry::new(term, index, data));
        index
    }

    /// Append a replicated entry, enforcing index contiguity.
    pub fn append_entry(&mut self, entry: LogEntry) -> Result<()> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(TesseraError::Log(format!(
                "expected index {}, got {}",
                expected, entry.index
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    /// Get an entry by index.
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 || index > self.last_index() {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`; index 0 is the empty-log sentinel.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    /// All entries at or after `index`.
    pub fn entries_from(&self, index: LogIndex) -> Vec<LogEntry> {
        if index == 0 {
            return self.entries.iter().cloned().collect();
        }
        self.entries
            .iter()
            .filter(|e| e.index >= index)
            .cloned()
            .collect()
    }

    /// Drop every entry at or after `index`.
    pub fn truncate_from(&mut self, index: LogIndex) {
        while self.last_index() >= index && !self.entries.is_empty() {
            self.entries.pop_back();
        }
    }
}
