//! # log
//!
//! why: model the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, persisted via raft-storage
//! what: LogEntry, CommitEntry handed to the application, log matching helpers

use serde::{Deserialize, Serialize};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }
}

/// A committed entry, delivered exactly once and in index order to the
/// application layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub command: Vec<u8>,
    pub index: u64,
    pub term: u64,
}

impl From<&LogEntry> for CommitEntry {
    fn from(entry: &LogEntry) -> Self {
        Self {
            command: entry.command.clone(),
            index: entry.index,
            term: entry.term,
        }
    }
}

/// Position in the log vector for a 1-based index, if it exists.
pub(crate) fn position(log: &[LogEntry], index: u64) -> Option<usize> {
    if index == 0 || index > log.len() as u64 {
        return None;
    }
    Some((index - 1) as usize)
}

/// Checks that a log is contiguous from index 1.
///
/// Returns the first index that breaks the sequence.
pub fn check_contiguous(log: &[LogEntry]) -> Result<(), u64> {
    for (i, entry) in log.iter().enumerate() {
        let expected = i as u64 + 1;
        if entry.index != expected {
            return Err(expected);
        }
    }
    Ok(())
}
