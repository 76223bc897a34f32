//! # error
//!
//! why: one error type for everything above the pure raft core
//! relations: returned by server, service, transports and client
//! what: Error enum, Result alias, retry classification

use std::io;

use raft_core::CoreError;
use raft_storage::StorageError;
use thiserror::Error;

use crate::NodeId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("unavailable: {0}")]
    Unavailable(String),

    /// a different command was committed at the index this request was given
    #[error("request was not committed")]
    FailedCommit,

    #[error("unexpected message: {0}")]
    Protocol(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Config(String),

    /// the node can no longer guarantee its invariants and has stopped
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the same request may succeed against another node or later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader { .. }
                | Error::Timeout
                | Error::Unavailable(_)
                | Error::FailedCommit
                | Error::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_errors_are_retryable() {
        assert!(Error::NotLeader { leader_hint: Some(2) }.is_retryable());
        assert!(Error::Timeout.is_retryable());
        assert!(Error::Unavailable("down".into()).is_retryable());
        assert!(Error::FailedCommit.is_retryable());
    }

    #[test]
    fn local_failures_are_not() {
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::Config("bad".into()).is_retryable());
        assert!(!Error::Fatal("gap".into()).is_retryable());
    }

    #[test]
    fn not_leader_mentions_hint() {
        let msg = Error::NotLeader { leader_hint: Some(3) }.to_string();
        assert!(msg.contains("Some(3)"));
    }
}
