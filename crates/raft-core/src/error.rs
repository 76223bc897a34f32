//! # error
//!
//! why: report why persisted or configured state cannot back a node
//! relations: returned by node.rs restore/validate, wrapped by raft-kv
//! what: CoreError

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("node {id} is not a member of its own cluster")]
    NotMember { id: u64 },

    #[error("log is not contiguous: expected index {expected}")]
    NonContiguousLog { expected: u64 },

    #[error("entry {index} has term {term}, beyond persisted term {current_term}")]
    FutureTerm { index: u64, term: u64, current_term: u64 },

    #[error("invalid raft config: {0}")]
    InvalidConfig(String),
}
