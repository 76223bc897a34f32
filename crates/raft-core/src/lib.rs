//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-kv's async server, persisted via raft-storage
//! what: state machine, election logic, log management, message types

pub mod error;
pub mod log;
pub mod message;
pub mod node;

pub use error::CoreError;
pub use log::{CommitEntry, LogEntry};
pub use message::{ConflictHint, RaftMessage};
pub use node::{NodeState, RaftConfig, RaftNode, Unpersisted};
