//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: used by node.rs for state transitions, serialized for network by raft-kv
//! what: VoteRequest, VoteResponse, AppendEntries, AppendEntriesResponse, ConflictHint

use serde::{Deserialize, Serialize};

use crate::LogEntry;

/// Where a follower's log diverged from the leader's claimed previous entry.
///
/// `term` is 0 when the follower's log is simply too short; `index` is then
/// one past the follower's last entry. Otherwise `term` is the conflicting
/// term and `index` the first entry the follower holds for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictHint {
    pub index: u64,
    pub term: u64,
}

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaftMessage {
    /// Request a vote during leader election
    VoteRequest {
        term: u64,
        candidate_id: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    /// Response to a vote request
    VoteResponse {
        term: u64,
        vote_granted: bool,
    },
    /// Replicate log entries (also serves as heartbeat when entries is empty)
    AppendEntries {
        term: u64,
        leader_id: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    /// Response to AppendEntries
    AppendEntriesResponse {
        term: u64,
        success: bool,
        /// Highest index known to match the leader, valid when `success`
        match_index: u64,
        conflict: Option<ConflictHint>,
    },
}

impl RaftMessage {
    /// The term carried by any message
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::VoteRequest { term, .. }
            | RaftMessage::VoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesResponse { term, .. } => *term,
        }
    }

    /// True for messages a peer sends unprompted (as opposed to replies)
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            RaftMessage::VoteRequest { .. } | RaftMessage::AppendEntries { .. }
        )
    }

    /// Short name for log fields
    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::VoteRequest { .. } => "vote_request",
            RaftMessage::VoteResponse { .. } => "vote_response",
            RaftMessage::AppendEntries { .. } => "append_entries",
            RaftMessage::AppendEntriesResponse { .. } => "append_entries_response",
        }
    }
}
