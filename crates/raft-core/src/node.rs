//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management
//! what: NodeState enum, RaftConfig, RaftNode with election, replication and commit logic
//!
//! The node is deliberately free of clocks and sockets. Every handler is a
//! synchronous transition that returns the reply to send and whether the
//! caller should reset its election timer; the async runtime owning the node
//! decides when timers fire and where messages go.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::CoreError;
use crate::log::{check_contiguous, position, CommitEntry, LogEntry};
use crate::message::{ConflictHint, RaftMessage};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

/// Timing parameters, all in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    pub heartbeat_interval: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
        }
    }
}

impl RaftConfig {
    /// Reject timings under which a healthy leader could not hold its term
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.election_timeout_min == 0 || self.heartbeat_interval == 0 {
            return Err(CoreError::InvalidConfig(
                "timeouts must be non-zero".to_string(),
            ));
        }
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(CoreError::InvalidConfig(format!(
                "election_timeout_min ({}) must be below election_timeout_max ({})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(CoreError::InvalidConfig(format!(
                "heartbeat_interval ({}) must be below election_timeout_min ({})",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        Ok(())
    }
}

/// State changed since the last flush to durable storage
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Unpersisted {
    /// New `(current_term, voted_for)` if either changed
    pub term_and_vote: Option<(u64, Option<u64>)>,
    /// First rewritten index and every entry from there to the end of the log.
    /// Storage must drop everything at or after that index before appending.
    pub log_suffix: Option<(u64, Vec<LogEntry>)>,
}

impl Unpersisted {
    pub fn is_empty(&self) -> bool {
        self.term_and_vote.is_none() && self.log_suffix.is_none()
    }
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: u64,
    /// Every voting member, this node included
    pub cluster_nodes: Vec<u64>,
    pub config: RaftConfig,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<u64>,
    /// Leader we last accepted entries from in the current term
    pub leader_id: Option<u64>,
    pub log: Vec<LogEntry>,
    pub commit_index: u64,
    /// Highest index handed out by `get_entries_to_apply`
    pub last_applied: u64,
    /// Candidate only: voters that granted us their vote this term
    pub votes_received: Vec<u64>,
    /// Leader only: next index to send to each peer
    pub next_index: HashMap<u64, u64>,
    /// Leader only: highest index known to be replicated on each peer
    pub match_index: HashMap<u64, u64>,
    hard_state_dirty: bool,
    log_dirty_from: Option<u64>,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: u64, cluster_nodes: Vec<u64>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    pub fn with_config(id: u64, cluster_nodes: Vec<u64>, config: RaftConfig) -> Self {
        Self {
            id,
            cluster_nodes,
            config,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            votes_received: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            hard_state_dirty: false,
            log_dirty_from: None,
        }
    }

    /// Rebuild a node from persisted term, vote and log after a restart.
    ///
    /// Commit index and leader bookkeeping are volatile and start from zero;
    /// they are re-learned from the current leader.
    pub fn restore(
        id: u64,
        cluster_nodes: Vec<u64>,
        config: RaftConfig,
        current_term: u64,
        voted_for: Option<u64>,
        log: Vec<LogEntry>,
    ) -> Result<Self, CoreError> {
        if !cluster_nodes.contains(&id) {
            return Err(CoreError::NotMember { id });
        }
        check_contiguous(&log).map_err(|expected| CoreError::NonContiguousLog { expected })?;
        if let Some(last) = log.last() {
            if last.term > current_term {
                return Err(CoreError::FutureTerm {
                    index: last.index,
                    term: last.term,
                    current_term,
                });
            }
        }

        let mut node = Self::with_config(id, cluster_nodes, config);
        node.current_term = current_term;
        node.voted_for = voted_for;
        node.log = log;
        Ok(node)
    }

    // -- membership --

    /// Every member except this node
    pub fn peers(&self) -> impl Iterator<Item = u64> + '_ {
        self.cluster_nodes.iter().copied().filter(move |&n| n != self.id)
    }

    /// Votes or acknowledgements needed, this node included
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    // -- role transitions --

    /// Election timeout fired: become candidate for the next term.
    ///
    /// Returns the vote request to broadcast to every peer.
    pub fn start_election(&mut self) -> RaftMessage {
        self.state = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.votes_received = vec![self.id];
        self.hard_state_dirty = true;

        RaftMessage::VoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        }
    }

    /// Step down. The vote is only cleared when the term moves forward.
    pub fn become_follower(&mut self, term: u64) {
        self.state = NodeState::Follower;
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.hard_state_dirty = true;
        }
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();

        let next = self.last_log_index() + 1;
        let peers: Vec<u64> = self.peers().collect();
        self.next_index = peers.iter().map(|&p| (p, next)).collect();
        self.match_index = peers.iter().map(|&p| (p, 0)).collect();
    }

    // -- elections --

    /// Returns the reply and whether the election timer should be reset.
    pub fn handle_vote_request(
        &mut self,
        term: u64,
        candidate_id: u64,
        last_log_index: u64,
        last_log_term: u64,
    ) -> (RaftMessage, bool) {
        if term > self.current_term {
            self.become_follower(term);
        }

        if term < self.current_term {
            return (self.vote_reply(false), false);
        }

        let free_to_vote = self.voted_for.map_or(true, |v| v == candidate_id);
        let up_to_date = last_log_term > self.last_log_term()
            || (last_log_term == self.last_log_term() && last_log_index >= self.last_log_index());

        if free_to_vote && up_to_date {
            if self.voted_for != Some(candidate_id) {
                self.voted_for = Some(candidate_id);
                self.hard_state_dirty = true;
            }
            (self.vote_reply(true), true)
        } else {
            (self.vote_reply(false), false)
        }
    }

    fn vote_reply(&self, vote_granted: bool) -> RaftMessage {
        RaftMessage::VoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Count a vote. Returns true when this response made us leader.
    pub fn handle_vote_response(&mut self, term: u64, vote_granted: bool, from: u64) -> bool {
        if term > self.current_term {
            self.become_follower(term);
            return false;
        }
        if self.state != NodeState::Candidate || term != self.current_term {
            return false;
        }

        if vote_granted && !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }

        if self.has_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    // -- replication, leader side --

    /// Append a command to the leader's log. Callers must check leadership.
    pub fn append_entry(&mut self, command: Vec<u8>) -> LogEntry {
        let entry = LogEntry::new(self.current_term, self.last_log_index() + 1, command);
        self.mark_log_dirty(entry.index);
        self.log.push(entry.clone());
        // a lone node is its own majority
        self.advance_commit_index();
        entry
    }

    /// Accept a client command if we are leader; returns its log index.
    pub fn submit(&mut self, command: Vec<u8>) -> Option<u64> {
        if !self.is_leader() {
            return None;
        }
        Some(self.append_entry(command).index)
    }

    /// Build the append for one peer: everything from its next index onward,
    /// or an empty heartbeat when it is caught up.
    pub fn create_append_entries(&self, peer: u64) -> Option<RaftMessage> {
        if !self.is_leader() {
            return None;
        }

        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.last_log_index() + 1)
            .max(1);
        let prev_log_index = next - 1;
        let entries = match position(&self.log, next) {
            Some(start) => self.log[start..].to_vec(),
            None => Vec::new(),
        };

        Some(RaftMessage::AppendEntries {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.get_term_at(prev_log_index),
            entries,
            leader_commit: self.commit_index,
        })
    }

    /// Process a peer's append reply. Returns true if the commit index advanced.
    pub fn handle_append_entries_response(
        &mut self,
        term: u64,
        success: bool,
        from: u64,
        match_index: u64,
        conflict: Option<ConflictHint>,
    ) -> bool {
        if term > self.current_term {
            self.become_follower(term);
            return false;
        }
        if !self.is_leader() || term != self.current_term {
            return false;
        }

        let matched = self.match_index.get(&from).copied().unwrap_or(0);
        if success {
            let matched = matched.max(match_index);
            self.match_index.insert(from, matched);
            self.next_index.insert(from, matched + 1);
            return self.advance_commit_index();
        }

        let current_next = self.next_index.get(&from).copied().unwrap_or(1);
        let next = match conflict {
            Some(ConflictHint { index, term: 0 }) => index,
            Some(ConflictHint { index, term }) => match self.last_index_of_term(term) {
                Some(last) => last + 1,
                None => index,
            },
            None => current_next.saturating_sub(1),
        };
        self.next_index.insert(from, next.max(matched + 1).max(1));
        false
    }

    /// Commit the highest current-term index held by a majority.
    ///
    /// Entries from earlier terms are never counted directly; they commit
    /// when a later current-term entry does.
    pub fn advance_commit_index(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }

        let before = self.commit_index;
        for n in (self.commit_index + 1)..=self.last_log_index() {
            if self.get_term_at(n) != self.current_term {
                continue;
            }
            let replicas = 1 + self
                .match_index
                .values()
                .filter(|&&matched| matched >= n)
                .count();
            if replicas >= self.quorum_size() {
                self.commit_index = n;
            }
        }
        self.commit_index > before
    }

    // -- replication, follower side --

    /// Returns the reply and whether the election timer should be reset.
    pub fn handle_append_entries(
        &mut self,
        term: u64,
        leader_id: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> (RaftMessage, bool) {
        if term < self.current_term {
            return (self.append_reply(false, 0, None), false);
        }
        if term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(term);
        }
        self.leader_id = Some(leader_id);

        if prev_log_index > self.last_log_index() {
            let hint = ConflictHint {
                index: self.last_log_index() + 1,
                term: 0,
            };
            return (self.append_reply(false, 0, Some(hint)), true);
        }
        let local_term = self.get_term_at(prev_log_index);
        if prev_log_index > 0 && local_term != prev_log_term {
            let hint = ConflictHint {
                index: self.first_index_of_term(local_term, prev_log_index),
                term: local_term,
            };
            return (self.append_reply(false, 0, Some(hint)), true);
        }

        let match_index = prev_log_index + entries.len() as u64;
        self.merge_entries(prev_log_index, entries);

        if leader_commit > self.commit_index {
            let commit = leader_commit.min(match_index);
            if commit > self.commit_index {
                self.commit_index = commit;
            }
        }

        (self.append_reply(true, match_index, None), true)
    }

    /// Skip entries we already hold, truncate at the first term mismatch,
    /// append the rest. Stale duplicates never shorten the log.
    fn merge_entries(&mut self, prev_log_index: u64, entries: Vec<LogEntry>) {
        let mut new_from = entries.len();
        for (offset, entry) in entries.iter().enumerate() {
            let index = prev_log_index + 1 + offset as u64;
            if index > self.last_log_index() {
                new_from = offset;
                break;
            }
            if self.get_term_at(index) != entry.term {
                debug_assert!(index > self.commit_index, "truncating committed entry {index}");
                self.log.truncate((index - 1) as usize);
                new_from = offset;
                break;
            }
        }

        if new_from < entries.len() {
            let first = prev_log_index + 1 + new_from as u64;
            self.mark_log_dirty(first);
            self.log.extend(entries.into_iter().skip(new_from));
        }
    }

    fn append_reply(&self, success: bool, match_index: u64, conflict: Option<ConflictHint>) -> RaftMessage {
        RaftMessage::AppendEntriesResponse {
            term: self.current_term,
            success,
            match_index,
            conflict,
        }
    }

    // -- application --

    /// Committed entries not yet handed out; advances `last_applied`.
    pub fn get_entries_to_apply(&mut self) -> Vec<CommitEntry> {
        if self.commit_index <= self.last_applied {
            return Vec::new();
        }
        let from = self.last_applied as usize;
        let to = (self.commit_index as usize).min(self.log.len());
        let entries: Vec<CommitEntry> = self.log[from..to].iter().map(CommitEntry::from).collect();
        self.last_applied = to as u64;
        entries
    }

    // -- persistence --

    /// Drain everything that changed since the last call.
    pub fn take_unpersisted(&mut self) -> Unpersisted {
        let term_and_vote = if std::mem::take(&mut self.hard_state_dirty) {
            Some((self.current_term, self.voted_for))
        } else {
            None
        };
        let log_suffix = self.log_dirty_from.take().map(|from| {
            let start = ((from - 1) as usize).min(self.log.len());
            (from, self.log[start..].to_vec())
        });
        Unpersisted {
            term_and_vote,
            log_suffix,
        }
    }

    fn mark_log_dirty(&mut self, from: u64) {
        self.log_dirty_from = Some(self.log_dirty_from.map_or(from, |d| d.min(from)));
    }

    // -- log helpers --

    pub fn last_log_index(&self) -> u64 {
        self.log.last().map_or(0, |e| e.index)
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map_or(0, |e| e.term)
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        position(&self.log, index).map(|i| &self.log[i])
    }

    /// Term at `index`, 0 when absent
    pub fn get_term_at(&self, index: u64) -> u64 {
        self.get_entry(index).map_or(0, |e| e.term)
    }

    fn first_index_of_term(&self, term: u64, at_or_before: u64) -> u64 {
        let mut index = at_or_before;
        while index > 1 && self.get_term_at(index - 1) == term {
            index -= 1;
        }
        index
    }

    fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.log.iter().rev().find(|e| e.term == term).map(|e| e.index)
    }
}
