//! # server
//!
//! why: give a raft-core node a clock, a network and a disk
//! relations: wraps RaftNode + Storage behind one lock, calls peers through PeerTransport,
//! hands committed entries to the service over an mpsc channel
//! what: RaftServer (start, handle_peer, submit, report, shutdown) and its three background loops
//!
//! Every transition of the core happens inside one critical section that also
//! persists whatever it dirtied, so no reply or outgoing rpc can observe state
//! that is not yet on disk. The lock is never held across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use raft_core::{CommitEntry, ConflictHint, NodeState, RaftConfig, RaftMessage, RaftNode};
use raft_storage::Storage;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::transport::PeerTransport;
use crate::NodeId;

/// Point-in-time view of a node, for tests and diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub id: NodeId,
    pub term: u64,
    pub state: NodeState,
    pub is_leader: bool,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_log_index: u64,
}

pub struct RaftServer {
    shared: Arc<Shared>,
}

struct Shared {
    id: NodeId,
    peers: Vec<NodeId>,
    timing: RaftConfig,
    rpc_timeout: Duration,
    core: Mutex<Core>,
    transport: Arc<dyn PeerTransport>,
    /// the commit index may have moved past what was delivered
    commit_ready: Notify,
    /// send append entries now instead of waiting for the heartbeat
    replicate_now: Notify,
    /// at most one append in flight per peer
    appending: HashMap<NodeId, AtomicBool>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

struct Core {
    node: RaftNode,
    storage: Box<dyn Storage>,
    election_deadline: Instant,
    rng: StdRng,
}

impl Core {
    fn role(&self) -> (NodeState, u64) {
        (self.node.state, self.node.current_term)
    }

    fn reset_election_deadline(&mut self) {
        let config = &self.node.config;
        let millis = self
            .rng
            .gen_range(config.election_timeout_min..=config.election_timeout_max);
        self.election_deadline = Instant::now() + Duration::from_millis(millis);
    }

    /// Log a role change since `before`, re-arm the timer if we stepped
    /// down, then flush whatever the transition dirtied.
    fn settle(&mut self, id: NodeId, before: (NodeState, u64)) -> Result<()> {
        let (state, term) = self.role();
        if (state, term) != before {
            match state {
                NodeState::Leader => {
                    info!(node = id, term, last_log_index = self.node.last_log_index(), "became leader")
                }
                NodeState::Candidate => info!(node = id, term, "election timeout, campaigning"),
                NodeState::Follower => {
                    info!(node = id, term, from = ?before.0, leader = ?self.node.leader_id, "following");
                    self.reset_election_deadline();
                }
            }
        }
        self.persist()
    }

    fn persist(&mut self) -> Result<()> {
        let delta = self.node.take_unpersisted();
        if delta.is_empty() {
            return Ok(());
        }
        self.storage.persist(&delta)?;
        Ok(())
    }

    fn report(&self, id: NodeId) -> Report {
        Report {
            id,
            term: self.node.current_term,
            state: self.node.state,
            is_leader: self.node.is_leader(),
            leader_id: self.node.leader_id,
            commit_index: self.node.commit_index,
            last_log_index: self.node.last_log_index(),
        }
    }
}

/// Holds a peer's append slot; frees it when dropped, cancellation included
struct AppendSlot<'a>(&'a AtomicBool);

impl<'a> AppendSlot<'a> {
    fn claim(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::AcqRel)).then_some(Self(flag))
    }
}

impl Drop for AppendSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RaftServer {
    /// Restore state from `storage` and start the election timer, the
    /// replication loop and the commit sender.
    ///
    /// Committed entries arrive on the returned channel in index order. The
    /// channel closes when the server stops.
    pub fn start(
        id: NodeId,
        peers: Vec<NodeId>,
        storage: Box<dyn Storage>,
        transport: Arc<dyn PeerTransport>,
        timing: RaftConfig,
        rpc_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CommitEntry>)> {
        timing.validate()?;

        let mut peers = peers;
        peers.retain(|&peer| peer != id);
        peers.sort_unstable();
        peers.dedup();
        let mut cluster = peers.clone();
        cluster.push(id);
        cluster.sort_unstable();

        let state = storage.load_state()?;
        let node = RaftNode::restore(
            id,
            cluster,
            timing.clone(),
            state.current_term,
            state.voted_for,
            state.log,
        )?;
        info!(
            node = id,
            term = node.current_term,
            voted_for = ?node.voted_for,
            last_log_index = node.last_log_index(),
            peers = ?peers,
            "raft server starting"
        );

        let mut core = Core {
            node,
            storage,
            election_deadline: Instant::now(),
            rng: StdRng::from_entropy(),
        };
        core.reset_election_deadline();

        let appending = peers.iter().map(|&peer| (peer, AtomicBool::new(false))).collect();
        let shared = Arc::new(Shared {
            id,
            peers,
            appending,
            timing,
            rpc_timeout,
            core: Mutex::new(core),
            transport,
            commit_ready: Notify::new(),
            replicate_now: Notify::new(),
            shutdown,
            tasks: TaskTracker::new(),
        });

        let (commits_tx, commits_rx) = mpsc::unbounded_channel();
        shared.tasks.spawn(run_election_timer(Arc::clone(&shared)));
        shared.tasks.spawn(run_replication(Arc::clone(&shared)));
        shared
            .tasks
            .spawn(run_commit_sender(Arc::clone(&shared), commits_tx));

        Ok((Self { shared }, commits_rx))
    }

    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    /// Answer a vote request or append entries from `from`.
    ///
    /// The reply is only produced after the resulting state is persisted.
    pub fn handle_peer(&self, from: NodeId, message: RaftMessage) -> Result<RaftMessage> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Err(Error::Unavailable(format!("node {} is stopped", shared.id)));
        }

        let mut core = shared.lock()?;
        let before = core.role();
        let commit_before = core.node.commit_index;

        let reply = match message {
            RaftMessage::VoteRequest {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                let (reply, reset) =
                    core.node
                        .handle_vote_request(term, candidate_id, last_log_index, last_log_term);
                if reset {
                    core.reset_election_deadline();
                }
                debug!(node = shared.id, candidate = candidate_id, term, granted = reset, "vote request");
                reply
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                let count = entries.len();
                let (reply, reset) = core.node.handle_append_entries(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                );
                if reset {
                    core.reset_election_deadline();
                }
                if count > 0 {
                    debug!(node = shared.id, leader = leader_id, term, prev_log_index, count, "append entries");
                }
                reply
            }
            other => {
                return Err(Error::Protocol(format!(
                    "{} sent as a request by node {from}",
                    other.kind()
                )))
            }
        };

        let committed = core.node.commit_index > commit_before;
        if let Err(err) = core.settle(shared.id, before) {
            drop(core);
            shared.fail(&err);
            return Err(err);
        }
        drop(core);

        if committed {
            shared.commit_ready.notify_one();
        }
        Ok(reply)
    }

    /// Append `command` to the leader's log and start replicating it.
    ///
    /// Returns the index the entry was given. Acceptance is not commitment.
    pub fn submit(&self, command: Vec<u8>) -> Result<u64> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Err(Error::Unavailable(format!("node {} is stopped", shared.id)));
        }

        let mut core = shared.lock()?;
        let Some(index) = core.node.submit(command) else {
            return Err(Error::NotLeader {
                leader_hint: core.node.leader_id,
            });
        };
        let term = core.node.current_term;
        if let Err(err) = core.persist() {
            drop(core);
            shared.fail(&err);
            return Err(err);
        }
        drop(core);

        debug!(node = shared.id, index, term, "accepted command");
        shared.replicate_now.notify_one();
        shared.commit_ready.notify_one();
        Ok(index)
    }

    pub fn report(&self) -> Result<Report> {
        let core = self.shared.lock()?;
        Ok(core.report(self.shared.id))
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Background tasks still running
    pub fn active_tasks(&self) -> usize {
        self.shared.tasks.len()
    }

    /// Stop every loop and in-flight rpc and wait for them to finish.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
        info!(node = self.shared.id, "raft server stopped");
    }
}

impl Drop for RaftServer {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Core>> {
        self.core
            .lock()
            .map_err(|_| Error::Fatal("raft state lock poisoned".to_string()))
    }

    /// Stop the node after an error it cannot recover from
    fn fail(&self, err: &Error) {
        error!(node = self.id, %err, "stopping node after fatal error");
        self.shutdown.cancel();
    }

    fn election_deadline(&self) -> Result<Instant> {
        let core = self.lock()?;
        if core.node.is_leader() {
            return Ok(Instant::now() + Duration::from_millis(self.timing.election_timeout_min));
        }
        Ok(core.election_deadline)
    }

    /// Campaign if the deadline passed while we were not leader
    fn maybe_start_election(self: &Arc<Self>) -> Result<()> {
        let (request, won) = {
            let mut core = self.lock()?;
            if core.node.is_leader() || Instant::now() < core.election_deadline {
                return Ok(());
            }
            let before = core.role();
            let request = core.node.start_election();
            core.reset_election_deadline();
            if core.node.has_quorum() {
                core.node.become_leader();
            }
            core.settle(self.id, before)?;
            (request, core.node.is_leader())
        };

        if won {
            self.replicate_now.notify_one();
            return Ok(());
        }
        for &peer in &self.peers {
            let shared = Arc::clone(self);
            let request = request.clone();
            self.tasks.spawn(async move { shared.request_vote(peer, request).await });
        }
        Ok(())
    }

    async fn request_vote(self: Arc<Self>, peer: NodeId, request: RaftMessage) {
        let Some(reply) = self.call(peer, request).await else {
            return;
        };
        let RaftMessage::VoteResponse { term, vote_granted } = reply else {
            warn!(node = self.id, peer, reply = reply.kind(), "unexpected reply to vote request");
            return;
        };
        match self.on_vote_response(peer, term, vote_granted) {
            Ok(true) => self.replicate_now.notify_one(),
            Ok(false) => {}
            Err(err) => self.fail(&err),
        }
    }

    fn on_vote_response(&self, peer: NodeId, term: u64, granted: bool) -> Result<bool> {
        let mut core = self.lock()?;
        let before = core.role();
        let won = core.node.handle_vote_response(term, granted, peer);
        core.settle(self.id, before)?;
        Ok(won)
    }

    /// Send every peer whatever it is missing, or a heartbeat. Peers that
    /// still have an append outstanding are skipped; they are caught up when
    /// it returns.
    fn broadcast_append_entries(self: &Arc<Self>) -> Result<()> {
        let core = self.lock()?;
        if !core.node.is_leader() {
            return Ok(());
        }
        for &peer in &self.peers {
            let Some(flag) = self.appending.get(&peer) else {
                continue;
            };
            if flag.load(Ordering::Acquire) {
                continue;
            }
            let Some(message) = core.node.create_append_entries(peer) else {
                continue;
            };
            let shared = Arc::clone(self);
            self.tasks.spawn(async move { shared.replicate_to(peer, message).await });
        }
        Ok(())
    }

    async fn replicate_to(self: Arc<Self>, peer: NodeId, message: RaftMessage) {
        let Some(flag) = self.appending.get(&peer) else {
            return;
        };
        let Some(slot) = AppendSlot::claim(flag) else {
            return;
        };
        let Some(reply) = self.call(peer, message).await else {
            return;
        };
        let RaftMessage::AppendEntriesResponse {
            term,
            success,
            match_index,
            conflict,
        } = reply
        else {
            warn!(node = self.id, peer, reply = reply.kind(), "unexpected reply to append entries");
            return;
        };

        let outcome = self.on_append_response(peer, term, success, match_index, conflict);
        drop(slot);
        match outcome {
            Ok((advanced, behind)) => {
                if advanced {
                    self.commit_ready.notify_one();
                }
                // followers learn the new commit index, and a lagging peer
                // gets its next batch, without waiting a heartbeat
                if advanced || behind {
                    self.replicate_now.notify_one();
                }
            }
            Err(err) => self.fail(&err),
        }
    }

    fn on_append_response(
        &self,
        peer: NodeId,
        term: u64,
        success: bool,
        match_index: u64,
        conflict: Option<ConflictHint>,
    ) -> Result<(bool, bool)> {
        let mut core = self.lock()?;
        let before = core.role();
        let advanced =
            core.node
                .handle_append_entries_response(term, success, peer, match_index, conflict);
        if advanced {
            debug!(node = self.id, commit_index = core.node.commit_index, "commit index advanced");
        }
        core.settle(self.id, before)?;
        let behind = core.node.is_leader()
            && core
                .node
                .next_index
                .get(&peer)
                .is_some_and(|&next| next <= core.node.last_log_index());
        Ok((advanced, behind))
    }

    fn take_committed(&self) -> Result<Vec<CommitEntry>> {
        let mut core = self.lock()?;
        Ok(core.node.get_entries_to_apply())
    }

    /// One bounded round trip. `None` when the peer is unreachable, too
    /// slow, or we are stopping.
    async fn call(&self, peer: NodeId, message: RaftMessage) -> Option<RaftMessage> {
        let rpc = message.kind();
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            result = timeout(self.rpc_timeout, self.transport.call(peer, message)) => match result {
                Ok(Ok(reply)) => Some(reply),
                Ok(Err(err)) => {
                    debug!(node = self.id, peer, rpc, %err, "rpc failed");
                    None
                }
                Err(_) => {
                    debug!(node = self.id, peer, rpc, "rpc timed out");
                    None
                }
            },
        }
    }
}

async fn run_election_timer(shared: Arc<Shared>) {
    loop {
        let deadline = match shared.election_deadline() {
            Ok(deadline) => deadline,
            Err(err) => return shared.fail(&err),
        };
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = sleep_until(deadline) => {}
        }
        if let Err(err) = shared.maybe_start_election() {
            return shared.fail(&err);
        }
    }
}

async fn run_replication(shared: Arc<Shared>) {
    let heartbeat = Duration::from_millis(shared.timing.heartbeat_interval);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = sleep(heartbeat) => {}
            _ = shared.replicate_now.notified() => {}
        }
        if let Err(err) = shared.broadcast_append_entries() {
            return shared.fail(&err);
        }
    }
}

async fn run_commit_sender(shared: Arc<Shared>, commits: mpsc::UnboundedSender<CommitEntry>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = shared.commit_ready.notified() => {}
        }
        let entries = match shared.take_committed() {
            Ok(entries) => entries,
            Err(err) => return shared.fail(&err),
        };
        for entry in entries {
            debug!(node = shared.id, index = entry.index, term = entry.term, "delivering commit");
            if commits.send(entry).is_err() {
                debug!(node = shared.id, "commit receiver gone");
                return;
            }
        }
    }
}
