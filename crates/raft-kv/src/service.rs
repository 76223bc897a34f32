//! # service
//!
//! why: expose the replicated log as a key-value store
//! relations: owns a RaftServer and the KvStore it feeds, answers RpcHandler calls from
//! transports, clients reach it through KvClient
//! what: KvService (start, handle_client, peer link management, serve_tcp, shutdown)

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use raft_core::{CommitEntry, RaftMessage};
use raft_storage::Storage;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::command::{Command, CommandResult};
use crate::config::RaftSettings;
use crate::error::{Error, Result};
use crate::rpc::{ClientRequest, ClientResponse};
use crate::server::{RaftServer, Report};
use crate::store::KvStore;
use crate::transport::{tcp, PeerTransport, RpcHandler};
use crate::NodeId;

/// What the apply task hands back to a waiting request
#[derive(Debug)]
struct Applied {
    command: Command,
    result: CommandResult,
}

type Subscriptions = HashMap<u64, oneshot::Sender<Applied>>;

pub struct KvService {
    id: NodeId,
    server: RaftServer,
    transport: Arc<dyn PeerTransport>,
    store: Arc<Mutex<KvStore>>,
    subscriptions: Arc<Mutex<Subscriptions>>,
    next_request_id: AtomicU64,
    commit_timeout: Duration,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl KvService {
    /// Start a node: restore from `storage`, run consensus, and apply
    /// committed commands to a fresh store.
    ///
    /// Peers are not connected yet; see `connect_to_peer`.
    pub fn start(
        id: NodeId,
        peers: Vec<NodeId>,
        storage: Box<dyn Storage>,
        transport: Arc<dyn PeerTransport>,
        settings: RaftSettings,
    ) -> Result<Arc<Self>> {
        settings.validate()?;

        let shutdown = CancellationToken::new();
        let (server, commits) = RaftServer::start(
            id,
            peers,
            storage,
            Arc::clone(&transport),
            settings.timing.clone(),
            settings.rpc_timeout(),
            shutdown.child_token(),
        )?;

        let service = Arc::new(Self {
            id,
            server,
            transport,
            store: Arc::new(Mutex::new(KvStore::new())),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: AtomicU64::new(u64::from(rand::random::<u32>()) << 32),
            commit_timeout: settings.commit_timeout(),
            shutdown,
            tasks: TaskTracker::new(),
        });

        service.tasks.spawn(run_applier(
            id,
            commits,
            Arc::clone(&service.store),
            Arc::clone(&service.subscriptions),
            service.shutdown.clone(),
        ));
        info!(node = id, "kv service started");
        Ok(service)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn connect_to_peer(&self, peer: NodeId, addr: &str) -> Result<()> {
        self.transport.connect(peer, addr)?;
        debug!(node = self.id, peer, addr, "connected to peer");
        Ok(())
    }

    pub fn disconnect_peer(&self, peer: NodeId) {
        self.transport.disconnect(peer);
        debug!(node = self.id, peer, "disconnected from peer");
    }

    pub fn disconnect_all(&self) {
        self.transport.disconnect_all();
        debug!(node = self.id, "disconnected from all peers");
    }

    pub fn report(&self) -> Result<Report> {
        self.server.report()
    }

    /// Copy of the applied key-value contents
    pub fn store_snapshot(&self) -> Result<std::collections::BTreeMap<String, String>> {
        Ok(lock(&self.store)?.snapshot())
    }

    /// Run `request` through consensus and wait for it to be applied.
    ///
    /// Reads go through the log too, so a deposed leader cannot serve stale data.
    pub async fn handle_client(&self, request: ClientRequest) -> Result<ClientResponse> {
        if self.shutdown.is_cancelled() || self.server.is_stopped() {
            return Err(Error::Unavailable(format!("node {} is stopped", self.id)));
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let command = Command::from_request(request, self.id, request_id);
        let encoded = command.encode()?;

        // subscribe under the same lock as submitting so the apply task can
        // never deliver this index before we are listening
        let (index, applied) = {
            let mut subs = lock(&self.subscriptions)?;
            let index = match self.server.submit(encoded) {
                Ok(index) => index,
                Err(Error::NotLeader { leader_hint }) => {
                    return Ok(ClientResponse::not_leader(leader_hint))
                }
                Err(err) => return Err(err),
            };
            let (tx, rx) = oneshot::channel();
            subs.insert(index, tx);
            (index, rx)
        };
        debug!(node = self.id, index, kind = ?command.kind, key = %command.key, "waiting for commit");

        match timeout(self.commit_timeout, applied).await {
            Ok(Ok(applied)) if applied.command.same_submission(&command) => {
                Ok(ClientResponse::ok(applied.result))
            }
            Ok(Ok(_)) => {
                info!(node = self.id, index, "another command committed at our index");
                Ok(ClientResponse::failed_commit())
            }
            // sender dropped: the slot was reused or the node is stopping
            Ok(Err(_)) => Ok(ClientResponse::failed_commit()),
            Err(_) => {
                if let Ok(mut subs) = lock(&self.subscriptions) {
                    if subs.get(&index).is_some_and(|tx| tx.is_closed()) {
                        subs.remove(&index);
                    }
                }
                debug!(node = self.id, index, "commit wait timed out");
                Ok(ClientResponse::timeout())
            }
        }
    }

    /// Answer peers and clients on `listener` until shutdown
    pub fn serve_tcp(self: &Arc<Self>, listener: TcpListener) {
        let handler: Arc<dyn RpcHandler> = Arc::clone(self) as Arc<dyn RpcHandler>;
        self.tasks.spawn(tcp::serve(
            listener,
            handler,
            self.shutdown.clone(),
            self.tasks.clone(),
        ));
    }

    /// Background tasks still running, consensus included
    pub fn active_tasks(&self) -> usize {
        self.tasks.len() + self.server.active_tasks()
    }

    /// Drop every peer link, stop consensus, the apply task and any listener,
    /// and wait for all of them. Pending requests resolve as failed.
    pub async fn shutdown(&self) {
        self.transport.disconnect_all();
        self.shutdown.cancel();
        self.server.shutdown().await;
        if let Ok(mut subs) = lock(&self.subscriptions) {
            subs.clear();
        }
        self.tasks.close();
        self.tasks.wait().await;
        info!(node = self.id, "kv service stopped");
    }
}

#[async_trait]
impl RpcHandler for KvService {
    async fn handle_peer(&self, from: NodeId, message: RaftMessage) -> Result<RaftMessage> {
        self.server.handle_peer(from, message)
    }

    async fn handle_client(&self, request: ClientRequest) -> Result<ClientResponse> {
        KvService::handle_client(self, request).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Fatal("service lock poisoned".to_string()))
}

/// Apply committed commands in order and wake whoever submitted them
async fn run_applier(
    id: NodeId,
    mut commits: mpsc::UnboundedReceiver<CommitEntry>,
    store: Arc<Mutex<KvStore>>,
    subscriptions: Arc<Mutex<Subscriptions>>,
    shutdown: CancellationToken,
) {
    while let Some(entry) = commits.recv().await {
        if let Err(err) = apply_one(&entry, &store, &subscriptions) {
            error!(node = id, index = entry.index, %err, "cannot apply committed entry, stopping");
            shutdown.cancel();
            return;
        }
    }
    debug!(node = id, "commit channel closed");
}

fn apply_one(
    entry: &CommitEntry,
    store: &Mutex<KvStore>,
    subscriptions: &Mutex<Subscriptions>,
) -> Result<()> {
    let command = Command::decode(&entry.command)?;
    let result = lock(store)?.apply(entry.index, &command)?;

    if let Some(tx) = lock(subscriptions)?.remove(&entry.index) {
        if tx.send(Applied { command, result }).is_err() {
            warn!(index = entry.index, "requester stopped waiting before apply");
        }
    }
    Ok(())
}
