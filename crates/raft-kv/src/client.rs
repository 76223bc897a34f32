//! # client
//!
//! why: callers should not have to know which node currently leads
//! relations: talks to KvService instances through a ClientTransport
//! what: KvClient with put/get/cas, leader discovery by rotation, deadline and cancellation

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::rpc::{ClientRequest, ClientResponse, ResponseStatus};
use crate::transport::ClientTransport;
use crate::NodeId;

const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(300);
const DEFAULT_BACKOFF: Duration = Duration::from_millis(50);

/// Sends each request to the node it believes leads, moving on to the next
/// address whenever that node refuses, fails the commit, or cannot be
/// reached. The last node that succeeded is tried first next time.
///
/// When node ids are known (`with_node_ids`), a refusal that names the
/// leader sends the next attempt straight there.
pub struct KvClient {
    addrs: Vec<String>,
    /// node id -> position in `addrs`
    members: HashMap<NodeId, usize>,
    transport: Arc<dyn ClientTransport>,
    assumed_leader: AtomicUsize,
    deadline: Duration,
    attempt_timeout: Duration,
    backoff: Duration,
    cancel: Option<CancellationToken>,
}

impl KvClient {
    /// Try `addrs` in the given order
    pub fn new(transport: Arc<dyn ClientTransport>, addrs: Vec<String>) -> Self {
        Self {
            addrs,
            members: HashMap::new(),
            transport,
            assumed_leader: AtomicUsize::new(0),
            deadline: DEFAULT_DEADLINE,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            backoff: DEFAULT_BACKOFF,
            cancel: None,
        }
    }

    /// Try `addrs` in a random order, so many clients spread their first attempts
    pub fn with_random_order(transport: Arc<dyn ClientTransport>, mut addrs: Vec<String>) -> Self {
        addrs.shuffle(&mut rand::thread_rng());
        Self::new(transport, addrs)
    }

    /// Tell the client which node listens where, so leader hints can be followed.
    /// Pairs whose address is not one of the client's are ignored.
    pub fn with_node_ids(mut self, nodes: impl IntoIterator<Item = (NodeId, String)>) -> Self {
        for (id, addr) in nodes {
            if let Some(pos) = self.addrs.iter().position(|a| *a == addr) {
                self.members.insert(id, pos);
            }
        }
        self
    }

    /// Give up on a request after `deadline`
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Bound for a single node's answer before trying the next one
    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// Abort in-flight requests when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    /// Set `key`; returns the previous value and whether there was one
    pub async fn put(&self, key: &str, value: &str) -> Result<(String, bool)> {
        let request = ClientRequest::Put {
            key: key.to_string(),
            value: value.to_string(),
        };
        self.send(request).await.map(|r| (r.value, r.key_found))
    }

    pub async fn get(&self, key: &str) -> Result<(String, bool)> {
        let request = ClientRequest::Get {
            key: key.to_string(),
        };
        self.send(request).await.map(|r| (r.value, r.key_found))
    }

    /// Set `key` to `value` if it currently equals `compare`.
    ///
    /// Returns the value before the call and whether the key existed; the
    /// swap happened exactly when the key existed and that value equals `compare`.
    pub async fn cas(&self, key: &str, compare: &str, value: &str) -> Result<(String, bool)> {
        let request = ClientRequest::Cas {
            key: key.to_string(),
            compare: compare.to_string(),
            value: value.to_string(),
        };
        self.send(request).await.map(|r| (r.value, r.key_found))
    }

    async fn send(&self, request: ClientRequest) -> Result<ClientResponse> {
        if self.addrs.is_empty() {
            return Err(Error::Config("client has no server addresses".to_string()));
        }

        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(Error::Cancelled),
            result = timeout(self.deadline, self.find_leader(&request)) => {
                result.unwrap_or(Err(Error::Timeout))
            }
        }
    }

    async fn find_leader(&self, request: &ClientRequest) -> Result<ClientResponse> {
        let n = self.addrs.len();
        let mut index = self.assumed_leader.load(Ordering::Relaxed) % n;
        let mut attempts = 0usize;

        loop {
            let addr = &self.addrs[index];
            let mut hinted = None;
            let outcome = timeout(
                self.attempt_timeout,
                self.transport.send(addr, request.clone()),
            )
            .await;

            match outcome {
                Ok(Ok(response)) => match response.status {
                    ResponseStatus::Ok => {
                        self.assumed_leader.store(index, Ordering::Relaxed);
                        return Ok(response);
                    }
                    status => {
                        hinted = response
                            .leader_hint
                            .and_then(|id| self.members.get(&id).copied())
                            .filter(|&pos| pos != index);
                        debug!(addr = %addr, ?status, hint = ?response.leader_hint, "trying next server")
                    }
                },
                Ok(Err(err)) if err.is_retryable() => {
                    debug!(addr = %addr, %err, "server unreachable")
                }
                Ok(Err(err)) => warn!(addr = %addr, %err, "server failed the request"),
                Err(_) => debug!(addr = %addr, "server did not answer in time"),
            }

            index = hinted.unwrap_or((index + 1) % n);
            attempts += 1;
            if attempts % n == 0 {
                sleep(self.backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers from a fixed script per address and records who was asked
    #[derive(Default)]
    struct Scripted {
        answers: HashMap<String, ResponseStatus>,
        /// leader named by a NotLeader answer from this address
        hints: HashMap<String, NodeId>,
        asked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ClientTransport for Scripted {
        async fn send(&self, addr: &str, _request: ClientRequest) -> Result<ClientResponse> {
            self.asked.lock().unwrap().push(addr.to_string());
            match self.answers.get(addr) {
                Some(ResponseStatus::Ok) => Ok(ClientResponse::ok(crate::CommandResult {
                    value: addr.to_string(),
                    key_found: true,
                })),
                Some(ResponseStatus::NotLeader) => {
                    Ok(ClientResponse::not_leader(self.hints.get(addr).copied()))
                }
                Some(ResponseStatus::FailedCommit) => Ok(ClientResponse::failed_commit()),
                Some(ResponseStatus::Timeout) => Ok(ClientResponse::timeout()),
                None => Err(Error::Unavailable(addr.to_string())),
            }
        }
    }

    fn scripted(answers: &[(&str, ResponseStatus)]) -> Arc<Scripted> {
        Arc::new(Scripted {
            answers: answers.iter().map(|(a, s)| (a.to_string(), *s)).collect(),
            hints: HashMap::new(),
            asked: Mutex::new(Vec::new()),
        })
    }

    fn addrs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn rotates_to_leader_and_remembers_it() {
        let transport = scripted(&[
            ("a", ResponseStatus::NotLeader),
            ("c", ResponseStatus::Ok),
        ]);
        let client = KvClient::new(transport.clone(), addrs(&["a", "b", "c"]));

        let (value, found) = client.get("k").await.unwrap();
        assert_eq!(value, "c");
        assert!(found);
        assert_eq!(*transport.asked.lock().unwrap(), addrs(&["a", "b", "c"]));

        client.put("k", "v").await.unwrap();
        assert_eq!(transport.asked.lock().unwrap().last().unwrap(), "c");
        assert_eq!(transport.asked.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn follows_leader_hint_when_id_is_known() {
        let transport = Arc::new(Scripted {
            answers: [("a", ResponseStatus::NotLeader), ("d", ResponseStatus::Ok)]
                .iter()
                .map(|(a, s)| (a.to_string(), *s))
                .collect(),
            hints: HashMap::from([("a".to_string(), 3)]),
            asked: Mutex::new(Vec::new()),
        });
        let client = KvClient::new(transport.clone(), addrs(&["a", "b", "c", "d"]))
            .with_node_ids([(0, "a"), (1, "b"), (2, "c"), (3, "d")].map(|(id, a)| (id, a.to_string())));

        assert_eq!(client.get("k").await.unwrap().0, "d");
        assert_eq!(*transport.asked.lock().unwrap(), addrs(&["a", "d"]));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_hint_falls_back_to_rotation() {
        let transport = Arc::new(Scripted {
            answers: [("a", ResponseStatus::NotLeader), ("b", ResponseStatus::Ok)]
                .iter()
                .map(|(a, s)| (a.to_string(), *s))
                .collect(),
            hints: HashMap::from([("a".to_string(), 9)]),
            asked: Mutex::new(Vec::new()),
        });
        let client = KvClient::new(transport.clone(), addrs(&["a", "b"]))
            .with_node_ids([(0, "a".to_string()), (1, "b".to_string())]);

        assert_eq!(client.get("k").await.unwrap().0, "b");
        assert_eq!(*transport.asked.lock().unwrap(), addrs(&["a", "b"]));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_commit_moves_on() {
        let transport = scripted(&[
            ("a", ResponseStatus::FailedCommit),
            ("b", ResponseStatus::Ok),
        ]);
        let client = KvClient::new(transport, addrs(&["a", "b"]));
        assert_eq!(client.cas("k", "x", "y").await.unwrap().0, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_deadline() {
        let transport = scripted(&[("a", ResponseStatus::NotLeader)]);
        let client = KvClient::new(transport, addrs(&["a", "b"]))
            .with_deadline(Duration::from_millis(500));

        let started = tokio::time::Instant::now();
        assert!(matches!(client.get("k").await, Err(Error::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins() {
        let token = CancellationToken::new();
        let transport = scripted(&[]);
        let client = KvClient::new(transport, addrs(&["a"])).with_cancellation(token.clone());

        token.cancel();
        assert!(matches!(client.put("k", "v").await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn no_addresses_is_a_config_error() {
        let client = KvClient::new(scripted(&[]), vec![]);
        assert!(matches!(client.get("k").await, Err(Error::Config(_))));
    }

    #[test]
    fn random_order_keeps_every_address() {
        let client = KvClient::with_random_order(scripted(&[]), addrs(&["a", "b", "c", "d"]));
        let mut seen = client.addrs().to_vec();
        seen.sort();
        assert_eq!(seen, addrs(&["a", "b", "c", "d"]));
    }
}
