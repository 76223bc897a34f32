//! In-process network for tests and simulations.
//!
//! Services register under an address string; transports look them up per
//! call, so a crashed service simply stops resolving.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use raft_core::RaftMessage;
use tracing::trace;

use super::{ClientTransport, PeerTransport, RpcHandler};
use crate::error::{Error, Result};
use crate::rpc::{ClientRequest, ClientResponse};
use crate::NodeId;

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<String, Weak<dyn RpcHandler>>>>,
    latency: Option<(Duration, Duration)>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every delivery by a random amount in `[min, max]`
    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.latency = Some((min, max.max(min)));
        self
    }

    pub fn register(&self, addr: impl Into<String>, handler: Arc<dyn RpcHandler>) {
        if let Ok(mut endpoints) = self.endpoints.lock() {
            endpoints.insert(addr.into(), Arc::downgrade(&handler));
        }
    }

    pub fn unregister(&self, addr: &str) {
        if let Ok(mut endpoints) = self.endpoints.lock() {
            endpoints.remove(addr);
        }
    }

    pub fn is_registered(&self, addr: &str) -> bool {
        self.resolve(addr).is_ok()
    }

    /// A transport for node `id` on this network
    pub fn transport(&self, id: NodeId) -> MemoryTransport {
        MemoryTransport {
            id,
            network: self.clone(),
            links: Mutex::new(HashMap::new()),
        }
    }

    fn resolve(&self, addr: &str) -> Result<Arc<dyn RpcHandler>> {
        let endpoints = self
            .endpoints
            .lock()
            .map_err(|_| Error::Unavailable("network lock poisoned".to_string()))?;
        endpoints
            .get(addr)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Unavailable(format!("nothing listening at {addr}")))
    }

    async fn delay(&self) {
        if let Some((min, max)) = self.latency {
            let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
            tokio::time::sleep(Duration::from_millis(millis as u64)).await;
        }
    }
}

#[async_trait]
impl ClientTransport for MemoryNetwork {
    async fn send(&self, addr: &str, request: ClientRequest) -> Result<ClientResponse> {
        let handler = self.resolve(addr)?;
        self.delay().await;
        handler.handle_client(request).await
    }
}

/// One node's outbound links on a `MemoryNetwork`
pub struct MemoryTransport {
    id: NodeId,
    network: MemoryNetwork,
    links: Mutex<HashMap<NodeId, String>>,
}

impl MemoryTransport {
    fn addr_of(&self, peer: NodeId) -> Result<String> {
        let links = self
            .links
            .lock()
            .map_err(|_| Error::Unavailable("link table poisoned".to_string()))?;
        links
            .get(&peer)
            .cloned()
            .ok_or_else(|| Error::Unavailable(format!("not connected to node {peer}")))
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn call(&self, peer: NodeId, message: RaftMessage) -> Result<RaftMessage> {
        let addr = self.addr_of(peer)?;
        let handler = self.network.resolve(&addr)?;
        trace!(from = self.id, to = peer, rpc = message.kind(), "memory rpc");
        self.network.delay().await;
        let reply = handler.handle_peer(self.id, message).await?;
        self.network.delay().await;

        // the link may have been cut while the call was in flight
        if !self.is_connected(peer) {
            return Err(Error::Unavailable(format!("link to node {peer} dropped")));
        }
        Ok(reply)
    }

    fn connect(&self, peer: NodeId, addr: &str) -> Result<()> {
        self.network.resolve(addr)?;
        let mut links = self
            .links
            .lock()
            .map_err(|_| Error::Unavailable("link table poisoned".to_string()))?;
        links.insert(peer, addr.to_string());
        Ok(())
    }

    fn disconnect(&self, peer: NodeId) {
        if let Ok(mut links) = self.links.lock() {
            links.remove(&peer);
        }
    }

    fn disconnect_all(&self) {
        if let Ok(mut links) = self.links.lock() {
            links.clear();
        }
    }

    fn is_connected(&self, peer: NodeId) -> bool {
        self.links
            .lock()
            .map(|links| links.contains_key(&peer))
            .unwrap_or(false)
    }
}
