//! # transport
//!
//! why: keep the consensus server and the client independent of how bytes move
//! relations: RaftServer calls out through PeerTransport, KvService answers as an RpcHandler,
//! KvClient reaches services through ClientTransport
//! what: the three traits plus in-memory and tcp implementations

pub mod memory;
pub mod tcp;

use async_trait::async_trait;
use raft_core::RaftMessage;

use crate::error::Result;
use crate::rpc::{ClientRequest, ClientResponse};
use crate::NodeId;

/// Whatever answers rpcs addressed to one node
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle_peer(&self, from: NodeId, message: RaftMessage) -> Result<RaftMessage>;

    async fn handle_client(&self, request: ClientRequest) -> Result<ClientResponse>;
}

/// Outbound links from one node to its peers.
///
/// Links are one-directional: disconnecting here stops this node's calls,
/// the peer's own transport decides whether it can still reach us.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn call(&self, peer: NodeId, message: RaftMessage) -> Result<RaftMessage>;

    fn connect(&self, peer: NodeId, addr: &str) -> Result<()>;

    fn disconnect(&self, peer: NodeId);

    fn disconnect_all(&self);

    fn is_connected(&self, peer: NodeId) -> bool;
}

/// How a client reaches a service by address
#[async_trait]
pub trait ClientTransport: Send + Sync + 'static {
    async fn send(&self, addr: &str, request: ClientRequest) -> Result<ClientResponse>;
}
