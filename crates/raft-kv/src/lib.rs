//! # raft-kv
//!
//! why: turn the pure raft-core state machine into a running, replicated key-value store
//! relations: drives raft-core, persists through raft-storage, talks to peers over a pluggable transport
//! what: async consensus server, kv state machine, service facade, memory/tcp transports, redirecting client

pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod rpc;
pub mod server;
pub mod service;
pub mod store;
pub mod transport;

/// Cluster-wide node identifier
pub type NodeId = u64;

pub use client::KvClient;
pub use command::{Command, CommandKind, CommandResult};
pub use config::{load_config, LoggingConfig, NodeConfig, RaftSettings};
pub use error::{Error, Result};
pub use rpc::{ClientRequest, ClientResponse, ResponseStatus};
pub use server::{RaftServer, Report};
pub use service::KvService;
pub use store::KvStore;
pub use transport::memory::{MemoryNetwork, MemoryTransport};
pub use transport::tcp::{TcpClientTransport, TcpTransport};
pub use transport::{ClientTransport, PeerTransport, RpcHandler};
