//! # command
//!
//! why: the unit of replication for the kv store
//! relations: built by the service from client requests, stored opaquely in raft-core log entries,
//! decoded and applied by the store
//! what: Command, CommandKind, CommandResult, json encoding

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::rpc::ClientRequest;
use crate::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Get,
    Put,
    Cas,
}

/// A client operation as it travels through the log.
///
/// `service_id` and `request_id` identify the submission, so the node that
/// proposed it can tell whether the entry committed at its index is still
/// its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub compare: String,
    pub service_id: NodeId,
    pub request_id: u64,
}

/// Outcome of applying a command: the relevant value and whether the key existed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub value: String,
    pub key_found: bool,
}

impl Command {
    pub fn from_request(request: ClientRequest, service_id: NodeId, request_id: u64) -> Self {
        let (kind, key, value, compare) = match request {
            ClientRequest::Get { key } => (CommandKind::Get, key, String::new(), String::new()),
            ClientRequest::Put { key, value } => (CommandKind::Put, key, value, String::new()),
            ClientRequest::Cas {
                key,
                compare,
                value,
            } => (CommandKind::Cas, key, value, compare),
        };
        Self {
            kind,
            key,
            value,
            compare,
            service_id,
            request_id,
        }
    }

    /// True when `other` is the same submission
    pub fn same_submission(&self, other: &Command) -> bool {
        self.service_id == other.service_id && self.request_id == other.request_id
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
