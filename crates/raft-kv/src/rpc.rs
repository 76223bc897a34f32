//! # rpc
//!
//! why: everything that crosses a node boundary, plus the line framing used on tcp
//! relations: ClientRequest/ClientResponse flow between KvClient and KvService,
//! Frame/FrameReply wrap them and raft-core messages on a tcp stream
//! what: client request/response types, frames, read_message/write_message

use std::io;

use raft_core::RaftMessage;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::command::CommandResult;
use crate::NodeId;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientRequest {
    Get {
        key: String,
    },
    Put {
        key: String,
        value: String,
    },
    Cas {
        key: String,
        compare: String,
        value: String,
    },
}

impl ClientRequest {
    pub fn key(&self) -> &str {
        match self {
            ClientRequest::Get { key }
            | ClientRequest::Put { key, .. }
            | ClientRequest::Cas { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    NotLeader,
    FailedCommit,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub status: ResponseStatus,
    #[serde(default)]
    pub key_found: bool,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub leader_hint: Option<NodeId>,
}

impl ClientResponse {
    pub fn ok(result: CommandResult) -> Self {
        Self {
            status: ResponseStatus::Ok,
            key_found: result.key_found,
            value: result.value,
            leader_hint: None,
        }
    }

    pub fn not_leader(leader_hint: Option<NodeId>) -> Self {
        Self::with_status(ResponseStatus::NotLeader, leader_hint)
    }

    pub fn failed_commit() -> Self {
        Self::with_status(ResponseStatus::FailedCommit, None)
    }

    pub fn timeout() -> Self {
        Self::with_status(ResponseStatus::Timeout, None)
    }

    fn with_status(status: ResponseStatus, leader_hint: Option<NodeId>) -> Self {
        Self {
            status,
            key_found: false,
            value: String::new(),
            leader_hint,
        }
    }
}

/// One request on a tcp connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Peer { from: NodeId, message: RaftMessage },
    Client { request: ClientRequest },
}

/// The answer to a `Frame`, always exactly one per frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameReply {
    Peer { message: RaftMessage },
    Client { response: ClientResponse },
    Error { message: String },
}

/// Read one newline-delimited json value. `None` on a clean end of stream.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn peer_frame_crosses_a_stream() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader);
        let frame = Frame::Peer {
            from: 2,
            message: RaftMessage::VoteRequest {
                term: 4,
                candidate_id: 2,
                last_log_index: 7,
                last_log_term: 3,
            },
        };

        write_message(&mut writer, &frame).await.unwrap();
        let received: Option<Frame> = read_message(&mut reader).await.unwrap();
        assert_eq!(received, Some(frame));
    }

    #[tokio::test]
    async fn blank_lines_are_skipped_and_eof_is_none() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader);

        writer.write_all(b"\r\n\n{\"op\":\"get\",\"key\":\"a\"}\n").await.unwrap();
        drop(writer);

        let first: Option<ClientRequest> = read_message(&mut reader).await.unwrap();
        assert_eq!(first, Some(ClientRequest::Get { key: "a".into() }));
        let end: Option<ClientRequest> = read_message(&mut reader).await.unwrap();
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn malformed_line_is_invalid_data() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader);
        writer.write_all(b"{oops\n").await.unwrap();

        let err = read_message::<_, Frame>(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn response_defaults_fill_missing_fields() {
        let response: ClientResponse =
            serde_json::from_str(r#"{"status":"not_leader","leader_hint":2}"#).unwrap();
        assert_eq!(response, ClientResponse::not_leader(Some(2)));
    }

    #[test]
    fn ok_response_carries_result() {
        let response = ClientResponse::ok(CommandResult {
            value: "v".into(),
            key_found: true,
        });
        assert_eq!(response.status, ResponseStatus::Ok);
        assert!(response.key_found);
        assert_eq!(response.value, "v");
    }
}
