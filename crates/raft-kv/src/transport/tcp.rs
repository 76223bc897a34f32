//! Line-delimited json over tcp.
//!
//! Each peer link keeps one lazily dialled connection. A connection is only
//! put back after a complete request/reply exchange, so a call abandoned
//! half way (timeout, cancellation) never leaves a stale reply on the wire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use raft_core::RaftMessage;
use tokio::io::{BufReader, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{ClientTransport, PeerTransport, RpcHandler};
use crate::error::{Error, Result};
use crate::rpc::{read_message, write_message, ClientRequest, ClientResponse, Frame, FrameReply};
use crate::NodeId;

struct PeerLink {
    addr: String,
    conn: tokio::sync::Mutex<Option<BufStream<TcpStream>>>,
}

pub struct TcpTransport {
    id: NodeId,
    links: Mutex<HashMap<NodeId, Arc<PeerLink>>>,
}

impl TcpTransport {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            links: Mutex::new(HashMap::new()),
        }
    }

    fn link(&self, peer: NodeId) -> Result<Arc<PeerLink>> {
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
impl PeerTransport for TcpTransport {
    async fn call(&self, peer: NodeId, message: RaftMessage) -> Result<RaftMessage> {
        let link = self.link(peer)?;
        let mut slot = link.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => {
                debug!(node = self.id, peer, addr = %link.addr, "dialling peer");
                BufStream::new(TcpStream::connect(&link.addr).await?)
            }
        };

        write_message(&mut conn, &Frame::Peer {
            from: self.id,
            message,
        })
        .await?;
        let reply: FrameReply = read_message(&mut conn)
            .await?
            .ok_or_else(|| Error::Unavailable(format!("{} closed the connection", link.addr)))?;
        *slot = Some(conn);

        match reply {
            FrameReply::Peer { message } => Ok(message),
            FrameReply::Error { message } => Err(Error::Unavailable(message)),
            FrameReply::Client { .. } => Err(Error::Protocol(
                "client reply to a peer request".to_string(),
            )),
        }
    }

    fn connect(&self, peer: NodeId, addr: &str) -> Result<()> {
        let mut links = self
            .links
            .lock()
            .map_err(|_| Error::Unavailable("link table poisoned".to_string()))?;
        links.insert(
            peer,
            Arc::new(PeerLink {
                addr: addr.to_string(),
                conn: tokio::sync::Mutex::new(None),
            }),
        );
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

/// Client side: one short-lived connection per request
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpClientTransport;

#[async_trait]
impl ClientTransport for TcpClientTransport {
    async fn send(&self, addr: &str, request: ClientRequest) -> Result<ClientResponse> {
        let mut conn = BufStream::new(TcpStream::connect(addr).await?);
        write_message(&mut conn, &Frame::Client { request }).await?;
        let reply: FrameReply = read_message(&mut conn)
            .await?
            .ok_or_else(|| Error::Unavailable(format!("{addr} closed the connection")))?;

        match reply {
            FrameReply::Client { response } => Ok(response),
            FrameReply::Error { message } => Err(Error::Unavailable(message)),
            FrameReply::Peer { .. } => Err(Error::Protocol(
                "peer reply to a client request".to_string(),
            )),
        }
    }
}

/// Accept connections until `shutdown`, answering every frame through `handler`
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn RpcHandler>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
) {
    let local = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    info!(addr = %local, "listening");

    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(%err, "accept failed");
                    continue;
                }
            },
        };

        let handler = Arc::clone(&handler);
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            if let Err(err) = serve_connection(stream, handler, shutdown).await {
                debug!(%remote, %err, "connection closed with error");
            }
        });
    }
    info!(addr = %local, "listener stopped");
}

async fn serve_connection(
    stream: TcpStream,
    handler: Arc<dyn RpcHandler>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let frame: Frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = read_message(&mut reader) => match frame? {
                Some(frame) => frame,
                None => return Ok(()),
            },
        };
        let reply = dispatch(handler.as_ref(), frame).await;
        write_message(&mut write_half, &reply).await?;
    }
}

async fn dispatch(handler: &dyn RpcHandler, frame: Frame) -> FrameReply {
    match frame {
        Frame::Peer { from, message } => match handler.handle_peer(from, message).await {
            Ok(message) => FrameReply::Peer { message },
            Err(err) => FrameReply::Error {
                message: err.to_string(),
            },
        },
        Frame::Client { request } => match handler.handle_client(request).await {
            Ok(response) => FrameReply::Client { response },
            Err(err) => FrameReply::Error {
                message: err.to_string(),
            },
        },
    }
}
