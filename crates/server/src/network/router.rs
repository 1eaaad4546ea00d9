//! Identity-framed TCP router
//!
//! Each accepted connection gets a 4-byte identity. Requests read from the
//! connection as `[empty, payload]` are forwarded to the broker thread as
//! `[identity, empty, payload]`; replies coming back carry the identity,
//! which picks the connection to write `[empty, payload]` to.

use anyhow::{Context, Result};
use bytes::Bytes;
use common::{BrokerBridge, BrokerCommand};
use protocol::{Multipart, ProtocolError, read_multipart_async, write_multipart_async};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Replies buffered per connection; further replies to that peer are dropped
const PEER_QUEUE_DEPTH: usize = 64;

/// How long a half-closed connection stays open for replies still owed to it
const REPLY_LINGER: Duration = Duration::from_secs(5);

type Peers = Arc<Mutex<HashMap<u32, mpsc::Sender<Multipart>>>>;

/// TCP front end of the broker
pub struct RouterServer {
    listener: TcpListener,
    bridge: BrokerBridge,
    peers: Peers,
    next_identity: AtomicU32,
}

impl RouterServer {
    /// Bind the listening socket
    pub async fn bind(addr: &str, bridge: BrokerBridge) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        Ok(Self {
            listener,
            bridge,
            peers: Arc::new(Mutex::new(HashMap::new())),
            next_identity: AtomicU32::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Accept connections until the task is dropped or the listener fails
    pub async fn run(self) -> Result<()> {
        info!("Router listening on {}", self.local_addr()?);

        let reply_task = tokio::spawn(route_replies(self.bridge.clone(), self.peers.clone()));

        let result = loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e).context("Failed to accept connection"),
            };
            let identity = self.next_identity.fetch_add(1, Ordering::Relaxed);
            debug!("Accepted connection from {} as peer {}", addr, identity);

            let bridge = self.bridge.clone();
            let peers = self.peers.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, identity, bridge, peers).await {
                    debug!("Peer {} closed with error: {:#}", identity, e);
                }
            });
        };

        reply_task.abort();
        result
    }
}

/// Forward reply envelopes to the connection owning their identity
///
/// Never waits on a peer: a connection whose queue is full has stopped
/// reading, and its reply is dropped so other peers keep being served.
async fn route_replies(bridge: BrokerBridge, peers: Peers) {
    while let Ok(reply) = bridge.recv_reply().await {
        route_reply(&peers, reply);
    }
    debug!("Reply router stopped");
}

fn route_reply(peers: &Peers, reply: Multipart) {
    let Some(identity) = reply
        .first()
        .and_then(|frame| <[u8; 4]>::try_from(frame.as_ref()).ok())
        .map(u32::from_be_bytes)
    else {
        warn!("Dropping reply without a peer identity");
        return;
    };

    let peers = peers.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(sender) = peers.get(&identity) else {
        debug!("Dropping reply for unknown peer {}", identity);
        return;
    };
    match sender.try_send(reply) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!(
                "Peer {} is not reading replies ({} queued), dropping reply",
                identity, PEER_QUEUE_DEPTH
            );
        }
        Err(TrySendError::Closed(_)) => debug!("Peer {} left before its reply", identity),
    }
}

async fn handle_connection(
    stream: TcpStream,
    identity: u32,
    bridge: BrokerBridge,
    peers: Peers,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Multipart>(PEER_QUEUE_DEPTH);
    peers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(identity, tx);

    // Replies handed to the socket so far
    let (written_tx, mut written_rx) = watch::channel(0usize);
    let mut writer_task = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            // Strip the identity frame before it leaves the broker
            let result = write_multipart_async(&mut writer, &reply[1..]).await;
            written_tx.send_modify(|n| *n += 1);
            if let Err(e) = result {
                debug!("Failed to write reply to peer {}: {}", identity, e);
                break;
            }
        }
    });

    let identity_frame = Bytes::copy_from_slice(&identity.to_be_bytes());
    let mut requests = 0usize;
    let result = loop {
        let frames = match read_multipart_async(&mut reader).await {
            Ok(frames) => frames,
            Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break Ok(());
            }
            Err(e) => {
                warn!("Closing peer {}: {}", identity, e);
                break Err(e.into());
            }
        };
        trace!("Peer {} sent {} frame(s)", identity, frames.len());

        // Only `[empty, payload]` requests are answered
        if frames.len() == 2 {
            requests += 1;
        }
        let mut envelope = Vec::with_capacity(frames.len() + 1);
        envelope.push(identity_frame.clone());
        envelope.extend(frames);

        if let Err(e) = bridge.send_command(BrokerCommand::Dispatch(envelope)).await {
            error!("Broker unavailable: {}", e);
            break Err(e.into());
        }
    };

    // A peer that only closed its write side still gets what it asked for
    if result.is_ok() && *written_rx.borrow() < requests {
        trace!("Peer {} half-closed, waiting for its replies", identity);
        let flushed = tokio::time::timeout(
            REPLY_LINGER,
            written_rx.wait_for(|written| *written >= requests),
        )
        .await
        .is_ok_and(|waited| waited.is_ok());
        if !flushed {
            debug!("Peer {} closed with replies still pending", identity);
        }
    }

    peers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&identity);
    if tokio::time::timeout(REPLY_LINGER, &mut writer_task).await.is_err() {
        writer_task.abort();
    }
    debug!("Peer {} disconnected", identity);
    result
}
