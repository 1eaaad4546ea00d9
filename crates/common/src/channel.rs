//! Async channel bridge between the Tokio network runtime and the broker thread
//!
//! The network side owns sockets and runs on Tokio; request handling blocks
//! on device queues and runs on a dedicated thread. Requests travel one way
//! as multipart envelopes, replies come back the other way still carrying
//! the peer identity frame so the router can find the connection.

use async_channel::{Receiver, Sender, bounded};
use protocol::Multipart;

/// Commands from the Tokio runtime to the broker thread
#[derive(Debug)]
pub enum BrokerCommand {
    /// A request envelope: `[identity, empty, payload]`
    Dispatch(Multipart),

    /// Stop the broker thread after the current request
    Shutdown,
}

/// Handle for the Tokio runtime (async)
#[derive(Clone)]
pub struct BrokerBridge {
    cmd_tx: Sender<BrokerCommand>,
    reply_rx: Receiver<Multipart>,
}

impl BrokerBridge {
    /// Send a command to the broker thread
    pub async fn send_command(&self, cmd: BrokerCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next reply envelope from the broker thread
    pub async fn recv_reply(&self) -> crate::Result<Multipart> {
        self.reply_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the broker thread (blocking)
pub struct BrokerWorker {
    cmd_rx: Receiver<BrokerCommand>,
    reply_tx: Sender<Multipart>,
}

impl BrokerWorker {
    /// Receive a command from the Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<BrokerCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<BrokerCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Send a reply envelope to the Tokio runtime (blocking)
    pub fn send_reply(&self, reply: Multipart) -> crate::Result<()> {
        self.reply_tx
            .send_blocking(reply)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and the broker thread
///
/// Returns (BrokerBridge for Tokio, BrokerWorker for the broker thread)
pub fn create_broker_bridge() -> (BrokerBridge, BrokerWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    let (reply_tx, reply_rx) = bounded(256);

    (
        BrokerBridge { cmd_tx, reply_rx },
        BrokerWorker { cmd_rx, reply_tx },
    )
}
