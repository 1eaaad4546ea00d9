//! Broker dispatch thread
//!
//! Receives request envelopes from the network runtime through the
//! [`BrokerWorker`] end of the bridge, answers them one at a time, and
//! sends the reply envelope back. Requests block on device queues, so this
//! runs on a dedicated OS thread rather than inside Tokio.

use super::Broker;
use bytes::Bytes;
use common::{BrokerCommand, BrokerWorker};
use protocol::Multipart;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Frames in a routed request: identity, empty delimiter, payload
const REQUEST_FRAMES: usize = 3;

/// Answer one routed request; `None` when it is not shaped like one
pub fn dispatch(broker: &Broker, frames: Multipart) -> Option<Multipart> {
    if frames.len() != REQUEST_FRAMES {
        debug!("Ignoring request with {} frames", frames.len());
        return None;
    }

    let response = broker.handle_payload(&frames[2]);
    let payload = match response.to_json() {
        Ok(payload) => payload,
        Err(e) => {
            error!("Failed to encode response: {}", e);
            return None;
        }
    };

    Some(vec![frames[0].clone(), Bytes::new(), Bytes::from(payload)])
}

/// Spawn the broker dispatch thread
///
/// The thread runs until a `Shutdown` command arrives or the bridge closes.
pub fn spawn_broker_worker(
    broker: Arc<Broker>,
    worker: BrokerWorker,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("broker-dispatch".to_string())
        .spawn(move || {
            info!("Broker dispatch thread started");
            loop {
                match worker.recv_command() {
                    Ok(BrokerCommand::Dispatch(frames)) => {
                        let Some(reply) = dispatch(&broker, frames) else {
                            continue;
                        };
                        if let Err(e) = worker.send_reply(reply) {
                            warn!("Failed to send reply: {}", e);
                            break;
                        }
                    }
                    Ok(BrokerCommand::Shutdown) => {
                        info!("Broker dispatch shutting down");
                        break;
                    }
                    Err(e) => {
                        debug!("Bridge closed: {}", e);
                        break;
                    }
                }
            }
            info!("Broker dispatch thread stopped");
        })
}
