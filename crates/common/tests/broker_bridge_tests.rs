//! Broker Bridge Integration Tests
//!
//! Tests for the async channel bridge between the network runtime and the
//! broker thread.
//!
//! # Test Scenarios
//! - Request/reply envelope flow
//! - Worker thread lifecycle
//! - Concurrent access patterns
//!
//! Run with: `cargo test -p common --test broker_bridge_tests`

use bytes::Bytes;
use common::test_utils::{DEFAULT_TEST_TIMEOUT, with_timeout};
use common::{BrokerCommand, create_broker_bridge};
use protocol::Multipart;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;

fn envelope(peer: u32, payload: &'static [u8]) -> Multipart {
    vec![
        Bytes::copy_from_slice(&peer.to_be_bytes()),
        Bytes::new(),
        Bytes::from_static(payload),
    ]
}

// ============================================================================
// Envelope Flow Tests
// ============================================================================

#[tokio::test]
async fn test_reply_keeps_peer_identity() {
    let (bridge, worker) = create_broker_bridge();

    let handle = thread::spawn(move || {
        while let Ok(BrokerCommand::Dispatch(mut frames)) = worker.recv_command() {
            frames[2] = Bytes::from_static(br#"{"Status":"ACK"}"#);
            worker.send_reply(frames).expect("Failed to send reply");
        }
    });

    bridge
        .send_command(BrokerCommand::Dispatch(envelope(42, b"{}")))
        .await
        .expect("Failed to send command");

    let reply = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_reply())
        .await
        .expect("Timed out")
        .expect("Bridge closed");
    assert_eq!(reply[0].as_ref(), &42u32.to_be_bytes());
    assert!(reply[1].is_empty());
    assert_eq!(reply[2].as_ref(), br#"{"Status":"ACK"}"#);

    bridge.send_command(BrokerCommand::Shutdown).await.unwrap();
    handle.join().expect("Worker thread panicked");
}

#[tokio::test]
async fn test_shutdown_command_flow() {
    let (bridge, worker) = create_broker_bridge();
    let shutdown_received = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown_received.clone();

    let handle = thread::spawn(move || {
        loop {
            match worker.recv_command() {
                Ok(BrokerCommand::Shutdown) => {
                    shutdown_flag.store(true, Ordering::Release);
                    break;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    });

    bridge
        .send_command(BrokerCommand::Shutdown)
        .await
        .expect("Failed to send shutdown");

    handle.join().expect("Worker thread panicked");
    assert!(shutdown_received.load(Ordering::Acquire));
}

// ============================================================================
// Worker Thread Lifecycle Tests
// ============================================================================

#[test]
fn test_worker_try_recv_non_blocking() {
    let (_bridge, worker) = create_broker_bridge();
    assert!(worker.try_recv_command().is_none());
}

#[test]
fn test_worker_exits_on_bridge_drop() {
    let (bridge, worker) = create_broker_bridge();
    let handle = thread::spawn(move || worker.recv_command().is_err());

    drop(bridge);
    assert!(handle.join().unwrap());
}

#[tokio::test]
async fn test_bridge_errors_on_worker_drop() {
    let (bridge, worker) = create_broker_bridge();
    drop(worker);

    let result = bridge
        .send_command(BrokerCommand::Dispatch(envelope(1, b"{}")))
        .await;
    assert!(result.is_err());
    assert!(bridge.recv_reply().await.is_err());
}

// ============================================================================
// Concurrent Access Pattern Tests
// ============================================================================

#[tokio::test]
async fn test_cloned_bridges_share_worker() {
    let (bridge, worker) = create_broker_bridge();
    let handled = Arc::new(AtomicU32::new(0));
    let worker_count = handled.clone();

    let handle = thread::spawn(move || {
        loop {
            match worker.recv_command() {
                Ok(BrokerCommand::Dispatch(frames)) => {
                    worker_count.fetch_add(1, Ordering::SeqCst);
                    let _ = worker.send_reply(frames);
                }
                Ok(BrokerCommand::Shutdown) | Err(_) => break,
            }
        }
    });

    let mut tasks = Vec::new();
    for peer in 0..8u32 {
        let bridge = bridge.clone();
        tasks.push(tokio::spawn(async move {
            bridge
                .send_command(BrokerCommand::Dispatch(envelope(peer, b"x")))
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().expect("Failed to send");
    }

    let mut peers = Vec::new();
    for _ in 0..8 {
        let reply = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_reply())
            .await
            .unwrap()
            .unwrap();
        peers.push(u32::from_be_bytes(reply[0].as_ref().try_into().unwrap()));
    }
    peers.sort_unstable();
    assert_eq!(peers, (0..8).collect::<Vec<_>>());

    bridge.send_command(BrokerCommand::Shutdown).await.unwrap();
    handle.join().expect("Worker panicked");
    assert_eq!(handled.load(Ordering::SeqCst), 8);
}
