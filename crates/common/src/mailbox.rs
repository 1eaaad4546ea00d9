//! Per-device message queues
//!
//! A [`Mailbox`] sits between callers and a device loop:
//!
//! - one bounded outbound FIFO; producers block (up to a timeout) when it is
//!   full, and the device loop drains it in order,
//! - one bounded inbound FIFO per subsystem; when full, new replies are
//!   dropped with a warning so the device loop never blocks.
//!
//! Replies are correlated by subsystem only: two callers waiting on the same
//! subsystem race for the next reply.

use crate::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use protocol::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Queue sizes and producer wait
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    /// Capacity of the outbound FIFO
    pub outbound_capacity: usize,
    /// Capacity of each per-subsystem inbound FIFO
    pub inbound_capacity: usize,
    /// How long `enqueue_outbound` waits for space before failing
    pub enqueue_timeout: Duration,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 100,
            inbound_capacity: 100,
            enqueue_timeout: Duration::from_secs(5),
        }
    }
}

/// Outbound queue entry
struct Envelope {
    message: Message,
    enqueued_at: Instant,
    dispatched: Sender<()>,
    done: Arc<AtomicBool>,
}

/// Handle to a queued outbound message
///
/// Completes once the device loop has taken the message for transmission,
/// not when the device acknowledges it.
pub struct PendingMessage {
    dispatched: Receiver<()>,
    done: Arc<AtomicBool>,
    enqueued_at: Instant,
}

impl PendingMessage {
    /// Wait until the message is dequeued; false on timeout
    pub fn wait_dispatched(&self, timeout: Duration) -> bool {
        if self.is_dispatched() {
            return true;
        }
        match self.dispatched.recv_timeout(timeout) {
            Ok(()) => true,
            // Sender dropped without signalling: the queue was cleared
            Err(RecvTimeoutError::Disconnected) => false,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    /// Stays true once set, whether or not the signal was already waited on
    pub fn is_dispatched(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }
}

type InboundQueue = (Sender<Message>, Receiver<Message>);

/// Outbound and per-subsystem inbound queues for one device
pub struct Mailbox {
    label: String,
    config: MailboxConfig,
    outbound_tx: Sender<Envelope>,
    outbound_rx: Receiver<Envelope>,
    inbound: Mutex<HashMap<u8, InboundQueue>>,
}

impl Mailbox {
    /// Create a mailbox; `label` tags its log lines (usually the device id)
    pub fn new(label: impl Into<String>, config: MailboxConfig) -> Self {
        let (outbound_tx, outbound_rx) = bounded(config.outbound_capacity.max(1));
        Self {
            label: label.into(),
            config,
            outbound_tx,
            outbound_rx,
            inbound: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    /// Queue a message for the device, waiting up to the configured timeout
    pub fn enqueue_outbound(&self, message: Message) -> Result<PendingMessage> {
        self.enqueue_outbound_timeout(message, self.config.enqueue_timeout)
    }

    /// Queue a message for the device, waiting up to `timeout` for space
    pub fn enqueue_outbound_timeout(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<PendingMessage> {
        let (dispatched_tx, dispatched_rx) = bounded(1);
        let done = Arc::new(AtomicBool::new(false));
        let enqueued_at = Instant::now();
        let envelope = Envelope {
            message,
            enqueued_at,
            dispatched: dispatched_tx,
            done: done.clone(),
        };

        if self.outbound_tx.is_full() {
            debug!(
                device = %self.label,
                "Message queue has reached {} messages, waiting",
                self.config.outbound_capacity
            );
        }

        match self.outbound_tx.send_timeout(envelope, timeout) {
            Ok(()) => Ok(PendingMessage {
                dispatched: dispatched_rx,
                done,
                enqueued_at,
            }),
            Err(SendTimeoutError::Timeout(_)) => Err(Error::QueueFull {
                capacity: self.config.outbound_capacity,
            }),
            Err(SendTimeoutError::Disconnected(_)) => {
                Err(Error::Channel("outbound queue closed".to_string()))
            }
        }
    }

    /// Take the next outbound message, waiting up to `timeout`
    ///
    /// Signals the producer's [`PendingMessage`]. A zero timeout polls.
    pub fn dequeue_outbound(&self, timeout: Duration) -> Option<Message> {
        let envelope = if timeout.is_zero() {
            self.outbound_rx.try_recv().ok()?
        } else {
            self.outbound_rx.recv_timeout(timeout).ok()?
        };

        trace!(
            device = %self.label,
            waited_us = envelope.enqueued_at.elapsed().as_micros() as u64,
            "Dequeued outbound message"
        );
        envelope.done.store(true, Ordering::Release);
        let _ = envelope.dispatched.try_send(());
        Some(envelope.message)
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound_rx.len()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound_rx.is_empty()
    }

    fn inbound_queue(&self, subsystem: u8) -> InboundQueue {
        let mut queues = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        queues
            .entry(subsystem)
            .or_insert_with(|| bounded(self.config.inbound_capacity.max(1)))
            .clone()
    }

    /// Deliver a reply to its subsystem queue
    ///
    /// Never blocks. Returns false when the queue was full and the message
    /// was dropped.
    pub fn enqueue_inbound(&self, message: Message) -> bool {
        let (tx, _) = self.inbound_queue(message.subsystem());
        match tx.try_send(message) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    device = %self.label,
                    "Message response dropped due to max queue count ({}): {}",
                    self.config.inbound_capacity,
                    err.into_inner()
                );
                false
            }
        }
    }

    /// Wait up to `timeout` for the next reply on `subsystem`
    pub fn dequeue_inbound(&self, subsystem: u8, timeout: Duration) -> Option<Message> {
        let (_, rx) = self.inbound_queue(subsystem);
        if timeout.is_zero() {
            rx.try_recv().ok()
        } else {
            rx.recv_timeout(timeout).ok()
        }
    }

    pub fn inbound_len(&self, subsystem: u8) -> usize {
        let queues = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        queues.get(&subsystem).map_or(0, |(_, rx)| rx.len())
    }

    /// Drop every queued message in both directions
    pub fn clear(&self) {
        let dropped_out = self.outbound_rx.try_iter().count();
        let mut queues = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped_in: usize = queues.values().map(|(_, rx)| rx.try_iter().count()).sum();
        queues.clear();

        if dropped_out + dropped_in > 0 {
            debug!(
                device = %self.label,
                "Cleared {} outbound and {} inbound messages",
                dropped_out,
                dropped_in
            );
        }
    }
}
