//! Device loops
//!
//! A [`DeviceLoop`] owns one raw HID device. Callers queue messages through
//! its [`Mailbox`]; a dedicated worker thread connects to the device, writes
//! queued messages as reports, reads replies, and routes them back into the
//! mailbox by subsystem.
//!
//! ```text
//! caller ──write()──> Mailbox outbound ──> worker ──reports──> device
//! caller <─write_wait()── Mailbox inbound <── worker <──reports── device
//! ```
//!
//! The worker reconnects on its own whenever the device disappears or a
//! transfer fails; callers only ever observe queue timeouts.

mod worker;

use common::{
    Error, HidTransport, Mailbox, MailboxConfig, PendingMessage, RAW_HID_USAGE,
    RAW_HID_USAGE_PAGE, Result,
};
use protocol::{DeviceIdentity, Message, protocol_info_request};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use worker::Worker;

/// Tunables of one device loop
#[derive(Debug, Clone)]
pub struct DeviceLoopConfig {
    /// HID usage page of the interface to open
    pub usage_page: u16,
    /// HID usage of the interface to open
    pub usage: u16,
    /// Retries per report write before reconnecting
    pub write_retries: u32,
    /// Pause between connection attempts
    pub reconnect_backoff: Duration,
    /// Read timeout while waiting for unsolicited reports
    pub idle_read_timeout: Duration,
    /// Read timeout for the remaining fragments of a multi-part message
    pub fragment_read_timeout: Duration,
    /// Queue sizes
    pub mailbox: MailboxConfig,
    /// Queue a protocol-info request when the loop is created
    pub handshake: bool,
}

impl Default for DeviceLoopConfig {
    fn default() -> Self {
        Self {
            usage_page: RAW_HID_USAGE_PAGE,
            usage: RAW_HID_USAGE,
            write_retries: 10,
            reconnect_backoff: Duration::from_secs(5),
            idle_read_timeout: Duration::from_millis(5),
            fragment_read_timeout: Duration::from_secs(5),
            mailbox: MailboxConfig::default(),
            handshake: true,
        }
    }
}

/// Connection state of a device loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    /// Created, worker not started
    Disconnected = 0,
    /// Looking for the device for the first time
    Connecting = 1,
    /// Device open, exchanging reports
    Active = 2,
    /// Device lost, looking for it again
    Reconnecting = 3,
    /// Stopped by the owner; terminal
    Stopped = 4,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Active,
            3 => Self::Reconnecting,
            4 => Self::Stopped,
            _ => Self::Disconnected,
        }
    }
}

/// State shared between a [`DeviceLoop`] and its worker thread
pub(crate) struct Shared {
    label: String,
    mailbox: Mailbox,
    running: AtomicBool,
    state: AtomicU8,
    identity: Mutex<DeviceIdentity>,
}

impl Shared {
    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LoopState) {
        // Stopped is terminal; a worker finishing its iteration must not undo it
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != LoopState::Stopped as u8).then_some(state as u8)
            });
    }

    fn set_strings(&self, product: Option<String>, manufacturer: Option<String>) {
        self.identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_strings(product, manufacturer);
    }
}

/// Worker-backed connection to one raw HID device
pub struct DeviceLoop {
    shared: Arc<Shared>,
    transport: Arc<dyn HidTransport>,
    config: DeviceLoopConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceLoop {
    /// Create a loop for `identity`; nothing touches the device until [`start`](Self::start)
    pub fn new(
        identity: DeviceIdentity,
        transport: Arc<dyn HidTransport>,
        config: DeviceLoopConfig,
    ) -> Self {
        let label = identity.to_string();
        let shared = Arc::new(Shared {
            mailbox: Mailbox::new(label.clone(), config.mailbox.clone()),
            label,
            running: AtomicBool::new(false),
            state: AtomicU8::new(LoopState::Disconnected as u8),
            identity: Mutex::new(identity),
        });

        if config.handshake {
            if let Err(e) = shared
                .mailbox
                .enqueue_outbound_timeout(protocol_info_request(), Duration::ZERO)
            {
                debug!(device = %shared.label, "Protocol info request not queued: {}", e);
            }
        }

        Self {
            shared,
            transport,
            config,
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker thread
    ///
    /// Calling `start` on a running loop is a no-op; a stopped loop cannot
    /// be restarted.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shared.state() == LoopState::Stopped {
            return Err(Error::Stopped);
        }
        if worker.is_some() {
            return Ok(());
        }

        self.shared.running.store(true, Ordering::Release);
        self.shared.set_state(LoopState::Connecting);

        let job = Worker::new(
            self.shared.clone(),
            self.transport.clone(),
            self.config.clone(),
        );
        let handle = std::thread::Builder::new()
            .name(format!("device-{}", self.shared.label))
            .spawn(move || job.run())
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                Error::Io(e)
            })?;

        *worker = Some(handle);
        info!(device = %self.shared.label, "Device loop started");
        Ok(())
    }

    /// Ask the worker to exit after its current iteration
    pub fn stop(&self) {
        debug!(device = %self.shared.label, "Stopping device loop");
        self.shared.running.store(false, Ordering::Release);
        self.shared
            .state
            .store(LoopState::Stopped as u8, Ordering::Release);
    }

    /// Block until the worker thread has exited
    pub fn join(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(device = %self.shared.label, "Device worker thread panicked");
            }
        }
    }

    /// Stop the worker, wait for it, and drop every queued message
    pub fn dispose(&self) {
        self.stop();
        self.join();
        self.shared.mailbox.clear();
    }

    /// Queue a message for the device without waiting for a reply
    ///
    /// Blocks while the outbound queue is full, up to the configured enqueue
    /// timeout.
    pub fn write(&self, message: Message) -> Result<PendingMessage> {
        if self.shared.state() == LoopState::Stopped {
            return Err(Error::Stopped);
        }
        debug!(device = %self.shared.label, "Message queued: {}", message);
        self.shared.mailbox.enqueue_outbound(message)
    }

    /// Queue a message and wait for the next reply on the same subsystem
    ///
    /// Returns `None` if no reply arrived within `timeout` (measured from the
    /// call), including when the device is absent or the loop is stopped.
    pub fn write_wait(&self, message: Message, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let subsystem = message.subsystem();
        let remaining = || deadline.saturating_duration_since(Instant::now());

        if self.shared.state() == LoopState::Stopped {
            return None;
        }

        let pending = match self
            .shared
            .mailbox
            .enqueue_outbound_timeout(message, remaining())
        {
            Ok(pending) => pending,
            Err(e) => {
                debug!(device = %self.shared.label, "Write-wait not queued: {}", e);
                return None;
            }
        };

        if !pending.wait_dispatched(remaining()) {
            debug!(device = %self.shared.label, "Write-wait timed out before dispatch");
            return None;
        }

        let reply = self.shared.mailbox.dequeue_inbound(subsystem, remaining());
        if reply.is_none() {
            debug!(device = %self.shared.label, subsystem, "Write-wait timed out waiting for reply");
        }
        reply
    }

    /// Identity of the device, including strings once connected
    pub fn identity(&self) -> DeviceIdentity {
        self.shared
            .identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> LoopState {
        self.shared.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == LoopState::Active
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.shared.mailbox
    }
}

impl Drop for DeviceLoop {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}
