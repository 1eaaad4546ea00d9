//! Device worker thread
//!
//! Runs the connect / write / read cycle of one device loop. The worker owns
//! the open HID handle and the message id counter; nothing else touches
//! either.

use super::{DeviceLoopConfig, LoopState, Shared};
use common::{HidHandle, HidTransport};
use protocol::{
    CURRENT_VERSION, Message, MessageIdCounter, Packet, PrivateSubsystem, ProtocolError,
    ProtocolVersion, REPORT_SIZE, fragment_message, reassemble_message,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Longest uninterrupted sleep while backing off, so `stop` stays responsive
const BACKOFF_SLICE: Duration = Duration::from_millis(50);

/// Failures that end the current connection
#[derive(Debug, Error)]
enum CycleError {
    #[error("failed to send packet after {attempts} attempts: {source}")]
    WriteFailed {
        attempts: u32,
        source: common::Error,
    },

    #[error("failed to read packet: {0}")]
    Read(common::Error),

    #[error("timed out waiting for fragment {received} of {expected}")]
    FragmentTimeout { received: usize, expected: usize },

    #[error("malformed multi-part message: {0}")]
    Malformed(#[from] ProtocolError),
}

pub(super) struct Worker {
    shared: Arc<Shared>,
    transport: Arc<dyn HidTransport>,
    config: DeviceLoopConfig,
    handle: Option<Box<dyn HidHandle>>,
    ids: MessageIdCounter,
    /// Consecutive failed reads on the current handle
    read_failures: u32,
}

impl Worker {
    pub(super) fn new(
        shared: Arc<Shared>,
        transport: Arc<dyn HidTransport>,
        config: DeviceLoopConfig,
    ) -> Self {
        Self {
            shared,
            transport,
            config,
            handle: None,
            ids: MessageIdCounter::new(),
            read_failures: 0,
        }
    }

    pub(super) fn run(mut self) {
        debug!(device = %self.shared.label, "Device worker running");

        while self.shared.running() {
            if self.handle.is_none() && !self.connect() {
                self.backoff();
                continue;
            }

            match self.cycle() {
                Ok(()) => {}
                Err(e @ CycleError::Read(_)) if self.read_failures < self.config.write_retries => {
                    self.read_failures += 1;
                    warn!(
                        device = %self.shared.label,
                        "{} ({}/{})",
                        e,
                        self.read_failures,
                        self.config.write_retries
                    );
                }
                Err(e) => {
                    match &e {
                        CycleError::Read(_) => warn!(device = %self.shared.label, "{}", e),
                        _ => error!(device = %self.shared.label, "{}", e),
                    }
                    self.disconnect();
                }
            }
        }

        self.handle = None;
        self.shared.set_state(LoopState::Stopped);
        info!(device = %self.shared.label, "Device loop stopped");
    }

    /// Open the matching HID interface; false if the device is unavailable
    fn connect(&mut self) -> bool {
        let (vendor_id, product_id) = {
            let identity = self
                .shared
                .identity
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            (identity.vendor_id, identity.product_id)
        };

        let candidates = match self.transport.enumerate(vendor_id, product_id) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(device = %self.shared.label, "Failed to enumerate devices: {}", e);
                return false;
            }
        };

        let Some(candidate) = candidates.into_iter().find(|c| {
            c.matches(vendor_id, product_id, self.config.usage_page, self.config.usage)
        }) else {
            warn!(
                device = %self.shared.label,
                "Device not found, retrying in {:?}",
                self.config.reconnect_backoff
            );
            return false;
        };

        match self.transport.connect(&candidate) {
            Ok(handle) => {
                self.shared
                    .set_strings(candidate.product.clone(), candidate.manufacturer.clone());
                self.handle = Some(handle);
                self.read_failures = 0;
                self.shared.set_state(LoopState::Active);
                info!(
                    device = %self.shared.label,
                    product = candidate.product.as_deref().unwrap_or("unknown"),
                    manufacturer = candidate.manufacturer.as_deref().unwrap_or("unknown"),
                    path = %candidate.path,
                    "Device connected"
                );
                true
            }
            Err(e) => {
                warn!(
                    device = %self.shared.label,
                    "Failed to connect to device: {}, retrying in {:?}",
                    e,
                    self.config.reconnect_backoff
                );
                false
            }
        }
    }

    /// Drop the handle; queued messages stay for the next connection
    fn disconnect(&mut self) {
        self.handle = None;
        self.shared.set_state(LoopState::Reconnecting);
        info!(device = %self.shared.label, "Reinitializing device");
    }

    fn backoff(&self) {
        let deadline = Instant::now() + self.config.reconnect_backoff;
        while self.shared.running() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            std::thread::sleep(remaining.min(BACKOFF_SLICE));
        }
    }

    /// One iteration: send at most one queued message, then read at most one
    /// report (plus its fragments)
    fn cycle(&mut self) -> Result<(), CycleError> {
        if let Some(message) = self.shared.mailbox.dequeue_outbound(Duration::ZERO) {
            self.send(&message)?;
        }

        let Some(packet) = self.read_packet(self.config.idle_read_timeout)? else {
            return Ok(());
        };

        if packet.is_multi_part() {
            let message = self.read_fragments(packet)?;
            self.deliver(message);
        } else {
            match Message::from_packet(&packet) {
                Ok(message) => self.deliver(message),
                Err(e) => debug!(device = %self.shared.label, "Discarding packet: {}", e),
            }
        }
        Ok(())
    }

    fn send(&mut self, message: &Message) -> Result<(), CycleError> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };
        let attempts = self.config.write_retries + 1;

        for packet in fragment_message(message, &mut self.ids) {
            let frame = packet.to_frame();
            let mut failures = 0;
            loop {
                trace!(device = %self.shared.label, "Sending packet: {:?}", packet);
                match handle.write(&frame) {
                    Ok(_) => break,
                    Err(e) => {
                        failures += 1;
                        debug!(
                            device = %self.shared.label,
                            "Failed to send packet ({}/{}): {}",
                            failures,
                            attempts,
                            e
                        );
                        if failures >= attempts {
                            return Err(CycleError::WriteFailed {
                                attempts,
                                source: e,
                            });
                        }
                    }
                }
            }
        }

        debug!(device = %self.shared.label, "Message sent: {}", message);
        Ok(())
    }

    /// Read one report; `None` on timeout or an undecodable report
    fn read_packet(&mut self, timeout: Duration) -> Result<Option<Packet>, CycleError> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(None);
        };

        let report = handle
            .read_timeout(REPORT_SIZE, timeout)
            .map_err(CycleError::Read)?;
        self.read_failures = 0;
        if report.is_empty() {
            return Ok(None);
        }

        match Packet::from_report(&report) {
            Ok(packet) => {
                trace!(device = %self.shared.label, "Received packet: {:?}", packet);
                Ok(Some(packet))
            }
            Err(e) => {
                debug!(device = %self.shared.label, "Discarding report: {}", e);
                Ok(None)
            }
        }
    }

    /// Collect the remaining fragments of a multi-part message, in order
    fn read_fragments(&mut self, first: Packet) -> Result<Message, CycleError> {
        let expected = first.number_of_packets();
        let mut packets = Vec::with_capacity(expected);
        packets.push(first);

        while packets.len() < expected {
            let Some(handle) = self.handle.as_mut() else {
                break;
            };
            let report = handle
                .read_timeout(REPORT_SIZE, self.config.fragment_read_timeout)
                .map_err(CycleError::Read)?;
            if report.is_empty() {
                return Err(CycleError::FragmentTimeout {
                    received: packets.len(),
                    expected,
                });
            }
            packets.push(Packet::from_report(&report)?);
        }

        Ok(reassemble_message(&packets)?)
    }

    fn deliver(&self, message: Message) {
        if message.subsystem() == u8::from(PrivateSubsystem::GetProtocolInfo) {
            self.log_protocol_version(&message);
        } else {
            debug!(device = %self.shared.label, "Received message: {}", message);
        }
        self.shared.mailbox.enqueue_inbound(message);
    }

    fn log_protocol_version(&self, message: &Message) {
        match ProtocolVersion::from_reply(message) {
            Some(version) if version.is_compatible_with(&CURRENT_VERSION) => {
                info!(device = %self.shared.label, "Device protocol version {}", version);
            }
            Some(version) => {
                warn!(
                    device = %self.shared.label,
                    "Device protocol version {} is incompatible with {}",
                    version,
                    CURRENT_VERSION
                );
            }
            None => {
                debug!(device = %self.shared.label, "Received protocol info: {}", message);
            }
        }
    }
}
