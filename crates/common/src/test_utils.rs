//! Test utilities for hid-broker
//!
//! Provides an in-memory [`HidTransport`] and helper functions for testing
//! device loops and the broker without hardware.
//!
//! # Example
//!
//! ```
//! use common::test_utils::MockTransport;
//! use common::HidTransport;
//!
//! let transport = MockTransport::new(0x3434, 0x0321);
//! let found = transport.enumerate(0x3434, 0x0321).unwrap();
//! assert_eq!(found.len(), 1);
//! ```

use crate::transport::{HidCandidate, HidHandle, HidTransport, RAW_HID_USAGE, RAW_HID_USAGE_PAGE};
use crate::{Error, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use protocol::REPORT_SIZE;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct MockState {
    vendor_id: u16,
    product_id: u16,
    usage_page: u16,
    usage: u16,
    present: AtomicBool,
    echo: AtomicBool,
    fail_writes: AtomicUsize,
    fail_reads: AtomicUsize,
    connects: AtomicUsize,
    written: Mutex<Vec<Vec<u8>>>,
    to_host_tx: Sender<Vec<u8>>,
    to_host_rx: Receiver<Vec<u8>>,
}

/// In-memory raw HID device
///
/// Cloning shares the device, so a test can keep one clone to script the
/// device while a device loop owns another.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    /// A present raw HID device with the given ids
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        let (to_host_tx, to_host_rx) = unbounded();
        Self {
            state: Arc::new(MockState {
                vendor_id,
                product_id,
                usage_page: RAW_HID_USAGE_PAGE,
                usage: RAW_HID_USAGE,
                present: AtomicBool::new(true),
                echo: AtomicBool::new(false),
                fail_writes: AtomicUsize::new(0),
                fail_reads: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                written: Mutex::new(Vec::new()),
                to_host_tx,
                to_host_rx,
            }),
        }
    }

    /// Echo every written report back to the host
    pub fn with_echo(self) -> Self {
        self.state.echo.store(true, Ordering::SeqCst);
        self
    }

    /// Plug or unplug the device
    pub fn set_present(&self, present: bool) {
        self.state.present.store(present, Ordering::SeqCst);
    }

    /// Make the next `count` writes fail
    pub fn fail_next_writes(&self, count: usize) {
        self.state.fail_writes.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` reads fail
    pub fn fail_next_reads(&self, count: usize) {
        self.state.fail_reads.store(count, Ordering::SeqCst);
    }

    /// Injected read failures not yet hit
    pub fn pending_read_failures(&self) -> usize {
        self.state.fail_reads.load(Ordering::SeqCst)
    }

    /// Reports queued for the host and not yet read
    pub fn pending_reports(&self) -> usize {
        self.state.to_host_rx.len()
    }

    /// Queue a report (without report id) for the host to read
    pub fn push_report(&self, report: impl Into<Vec<u8>>) {
        let _ = self.state.to_host_tx.send(report.into());
    }

    /// Every frame written so far, report id included
    pub fn written_reports(&self) -> Vec<Vec<u8>> {
        self.state
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of successful `connect` calls
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }
}

impl HidTransport for MockTransport {
    fn enumerate(&self, vendor_id: u16, product_id: u16) -> Result<Vec<HidCandidate>> {
        let state = &self.state;
        if !state.present.load(Ordering::SeqCst)
            || state.vendor_id != vendor_id
            || state.product_id != product_id
        {
            return Ok(Vec::new());
        }

        Ok(vec![HidCandidate {
            vendor_id,
            product_id,
            usage_page: state.usage_page,
            usage: state.usage,
            product: Some("Mock Keyboard".to_string()),
            manufacturer: Some("Mock Inc.".to_string()),
            path: "mock:0".to_string(),
        }])
    }

    fn connect(&self, _candidate: &HidCandidate) -> Result<Box<dyn HidHandle>> {
        if !self.state.present.load(Ordering::SeqCst) {
            return Err(Error::DeviceNotFound("mock device unplugged".to_string()));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockHandle {
            state: self.state.clone(),
        }))
    }
}

struct MockHandle {
    state: Arc<MockState>,
}

impl HidHandle for MockHandle {
    fn read_timeout(&mut self, size: usize, timeout: Duration) -> Result<Vec<u8>> {
        if !self.state.present.load(Ordering::SeqCst) {
            return Err(Error::Transport("mock device unplugged".to_string()));
        }
        let failing = self
            .state
            .fail_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Transport("injected read failure".to_string()));
        }
        match self.state.to_host_rx.recv_timeout(timeout) {
            Ok(mut report) => {
                report.resize(size, 0);
                Ok(report)
            }
            Err(_) => Ok(Vec::new()),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let state = &self.state;
        if !state.present.load(Ordering::SeqCst) {
            return Err(Error::Transport("mock device unplugged".to_string()));
        }
        let failing = state
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Transport("injected write failure".to_string()));
        }

        state
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bytes.to_vec());
        if state.echo.load(Ordering::SeqCst) && bytes.len() > REPORT_SIZE {
            let _ = state.to_host_tx.send(bytes[1..].to_vec());
        }
        Ok(bytes.len())
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Timeout wrapper for async tests
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> std::result::Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
