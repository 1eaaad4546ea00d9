//! Common utilities for hid-broker
//!
//! This crate provides shared functionality between the server and client,
//! including the raw HID transport abstraction, per-device message queues,
//! error handling, and the async channel bridge for the broker thread.

pub mod channel;
pub mod error;
pub mod logging;
pub mod mailbox;
pub mod test_utils;
pub mod transport;

pub use channel::{BrokerBridge, BrokerCommand, BrokerWorker, create_broker_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use mailbox::{Mailbox, MailboxConfig, PendingMessage};
pub use transport::{HidCandidate, HidHandle, HidTransport, RAW_HID_USAGE, RAW_HID_USAGE_PAGE};
