//! Network subsystem
//!
//! Exposes the broker over TCP.
//!
//! # Architecture
//!
//! ```text
//! RouterServer (Tokio)
//!   ├─> accept connections, assign peer identity
//!   ├─> read [empty, payload] ──> BrokerBridge ──> broker dispatch thread
//!   └─> route [identity, empty, payload] replies back to the owning peer
//! ```

pub mod router;

pub use router::RouterServer;
