//! Broker connection
//!
//! A thin request/reply client over the broker's TCP router.

pub mod client;

pub use client::BrokerClient;
