//! Fixed-size HID report framing
//!
//! Every unit exchanged with the device is one raw HID report:
//!
//! ```text
//! [subsystem: u8][id: u8][length: u8][data: DATA_SIZE bytes, zero padded]
//! ```
//!
//! `length` is the total length of the *message* the packet belongs to, so
//! every fragment of a multi-part message carries the same header. Reports
//! written to the transport are prefixed with a report-id byte (`0x00`).

use crate::error::{ProtocolError, Result};

/// Size of one raw HID report as read from the device
pub const REPORT_SIZE: usize = 32;

/// Header bytes at the start of each report (subsystem, id, length)
pub const HEADER_SIZE: usize = 3;

/// Payload capacity of a single packet
pub const DATA_SIZE: usize = REPORT_SIZE - HEADER_SIZE;

/// Size of an encoded packet handed to the transport's write call
pub const FRAME_SIZE: usize = REPORT_SIZE + 1;

/// Report id prefix required by report-based writes
pub const REPORT_ID: u8 = 0x00;

/// One fixed-size report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub subsystem: u8,
    pub id: u8,
    pub length: u8,
    pub data: [u8; DATA_SIZE],
}

impl Packet {
    /// Build a packet, zero-padding `payload` to `DATA_SIZE`
    pub fn new(subsystem: u8, id: u8, length: u8, payload: &[u8]) -> Result<Self> {
        if payload.len() > DATA_SIZE {
            return Err(ProtocolError::MalformedPacket(format!(
                "payload is {} bytes (max {})",
                payload.len(),
                DATA_SIZE
            )));
        }

        let mut data = [0u8; DATA_SIZE];
        data[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            subsystem,
            id,
            length,
            data,
        })
    }

    /// Whether this packet is one fragment of a larger message
    pub fn is_multi_part(&self) -> bool {
        usize::from(self.length) > DATA_SIZE
    }

    /// Number of packets making up the message this packet belongs to
    ///
    /// A zero-length message still occupies one header-only packet.
    pub fn number_of_packets(&self) -> usize {
        usize::from(self.length).div_ceil(DATA_SIZE).max(1)
    }

    /// Encode into a write frame: `[REPORT_ID][subsystem][id][length][data]`
    pub fn to_frame(&self) -> [u8; FRAME_SIZE] {
        let mut frame = [0u8; FRAME_SIZE];
        frame[0] = REPORT_ID;
        frame[1] = self.subsystem;
        frame[2] = self.id;
        frame[3] = self.length;
        frame[1 + HEADER_SIZE..].copy_from_slice(&self.data);
        frame
    }

    /// Decode a report as returned by the transport's read call
    ///
    /// Bytes past `REPORT_SIZE` are ignored.
    pub fn from_report(report: &[u8]) -> Result<Self> {
        if report.len() < REPORT_SIZE {
            return Err(ProtocolError::MalformedPacket(format!(
                "report is {} bytes (expected {})",
                report.len(),
                REPORT_SIZE
            )));
        }

        let mut data = [0u8; DATA_SIZE];
        data.copy_from_slice(&report[HEADER_SIZE..REPORT_SIZE]);

        Ok(Self {
            subsystem: report[0],
            id: report[1],
            length: report[2],
            data,
        })
    }
}

/// Encode header fields and payload into a write frame
pub fn encode_packet(subsystem: u8, id: u8, length: u8, payload: &[u8]) -> Result<[u8; FRAME_SIZE]> {
    Packet::new(subsystem, id, length, payload).map(|packet| packet.to_frame())
}

/// Decode a raw report into a packet
pub fn decode_packet(report: &[u8]) -> Result<Packet> {
    Packet::from_report(report)
}
