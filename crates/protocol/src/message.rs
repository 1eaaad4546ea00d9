//! Logical messages and their fragmentation into packets

use crate::error::{ProtocolError, Result};
use crate::packet::{DATA_SIZE, Packet};
use std::fmt;

/// Largest payload a message can carry (the length field is one byte)
pub const MAX_MESSAGE_SIZE: usize = u8::MAX as usize;

/// Application-level message addressed to a subsystem
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Message {
    subsystem: u8,
    data: Vec<u8>,
}

impl Message {
    /// Create a message, rejecting payloads longer than `MAX_MESSAGE_SIZE`
    pub fn new(subsystem: u8, data: impl Into<Vec<u8>>) -> Result<Self> {
        let data = data.into();
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(Self { subsystem, data })
    }

    /// Construct from a payload already known to fit
    pub(crate) fn new_unchecked(subsystem: u8, data: Vec<u8>) -> Self {
        debug_assert!(data.len() <= MAX_MESSAGE_SIZE);
        Self { subsystem, data }
    }

    pub fn subsystem(&self) -> u8 {
        self.subsystem
    }

    /// Payload length as carried in the packet header
    pub fn length(&self) -> u8 {
        // Bounded by MAX_MESSAGE_SIZE at construction
        self.data.len() as u8
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Build a message from a single (non multi-part) packet
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if packet.is_multi_part() {
            return Err(ProtocolError::MalformedMessage(format!(
                "packet declares {} bytes, more than one packet carries",
                packet.length
            )));
        }
        Self::new(packet.subsystem, &packet.data[..usize::from(packet.length)])
    }

    /// Split into packets sharing `id` and the total length, in offset order
    pub fn fragment(&self, id: u8) -> Vec<Packet> {
        let length = self.length();
        if self.data.is_empty() {
            return vec![Packet {
                subsystem: self.subsystem,
                id,
                length,
                data: [0u8; DATA_SIZE],
            }];
        }

        self.data
            .chunks(DATA_SIZE)
            .map(|chunk| {
                let mut data = [0u8; DATA_SIZE];
                data[..chunk.len()].copy_from_slice(chunk);
                Packet {
                    subsystem: self.subsystem,
                    id,
                    length,
                    data,
                }
            })
            .collect()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message: Subsystem={}, Length={}, Data={:?}",
            self.subsystem,
            self.data.len(),
            self.data
        )
    }
}

/// Sequence number source for outbound messages
///
/// Each device owns one counter; ids wrap after 255 so reuse is expected once
/// more than 256 messages have been sent.
#[derive(Debug, Default, Clone)]
pub struct MessageIdCounter {
    last: u8,
}

impl MessageIdCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the next id (the first id handed out is 1)
    pub fn next_id(&mut self) -> u8 {
        self.last = self.last.wrapping_add(1);
        self.last
    }
}

/// Fragment `message` using the next id from `ids`
pub fn fragment_message(message: &Message, ids: &mut MessageIdCounter) -> Vec<Packet> {
    message.fragment(ids.next_id())
}

/// Rebuild a message from its packets
///
/// All packets must agree on id, subsystem and length, there must be exactly
/// as many as the declared length requires, and the concatenated payload
/// must match the declared length.
pub fn reassemble_message(packets: &[Packet]) -> Result<Message> {
    let first = packets
        .first()
        .ok_or_else(|| ProtocolError::MalformedMessage("no packets".to_string()))?;

    for packet in &packets[1..] {
        if packet.id != first.id {
            return Err(ProtocolError::MalformedMessage(format!(
                "packets have different ids ({} != {})",
                packet.id, first.id
            )));
        }
        if packet.subsystem != first.subsystem {
            return Err(ProtocolError::MalformedMessage(format!(
                "packets have different subsystems ({} != {})",
                packet.subsystem, first.subsystem
            )));
        }
        if packet.length != first.length {
            return Err(ProtocolError::MalformedMessage(format!(
                "packets have different lengths ({} != {})",
                packet.length, first.length
            )));
        }
    }

    let expected = first.number_of_packets();
    if packets.len() < expected {
        return Err(ProtocolError::MalformedMessage(format!(
            "data is missing: {} of {} packets",
            packets.len(),
            expected
        )));
    }
    if packets.len() > expected {
        return Err(ProtocolError::MalformedMessage(format!(
            "too many packets: {} (expected {})",
            packets.len(),
            expected
        )));
    }

    let declared = usize::from(first.length);
    let mut data = Vec::with_capacity(declared);
    for packet in packets {
        let take = (declared - data.len()).min(DATA_SIZE);
        data.extend_from_slice(&packet.data[..take]);
    }

    if data.len() != declared {
        return Err(ProtocolError::MalformedMessage(format!(
            "reassembled {} bytes, header declares {}",
            data.len(),
            declared
        )));
    }

    Message::new(first.subsystem, data)
}
