//! Protocol library for hid-broker
//!
//! This crate defines the two wire formats of the broker:
//!
//! - the fixed-size report protocol spoken with raw HID devices
//!   ([`Packet`], [`Message`], fragmentation and reassembly), and
//! - the JSON request/response schema ([`Request`], [`Response`]) carried in
//!   multipart frames over the broker's network transport.
//!
//! # Example
//!
//! ```
//! use protocol::{Message, MessageIdCounter, fragment_message, reassemble_message};
//!
//! let mut ids = MessageIdCounter::new();
//! let msg = Message::new(4, vec![0xAB; 60]).unwrap();
//!
//! // 60 bytes need three 29-byte packets sharing one id
//! let packets = fragment_message(&msg, &mut ids);
//! assert_eq!(packets.len(), 3);
//!
//! let rebuilt = reassemble_message(&packets).unwrap();
//! assert_eq!(rebuilt, msg);
//! ```

pub mod codec;
pub mod error;
pub mod identity;
pub mod message;
pub mod packet;
pub mod rpc;
pub mod version;

pub use codec::{
    MAX_FRAME_SIZE, Multipart, decode_multipart, encode_multipart, read_multipart,
    write_multipart,
};

#[cfg(feature = "async")]
pub use codec::{read_multipart_async, write_multipart_async};
pub use error::{ProtocolError, Result};
pub use identity::DeviceIdentity;
pub use message::{
    MAX_MESSAGE_SIZE, Message, MessageIdCounter, fragment_message, reassemble_message,
};
pub use packet::{
    DATA_SIZE, FRAME_SIZE, HEADER_SIZE, Packet, REPORT_ID, REPORT_SIZE, decode_packet,
    encode_packet,
};
pub use rpc::{Request, Response, Status};
pub use version::{CURRENT_VERSION, PrivateSubsystem, ProtocolVersion, protocol_info_request};
