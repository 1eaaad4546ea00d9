//! Device protocol version and private subsystem numbers

use crate::message::Message;
use std::fmt;

/// Version reported by a device in reply to a protocol-info request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

/// Protocol version spoken by this broker
pub const CURRENT_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

impl ProtocolVersion {
    /// Check if this version is compatible with another version
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }

    /// Read the version from a protocol-info reply (`[major, minor, ..]`)
    pub fn from_reply(message: &Message) -> Option<Self> {
        match message.data() {
            [major, minor, ..] => Some(Self {
                major: *major,
                minor: *minor,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Subsystem numbers reserved by the broker protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrivateSubsystem {
    ErrorState = 0,
    GetProtocolInfo = 1,
    GetCapabilities = 2,
    GetRgbSettings = 3,
    GetRgbModes = 4,
    SetRgbSettings = 5,
    PerKeyRgb = 6,
    Volume = 7,
    Broadcast = 99,
}

impl From<PrivateSubsystem> for u8 {
    fn from(subsystem: PrivateSubsystem) -> Self {
        subsystem as u8
    }
}

impl TryFrom<u8> for PrivateSubsystem {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::ErrorState,
            1 => Self::GetProtocolInfo,
            2 => Self::GetCapabilities,
            3 => Self::GetRgbSettings,
            4 => Self::GetRgbModes,
            5 => Self::SetRgbSettings,
            6 => Self::PerKeyRgb,
            7 => Self::Volume,
            99 => Self::Broadcast,
            other => return Err(other),
        })
    }
}

/// Request the device's protocol version
pub fn protocol_info_request() -> Message {
    Message::new_unchecked(PrivateSubsystem::GetProtocolInfo.into(), vec![0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let v1_0 = ProtocolVersion { major: 1, minor: 0 };
        let v1_3 = ProtocolVersion { major: 1, minor: 3 };
        let v2_0 = ProtocolVersion { major: 2, minor: 0 };

        assert!(v1_3.is_compatible_with(&v1_0));
        assert!(v1_0.is_compatible_with(&v1_3));
        assert!(!v2_0.is_compatible_with(&CURRENT_VERSION));
    }

    #[test]
    fn test_from_reply() {
        let reply = Message::new(1, vec![1, 2, 0xFF]).unwrap();
        let version = ProtocolVersion::from_reply(&reply).unwrap();
        assert_eq!(version.to_string(), "1.2");

        let short = Message::new(1, vec![1]).unwrap();
        assert!(ProtocolVersion::from_reply(&short).is_none());
    }

    #[test]
    fn test_private_subsystem_numbers() {
        assert_eq!(u8::from(PrivateSubsystem::Broadcast), 99);
        assert_eq!(PrivateSubsystem::try_from(1), Ok(PrivateSubsystem::GetProtocolInfo));
        assert_eq!(PrivateSubsystem::try_from(42), Err(42));

        let request = protocol_info_request();
        assert_eq!(request.subsystem(), 1);
        assert_eq!(request.data(), &[0]);
    }
}
