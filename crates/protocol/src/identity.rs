//! Device identity (vendor id / product id pair)

use crate::error::ProtocolError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Identity of a physical device
///
/// Equality and hashing use only `(vendor_id, product_id)`; the product and
/// manufacturer strings are filled in once the device has been opened.
/// The canonical string form is `0xVVVV:0xPPPP`.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub product: Option<String>,
    pub manufacturer: Option<String>,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            product: None,
            manufacturer: None,
        }
    }

    /// Record the strings read from the device
    pub fn set_strings(&mut self, product: Option<String>, manufacturer: Option<String>) {
        self.product = product;
        self.manufacturer = manufacturer;
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.vendor_id == other.vendor_id && self.product_id == other.product_id
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.vendor_id.hash(state);
        self.product_id.hash(state);
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}:0x{:04X}", self.vendor_id, self.product_id)
    }
}

fn parse_hex_u16(part: &str, input: &str) -> Result<u16, ProtocolError> {
    let part = part.trim();
    let digits = part
        .strip_prefix("0x")
        .or_else(|| part.strip_prefix("0X"))
        .unwrap_or(part);

    if digits.is_empty() || digits.len() > 4 {
        return Err(ProtocolError::InvalidDeviceId(input.to_string()));
    }

    u16::from_str_radix(digits, 16).map_err(|_| ProtocolError::InvalidDeviceId(input.to_string()))
}

impl FromStr for DeviceIdentity {
    type Err = ProtocolError;

    /// Parse `VID:PID` in hex, with or without `0x` prefixes
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vid, pid) = s
            .split_once(':')
            .ok_or_else(|| ProtocolError::InvalidDeviceId(s.to_string()))?;
        Ok(Self::new(parse_hex_u16(vid, s)?, parse_hex_u16(pid, s)?))
    }
}

impl Serialize for DeviceIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Fields {
                #[serde(rename = "VID")]
                vid: u16,
                #[serde(rename = "PID")]
                pid: u16,
            },
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Repr::Fields { vid, pid } => Ok(Self::new(vid, pid)),
        }
    }
}
