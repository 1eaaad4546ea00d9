//! Broker RPC payloads
//!
//! Requests and responses travel as JSON. Field names are part of the
//! external contract: `Type`, `DeviceID`, `Subsystem`, `Message`,
//! `ManagementPin`, `Status`, `DeviceMessage`, `ErrorMessage`, `Devices`.
//!
//! ```
//! use protocol::{Request, Response};
//!
//! let req: Request = serde_json::from_str(r#"{"Type": "List"}"#).unwrap();
//! assert_eq!(req, Request::List);
//!
//! let resp = Response::ack();
//! assert_eq!(serde_json::to_string(&resp).unwrap(), r#"{"Status":"ACK"}"#);
//! ```

use crate::error::Result;
use crate::identity::DeviceIdentity;
use serde::{Deserialize, Serialize};

/// Request sent by a broker client
///
/// Fields are optional on the wire so that a request missing one can be
/// answered with a descriptive error rather than a parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum Request {
    /// List registered devices
    List,
    /// Queue a message without waiting for a reply
    Write {
        #[serde(rename = "DeviceID", default, skip_serializing_if = "Option::is_none")]
        device_id: Option<DeviceIdentity>,
        #[serde(rename = "Subsystem", default, skip_serializing_if = "Option::is_none")]
        subsystem: Option<u8>,
        #[serde(rename = "Message", default, skip_serializing_if = "Option::is_none")]
        message: Option<Vec<u8>>,
    },
    /// Queue a message and wait for the reply on the same subsystem
    WriteRead {
        #[serde(rename = "DeviceID", default, skip_serializing_if = "Option::is_none")]
        device_id: Option<DeviceIdentity>,
        #[serde(rename = "Subsystem", default, skip_serializing_if = "Option::is_none")]
        subsystem: Option<u8>,
        #[serde(rename = "Message", default, skip_serializing_if = "Option::is_none")]
        message: Option<Vec<u8>>,
    },
    /// Register a device (management)
    AddDevice {
        #[serde(rename = "DeviceID", default, skip_serializing_if = "Option::is_none")]
        device_id: Option<DeviceIdentity>,
        #[serde(rename = "ManagementPin", default, skip_serializing_if = "Option::is_none")]
        management_pin: Option<String>,
    },
    /// Unregister a device (management)
    RemoveDevice {
        #[serde(rename = "DeviceID", default, skip_serializing_if = "Option::is_none")]
        device_id: Option<DeviceIdentity>,
        #[serde(rename = "ManagementPin", default, skip_serializing_if = "Option::is_none")]
        management_pin: Option<String>,
    },
}

impl Request {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Outcome of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "ACK")]
    Ack,
    #[serde(rename = "ERR")]
    Err,
}

/// Response returned for every well-formed request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "Status")]
    pub status: Status,
    #[serde(rename = "DeviceMessage", default, skip_serializing_if = "Option::is_none")]
    pub device_message: Option<Vec<u8>>,
    #[serde(rename = "ErrorMessage", default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(rename = "Devices", default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<String>>,
}

impl Response {
    pub fn ack() -> Self {
        Self {
            status: Status::Ack,
            device_message: None,
            error_message: None,
            devices: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Err,
            error_message: Some(message.into()),
            ..Self::ack()
        }
    }

    pub fn with_device_message(data: Vec<u8>) -> Self {
        Self {
            device_message: Some(data),
            ..Self::ack()
        }
    }

    pub fn with_devices(devices: Vec<String>) -> Self {
        Self {
            devices: Some(devices),
            ..Self::ack()
        }
    }

    pub fn is_ack(&self) -> bool {
        self.status == Status::Ack
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_request_wire_names() {
        let json = r#"{"Type":"Write","DeviceID":"0x3434:0x0321","Subsystem":4,"Message":[1,2,3]}"#;
        let req = Request::from_json(json.as_bytes()).unwrap();
        assert_eq!(
            req,
            Request::Write {
                device_id: Some(DeviceIdentity::new(0x3434, 0x0321)),
                subsystem: Some(4),
                message: Some(vec![1, 2, 3]),
            }
        );
        assert_eq!(req.to_json().unwrap(), json.as_bytes());
    }

    #[test]
    fn test_missing_fields_parse() {
        let req = Request::from_json(br#"{"Type":"AddDevice"}"#).unwrap();
        assert_eq!(
            req,
            Request::AddDevice {
                device_id: None,
                management_pin: None
            }
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(Request::from_json(br#"{"Type":"Reboot"}"#).is_err());
        assert!(Request::from_json(b"not json").is_err());
    }

    #[test]
    fn test_response_shapes() {
        let err = Response::error("device already exists");
        assert_eq!(
            String::from_utf8(err.to_json().unwrap()).unwrap(),
            r#"{"Status":"ERR","ErrorMessage":"device already exists"}"#
        );

        let list = Response::with_devices(vec!["0x0001:0x0002".into()]);
        assert_eq!(
            String::from_utf8(list.to_json().unwrap()).unwrap(),
            r#"{"Status":"ACK","Devices":["0x0001:0x0002"]}"#
        );

        let parsed = Response::from_json(br#"{"Status":"ACK","DeviceMessage":[9]}"#).unwrap();
        assert!(parsed.is_ack());
        assert_eq!(parsed.device_message, Some(vec![9]));
    }
}
