//! Raw HID transport capability
//!
//! Device loops never talk to a driver directly; they are handed an
//! [`HidTransport`] that can enumerate and open matching HID interfaces.
//! The server provides a libusb-backed implementation, tests use
//! [`crate::test_utils::MockTransport`].

use std::time::Duration;

/// Usage page of the vendor-defined raw HID interface
pub const RAW_HID_USAGE_PAGE: u16 = 0xFF60;

/// Usage of the vendor-defined raw HID interface
pub const RAW_HID_USAGE: u16 = 0x61;

/// An openable HID interface found during enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidCandidate {
    pub vendor_id: u16,
    pub product_id: u16,
    pub usage_page: u16,
    pub usage: u16,
    pub product: Option<String>,
    pub manufacturer: Option<String>,
    /// Transport-specific locator (e.g. `bus:address:interface`)
    pub path: String,
}

impl HidCandidate {
    /// Whether this candidate is the interface identified by the given ids
    pub fn matches(&self, vendor_id: u16, product_id: u16, usage_page: u16, usage: u16) -> bool {
        self.vendor_id == vendor_id
            && self.product_id == product_id
            && self.usage_page == usage_page
            && self.usage == usage
    }
}

/// Enumerates and opens HID interfaces
pub trait HidTransport: Send + Sync {
    /// List interfaces of devices with the given vendor and product id
    fn enumerate(&self, vendor_id: u16, product_id: u16) -> crate::Result<Vec<HidCandidate>>;

    /// Open a candidate for exclusive use; dropping the handle releases it
    fn connect(&self, candidate: &HidCandidate) -> crate::Result<Box<dyn HidHandle>>;
}

/// An open HID interface
pub trait HidHandle: Send {
    /// Read one report, waiting at most `timeout`
    ///
    /// Returns an empty buffer when no report arrived in time.
    fn read_timeout(&mut self, size: usize, timeout: Duration) -> crate::Result<Vec<u8>>;

    /// Write one report; `bytes[0]` is the report id
    fn write(&mut self, bytes: &[u8]) -> crate::Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_matches() {
        let candidate = HidCandidate {
            vendor_id: 0x3434,
            product_id: 0x0321,
            usage_page: RAW_HID_USAGE_PAGE,
            usage: RAW_HID_USAGE,
            product: None,
            manufacturer: None,
            path: "1:4:1".to_string(),
        };

        assert!(candidate.matches(0x3434, 0x0321, RAW_HID_USAGE_PAGE, RAW_HID_USAGE));
        // Keyboard boot interface of the same device
        assert!(!candidate.matches(0x3434, 0x0321, 0x0001, 0x0006));
        assert!(!candidate.matches(0x3434, 0x0322, RAW_HID_USAGE_PAGE, RAW_HID_USAGE));
    }
}
