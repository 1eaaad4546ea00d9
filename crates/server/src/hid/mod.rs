//! libusb-backed raw HID transport
//!
//! Talks to HID interfaces directly through `rusb`: enumeration reads each
//! HID interface's report descriptor to find its usage page/usage, and an
//! open handle claims the interface and uses its interrupt endpoints.

pub mod descriptor;

use common::{Error, HidCandidate, HidHandle, HidTransport, Result};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

const HID_CLASS: u8 = 0x03;

/// bmRequestType for GET_DESCRIPTOR addressed to an interface
const REQUEST_TYPE_INTERFACE_IN: u8 = 0x81;
const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
const DESCRIPTOR_TYPE_REPORT: u16 = 0x22;

/// bmRequestType / bRequest for HID SET_REPORT
const REQUEST_TYPE_CLASS_OUT: u8 = 0x21;
const REQUEST_SET_REPORT: u8 = 0x09;
const REPORT_TYPE_OUTPUT: u16 = 0x02;

/// Raw HID interfaces use 32-byte interrupt endpoints
const RAW_HID_PACKET_SIZE: u16 = 32;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Map rusb errors to the shared error type
pub fn map_rusb_error(err: rusb::Error) -> Error {
    match err {
        rusb::Error::NoDevice | rusb::Error::NotFound => Error::DeviceNotFound(err.to_string()),
        other => Error::Transport(other.to_string()),
    }
}

/// Raw HID transport over libusb
///
/// libusb is initialised on first use, so a host without USB access can
/// still run the broker; device loops then keep retrying.
#[derive(Default)]
pub struct RusbTransport {
    context: Mutex<Option<Context>>,
}

impl RusbTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn context(&self) -> Result<Context> {
        let mut slot = self.context.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(context) = slot.as_ref() {
            return Ok(context.clone());
        }
        let context = Context::new().map_err(map_rusb_error)?;
        *slot = Some(context.clone());
        Ok(context)
    }

    /// Usage page and usage of one HID interface
    fn interface_usage(
        handle: Option<&DeviceHandle<Context>>,
        interface: &rusb::InterfaceDescriptor<'_>,
    ) -> Option<(u16, u16)> {
        let number = interface.interface_number();

        if let Some(handle) = handle {
            let mut buf = [0u8; 1024];
            match handle.read_control(
                REQUEST_TYPE_INTERFACE_IN,
                REQUEST_GET_DESCRIPTOR,
                DESCRIPTOR_TYPE_REPORT << 8,
                u16::from(number),
                &mut buf,
                CONTROL_TIMEOUT,
            ) {
                Ok(len) => return descriptor::top_level_usage(&buf[..len]),
                Err(e) => debug!(
                    "Could not read report descriptor of interface {}: {}",
                    number, e
                ),
            }
        }

        // Kernel-bound interfaces may refuse the descriptor request. A
        // non-boot HID interface with 32-byte interrupt endpoints in both
        // directions is what raw HID firmware exposes.
        let raw_hid_shaped = interface.sub_class_code() == 0
            && interface.protocol_code() == 0
            && [Direction::In, Direction::Out].iter().all(|dir| {
                interface.endpoint_descriptors().any(|ep| {
                    ep.direction() == *dir
                        && ep.transfer_type() == TransferType::Interrupt
                        && ep.max_packet_size() == RAW_HID_PACKET_SIZE
                })
            });

        raw_hid_shaped.then_some((common::RAW_HID_USAGE_PAGE, common::RAW_HID_USAGE))
    }

    fn candidates_of(device: &Device<Context>, out: &mut Vec<HidCandidate>) -> rusb::Result<()> {
        let desc = device.device_descriptor()?;
        let config = device.active_config_descriptor()?;
        let handle = device
            .open()
            .map_err(|e| debug!("Could not open device for inspection: {}", e))
            .ok();

        let (product, manufacturer) = match handle.as_ref() {
            Some(h) => (
                h.read_product_string_ascii(&desc).ok(),
                h.read_manufacturer_string_ascii(&desc).ok(),
            ),
            None => (None, None),
        };

        for interface in config.interfaces() {
            let Some(alt) = interface.descriptors().next() else {
                continue;
            };
            if alt.class_code() != HID_CLASS {
                continue;
            }
            let Some((usage_page, usage)) = Self::interface_usage(handle.as_ref(), &alt) else {
                continue;
            };

            out.push(HidCandidate {
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                usage_page,
                usage,
                product: product.clone(),
                manufacturer: manufacturer.clone(),
                path: format!(
                    "{}:{}:{}",
                    device.bus_number(),
                    device.address(),
                    interface.number()
                ),
            });
        }
        Ok(())
    }
}

fn parse_path(path: &str) -> Option<(u8, u8, u8)> {
    let mut parts = path.split(':').map(str::parse::<u8>);
    let bus = parts.next()?.ok()?;
    let address = parts.next()?.ok()?;
    let interface = parts.next()?.ok()?;
    parts.next().is_none().then_some((bus, address, interface))
}

impl HidTransport for RusbTransport {
    fn enumerate(&self, vendor_id: u16, product_id: u16) -> Result<Vec<HidCandidate>> {
        let context = self.context()?;
        let devices = context.devices().map_err(map_rusb_error)?;

        let mut candidates = Vec::new();
        for device in devices.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if desc.vendor_id() != vendor_id || desc.product_id() != product_id {
                continue;
            }
            if let Err(e) = Self::candidates_of(&device, &mut candidates) {
                warn!(
                    "Failed to inspect device {:04x}:{:04x} on bus {} address {}: {}",
                    vendor_id,
                    product_id,
                    device.bus_number(),
                    device.address(),
                    e
                );
            }
        }

        debug!(
            "Found {} HID interface(s) for {:04x}:{:04x}",
            candidates.len(),
            vendor_id,
            product_id
        );
        Ok(candidates)
    }

    fn connect(&self, candidate: &HidCandidate) -> Result<Box<dyn HidHandle>> {
        let (bus, address, interface) = parse_path(&candidate.path)
            .ok_or_else(|| Error::Transport(format!("invalid device path: {}", candidate.path)))?;

        let context = self.context()?;
        let devices = context.devices().map_err(map_rusb_error)?;
        let device = devices
            .iter()
            .find(|d| d.bus_number() == bus && d.address() == address)
            .ok_or_else(|| Error::DeviceNotFound(candidate.path.clone()))?;

        let config = device.active_config_descriptor().map_err(map_rusb_error)?;
        let (mut endpoint_in, mut endpoint_out) = (None, None);
        for alt in config
            .interfaces()
            .filter(|i| i.number() == interface)
            .flat_map(|i| i.descriptors().take(1))
        {
            for ep in alt.endpoint_descriptors() {
                if ep.transfer_type() != TransferType::Interrupt {
                    continue;
                }
                match ep.direction() {
                    Direction::In => endpoint_in = endpoint_in.or(Some(ep.address())),
                    Direction::Out => endpoint_out = endpoint_out.or(Some(ep.address())),
                }
            }
        }
        let endpoint_in = endpoint_in.ok_or_else(|| {
            Error::Transport(format!("interface {} has no interrupt IN endpoint", interface))
        })?;

        let mut handle = device.open().map_err(map_rusb_error)?;

        let mut reattach = false;
        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                handle
                    .detach_kernel_driver(interface)
                    .map_err(map_rusb_error)?;
                reattach = true;
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        if let Err(e) = handle.claim_interface(interface) {
            if reattach {
                let _ = handle.attach_kernel_driver(interface);
            }
            return Err(map_rusb_error(e));
        }

        debug!(
            "Claimed interface {} (in {:#04x}, out {:?})",
            interface, endpoint_in, endpoint_out
        );
        Ok(Box::new(RusbHandle {
            handle,
            interface,
            endpoint_in,
            endpoint_out,
            reattach,
        }))
    }
}

/// A claimed raw HID interface
struct RusbHandle {
    handle: DeviceHandle<Context>,
    interface: u8,
    endpoint_in: u8,
    endpoint_out: Option<u8>,
    reattach: bool,
}

impl HidHandle for RusbHandle {
    fn read_timeout(&mut self, size: usize, timeout: Duration) -> Result<Vec<u8>> {
        // libusb treats a zero timeout as "wait forever"
        let timeout = timeout.max(Duration::from_millis(1));
        let mut buf = vec![0u8; size];

        match self.handle.read_interrupt(self.endpoint_in, &mut buf, timeout) {
            Ok(len) => {
                buf.truncate(len);
                Ok(buf)
            }
            Err(rusb::Error::Timeout) => Ok(Vec::new()),
            Err(e) => Err(map_rusb_error(e)),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let Some((&report_id, payload)) = bytes.split_first() else {
            return Err(Error::Transport("empty report".to_string()));
        };

        let written = match self.endpoint_out {
            Some(endpoint) => self.handle.write_interrupt(endpoint, payload, WRITE_TIMEOUT),
            None => self.handle.write_control(
                REQUEST_TYPE_CLASS_OUT,
                REQUEST_SET_REPORT,
                (REPORT_TYPE_OUTPUT << 8) | u16::from(report_id),
                u16::from(self.interface),
                payload,
                WRITE_TIMEOUT,
            ),
        }
        .map_err(map_rusb_error)?;

        Ok(written + 1)
    }
}

impl Drop for RusbHandle {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface) {
            debug!("Failed to release interface {}: {}", self.interface, e);
        }
        if self.reattach {
            if let Err(e) = self.handle.attach_kernel_driver(self.interface) {
                debug!(
                    "Failed to reattach kernel driver to interface {}: {}",
                    self.interface, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_path() {
        assert_eq!(parse_path("1:4:1"), Some((1, 4, 1)));
        assert_eq!(parse_path("1:4"), None);
        assert_eq!(parse_path("1:4:1:0"), None);
        assert_eq!(parse_path("a:4:1"), None);
        assert_eq!(parse_path("1:300:1"), None);
    }

    #[test]
    fn test_map_rusb_error() {
        assert!(matches!(
            map_rusb_error(rusb::Error::NoDevice),
            Error::DeviceNotFound(_)
        ));
        assert!(matches!(map_rusb_error(rusb::Error::Pipe), Error::Transport(_)));
    }

    #[test]
    fn test_transport_enumerate_without_device() {
        // May fail without USB access; must never panic
        let transport = RusbTransport::new();
        if let Ok(found) = transport.enumerate(0xFFFE, 0xFFFE) {
            assert!(found.is_empty());
        }
    }
}
