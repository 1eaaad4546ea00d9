//! Device broker
//!
//! Owns the device registry and answers RPC requests against it. Request
//! handling is synchronous: the dispatch thread finishes one request
//! (including a `WriteRead` wait) before receiving the next.

mod dispatch;
mod registry;

pub use dispatch::spawn_broker_worker;
pub use registry::DeviceRegistry;

use crate::device::{DeviceLoop, DeviceLoopConfig};
use common::{Error, HidTransport, Result};
use protocol::{DeviceIdentity, Message, Request, Response};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Settings shared by every device the broker creates
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub device: DeviceLoopConfig,
    /// How long a `WriteRead` waits for the device's reply
    pub write_read_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            device: DeviceLoopConfig::default(),
            write_read_timeout: Duration::from_secs(1),
        }
    }
}

pub struct Broker {
    registry: DeviceRegistry,
    management_pin: String,
    transport: Arc<dyn HidTransport>,
    config: BrokerConfig,
}

impl Broker {
    /// Create a broker with a fresh random management pin
    pub fn new(transport: Arc<dyn HidTransport>, config: BrokerConfig) -> Self {
        let pin = rand::rng().random_range(0..i64::MAX).to_string();
        Self::with_management_pin(transport, config, pin)
    }

    pub fn with_management_pin(
        transport: Arc<dyn HidTransport>,
        config: BrokerConfig,
        management_pin: impl Into<String>,
    ) -> Self {
        Self {
            registry: DeviceRegistry::new(),
            management_pin: management_pin.into(),
            transport,
            config,
        }
    }

    /// Secret required by `AddDevice` / `RemoveDevice` requests
    pub fn management_pin(&self) -> &str {
        &self.management_pin
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Register and start a loop for `identity`
    pub fn add_device(&self, identity: DeviceIdentity) -> Result<()> {
        debug!("Adding device: {}", identity);
        self.registry.insert_with(identity, |identity| {
            let device = DeviceLoop::new(
                identity,
                self.transport.clone(),
                self.config.device.clone(),
            );
            device.start()?;
            Ok(device)
        })?;
        Ok(())
    }

    /// Stop, dispose and unregister the loop for `identity`
    pub fn remove_device(&self, identity: &DeviceIdentity) -> Result<()> {
        debug!("Removing device: {}", identity);
        self.registry.remove(identity)?;
        info!("Removed device {}", identity);
        Ok(())
    }

    pub fn list_devices(&self) -> Vec<DeviceIdentity> {
        self.registry.identities()
    }

    /// Queue a message for one device
    pub fn write(&self, identity: &DeviceIdentity, message: Message) -> Result<()> {
        let device = self
            .registry
            .get(identity)
            .ok_or_else(|| Error::DeviceNotFound(identity.to_string()))?;
        device.write(message)?;
        Ok(())
    }

    /// Queue a message and wait for the device's reply on the same subsystem
    ///
    /// `Ok(None)` means the device is registered but did not answer in time.
    pub fn write_read(&self, identity: &DeviceIdentity, message: Message) -> Result<Option<Message>> {
        let device = self
            .registry
            .get(identity)
            .ok_or_else(|| Error::DeviceNotFound(identity.to_string()))?;
        Ok(device.write_wait(message, self.config.write_read_timeout))
    }

    /// Queue one message for every registered device; returns how many accepted it
    pub fn broadcast(&self, message: Message) -> usize {
        let mut queued = 0;
        for device in self.registry.loops() {
            match device.write(message.clone()) {
                Ok(_) => queued += 1,
                Err(e) => warn!(device = %device.identity(), "Broadcast not queued: {}", e),
            }
        }
        queued
    }

    /// Stop every device loop and empty the registry
    ///
    /// Every loop is signalled before any is joined, and each entry stays
    /// registered until its loop has been disposed.
    pub fn shutdown_all(&self) {
        let devices = self.registry.loops();
        for device in &devices {
            device.stop();
        }
        for device in &devices {
            let identity = device.identity();
            if let Err(e) = self.registry.remove(&identity) {
                debug!(device = %identity, "Skipping shutdown: {}", e);
            }
        }
        info!("Stopped {} device loop(s)", devices.len());
    }

    fn check_pin(&self, pin: Option<&str>) -> Result<()> {
        match pin {
            Some(pin) if pin == self.management_pin => Ok(()),
            _ => Err(Error::Unauthorized),
        }
    }

    /// Answer one request; never fails, errors become ERR responses
    pub fn handle(&self, request: Request) -> Response {
        let result = match request {
            Request::List => {
                let devices = self.list_devices().iter().map(ToString::to_string).collect();
                return Response::with_devices(devices);
            }
            Request::Write {
                device_id,
                subsystem,
                message,
            } => required_message(device_id, subsystem, message)
                .and_then(|(id, msg)| self.write(&id, msg))
                .map(|()| Response::ack()),
            Request::WriteRead {
                device_id,
                subsystem,
                message,
            } => required_message(device_id, subsystem, message)
                .and_then(|(id, msg)| self.write_read(&id, msg))
                .map(|reply| match reply {
                    Some(reply) => Response::with_device_message(reply.into_data()),
                    None => Response::error("no response from device"),
                }),
            Request::AddDevice {
                device_id,
                management_pin,
            } => self
                .check_pin(management_pin.as_deref())
                .and_then(|()| required_device(device_id))
                .and_then(|id| self.add_device(id))
                .map(|()| Response::ack()),
            Request::RemoveDevice {
                device_id,
                management_pin,
            } => self
                .check_pin(management_pin.as_deref())
                .and_then(|()| required_device(device_id))
                .and_then(|id| self.remove_device(&id))
                .map(|()| Response::ack()),
        };

        result.unwrap_or_else(|e| {
            debug!("Request failed: {}", e);
            Response::error(error_message(&e))
        })
    }

    /// Decode and answer a JSON request payload
    pub fn handle_payload(&self, payload: &[u8]) -> Response {
        match Request::from_json(payload) {
            Ok(request) => self.handle(request),
            Err(e) => {
                debug!("Invalid request: {}", e);
                Response::error("invalid request")
            }
        }
    }
}

fn required_device(device_id: Option<DeviceIdentity>) -> Result<DeviceIdentity> {
    device_id.ok_or_else(|| Error::InvalidRequest("DeviceID is required".to_string()))
}

fn required_message(
    device_id: Option<DeviceIdentity>,
    subsystem: Option<u8>,
    message: Option<Vec<u8>>,
) -> Result<(DeviceIdentity, Message)> {
    let device_id = required_device(device_id)?;
    let subsystem = subsystem.ok_or_else(|| Error::InvalidRequest("Subsystem is required".to_string()))?;
    let data = message.ok_or_else(|| Error::InvalidRequest("Message is required".to_string()))?;
    Ok((device_id, Message::new(subsystem, data)?))
}

/// Client-facing wording for a failed request
fn error_message(err: &Error) -> String {
    match err {
        Error::DeviceNotFound(_) => "device not found".to_string(),
        Error::DeviceAlreadyExists(_) => "device already exists".to_string(),
        Error::Unauthorized => "invalid management pin".to_string(),
        Error::InvalidRequest(msg) => msg.clone(),
        Error::Protocol(e) => e.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::MockTransport;
    use crate::device::LoopState;
    use protocol::Status;
    use std::time::Instant;

    const PIN: &str = "1234";

    fn broker(transport: MockTransport) -> Broker {
        let config = BrokerConfig {
            device: DeviceLoopConfig {
                reconnect_backoff: Duration::from_millis(20),
                idle_read_timeout: Duration::from_millis(2),
                fragment_read_timeout: Duration::from_millis(100),
                handshake: false,
                ..DeviceLoopConfig::default()
            },
            write_read_timeout: Duration::from_millis(500),
        };
        Broker::with_management_pin(Arc::new(transport), config, PIN)
    }

    fn add(id: DeviceIdentity, pin: &str) -> Request {
        Request::AddDevice {
            device_id: Some(id),
            management_pin: Some(pin.to_string()),
        }
    }

    fn remove(id: DeviceIdentity, pin: &str) -> Request {
        Request::RemoveDevice {
            device_id: Some(id),
            management_pin: Some(pin.to_string()),
        }
    }

    fn listed(broker: &Broker) -> Vec<String> {
        broker.handle(Request::List).devices.unwrap_or_default()
    }

    #[test]
    fn test_random_pin() {
        let a = Broker::new(Arc::new(MockTransport::new(1, 2)), BrokerConfig::default());
        let b = Broker::new(Arc::new(MockTransport::new(1, 2)), BrokerConfig::default());
        assert!(!a.management_pin().is_empty());
        assert!(a.management_pin().chars().all(|c| c.is_ascii_digit()));
        assert_ne!(a.management_pin(), b.management_pin());
    }

    #[test]
    fn test_list_empty() {
        let broker = broker(MockTransport::new(1, 2));
        let response = broker.handle(Request::List);
        assert!(response.is_ack());
        assert_eq!(response.devices, Some(vec![]));
    }

    #[test]
    fn test_add_twice_fails() {
        let broker = broker(MockTransport::new(0x3434, 0x0321));
        let id = DeviceIdentity::new(0x3434, 0x0321);

        assert!(broker.handle(add(id.clone(), PIN)).is_ack());
        let second = broker.handle(add(id, PIN));
        assert_eq!(second.status, Status::Err);
        assert_eq!(second.error_message.as_deref(), Some("device already exists"));
        assert_eq!(listed(&broker), vec!["0x3434:0x0321"]);
    }

    #[test]
    fn test_remove_with_wrong_pin_keeps_device() {
        let broker = broker(MockTransport::new(0x3434, 0x0321));
        let id = DeviceIdentity::new(0x3434, 0x0321);
        broker.handle(add(id.clone(), PIN));

        let response = broker.handle(remove(id.clone(), "4321"));
        assert_eq!(response.status, Status::Err);
        assert_eq!(response.error_message.as_deref(), Some("invalid management pin"));
        assert_eq!(listed(&broker), vec!["0x3434:0x0321"]);

        assert!(broker.handle(remove(id.clone(), PIN)).is_ack());
        assert!(listed(&broker).is_empty());

        let again = broker.handle(remove(id, PIN));
        assert_eq!(again.error_message.as_deref(), Some("device not found"));
    }

    #[test]
    fn test_missing_pin_rejected() {
        let broker = broker(MockTransport::new(1, 2));
        let response = broker.handle(Request::AddDevice {
            device_id: Some(DeviceIdentity::new(1, 2)),
            management_pin: None,
        });
        assert_eq!(response.status, Status::Err);
        assert!(broker.registry().is_empty());
    }

    #[test]
    fn test_write_read_unknown_device() {
        let broker = broker(MockTransport::new(1, 2));
        let started = Instant::now();
        let response = broker.handle(Request::WriteRead {
            device_id: Some(DeviceIdentity::new(9, 9)),
            subsystem: Some(3),
            message: Some(vec![1]),
        });

        assert_eq!(response.status, Status::Err);
        assert_eq!(response.error_message.as_deref(), Some("device not found"));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_write_unknown_device() {
        let broker = broker(MockTransport::new(1, 2));
        let response = broker.handle(Request::Write {
            device_id: Some(DeviceIdentity::new(9, 9)),
            subsystem: Some(3),
            message: Some(vec![1]),
        });
        assert_eq!(response.status, Status::Err);
        assert_eq!(response.error_message.as_deref(), Some("device not found"));
    }

    #[test]
    fn test_write_read_echo() {
        let broker = broker(MockTransport::new(0x3434, 0x0321).with_echo());
        let id = DeviceIdentity::new(0x3434, 0x0321);
        broker.add_device(id.clone()).unwrap();

        let response = broker.handle(Request::WriteRead {
            device_id: Some(id.clone()),
            subsystem: Some(7),
            message: Some(vec![0xDE, 0xAD]),
        });
        assert!(response.is_ack());
        assert_eq!(response.device_message, Some(vec![0xDE, 0xAD]));

        broker.shutdown_all();
        assert!(broker.registry().is_empty());
    }

    #[test]
    fn test_write_read_silent_device() {
        let broker = broker(MockTransport::new(1, 2));
        broker.add_device(DeviceIdentity::new(1, 2)).unwrap();

        let response = broker.handle(Request::WriteRead {
            device_id: Some(DeviceIdentity::new(1, 2)),
            subsystem: Some(7),
            message: Some(vec![1]),
        });
        assert_eq!(response.error_message.as_deref(), Some("no response from device"));
    }

    #[test]
    fn test_missing_fields() {
        let broker = broker(MockTransport::new(1, 2));
        let id = Some(DeviceIdentity::new(1, 2));

        let cases = [
            (
                Request::Write { device_id: None, subsystem: Some(1), message: Some(vec![]) },
                "DeviceID is required",
            ),
            (
                Request::Write { device_id: id.clone(), subsystem: None, message: Some(vec![]) },
                "Subsystem is required",
            ),
            (
                Request::WriteRead { device_id: id, subsystem: Some(1), message: None },
                "Message is required",
            ),
            (
                Request::AddDevice { device_id: None, management_pin: Some(PIN.to_string()) },
                "DeviceID is required",
            ),
        ];

        for (request, expected) in cases {
            let response = broker.handle(request);
            assert_eq!(response.status, Status::Err);
            assert_eq!(response.error_message.as_deref(), Some(expected));
        }
    }

    #[test]
    fn test_oversized_message_rejected() {
        let broker = broker(MockTransport::new(1, 2));
        broker.add_device(DeviceIdentity::new(1, 2)).unwrap();
        let response = broker.handle(Request::Write {
            device_id: Some(DeviceIdentity::new(1, 2)),
            subsystem: Some(1),
            message: Some(vec![0; 256]),
        });
        assert_eq!(response.status, Status::Err);
    }

    #[test]
    fn test_invalid_payload() {
        let broker = broker(MockTransport::new(1, 2));
        for payload in [&b"not json"[..], br#"{"Type":"Reboot"}"#, br#"{}"#] {
            let response = broker.handle_payload(payload);
            assert_eq!(response.status, Status::Err);
            assert_eq!(response.error_message.as_deref(), Some("invalid request"));
        }
    }

    #[test]
    fn test_json_object_device_id() {
        let broker = broker(MockTransport::new(0x3434, 0x0321));
        let payload = format!(
            r#"{{"Type":"AddDevice","DeviceID":{{"VID":13364,"PID":801}},"ManagementPin":"{PIN}"}}"#
        );
        assert!(broker.handle_payload(payload.as_bytes()).is_ack());
        assert_eq!(listed(&broker), vec!["0x3434:0x0321"]);
    }

    #[test]
    fn test_broadcast() {
        let transport = MockTransport::new(0x3434, 0x0321);
        let broker = broker(transport.clone());
        broker.add_device(DeviceIdentity::new(0x3434, 0x0321)).unwrap();
        broker.add_device(DeviceIdentity::new(0x1111, 0x2222)).unwrap();

        assert_eq!(broker.broadcast(Message::new(99, vec![1]).unwrap()), 2);
        assert!(common::test_utils::wait_for(Duration::from_secs(2), || {
            transport.written_reports().iter().any(|f| f[1] == 99)
        }));
    }

    #[test]
    fn test_shutdown_all_stops_loops() {
        let broker = broker(MockTransport::new(0x3434, 0x0321));
        broker.add_device(DeviceIdentity::new(0x3434, 0x0321)).unwrap();
        broker.add_device(DeviceIdentity::new(0x1111, 0x2222)).unwrap();
        let loops = broker.registry().loops();

        broker.shutdown_all();
        assert!(broker.registry().is_empty());
        assert!(loops.iter().all(|device| device.state() == LoopState::Stopped));
        assert!(listed(&broker).is_empty());
    }

    #[test]
    fn test_shutdown_keeps_entries_until_disposed() {
        let transport = MockTransport::new(0x3434, 0x0321);
        let config = BrokerConfig {
            device: DeviceLoopConfig {
                idle_read_timeout: Duration::from_millis(2),
                fragment_read_timeout: Duration::from_secs(1),
                handshake: false,
                ..DeviceLoopConfig::default()
            },
            write_read_timeout: Duration::from_millis(500),
        };
        let broker = Arc::new(Broker::with_management_pin(
            Arc::new(transport.clone()),
            config,
            PIN,
        ));
        let identity = DeviceIdentity::new(0x3434, 0x0321);
        broker.add_device(identity.clone()).unwrap();
        let device = broker.registry().get(&identity).unwrap();
        assert!(common::test_utils::wait_for(Duration::from_secs(2), || device.is_active()));

        // Park the worker in a fragment read so disposal is slow
        let mut report = vec![0u8; protocol::REPORT_SIZE];
        report[..3].copy_from_slice(&[6, 1, 40]);
        transport.push_report(report);
        assert!(common::test_utils::wait_for(Duration::from_secs(2), || {
            transport.pending_reports() == 0
        }));

        let stopper = {
            let broker = broker.clone();
            std::thread::spawn(move || broker.shutdown_all())
        };
        std::thread::sleep(Duration::from_millis(50));

        // Signalled but still registered while its worker winds down
        assert_eq!(device.state(), LoopState::Stopped);
        assert_eq!(listed(&broker), vec!["0x3434:0x0321"]);
        assert!(!stopper.is_finished());

        stopper.join().unwrap();
        assert!(broker.registry().is_empty());
    }
}
