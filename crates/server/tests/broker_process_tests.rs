//! Broker process tests
//!
//! Starts the `hid-broker` binary with a temporary configuration and talks to
//! it over TCP the way client applications do. No HID hardware is needed:
//! requests that register devices only start their loops, which keep
//! retrying in the background.
//!
//! Run with: `cargo test -p server --test broker_process_tests`

use bytes::Bytes;
use protocol::{DeviceIdentity, Request, Response, Status, read_multipart, write_multipart};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Harness
// ============================================================================

struct BrokerProcess {
    child: Child,
    addr: String,
    pin_file: PathBuf,
    _dir: TempDir,
}

impl BrokerProcess {
    fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let addr = free_addr();
        let pin_file = dir.path().join("pin");
        let config_path = dir.path().join("server.toml");

        std::fs::write(
            &config_path,
            format!(
                r#"
[server]
bind_addr = "{addr}"
log_level = "debug"

[broker]
write_read_timeout_ms = 200
pin_file = "{pin}"

[device]
reconnect_backoff_ms = 100
"#,
                addr = addr,
                pin = pin_file.display()
            ),
        )
        .unwrap();

        let child = Command::new(env!("CARGO_BIN_EXE_hid-broker"))
            .arg("--config")
            .arg(&config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let process = Self {
            child,
            addr,
            pin_file,
            _dir: dir,
        };
        process.wait_ready();
        process
    }

    fn wait_ready(&self) {
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        while Instant::now() < deadline {
            if self.pin_file.exists() && TcpStream::connect(&self.addr).is_ok() {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
        panic!("broker did not start listening on {}", self.addr);
    }

    fn pin(&self) -> String {
        read_pin(&self.pin_file)
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(&self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }
}

impl Drop for BrokerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

fn read_pin(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap().trim().to_string()
}

fn call(stream: &mut TcpStream, request: &Request) -> Response {
    let frames = [Bytes::new(), Bytes::from(request.to_json().unwrap())];
    write_multipart(stream, &frames).unwrap();

    let reply = read_multipart(stream).unwrap();
    assert_eq!(reply.len(), 2, "reply must be [empty, payload]");
    assert!(reply[0].is_empty());
    Response::from_json(&reply[1]).unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_list_on_fresh_broker() {
    let broker = BrokerProcess::start();
    let mut stream = broker.connect();

    let response = call(&mut stream, &Request::List);
    assert_eq!(response.status, Status::Ack);
    assert_eq!(response.devices, Some(vec![]));
}

#[test]
fn test_pin_file_holds_numeric_pin() {
    let broker = BrokerProcess::start();
    let pin = broker.pin();
    assert!(!pin.is_empty());
    assert!(pin.chars().all(|c| c.is_ascii_digit()));
}

#[test]
fn test_management_requires_pin() {
    let broker = BrokerProcess::start();
    let mut stream = broker.connect();

    let response = call(
        &mut stream,
        &Request::AddDevice {
            device_id: Some(DeviceIdentity::new(0x3434, 0x0321)),
            management_pin: Some("not-the-pin".to_string()),
        },
    );
    assert_eq!(response.status, Status::Err);
    assert_eq!(
        response.error_message.as_deref(),
        Some("invalid management pin")
    );

    let listed = call(&mut stream, &Request::List);
    assert_eq!(listed.devices, Some(vec![]));
}

#[test]
fn test_add_list_remove_cycle() {
    let broker = BrokerProcess::start();
    let pin = broker.pin();
    let mut stream = broker.connect();
    let device = DeviceIdentity::new(0x3434, 0x0321);

    let added = call(
        &mut stream,
        &Request::AddDevice {
            device_id: Some(device.clone()),
            management_pin: Some(pin.clone()),
        },
    );
    assert!(added.is_ack(), "{:?}", added);

    let listed = call(&mut stream, &Request::List);
    assert_eq!(listed.devices, Some(vec!["0x3434:0x0321".to_string()]));

    // Registered but absent: the write is queued, the read times out
    let queued = call(
        &mut stream,
        &Request::Write {
            device_id: Some(device.clone()),
            subsystem: Some(7),
            message: Some(vec![1]),
        },
    );
    assert!(queued.is_ack());

    let unanswered = call(
        &mut stream,
        &Request::WriteRead {
            device_id: Some(device.clone()),
            subsystem: Some(7),
            message: Some(vec![1]),
        },
    );
    assert_eq!(unanswered.status, Status::Err);

    let removed = call(
        &mut stream,
        &Request::RemoveDevice {
            device_id: Some(device),
            management_pin: Some(pin),
        },
    );
    assert!(removed.is_ack());

    let listed = call(&mut stream, &Request::List);
    assert_eq!(listed.devices, Some(vec![]));
}

#[test]
fn test_unknown_device_is_an_error() {
    let broker = BrokerProcess::start();
    let mut stream = broker.connect();

    let started = Instant::now();
    let response = call(
        &mut stream,
        &Request::WriteRead {
            device_id: Some(DeviceIdentity::new(0xDEAD, 0xBEEF)),
            subsystem: Some(2),
            message: Some(vec![]),
        },
    );
    assert_eq!(response.status, Status::Err);
    assert_eq!(response.error_message.as_deref(), Some("device not found"));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_clients_are_served_independently() {
    let broker = BrokerProcess::start();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let mut stream = broker.connect();
            thread::spawn(move || {
                for _ in 0..10 {
                    assert!(call(&mut stream, &Request::List).is_ack());
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}
