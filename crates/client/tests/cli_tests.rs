//! Command-line tests
//!
//! Runs `hid-broker-ctl` against an in-process stand-in for the broker router
//! that records each request and answers with a scripted response.
//!
//! Run with: `cargo test -p client --test cli_tests`

use bytes::Bytes;
use protocol::{DeviceIdentity, Request, Response, read_multipart, write_multipart};
use std::net::TcpListener;
use std::process::{Command, Output};
use std::sync::mpsc;
use std::thread;

// ============================================================================
// Harness
// ============================================================================

/// Accept one connection, answer one request, report what was asked
fn serve_once(response: Response) -> (String, mpsc::Receiver<Request>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let frames = read_multipart(&mut stream).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_empty());
        tx.send(Request::from_json(&frames[1]).unwrap()).unwrap();

        let reply = [Bytes::new(), Bytes::from(response.to_json().unwrap())];
        write_multipart(&mut stream, &reply).unwrap();
    });

    (addr, rx)
}

fn ctl(addr: &str, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_hid-broker-ctl"))
        .args(args)
        .arg("--endpoint")
        .arg(addr)
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_list_prints_devices() {
    let (addr, requests) = serve_once(Response::with_devices(vec![
        "0x3434:0x0321".to_string(),
        "0x3434:0x0340".to_string(),
    ]));

    let output = ctl(&addr, &["list"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "0x3434:0x0321\n0x3434:0x0340");
    assert_eq!(requests.recv().unwrap(), Request::List);
}

#[test]
fn test_write_read_prints_reply_hex() {
    let (addr, requests) = serve_once(Response::with_device_message(vec![1, 0, 0xFF]));

    let output = ctl(
        &addr,
        &["write-read", "--device", "0x3434:0x0321", "--subsystem", "1", "--data", "00"],
    );
    assert!(output.status.success());
    assert_eq!(stdout(&output), "01 00 ff");
    assert_eq!(
        requests.recv().unwrap(),
        Request::WriteRead {
            device_id: Some(DeviceIdentity::new(0x3434, 0x0321)),
            subsystem: Some(1),
            message: Some(vec![0]),
        }
    );
}

#[test]
fn test_add_with_pin() {
    let (addr, requests) = serve_once(Response::ack());

    let output = ctl(&addr, &["add", "-d", "3434:0321", "--pin", "1234"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "OK");
    assert_eq!(
        requests.recv().unwrap(),
        Request::AddDevice {
            device_id: Some(DeviceIdentity::new(0x3434, 0x0321)),
            management_pin: Some("1234".to_string()),
        }
    );
}

#[test]
fn test_error_reply_exits_nonzero() {
    let (addr, _requests) = serve_once(Response::error("invalid management pin"));

    let output = ctl(&addr, &["remove", "-d", "3434:0321", "--pin", "0"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid management pin"));
}

#[test]
fn test_unreachable_broker_fails() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    };

    let output = ctl(&addr, &["list"]);
    assert!(!output.status.success());
}
