//! Integration tests for encrypted connections

mod common;

use std::io::Write;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use common::{count, logged, manager, spin_until, Log, Recorder};
use sockmux::config::TlsConfig;
use sockmux::{
    ConnType, ConnectOptions, Connection, ConnectionManager, ListenOptions, PollStatus, SocketError,
};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

fn server_tls() -> TlsConfig {
    TlsConfig {
        pem_file: Some(fixture("server.pem")),
        ..TlsConfig::default()
    }
}

fn tls_listener(manager: &mut ConnectionManager<Recorder>, log: &Log) -> u16 {
    let id = manager
        .listen(
            ListenOptions::new(0, "secure").bind_host("127.0.0.1").tls(server_tls()),
            Connection::new(Recorder::new(log, "listener").echo()),
        )
        .unwrap();
    manager.get(id).unwrap().socket().port()
}

#[test]
fn test_tls_round_trip_in_one_loop() {
    let log = Log::default();
    let mut manager = manager();
    let port = tls_listener(&mut manager, &log);

    let mut client = Connection::new(Recorder::new(&log, "client").greeting("hello over tls"));
    client.socket_mut().enable_line_mode(true);
    let id = manager
        .connect(
            ConnectOptions::new("127.0.0.1", port, "client").tls(TlsConfig::default()),
            client,
        )
        .unwrap();

    spin_until(&mut manager, |_| logged(&log, "client line:hello over tls"));
    assert!(logged(&log, "peer line:hello over tls"));

    let client = manager.get(id).unwrap();
    assert!(client.socket().is_tls());
    assert!(client.socket().tls_established());
    assert!(client.socket().protocol_version().is_some());

    let peer = manager
        .iter()
        .find(|c| c.socket().conn_type() == ConnType::Inbound)
        .unwrap();
    assert!(peer.socket().tls_accepted());
    assert_eq!(peer.socket().parent_name(), "secure");
}

#[test]
fn test_tls13_client_with_client_certificate() {
    let log = Log::default();
    let mut manager = manager();
    let port = tls_listener(&mut manager, &log);

    let mut client = Connection::new(Recorder::new(&log, "client").greeting("PING"));
    client.socket_mut().enable_line_mode(true);
    let tls = TlsConfig {
        pem_file: Some(fixture("client.pem")),
        method: sockmux::connection::TlsMethod::Tls13,
        ..TlsConfig::default()
    };
    manager
        .connect(ConnectOptions::new("127.0.0.1", port, "client").tls(tls), client)
        .unwrap();

    spin_until(&mut manager, |_| logged(&log, "client line:PONG"));
    // Both ends closed: the peer after answering, the client once the peer is gone
    spin_until(&mut manager, |m| m.len() == 1);
}

#[test]
fn test_plaintext_peer_fails_handshake() {
    let log = Log::default();
    let mut manager = manager();
    let port = tls_listener(&mut manager, &log);

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client.write_all(b"this is not a client hello\r\n\r\n").unwrap();

    spin_until(&mut manager, |m| logged(&log, "listener accepted") && m.len() == 1);
    assert!(!logged(&log, "peer line:this is not a client hello"));
}

#[test]
fn test_tls_listener_requires_credentials() {
    let log = Log::default();
    let mut manager = manager();
    let result = manager.listen(
        ListenOptions::new(0, "secure")
            .bind_host("127.0.0.1")
            .tls(TlsConfig::default()),
        Connection::new(Recorder::new(&log, "listener")),
    );
    assert!(matches!(result, Err(SocketError::Credentials { .. })));
    assert!(manager.is_empty());
}

#[test]
fn test_tls_writes_are_shaped_per_window() {
    let log = Log::default();
    let mut manager = manager();
    let port = tls_listener(&mut manager, &log);

    let mut client = Connection::new(Recorder::new(&log, "client"));
    // Two five-byte lines per second
    client.socket_mut().set_rate(10, 1000);
    let id = manager
        .connect(
            ConnectOptions::new("127.0.0.1", port, "client").tls(TlsConfig::default()),
            client,
        )
        .unwrap();
    let start = Instant::now();
    let socket = manager.get_mut(id).unwrap().socket_mut();
    for line in ["ab1", "ab2", "ab3", "ab4"] {
        socket.write_line(line).unwrap();
    }

    spin_until(&mut manager, |_| logged(&log, "peer line:ab2"));
    let hold = Instant::now() + Duration::from_millis(300);
    while Instant::now() < hold {
        manager.loop_once();
    }
    assert!(!logged(&log, "peer line:ab3"));

    spin_until(&mut manager, |_| logged(&log, "peer line:ab4"));
    assert!(start.elapsed() >= Duration::from_millis(900));
    let lines: Vec<_> = log
        .borrow()
        .iter()
        .filter(|e| e.starts_with("peer line:"))
        .cloned()
        .collect();
    assert_eq!(
        lines,
        vec!["peer line:ab1", "peer line:ab2", "peer line:ab3", "peer line:ab4"]
    );
}

#[test]
fn test_decrypted_data_left_in_session_is_delivered() {
    let log = Log::default();
    let mut manager = manager();
    let id = manager
        .listen(
            ListenOptions::new(0, "secure").bind_host("127.0.0.1").tls(server_tls()),
            Connection::new(Recorder::new(&log, "listener")),
        )
        .unwrap();
    let port = manager.get(id).unwrap().socket().port();

    // One record holding more plaintext than a single read takes
    let batch: Vec<String> = (1..=1200).map(|n| format!("line-{:04}", n)).collect();
    let greeting: &'static str = Box::leak(batch.join("\r\n").into_boxed_str());
    manager
        .connect(
            ConnectOptions::new("127.0.0.1", port, "client").tls(TlsConfig::default()),
            Connection::new(Recorder::new(&log, "client").greeting(greeting)),
        )
        .unwrap();

    spin_until(&mut manager, |_| logged(&log, "peer line:line-1200"));
    let received = log
        .borrow()
        .iter()
        .filter(|e| e.starts_with("peer line:line-"))
        .count();
    assert_eq!(received, 1200);
    assert_eq!(count(&log, "peer line:line-0001"), 1);
}

#[test]
fn test_handshake_traffic_is_not_reported_as_readiness() {
    let log = Log::default();
    let mut manager = manager();
    let port = tls_listener(&mut manager, &log);

    let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    spin_until(&mut manager, |m| m.len() == 2);
    for _ in 0..3 {
        manager.loop_once();
    }

    manager.set_select_timeout(Duration::from_secs(2));
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        let mut client = client;
        // First byte of a handshake record; the rest never comes
        client.write_all(&[0x16]).unwrap();
        client
    });

    let start = Instant::now();
    assert_eq!(manager.loop_once(), PollStatus::Timeout);
    assert!(start.elapsed() < Duration::from_millis(1500));
    assert_eq!(manager.last_status(), PollStatus::Timeout);
    let _client = writer.join().unwrap();
    assert_eq!(manager.len(), 2);
}
