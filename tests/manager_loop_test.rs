//! Integration tests for the connection manager's readiness loop

mod common;

use std::cell::Cell;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use common::{count, logged, manager, spin_until, Log, Recorder};
use sockmux::{
    ConnType, ConnectOptions, Connection, ConnectionManager, Cron, ListenOptions, PollStatus,
    ReadResult, Socket, SocketError,
};

fn echo_listener(manager: &mut ConnectionManager<Recorder>, log: &Log) -> u16 {
    let id = manager
        .listen(
            ListenOptions::new(0, "echo").bind_host("127.0.0.1"),
            Connection::new(Recorder::new(log, "listener").echo()),
        )
        .unwrap();
    manager.get(id).unwrap().socket().port()
}

/// Port with nothing listening on it
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn test_ping_pong_then_disconnect_next_iteration() {
    let log = Log::default();
    let mut manager = manager();
    let port = echo_listener(&mut manager, &log);

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client.write_all(b"PING\n").unwrap();

    spin_until(&mut manager, |_| logged(&log, "peer line:PING"));
    assert!(logged(&log, "listener accepted"));

    // Closed from the hook but still owned until the next pass
    assert_eq!(manager.len(), 2);
    let peer = manager
        .iter()
        .find(|c| c.socket().conn_type() == ConnType::Inbound)
        .unwrap();
    assert!(peer.socket().is_closed());
    assert_eq!(peer.socket().parent_name(), "echo");
    assert!(peer.name().starts_with("127.0.0.1:"));
    assert!(!logged(&log, "peer disconnected"));

    manager.loop_once();
    assert_eq!(manager.len(), 1);
    assert_eq!(count(&log, "peer disconnected"), 1);

    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut reply = String::new();
    client.read_to_string(&mut reply).unwrap();
    assert_eq!(reply, "PONG\r\n");
}

#[test]
fn test_lines_split_across_packets_are_echoed_in_order() {
    let log = Log::default();
    let mut manager = manager();
    let port = echo_listener(&mut manager, &log);

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client.write_all(b"hel").unwrap();
    spin_until(&mut manager, |m| m.len() == 2);
    for _ in 0..3 {
        manager.loop_once();
    }
    client.write_all(b"lo\nworld\n").unwrap();

    spin_until(&mut manager, |_| logged(&log, "peer line:world"));
    let lines: Vec<String> = log
        .borrow()
        .iter()
        .filter(|e| e.starts_with("peer line:"))
        .cloned()
        .collect();
    assert_eq!(lines, vec!["peer line:hello", "peer line:world"]);

    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut reply = [0u8; 14];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello\r\nworld\r\n");
}

#[test]
fn test_outbound_and_inbound_share_one_loop() {
    let log = Log::default();
    let mut manager = manager();
    let port = echo_listener(&mut manager, &log);

    let mut client = Connection::new(Recorder::new(&log, "client").greeting("HELLO"));
    client.socket_mut().enable_line_mode(true);
    let id = manager
        .connect(ConnectOptions::new("127.0.0.1", port, "client"), client)
        .unwrap();

    spin_until(&mut manager, |_| logged(&log, "client line:HELLO"));
    assert_eq!(count(&log, "client connected"), 1);
    assert!(logged(&log, "peer line:HELLO"));

    let client = manager.get(id).unwrap();
    assert_eq!(client.socket().conn_type(), ConnType::Outbound);
    assert!(client.socket().has_write());
    assert!(manager.find_by_name("client").is_some());
    assert!(manager.find_by_remote_host("127.0.0.1").len() >= 2);
}

#[test]
fn test_accept_policy_rejection_drops_peer() {
    let log = Log::default();
    let mut manager = manager();
    let id = manager
        .listen(
            ListenOptions::new(0, "picky").bind_host("127.0.0.1"),
            Connection::new(Recorder::new(&log, "listener").reject()),
        )
        .unwrap();
    let port = manager.get(id).unwrap().socket().port();

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    spin_until(&mut manager, |_| logged(&log, "listener rejected"));
    manager.loop_once();
    assert_eq!(manager.len(), 1);
    assert!(!logged(&log, "peer connected"));

    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 8];
    match client.read(&mut buf) {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected {} bytes from a rejected connection", n),
    }
}

#[test]
fn test_refused_connect_fires_refused_once() {
    let log = Log::default();
    let mut manager = manager();
    let port = closed_port();

    let result = manager.connect(
        ConnectOptions::new("127.0.0.1", port, "doomed"),
        Connection::new(Recorder::new(&log, "client")),
    );
    match result {
        Err(SocketError::Refused(_)) => assert!(manager.is_empty()),
        Ok(_) => spin_until(&mut manager, |m| m.is_empty()),
        Err(e) => panic!("unexpected connect error: {}", e),
    }

    assert_eq!(count(&log, "client refused"), 1);
    assert!(!logged(&log, "client connected"));
}

#[test]
fn test_idle_connection_times_out() {
    let log = Log::default();
    let mut manager = manager();
    manager.set_timeout_check_interval(Duration::from_millis(10));

    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();
    manager
        .connect(
            ConnectOptions::new("127.0.0.1", port, "idle").timeout(1),
            Connection::new(Recorder::new(&log, "client")),
        )
        .unwrap();
    let (_peer, _) = server.accept().unwrap();

    spin_until(&mut manager, |m| m.is_empty());
    assert_eq!(count(&log, "client timeout"), 1);
    assert_eq!(count(&log, "client disconnected"), 1);
    assert!(logged(&log, "client connected"));
}

#[test]
fn test_zero_timeout_never_expires() {
    let log = Log::default();
    let mut manager = manager();
    manager.set_timeout_check_interval(Duration::from_millis(1));

    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();
    manager
        .connect(
            ConnectOptions::new("127.0.0.1", port, "patient").timeout(0),
            Connection::new(Recorder::new(&log, "client")),
        )
        .unwrap();
    let (_peer, _) = server.accept().unwrap();

    for _ in 0..20 {
        manager.loop_once();
    }
    assert_eq!(manager.len(), 1);
    assert!(!logged(&log, "client timeout"));
}

#[test]
fn test_connection_job_closes_its_connection() {
    let log = Log::default();
    let mut manager = manager();

    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();
    let mut conn = Connection::new(Recorder::new(&log, "client"));
    conn.add_cron(Cron::once(
        "hangup",
        Duration::from_millis(20),
        |c: &mut Connection<Recorder>| c.close(),
    ));
    manager
        .connect(ConnectOptions::new("127.0.0.1", port, "client").timeout(0), conn)
        .unwrap();
    let (_peer, _) = server.accept().unwrap();

    spin_until(&mut manager, |m| m.is_empty());
    assert_eq!(count(&log, "client disconnected"), 1);
}

#[test]
fn test_manager_jobs_run_and_may_schedule_more() {
    let mut manager = manager();
    let ticks = Rc::new(Cell::new(0u32));
    let child_ran = Rc::new(Cell::new(false));

    let counter = Rc::clone(&ticks);
    manager.add_cron(Cron::every(
        "tick",
        Duration::ZERO,
        move |_m: &mut ConnectionManager<Recorder>| counter.set(counter.get() + 1),
    ));
    let flag = Rc::clone(&child_ran);
    manager.add_cron(Cron::once(
        "spawner",
        Duration::ZERO,
        move |m: &mut ConnectionManager<Recorder>| {
            let flag = Rc::clone(&flag);
            m.add_cron(Cron::once("child", Duration::ZERO, move |_m: &mut ConnectionManager<Recorder>| {
                flag.set(true)
            }));
        },
    ));

    manager.loop_once();
    assert_eq!(ticks.get(), 1);
    assert!(!child_ran.get());
    assert_eq!(manager.crons().len(), 3);

    manager.loop_once();
    assert!(child_ran.get());
    assert_eq!(ticks.get(), 2);

    manager.loop_once();
    assert_eq!(manager.crons().len(), 1);
    assert!(manager.crons().find("tick").is_some());
}

#[test]
fn test_close_all_and_unknown_removal() {
    let log = Log::default();
    let mut manager = manager();
    let port = echo_listener(&mut manager, &log);
    let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    spin_until(&mut manager, |m| m.len() == 2);
    assert!(manager.has_fds());

    manager.close_all();
    manager.loop_once();
    assert!(manager.is_empty());
    assert!(!manager.has_fds());
    assert_eq!(count(&log, "peer disconnected"), 1);
    assert_eq!(count(&log, "listener disconnected"), 1);
}

#[test]
fn test_status_and_waker() {
    let mut manager = manager();
    assert_eq!(manager.loop_once(), PollStatus::Timeout);

    manager.waker().wake().unwrap();
    assert_eq!(manager.loop_once(), PollStatus::Ok);
    assert_eq!(manager.last_status(), PollStatus::Ok);
}

#[test]
fn test_del_sock_of_unknown_id_is_refused() {
    let log = Log::default();
    let mut manager = manager();
    let port = echo_listener(&mut manager, &log);
    let id = manager.find_by_name("echo").unwrap().id().unwrap();
    assert_eq!(manager.get(id).unwrap().socket().port(), port);

    assert!(manager.del_sock(id));
    assert!(!manager.del_sock(id));
    assert!(!manager.close(id));
    assert_eq!(count(&log, "listener disconnected"), 1);
}

#[test]
fn test_client_close_disconnects_peer() {
    let log = Log::default();
    let mut manager = manager();
    let id = manager
        .listen(
            ListenOptions::new(0, "quiet").bind_host("127.0.0.1"),
            Connection::new(Recorder::new(&log, "listener")),
        )
        .unwrap();
    let port = manager.get(id).unwrap().socket().port();

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client.write_all(b"PING\n").unwrap();
    spin_until(&mut manager, |_| logged(&log, "peer line:PING"));
    assert_eq!(count(&log, "peer line:PING"), 1);

    drop(client);
    spin_until(&mut manager, |_| logged(&log, "peer disconnected"));
    assert_eq!(manager.len(), 1);
    assert_eq!(count(&log, "peer disconnected"), 1);
    assert!(!logged(&log, "peer error"));
}

#[test]
fn test_manager_job_stops_sibling_job() {
    let mut manager = manager();
    let ticks = Rc::new(Cell::new(0u32));
    let stopped = Rc::new(Cell::new(false));

    let counter = Rc::clone(&ticks);
    manager.add_cron(Cron::every(
        "tick",
        Duration::ZERO,
        move |_m: &mut ConnectionManager<Recorder>| counter.set(counter.get() + 1),
    ));
    let flag = Rc::clone(&stopped);
    manager.add_cron(Cron::once(
        "stopper",
        Duration::ZERO,
        move |m: &mut ConnectionManager<Recorder>| flag.set(m.crons_mut().stop("tick")),
    ));

    for _ in 0..5 {
        manager.loop_once();
    }
    assert!(stopped.get());
    assert_eq!(ticks.get(), 1);
    assert!(manager.crons().is_empty());
}

#[test]
fn test_connection_job_stops_sibling_job() {
    let log = Log::default();
    let mut manager = manager();
    let ticks = Rc::new(Cell::new(0u32));

    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();
    let mut conn = Connection::new(Recorder::new(&log, "client"));
    let counter = Rc::clone(&ticks);
    conn.add_cron(Cron::every(
        "tick",
        Duration::ZERO,
        move |_c: &mut Connection<Recorder>| counter.set(counter.get() + 1),
    ));
    conn.add_cron(Cron::every(
        "stopper",
        Duration::ZERO,
        |c: &mut Connection<Recorder>| {
            if c.crons_mut().stop("tick") {
                c.crons_mut().stop("stopper");
            }
        },
    ));
    let id = manager
        .connect(ConnectOptions::new("127.0.0.1", port, "client").timeout(0), conn)
        .unwrap();
    let (_peer, _) = server.accept().unwrap();

    for _ in 0..5 {
        manager.loop_once();
    }
    assert_eq!(ticks.get(), 1);
    assert!(manager.get(id).unwrap().crons().is_empty());
}

#[test]
fn test_blocking_connect_reports_refusal() {
    let log = Log::default();
    let mut conn = Connection::new(Recorder::new(&log, "client"));
    let socket = conn.socket_mut();
    socket.set_host("127.0.0.1");
    socket.set_port(closed_port());
    socket.set_blocking(true);
    socket.set_timeout(5);

    assert!(matches!(conn.connect(None), Err(SocketError::Refused(_))));
    assert_eq!(count(&log, "client refused"), 1);
    assert!(!conn.socket().is_open());
}

#[test]
fn test_blocking_socket_waits_for_data() {
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();

    let mut socket = Socket::outbound("127.0.0.1", port);
    socket.set_blocking(true);
    socket.set_timeout(5);
    socket.connect(None).unwrap();
    let (mut peer, _) = server.accept().unwrap();

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        peer.write_all(b"hello\n").unwrap();
        peer
    });
    let mut buf = [0u8; 16];
    assert_eq!(socket.read(&mut buf), ReadResult::Data(6));
    assert_eq!(&buf[..6], b"hello\n");
    let mut peer = writer.join().unwrap();

    socket.write_line("bye").unwrap();
    let mut reply = [0u8; 5];
    peer.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"bye\r\n");

    // Nothing more arrives: the wait gives up after the idle timeout
    socket.set_timeout(1);
    assert_eq!(socket.read(&mut buf), ReadResult::Error);
}
