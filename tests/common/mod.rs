//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use sockmux::{Connection, ConnectionHandler, ConnectionManager, Context};

pub type Log = Rc<RefCell<Vec<String>>>;

/// Records every hook into a shared log. Echo peers answer `PING` with
/// `PONG` and close, and echo any other line back.
#[derive(Default, Clone)]
pub struct Recorder {
    pub log: Log,
    pub label: &'static str,
    pub echo: bool,
    pub reject: bool,
    /// Line written once the connection is up
    pub greeting: Option<&'static str>,
}

impl Recorder {
    pub fn new(log: &Log, label: &'static str) -> Self {
        Self {
            log: Rc::clone(log),
            label,
            ..Self::default()
        }
    }

    pub fn echo(mut self) -> Self {
        self.echo = true;
        self
    }

    pub fn reject(mut self) -> Self {
        self.reject = true;
        self
    }

    pub fn greeting(mut self, line: &'static str) -> Self {
        self.greeting = Some(line);
        self
    }

    fn record(&self, event: impl AsRef<str>) {
        self.log.borrow_mut().push(format!("{} {}", self.label, event.as_ref()));
    }
}

impl ConnectionHandler for Recorder {
    fn connected(&mut self, ctx: &mut Context<'_, Self>) {
        self.record("connected");
        if let Some(line) = self.greeting {
            ctx.write_line(line).unwrap();
        }
    }

    fn disconnected(&mut self, _ctx: &mut Context<'_, Self>) {
        self.record("disconnected");
    }

    fn timeout(&mut self, _ctx: &mut Context<'_, Self>) {
        self.record("timeout");
    }

    fn sock_error(&mut self, _ctx: &mut Context<'_, Self>) {
        self.record("error");
    }

    fn read_line(&mut self, ctx: &mut Context<'_, Self>, line: &[u8]) {
        let text = String::from_utf8_lossy(line).trim_end().to_string();
        self.record(format!("line:{}", text));
        if !self.echo {
            return;
        }
        if text == "PING" {
            ctx.write_line("PONG").unwrap();
            ctx.close();
        } else {
            ctx.write_line(&text).unwrap();
        }
    }

    fn reached_max_buffer(&mut self, ctx: &mut Context<'_, Self>) {
        self.record("overflow");
        ctx.read_buffer_mut().clear();
    }

    fn connection_from(&mut self, _ctx: &mut Context<'_, Self>, _host: &str, _port: u16) -> bool {
        self.record(if self.reject { "rejected" } else { "accepted" });
        !self.reject
    }

    fn connection_refused(&mut self, _ctx: &mut Context<'_, Self>) {
        self.record("refused");
    }

    fn spawn(&mut self, _host: &str, _port: u16) -> Option<Connection<Self>> {
        let mut peer = Connection::new(Recorder {
            log: Rc::clone(&self.log),
            label: "peer",
            echo: self.echo,
            reject: false,
            greeting: None,
        });
        peer.socket_mut().enable_line_mode(true);
        Some(peer)
    }
}

/// A manager with short waits so tests spin quickly
pub fn manager() -> ConnectionManager<Recorder> {
    let mut manager = ConnectionManager::new().unwrap();
    manager.set_select_timeout(Duration::from_millis(10));
    manager
}

/// Run the loop until `done` holds, failing after five seconds
pub fn spin_until<H, F>(manager: &mut ConnectionManager<H>, mut done: F)
where
    H: ConnectionHandler + Default,
    F: FnMut(&ConnectionManager<H>) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(manager) {
        assert!(Instant::now() < deadline, "condition not reached in time");
        manager.loop_once();
    }
}

pub fn logged(log: &Log, event: &str) -> bool {
    log.borrow().iter().any(|e| e == event)
}

pub fn count(log: &Log, event: &str) -> usize {
    log.borrow().iter().filter(|e| *e == event).count()
}
