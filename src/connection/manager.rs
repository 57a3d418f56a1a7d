//! Connection Manager Implementation
//!
//! Owns every connection of one handler type and drives them from a single
//! readiness loop. Each call to [`ConnectionManager::loop_once`] runs
//! housekeeping, accepts pending peers, polls, flushes writable
//! connections, reads readable ones, checks idle timeouts and finally runs
//! the manager's own scheduled jobs.

use std::collections::HashSet;
#[cfg(unix)]
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, trace, warn};

use crate::clock;
use crate::config::{ManagerConfig, TlsConfig};
use crate::connection::conn::Connection;
use crate::connection::handler::ConnectionHandler;
use crate::connection::transport::slot_of;
use crate::connection::types::{ConnId, ConnType, PollStatus, ReadResult, DEFAULT_TIMEOUT_SECS, READ_BLOCK_SIZE};
use crate::cron::{Cron, CronList};
use crate::error::SocketResult;

/// Token reserved for the cross-thread waker
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Wait used when decrypted data is already waiting; only catches
/// descriptors that become ready at the same moment
const SHORT_WAIT: Duration = Duration::from_millis(1);

const EVENT_CAPACITY: usize = 1024;

/// Readiness of one poll that will be dispatched to connections
#[derive(Debug, Default)]
struct Dispatch {
    readable: HashSet<usize>,
    writable: HashSet<usize>,
    woken: bool,
}

impl Dispatch {
    fn is_idle(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty()
    }
}

/// Parameters of an outbound connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub name: String,
    /// Idle timeout in seconds; zero disables it
    pub timeout_secs: u32,
    pub tls: Option<TlsConfig>,
    pub bind_host: Option<String>,
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, port: u16, name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            name: name.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            tls: None,
            bind_host: None,
        }
    }

    pub fn timeout(mut self, secs: u32) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Encrypt the connection with these settings
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = Some(host.into());
        self
    }
}

/// Parameters of a listening socket
#[derive(Debug, Clone)]
pub struct ListenOptions {
    pub port: u16,
    pub name: String,
    pub bind_host: Option<String>,
    pub tls: Option<TlsConfig>,
    pub backlog: u32,
}

impl ListenOptions {
    pub fn new(port: u16, name: impl Into<String>) -> Self {
        Self {
            port,
            name: name.into(),
            bind_host: None,
            tls: None,
            backlog: 128,
        }
    }

    pub fn bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = Some(host.into());
        self
    }

    /// Encrypt accepted peers with these settings
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }
}

/// Owns connections and multiplexes them over one poller
pub struct ConnectionManager<H: ConnectionHandler> {
    connections: Vec<Connection<H>>,
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    next_id: usize,
    destroy_queue: Vec<ConnId>,
    crons: CronList<ConnectionManager<H>>,
    status: PollStatus,
    select_timeout: Duration,
    timeout_check_interval: Duration,
    last_timeout_check: u64,
    read_buf: Vec<u8>,
}

impl<H: ConnectionHandler + Default> ConnectionManager<H> {
    /// Create a manager with default timings
    pub fn new() -> SocketResult<Self> {
        Self::with_config(&ManagerConfig::default())
    }

    /// Create a manager using the configured poll wait and timeout cadence
    pub fn with_config(config: &ManagerConfig) -> SocketResult<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            connections: Vec::new(),
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            waker,
            next_id: 1,
            destroy_queue: Vec::new(),
            crons: CronList::new(),
            status: PollStatus::Ok,
            select_timeout: config.select_timeout,
            timeout_check_interval: config.timeout_check_interval,
            last_timeout_check: clock::now_millis(),
            read_buf: vec![0; READ_BLOCK_SIZE],
        })
    }

    /// Connect `conn` as described by `options` and take ownership of it.
    ///
    /// On failure the connection is dropped; a refusal has already fired
    /// its refused hook.
    pub fn connect(&mut self, options: ConnectOptions, mut conn: Connection<H>) -> SocketResult<ConnId> {
        let socket = conn.socket_mut();
        socket.set_host(options.host.clone());
        socket.set_port(options.port);
        socket.set_timeout(options.timeout_secs);
        socket.set_blocking(false);

        let bind_host = options.bind_host.as_deref();
        match options.tls {
            Some(tls) => {
                socket.set_tls_config(TlsConfig { enabled: true, ..tls });
                conn.connect_tls(bind_host)
            }
            None => conn.connect(bind_host),
        }
        .map_err(|e| {
            warn!("Connection {} to {}:{} failed: {}", options.name, options.host, options.port, e);
            e
        })?;

        self.add_sock(conn, options.name)
    }

    /// Listen as described by `options` with `conn` as the listener
    pub fn listen(&mut self, options: ListenOptions, mut conn: Connection<H>) -> SocketResult<ConnId> {
        let socket = conn.socket_mut();
        socket.set_blocking(false);
        if let Some(tls) = options.tls {
            socket.set_tls_config(TlsConfig { enabled: true, ..tls });
        }

        conn.listen(options.port, options.backlog, options.bind_host.as_deref())
            .map_err(|e| {
                warn!("Unable to listen for {} on port {}: {}", options.name, options.port, e);
                e
            })?;

        self.add_sock(conn, options.name)
    }

    /// Listen on every local address
    pub fn listen_all(&mut self, options: ListenOptions, conn: Connection<H>) -> SocketResult<ConnId> {
        self.listen(
            ListenOptions {
                bind_host: None,
                ..options
            },
            conn,
        )
    }

    #[cfg(unix)]
    pub fn connect_unix(&mut self, path: &Path, name: impl Into<String>, mut conn: Connection<H>) -> SocketResult<ConnId> {
        conn.socket_mut().set_blocking(false);
        conn.connect_unix(path)?;
        self.add_sock(conn, name)
    }

    #[cfg(unix)]
    pub fn listen_unix(&mut self, path: &Path, name: impl Into<String>, mut conn: Connection<H>) -> SocketResult<ConnId> {
        conn.socket_mut().set_blocking(false);
        conn.listen_unix(path)?;
        self.add_sock(conn, name)
    }

    /// Take ownership of an already set up connection under `name`
    pub fn add_sock(&mut self, mut conn: Connection<H>, name: impl Into<String>) -> SocketResult<ConnId> {
        let id = ConnId(self.next_id);
        self.next_id += 1;

        let interest = match conn.socket().conn_type() {
            ConnType::Listener => Interest::READABLE,
            _ => Interest::READABLE | Interest::WRITABLE,
        };
        conn.socket_mut().register(self.poll.registry(), id.get(), interest)?;

        conn.socket_mut().set_name(name);
        conn.id = Some(id);
        debug!("Added connection {} ({}) as {}", conn.name(), conn.socket().conn_type(), id);
        self.connections.push(conn);
        Ok(id)
    }

    /// Run one iteration of the readiness loop and report its poll status
    pub fn loop_once(&mut self) -> PollStatus {
        self.housekeeping();

        for id in std::mem::take(&mut self.destroy_queue) {
            self.del_sock(id);
        }

        self.prepare_poll();

        let ready_pending = self.pending_reads();
        let wait = if ready_pending.is_empty() {
            self.select_timeout
        } else {
            SHORT_WAIT
        };

        let polled = match self.poll.poll(&mut self.events, Some(wait)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Err(PollStatus::Again),
            Err(e) => {
                warn!("Select error: {}", e);
                Err(PollStatus::Error)
            }
        };

        let mut seen = HashSet::new();
        self.status = match polled {
            Err(status) if ready_pending.is_empty() => status,
            polled => {
                let dispatch = self.collect_events(polled.is_ok());
                if dispatch.is_idle() && ready_pending.is_empty() {
                    if dispatch.woken {
                        PollStatus::Ok
                    } else {
                        PollStatus::Timeout
                    }
                } else {
                    let flushed = self.process_writes(&dispatch.writable);

                    let mut ready = ready_pending;
                    for conn in &self.connections {
                        let Some(id) = conn.id else { continue };
                        if (dispatch.readable.contains(&id.get()) || flushed.contains(&id)) && !ready.contains(&id) {
                            ready.push(id);
                        }
                    }
                    self.process_reads(&ready, &mut seen);
                    PollStatus::Ok
                }
            }
        };

        self.check_timeouts(&seen);
        self.run_crons();
        self.status
    }

    /// Loop until `stop` is set. Setting it from another thread should be
    /// followed by a [`waker`](Self::waker) wake-up.
    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::SeqCst) {
            if self.loop_once() == PollStatus::Error {
                // Avoid spinning on a broken poller
                std::thread::sleep(self.select_timeout);
            }
        }
        info!("Connection manager stopped with {} connections", self.connections.len());
    }

    /// Step 1: collect closed connections, run each live connection's jobs
    fn housekeeping(&mut self) {
        let now = clock::now_millis();
        for conn in self.connections.iter_mut() {
            let Some(id) = conn.id else { continue };
            if conn.socket().is_closed() {
                queue_destroy(&mut self.destroy_queue, id);
            } else {
                conn.run_crons(now);
            }
        }
    }

    /// Step 3: accept on listeners, retry pending accepts and decide the
    /// interest each connection is polled with this iteration
    fn prepare_poll(&mut self) {
        let mut index = 0;
        while index < self.connections.len() {
            let registry = self.poll.registry();
            let conn = &mut self.connections[index];
            let Some(id) = conn.id else {
                index += 1;
                continue;
            };

            let (polled, armed) = if conn.socket().conn_type() == ConnType::Listener {
                (None, Interest::READABLE)
            } else {
                classify(conn)
            };
            conn.polled = polled;
            if let Err(e) = conn.socket_mut().reregister(registry, id.get(), armed) {
                warn!("Unable to arm {} ({}): {}", conn.name(), id, e);
                conn.close();
                conn.polled = None;
            }

            if conn.socket().conn_type() == ConnType::Listener {
                if let Some((peer, name)) = self.accept_on(index) {
                    if let Err(e) = self.add_sock(peer, name) {
                        warn!("Unable to register accepted connection: {}", e);
                    }
                }
            }
            index += 1;
        }
    }

    /// Accept one peer on the listener at `index` and build its connection
    fn accept_on(&mut self, index: usize) -> Option<(Connection<H>, String)> {
        let listener = &mut self.connections[index];
        let accepted = match listener.accept() {
            Ok(Some(accepted)) => accepted,
            Ok(None) => return None,
            Err(e) => {
                warn!("Accept failed on {}: {}", listener.name(), e);
                return None;
            }
        };

        let host = accepted.host.clone();
        let port = accepted.port;
        let mut peer = listener
            .spawn_peer(&host, port)
            .unwrap_or_else(|| Connection::new(H::default()));

        let socket = peer.socket_mut();
        socket.adopt(accepted);
        socket.inherit_from(listener.socket());
        if socket.is_tls() {
            if let Err(e) = socket.accept_tls() {
                warn!("Discarding connection from {}:{}: {}", host, port, e);
                return None;
            }
        }
        socket.set_parent_name(listener.name());

        let name = match port {
            0 => format!("unix:{}", host),
            _ => format!("{}:{}", host, port),
        };
        info!("Accepted connection {} on {}", name, listener.name());
        Some((peer, name))
    }

    /// Step 4: encrypted connections holding decrypted data the OS poll
    /// cannot see
    fn pending_reads(&mut self) -> Vec<ConnId> {
        let mut ready = Vec::new();
        for conn in self.connections.iter_mut() {
            let Some(id) = conn.id else { continue };
            if conn.polled.is_none() {
                continue;
            }
            let socket = conn.socket_mut();
            if socket.is_tls() && socket.pending() > 0 {
                trace!("{} has decrypted data pending", id);
                ready.push(id);
            }
        }
        ready
    }

    /// Split poll events into readable and writable slots, honouring the
    /// interest each connection was polled with. Wake-ups of listeners and
    /// of connections polled for nothing are dropped here.
    fn collect_events(&self, polled_ok: bool) -> Dispatch {
        let mut dispatch = Dispatch::default();
        if !polled_ok {
            return dispatch;
        }

        let mut readable = HashSet::new();
        let mut writable = HashSet::new();
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                trace!("Woken up");
                dispatch.woken = true;
                continue;
            }
            let slot = slot_of(event.token());
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                readable.insert(slot);
            }
            if event.is_writable() || event.is_write_closed() || event.is_error() {
                writable.insert(slot);
            }
        }

        for conn in &self.connections {
            let (Some(id), Some(interest)) = (conn.id, conn.polled) else { continue };
            let slot = id.get();
            if readable.contains(&slot) {
                dispatch.readable.insert(slot);
            }
            if interest.is_writable() && writable.contains(&slot) {
                dispatch.writable.insert(slot);
            }
        }
        dispatch
    }

    /// Step 7: first writability means connected; then flush pending
    /// output. Returns the connections that were handled successfully.
    fn process_writes(&mut self, writable: &HashSet<usize>) -> Vec<ConnId> {
        let mut handled = Vec::new();
        for conn in self.connections.iter_mut() {
            let Some(id) = conn.id else { continue };
            if !writable.contains(&id.get()) {
                continue;
            }

            if !conn.socket().has_write() {
                match conn.socket().take_error() {
                    Ok(None) => {}
                    Ok(Some(e)) | Err(e) => {
                        if e.kind() == std::io::ErrorKind::ConnectionRefused {
                            info!("Connection {} refused", conn.name());
                            conn.fire_connection_refused();
                        } else {
                            warn!("Connection {} failed: {}", conn.name(), e);
                            conn.fire_sock_error();
                        }
                        queue_destroy(&mut self.destroy_queue, id);
                        continue;
                    }
                }
                conn.socket_mut().set_has_write(true);
                conn.fire_connected();
            }

            if !conn.socket().send_buffer().is_empty() || conn.socket().session_wants_write() {
                if let Err(e) = conn.write(&[]) {
                    debug!("Write to {} failed: {}", conn.name(), e);
                    queue_destroy(&mut self.destroy_queue, id);
                    continue;
                }
            }
            handled.push(id);
        }
        handled
    }

    /// Step 8: one read per ready connection, dispatched by outcome
    fn process_reads(&mut self, ready: &[ConnId], seen: &mut HashSet<ConnId>) {
        for &id in ready {
            if self.destroy_queue.contains(&id) {
                continue;
            }
            let Some(index) = self.index_of(id) else { continue };
            seen.insert(id);

            let conn = &mut self.connections[index];
            let socket = conn.socket_mut();
            socket.reset_timer();

            let pending = if socket.is_tls() { socket.pending() } else { 0 };
            let len = if pending > 0 { pending } else { READ_BLOCK_SIZE };
            if self.read_buf.len() < len {
                self.read_buf.resize(len, 0);
            }

            match socket.read(&mut self.read_buf[..len]) {
                ReadResult::Data(n) => {
                    let data = &self.read_buf[..n];
                    conn.push_buffer(data);
                    conn.fire_read_data(data);
                }
                ReadResult::Eof => {
                    debug!("Connection {} closed by peer", conn.name());
                    self.del_sock(id);
                }
                ReadResult::Error => {
                    conn.fire_sock_error();
                    self.del_sock(id);
                }
                ReadResult::Again => {}
                ReadResult::Refused => {
                    conn.fire_connection_refused();
                    self.del_sock(id);
                }
            }
        }
    }

    /// Step 9: advance idle counters of connections that saw no traffic
    fn check_timeouts(&mut self, seen: &HashSet<ConnId>) {
        if clock::elapsed_since(self.last_timeout_check) <= self.timeout_check_interval.as_millis() as u64 {
            return;
        }
        self.last_timeout_check = clock::now_millis();

        for conn in self.connections.iter_mut() {
            let Some(id) = conn.id else { continue };
            if conn.socket().conn_type() == ConnType::Listener || seen.contains(&id) {
                continue;
            }
            if conn.check_timeout() {
                info!("Connection {} timed out", conn.name());
                queue_destroy(&mut self.destroy_queue, id);
            }
        }
    }

    /// Step 10: manager level jobs. Jobs added while running are kept.
    fn run_crons(&mut self) {
        let mut crons = self.crons.take_for_run();
        crons.run(self, clock::now_millis());
        self.crons.restore(crons);
    }
}

impl<H: ConnectionHandler> ConnectionManager<H> {
    /// Remove a connection now: fire its disconnected hook, then release it
    pub fn del_sock(&mut self, id: ConnId) -> bool {
        let Some(index) = self.index_of(id) else {
            warn!("Could not find connection {}", id);
            return false;
        };
        self.destroy_queue.retain(|queued| *queued != id);

        let mut conn = self.connections.remove(index);
        conn.fire_disconnected();
        if let Err(e) = conn.socket_mut().deregister(self.poll.registry()) {
            debug!("Unable to deregister {}: {}", conn.name(), e);
        }
        debug!("Removed connection {} ({})", conn.name(), id);
        true
    }

    fn index_of(&self, id: ConnId) -> Option<usize> {
        self.connections.iter().position(|c| c.id == Some(id))
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection<H>> {
        self.index_of(id).map(|i| &self.connections[i])
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection<H>> {
        self.index_of(id).map(|i| &mut self.connections[i])
    }

    /// First connection called `name`, in insertion order
    pub fn find_by_name(&self, name: &str) -> Option<&Connection<H>> {
        self.connections.iter().find(|c| c.name() == name)
    }

    pub fn find_by_name_mut(&mut self, name: &str) -> Option<&mut Connection<H>> {
        self.connections.iter_mut().find(|c| c.name() == name)
    }

    /// Every connection whose remote host is `host`
    pub fn find_by_remote_host(&self, host: &str) -> Vec<&Connection<H>> {
        self.connections
            .iter()
            .filter(|c| c.socket().host() == host)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection<H>> {
        self.connections.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection<H>> {
        self.connections.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Any owned connection still holds a descriptor
    pub fn has_fds(&self) -> bool {
        self.connections.iter().any(|c| c.socket().is_open())
    }

    /// Mark a connection closed; it is removed on the next iteration
    pub fn close(&mut self, id: ConnId) -> bool {
        match self.get_mut(id) {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&mut self) {
        for conn in self.connections.iter_mut() {
            conn.close();
        }
    }

    /// Attach a manager level job
    pub fn add_cron(&mut self, cron: Cron<ConnectionManager<H>>) {
        self.crons.add(cron);
    }

    pub fn crons(&self) -> &CronList<ConnectionManager<H>> {
        &self.crons
    }

    pub fn crons_mut(&mut self) -> &mut CronList<ConnectionManager<H>> {
        &mut self.crons
    }

    pub fn select_timeout(&self) -> Duration {
        self.select_timeout
    }

    /// Longest wait of one readiness poll
    pub fn set_select_timeout(&mut self, timeout: Duration) {
        self.select_timeout = timeout;
    }

    pub fn set_timeout_check_interval(&mut self, interval: Duration) {
        self.timeout_check_interval = interval;
    }

    /// Poll status of the most recent iteration
    pub fn last_status(&self) -> PollStatus {
        self.status
    }

    /// Handle for interrupting a poll from another thread
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }
}

impl<H: ConnectionHandler> Drop for ConnectionManager<H> {
    fn drop(&mut self) {
        let registry = self.poll.registry();
        for conn in self.connections.iter_mut() {
            let _ = conn.socket_mut().deregister(registry);
        }
    }
}

/// Decide how a non-listening connection takes part in this poll.
///
/// Returns the interest it is polled with (`None` keeps it out of the
/// dispatch) and the interest armed on the poller.
fn classify<H: ConnectionHandler>(conn: &mut Connection<H>) -> (Option<Interest>, Interest) {
    let socket = conn.socket_mut();

    if socket.is_tls() && socket.conn_type() == ConnType::Inbound && !socket.tls_accepted() {
        if let Err(e) = socket.accept_tls() {
            debug!("TLS accept on {} failed: {}", socket.name(), e);
            socket.close();
        }
        // Armed only so handshake traffic wakes the loop
        return (None, Interest::READABLE);
    }

    if socket.has_write() && socket.send_buffer().is_empty() && !socket.session_wants_write() {
        return (Some(Interest::READABLE), Interest::READABLE);
    }

    if socket.is_tls() && !socket.tls_established() && !socket.send_buffer().is_empty() {
        if conn.write(&[]).is_err() {
            conn.close();
        }
        return (Some(Interest::READABLE), Interest::READABLE);
    }

    let both = Interest::READABLE | Interest::WRITABLE;
    (Some(both), both)
}

fn queue_destroy(queue: &mut Vec<ConnId>, id: ConnId) {
    if !queue.contains(&id) {
        queue.push(id);
    }
}
