//! Connection Socket
//!
//! [`Socket`] is the transport half of a connection: descriptors, buffers,
//! the encrypted session, rate shaping and the idle counter. It never calls
//! application hooks itself; [`Connection`](super::Connection) pairs it with
//! a handler and fires them.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
#[cfg(unix)]
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use mio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use mio::net::{UnixListener, UnixStream};
#[cfg(unix)]
use mio::unix::pipe;
use mio::{Interest, Registry};
use rustls::pki_types::CertificateDer;
use rustls::{ProtocolVersion, ServerConfig};
use socket2::{Domain, Protocol, SockAddr, Socket as RawSocket, Type};
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::{SocketConfig, TlsConfig};
use crate::connection::resolve::resolve;
use crate::connection::shaper::WriteShaper;
use crate::connection::tls::{self, HandshakeStatus, SessionError, SessionRead, SessionWrite, TlsSession};
use crate::connection::transport::{Accepted, Transport};
use crate::connection::types::{
    ConnType, PollStatus, ReadResult, TlsMethod, DEFAULT_MAX_BUFFER_THRESHOLD, DEFAULT_TIMEOUT_SECS,
    LINE_TERMINATOR,
};
use crate::error::{SocketError, SocketResult, WriteError};

/// Attempts to bind the local address before an outbound connect
const BIND_ATTEMPTS: usize = 3;

/// Pause between bind attempts
const BIND_RETRY_PAUSE: Duration = Duration::from_millis(5);

/// One socket endpoint: outbound client, listener or accepted peer
pub struct Socket {
    transport: Option<Transport>,
    conn_type: ConnType,
    host: String,
    port: u16,
    name: String,
    parent_name: String,
    timeout_secs: u32,
    idle_count: u32,
    closed: bool,
    blocking: bool,
    has_write: bool,
    never_written: bool,
    line_mode: bool,
    read_buffer: BytesMut,
    send_buffer: BytesMut,
    /// Length of the front of `send_buffer` handed to the session and not
    /// yet fully accepted; retries must offer exactly these bytes
    pending_attempt: Option<usize>,
    max_buffer_threshold: usize,
    shaper: WriteShaper,
    tls: TlsConfig,
    server_ctx: Option<Arc<ServerConfig>>,
    session: Option<TlsSession>,
    tls_accepted: bool,
    tls_established: bool,
}

impl Default for Socket {
    fn default() -> Self {
        Self {
            transport: None,
            conn_type: ConnType::Outbound,
            host: String::new(),
            port: 0,
            name: String::new(),
            parent_name: String::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            idle_count: 0,
            closed: false,
            blocking: false,
            has_write: false,
            never_written: true,
            line_mode: false,
            read_buffer: BytesMut::new(),
            send_buffer: BytesMut::new(),
            pending_attempt: None,
            max_buffer_threshold: DEFAULT_MAX_BUFFER_THRESHOLD,
            shaper: WriteShaper::default(),
            tls: TlsConfig::default(),
            server_ctx: None,
            session: None,
            tls_accepted: false,
            tls_established: false,
        }
    }
}

impl Socket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Socket aimed at `host:port`, not yet connected
    pub fn outbound(host: impl Into<String>, port: u16) -> Self {
        let mut socket = Self::default();
        socket.host = host.into();
        socket.port = port;
        socket
    }

    /// Apply per-connection settings from configuration
    pub fn apply_config(&mut self, config: &SocketConfig) {
        self.timeout_secs = config.idle_timeout.as_secs().min(u32::MAX as u64) as u32;
        self.blocking = config.blocking;
        self.line_mode = config.line_mode;
        self.max_buffer_threshold = config.max_buffer_threshold;
    }

    /// Create the descriptor, optionally bind it, and start a non-blocking
    /// connect. Success means the connect is under way, not that the peer
    /// accepted; the manager reports that through the connected hook.
    pub fn connect(&mut self, bind_host: Option<&str>) -> SocketResult<()> {
        if self.transport.is_some() {
            return Err(SocketError::Misuse("connect on a socket that already owns a descriptor"));
        }

        let addr = resolve(&self.host, self.port, None)?;
        let raw = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

        if let Some(bind_host) = bind_host.filter(|h| !h.is_empty()) {
            let local = resolve(bind_host, 0, Some(&addr))?;
            bind_with_retries(&raw, local)?;
        }

        raw.set_nonblocking(true)?;
        match raw.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(SocketError::Refused(addr.to_string()));
            }
            Err(source) => {
                warn!("Connect to {} failed: {}", addr, source);
                return Err(SocketError::Connect {
                    addr: addr.to_string(),
                    source,
                });
            }
        }

        let stream: StdTcpStream = raw.into();
        self.transport = Some(Transport::Tcp(TcpStream::from_std(stream)));
        self.conn_type = ConnType::Outbound;
        debug!("Connecting to {}:{} ({})", self.host, self.port, addr);

        if self.blocking {
            if let Err(e) = self.finish_blocking_connect(addr) {
                self.transport = None;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Wait for the pending connect to settle and surface its outcome
    fn finish_blocking_connect(&mut self, addr: SocketAddr) -> SocketResult<()> {
        match self.write_select() {
            PollStatus::Ok => {}
            PollStatus::Timeout => {
                return Err(SocketError::Connect {
                    addr: addr.to_string(),
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                });
            }
            _ => {
                return Err(SocketError::Connect {
                    addr: addr.to_string(),
                    source: io::Error::new(io::ErrorKind::Other, "readiness wait failed"),
                });
            }
        }

        match self.take_error()? {
            None => Ok(()),
            Some(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                Err(SocketError::Refused(addr.to_string()))
            }
            Some(source) => {
                warn!("Connect to {} failed: {}", addr, source);
                Err(SocketError::Connect {
                    addr: addr.to_string(),
                    source,
                })
            }
        }
    }

    /// Connect to a local-domain socket at `path`
    #[cfg(unix)]
    pub fn connect_unix(&mut self, path: &Path) -> SocketResult<()> {
        if self.transport.is_some() {
            return Err(SocketError::Misuse("connect on a socket that already owns a descriptor"));
        }

        let stream = UnixStream::connect(path).map_err(|source| match source.kind() {
            io::ErrorKind::ConnectionRefused => SocketError::Refused(path.display().to_string()),
            _ => SocketError::Connect {
                addr: path.display().to_string(),
                source,
            },
        })?;

        self.host = path.display().to_string();
        self.port = 0;
        self.transport = Some(Transport::Unix(stream));
        self.conn_type = ConnType::Outbound;
        Ok(())
    }

    /// Bind `bind_host:port` (wildcard when absent) with address reuse and
    /// start listening. Port 0 picks an ephemeral port, readable afterwards
    /// through [`port`](Self::port).
    pub fn listen(&mut self, port: u16, backlog: u32, bind_host: Option<&str>) -> SocketResult<()> {
        if self.transport.is_some() {
            return Err(SocketError::Misuse("listen on a socket that already owns a descriptor"));
        }

        if self.tls.enabled {
            self.server_ctx = Some(tls::server_config(&self.tls)?);
        }

        let addr = match bind_host.filter(|h| !h.is_empty()) {
            Some(host) => resolve(host, port, None)?,
            None => SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        };

        let raw = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        raw.set_reuse_address(true)?;
        raw.bind(&SockAddr::from(addr)).map_err(|source| {
            warn!("Failure to bind to {}: {}", addr, source);
            SocketError::Bind {
                addr: addr.to_string(),
                source,
            }
        })?;
        let backlog = backlog.min(i32::MAX as u32) as i32;
        raw.listen(backlog).map_err(|source| SocketError::Listen {
            addr: addr.to_string(),
            source,
        })?;
        raw.set_nonblocking(true)?;

        let listener: StdTcpListener = raw.into();
        let listener = TcpListener::from_std(listener);
        let local = listener.local_addr()?;

        self.host = local.ip().to_string();
        self.port = local.port();
        self.transport = Some(Transport::TcpListener(listener));
        self.conn_type = ConnType::Listener;
        info!("Listening on {}", local);
        Ok(())
    }

    /// Listen on a local-domain socket, replacing a stale socket file
    #[cfg(unix)]
    pub fn listen_unix(&mut self, path: &Path) -> SocketResult<()> {
        if self.transport.is_some() {
            return Err(SocketError::Misuse("listen on a socket that already owns a descriptor"));
        }

        if self.tls.enabled {
            self.server_ctx = Some(tls::server_config(&self.tls)?);
        }

        if path.exists() {
            debug!("Removing stale socket file {}", path.display());
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path).map_err(|source| SocketError::Bind {
            addr: path.display().to_string(),
            source,
        })?;

        self.host = path.display().to_string();
        self.port = 0;
        self.transport = Some(Transport::UnixListener {
            listener,
            path: path.to_path_buf(),
        });
        self.conn_type = ConnType::Listener;
        info!("Listening on {}", path.display());
        Ok(())
    }

    /// Use a pipe pair: reads come from `reader`, writes go to `writer`
    #[cfg(unix)]
    pub fn set_pipes(&mut self, reader: pipe::Receiver, writer: pipe::Sender) -> SocketResult<()> {
        if self.transport.is_some() {
            return Err(SocketError::Misuse("socket already owns a descriptor"));
        }
        self.transport = Some(Transport::Pipe {
            reader,
            writer,
            writer_registered: false,
        });
        Ok(())
    }

    /// Take one pending peer off a listening socket
    pub fn accept_raw(&mut self) -> SocketResult<Option<Accepted>> {
        if self.conn_type != ConnType::Listener {
            debug_assert!(false, "accept on a socket that is not listening");
            return Err(SocketError::Misuse("accept on a socket that is not listening"));
        }
        let transport = self.transport.as_mut().ok_or(SocketError::Misuse("accept on a closed socket"))?;
        Ok(transport.accept()?)
    }

    /// Take over an accepted peer as an inbound connection
    pub(crate) fn adopt(&mut self, accepted: Accepted) {
        self.transport = Some(accepted.transport);
        self.conn_type = ConnType::Inbound;
        self.host = accepted.host;
        self.port = accepted.port;
        self.blocking = false;
    }

    /// Copy TLS settings and rate quota from the listener that accepted us
    pub(crate) fn inherit_from(&mut self, listener: &Socket) {
        self.tls = listener.tls.clone();
        self.server_ctx = listener.server_ctx.clone();
        self.shaper
            .set_rate(listener.shaper.max_bytes(), listener.shaper.window_ms());
    }

    /// Read once into `buf`.
    ///
    /// Blocking sockets wait for readability first, bounded by the timeout.
    /// Encrypted sockets read through the session; its want-read and
    /// want-write conditions surface as [`ReadResult::Again`].
    pub fn read(&mut self, buf: &mut [u8]) -> ReadResult {
        if self.transport.is_none() {
            return ReadResult::Error;
        }

        if self.blocking && self.read_select() != PollStatus::Ok {
            return ReadResult::Error;
        }

        let result = match (self.session.as_mut(), self.transport.as_mut()) {
            (Some(session), Some(io)) => {
                let result = match session.read(io, buf) {
                    SessionRead::Data(0) => ReadResult::Again,
                    SessionRead::Data(n) => ReadResult::Data(n),
                    SessionRead::Again => ReadResult::Again,
                    SessionRead::Eof | SessionRead::Failed(SessionError::Closed) => ReadResult::Eof,
                    SessionRead::Failed(SessionError::Io(e)) => classify_read_error(&e),
                    SessionRead::Failed(SessionError::Protocol(e)) => {
                        warn!("TLS error on {}: {}", self.name, e);
                        ReadResult::Error
                    }
                };
                self.tls_established = !session.is_handshaking();
                result
            }
            (None, Some(io)) => match io.read(buf) {
                Ok(0) if !buf.is_empty() => ReadResult::Eof,
                Ok(0) => ReadResult::Again,
                Ok(n) => ReadResult::Data(n),
                Err(e) => classify_read_error(&e),
            },
            (_, None) => ReadResult::Error,
        };

        if let ReadResult::Data(_) = result {
            self.reset_timer();
        }
        result
    }

    /// Queue `data` and send as much as rate shaping allows.
    ///
    /// An empty `data` only flushes. On encrypted sockets the byte range
    /// chosen for an attempt is retried unchanged until the session has
    /// taken all of it.
    pub fn write(&mut self, data: &[u8]) -> Result<(), WriteError> {
        self.send_buffer.extend_from_slice(data);

        let session_output = self.session.as_ref().map_or(false, |s| s.wants_write());
        if self.send_buffer.is_empty() && !session_output {
            return Ok(());
        }

        if self.transport.is_none() {
            return Err(WriteError::NotOpen);
        }

        if self.blocking && self.write_select() != PollStatus::Ok {
            return Err(WriteError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "socket not writable",
            )));
        }

        if self.session.is_some() {
            self.write_session()
        } else {
            self.write_plain()
        }
    }

    fn write_session(&mut self) -> Result<(), WriteError> {
        let attempt = match self.pending_attempt {
            Some(len) => len,
            None => {
                let len = self.shaper.allowance(clock::now_millis(), self.send_buffer.len());
                self.shaper.consume(len);
                if len > 0 {
                    self.pending_attempt = Some(len);
                }
                len
            }
        };
        if attempt > 0 {
            self.never_written = false;
        }

        let (Some(session), Some(io)) = (self.session.as_mut(), self.transport.as_mut()) else {
            return Err(WriteError::NotOpen);
        };

        let outcome = session.write(io, &self.send_buffer[..attempt]);
        self.tls_established = !session.is_handshaking();

        match outcome {
            SessionWrite::Accepted(n) => {
                if n > 0 {
                    self.send_buffer.advance(n);
                    let remaining = attempt - n;
                    self.pending_attempt = (remaining > 0).then_some(remaining);
                    self.reset_timer();
                }
                Ok(())
            }
            SessionWrite::Again => Ok(()),
            SessionWrite::Closed | SessionWrite::Failed(SessionError::Closed) => {
                Err(WriteError::SessionClosed)
            }
            SessionWrite::Failed(SessionError::Io(e)) => match e.kind() {
                io::ErrorKind::ConnectionRefused => Err(WriteError::Refused),
                _ => Err(WriteError::Io(e)),
            },
            SessionWrite::Failed(SessionError::Protocol(e)) => {
                warn!("TLS error on {}: {}", self.name, e);
                Err(WriteError::Session(e.to_string()))
            }
        }
    }

    fn write_plain(&mut self) -> Result<(), WriteError> {
        let allowed = self.shaper.allowance(clock::now_millis(), self.send_buffer.len());
        if allowed == 0 {
            return Ok(());
        }
        self.never_written = false;

        let Some(io) = self.transport.as_mut() else {
            return Err(WriteError::NotOpen);
        };

        match io.write(&self.send_buffer[..allowed]) {
            Ok(n) => {
                self.shaper.consume(n);
                if n > 0 {
                    self.send_buffer.advance(n);
                    self.reset_timer();
                }
                Ok(())
            }
            Err(e) if is_transient(&e) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => Err(WriteError::Refused),
            Err(e) => Err(WriteError::Io(e)),
        }
    }

    /// Push out buffered output without adding any
    pub fn flush(&mut self) -> Result<(), WriteError> {
        self.write(&[])
    }

    pub fn write_str(&mut self, data: &str) -> Result<(), WriteError> {
        self.write(data.as_bytes())
    }

    /// Write `line` followed by CRLF
    pub fn write_line(&mut self, line: &str) -> Result<(), WriteError> {
        self.send_buffer.reserve(line.len() + 2);
        self.send_buffer.extend_from_slice(line.as_bytes());
        self.write(b"\r\n")
    }

    /// One idle check. Fires when the counter has reached the timeout,
    /// otherwise advances the counter. A zero timeout never fires.
    pub fn tick_timeout(&mut self) -> bool {
        if self.timeout_secs == 0 {
            return false;
        }
        if self.idle_count >= self.timeout_secs {
            return true;
        }
        self.idle_count += 1;
        false
    }

    pub fn reset_timer(&mut self) {
        self.idle_count = 0;
    }

    /// Append inbound bytes to the line buffer
    pub(crate) fn buffer_inbound(&mut self, data: &[u8]) {
        self.read_buffer.extend_from_slice(data);
    }

    /// Split the next complete line, terminator included, off the line buffer
    pub fn next_line(&mut self) -> Option<Bytes> {
        let end = self.read_buffer.iter().position(|b| *b == LINE_TERMINATOR)?;
        Some(self.read_buffer.split_to(end + 1).freeze())
    }

    /// The line buffer holds more than the overflow threshold allows
    pub fn over_threshold(&self) -> bool {
        self.max_buffer_threshold > 0 && self.read_buffer.len() > self.max_buffer_threshold
    }

    /// Server side handshake step. Success includes "still in progress".
    pub fn accept_tls(&mut self) -> SocketResult<()> {
        if self.session.is_none() {
            let ctx = match &self.server_ctx {
                Some(ctx) => ctx.clone(),
                None => {
                    let ctx = tls::server_config(&self.tls)?;
                    self.server_ctx = Some(ctx.clone());
                    ctx
                }
            };
            self.session = Some(TlsSession::server(ctx)?);
            self.tls.enabled = true;
        }

        let (Some(session), Some(io)) = (self.session.as_mut(), self.transport.as_mut()) else {
            return Err(SocketError::Misuse("tls accept on a closed socket"));
        };

        match session.handshake(io) {
            HandshakeStatus::Complete => {
                debug!("TLS accept complete for {}", self.name);
                self.tls_accepted = true;
                self.tls_established = true;
                Ok(())
            }
            HandshakeStatus::Pending => {
                self.tls_accepted = false;
                Ok(())
            }
            HandshakeStatus::Failed(e) => {
                warn!("TLS accept failed for {}:{}: {}", self.host, self.port, e);
                Err(SocketError::Handshake(e.to_string()))
            }
        }
    }

    /// Client side: connect if needed, set up the session and take one
    /// handshake step. Success includes "still in progress".
    pub fn connect_tls(&mut self, bind_host: Option<&str>) -> SocketResult<()> {
        if self.transport.is_none() {
            self.connect(bind_host)?;
        }

        if self.session.is_none() {
            let ctx = tls::client_config(&self.tls)?;
            let server_name = match self.port {
                0 => "localhost",
                _ => self.host.as_str(),
            };
            self.session = Some(TlsSession::client(ctx, server_name)?);
            self.tls.enabled = true;
        }

        let (Some(session), Some(io)) = (self.session.as_mut(), self.transport.as_mut()) else {
            return Err(SocketError::Misuse("tls connect on a closed socket"));
        };

        match session.handshake(io) {
            HandshakeStatus::Complete => {
                self.tls_established = true;
                Ok(())
            }
            HandshakeStatus::Pending => Ok(()),
            HandshakeStatus::Failed(SessionError::Io(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                Err(SocketError::Refused(format!("{}:{}", self.host, self.port)))
            }
            HandshakeStatus::Failed(e) => Err(SocketError::Handshake(e.to_string())),
        }
    }

    /// Upgrade an established plaintext connection in place
    pub fn start_tls(&mut self) -> SocketResult<()> {
        if self.session.is_some() {
            return Err(SocketError::Misuse("connection is already encrypted"));
        }
        match self.conn_type {
            ConnType::Outbound => self.connect_tls(None),
            ConnType::Inbound => self.accept_tls(),
            ConnType::Listener => Err(SocketError::Misuse("start_tls on a listening socket")),
        }
    }

    /// Wait until readable, bounded by the idle timeout (zero waits forever)
    pub fn read_select(&mut self) -> PollStatus {
        let timeout = self.select_timeout();
        match self.transport.as_mut() {
            Some(io) => io.wait_ready(Interest::READABLE, timeout),
            None => PollStatus::Error,
        }
    }

    /// Wait until writable, bounded by the idle timeout (zero waits forever)
    pub fn write_select(&mut self) -> PollStatus {
        let timeout = self.select_timeout();
        match self.transport.as_mut() {
            Some(io) => io.wait_ready(Interest::WRITABLE, timeout),
            None => PollStatus::Error,
        }
    }

    fn select_timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs as u64))
    }

    /// Decrypted bytes waiting inside the session
    pub fn pending(&mut self) -> usize {
        self.session.as_mut().map_or(0, |s| s.pending())
    }

    /// Encrypted output is queued inside the session
    pub(crate) fn session_wants_write(&self) -> bool {
        self.session.as_ref().map_or(false, |s| s.wants_write())
    }

    /// Mark for teardown; the manager removes it on its next pass
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn conn_type(&self) -> ConnType {
        self.conn_type
    }

    pub fn set_conn_type(&mut self, conn_type: ConnType) {
        self.conn_type = conn_type;
    }

    /// Remote host (local address for listeners, path for local sockets)
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Name of the listener that accepted this connection
    pub fn parent_name(&self) -> &str {
        &self.parent_name
    }

    pub(crate) fn set_parent_name(&mut self, name: impl Into<String>) {
        self.parent_name = name.into();
    }

    pub fn timeout(&self) -> u32 {
        self.timeout_secs
    }

    /// Idle timeout in seconds; zero leaves liveness to the transport
    pub fn set_timeout(&mut self, secs: u32) {
        self.timeout_secs = secs;
    }

    pub fn idle_count(&self) -> u32 {
        self.idle_count
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    /// Writability has been observed at least once
    pub fn has_write(&self) -> bool {
        self.has_write
    }

    pub(crate) fn set_has_write(&mut self, has_write: bool) {
        self.has_write = has_write;
    }

    /// No write has been attempted yet
    pub fn never_written(&self) -> bool {
        self.never_written
    }

    pub fn line_mode(&self) -> bool {
        self.line_mode
    }

    pub fn enable_line_mode(&mut self, enabled: bool) {
        self.line_mode = enabled;
    }

    /// Inbound bytes accumulated for line framing
    pub fn read_buffer(&self) -> &[u8] {
        &self.read_buffer
    }

    pub fn read_buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.read_buffer
    }

    /// Output not yet handed to the descriptor or session
    pub fn send_buffer(&self) -> &[u8] {
        &self.send_buffer
    }

    pub fn max_buffer_threshold(&self) -> usize {
        self.max_buffer_threshold
    }

    pub fn set_max_buffer_threshold(&mut self, threshold: usize) {
        self.max_buffer_threshold = threshold;
    }

    /// Cap output at `max_bytes` per `window_ms`; zero in either disables
    pub fn set_rate(&mut self, max_bytes: u32, window_ms: u64) {
        self.shaper.set_rate(max_bytes, window_ms);
    }

    pub fn rate_bytes(&self) -> u32 {
        self.shaper.max_bytes()
    }

    pub fn rate_window_ms(&self) -> u64 {
        self.shaper.window_ms()
    }

    pub fn is_tls(&self) -> bool {
        self.tls.enabled
    }

    pub fn set_tls(&mut self, enabled: bool) {
        self.tls.enabled = enabled;
    }

    pub fn tls_config(&self) -> &TlsConfig {
        &self.tls
    }

    /// Replace TLS settings; takes effect for the next session set up
    pub fn set_tls_config(&mut self, config: TlsConfig) {
        self.tls = config;
    }

    pub fn set_pem_file(&mut self, path: impl Into<std::path::PathBuf>) {
        self.tls.pem_file = Some(path.into());
    }

    pub fn set_cipher(&mut self, cipher: impl Into<String>) {
        self.tls.cipher = cipher.into();
    }

    pub fn set_require_client_cert(&mut self, required: bool) {
        self.tls.require_client_cert = required;
    }

    pub fn set_tls_method(&mut self, method: TlsMethod) {
        self.tls.method = method;
    }

    /// Server handshake finished
    pub fn tls_accepted(&self) -> bool {
        self.tls_accepted
    }

    /// Session carries application data
    pub fn tls_established(&self) -> bool {
        self.tls_established
    }

    pub fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        self.session.as_ref().and_then(|s| s.peer_certificates())
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.session.as_ref().and_then(|s| s.protocol_version())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().and_then(|t| t.peer_addr())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().and_then(|t| t.local_addr())
    }

    /// Reads and writes use different descriptors
    pub fn has_split_descriptors(&self) -> bool {
        self.transport
            .as_ref()
            .map_or(false, |t| t.has_split_descriptors())
    }

    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        match &self.transport {
            Some(t) => t.take_error(),
            None => Ok(None),
        }
    }

    pub(crate) fn register(&mut self, registry: &Registry, slot: usize, interest: Interest) -> io::Result<()> {
        match self.transport.as_mut() {
            Some(t) => t.register(registry, slot, interest),
            None => Ok(()),
        }
    }

    pub(crate) fn reregister(&mut self, registry: &Registry, slot: usize, interest: Interest) -> io::Result<()> {
        match self.transport.as_mut() {
            Some(t) => t.reregister(registry, slot, interest),
            None => Ok(()),
        }
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self.transport.as_mut() {
            Some(t) => t.deregister(registry),
            None => Ok(()),
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let (Some(session), Some(io)) = (self.session.as_mut(), self.transport.as_mut()) {
            session.close(io);
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("name", &self.name)
            .field("conn_type", &self.conn_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("closed", &self.closed)
            .field("tls", &self.tls.enabled)
            .field("buffered_out", &self.send_buffer.len())
            .finish()
    }
}

fn bind_with_retries(raw: &RawSocket, local: SocketAddr) -> SocketResult<()> {
    let mut last_err = None;
    for attempt in 0..BIND_ATTEMPTS {
        match raw.bind(&SockAddr::from(local)) {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!("Bind attempt {} to {} failed: {}", attempt + 1, local, e);
                last_err = Some(e);
                thread::sleep(BIND_RETRY_PAUSE);
            }
        }
    }
    warn!("Failure to bind to {}", local);
    Err(SocketError::Bind {
        addr: local.to_string(),
        source: last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "bind failed")),
    })
}

fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS)
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::NotConnected
    )
}

fn classify_read_error(e: &io::Error) -> ReadResult {
    if is_transient(e) {
        return ReadResult::Again;
    }
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ReadResult::Refused,
        _ => {
            debug!("Read failed: {}", e);
            ReadResult::Error
        }
    }
}
