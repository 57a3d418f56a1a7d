//! Connections
//!
//! A [`Connection`] pairs a [`Socket`] with the application's handler and
//! the jobs scheduled on it. Operations that can raise events (refusals,
//! complete lines, timeouts) fire the matching hook before returning.

use std::fmt;
#[cfg(unix)]
use std::path::Path;

use bytes::Bytes;
#[cfg(unix)]
use mio::unix::pipe;
use mio::Interest;
use tracing::debug;

use crate::connection::handler::{ConnectionHandler, Context};
use crate::connection::socket::Socket;
use crate::connection::transport::Accepted;
use crate::connection::types::ConnId;
use crate::cron::{Cron, CronList};
use crate::error::{SocketError, SocketResult, WriteError};

/// A socket, its handler and its scheduled jobs
pub struct Connection<H: ConnectionHandler> {
    socket: Socket,
    handler: H,
    crons: CronList<Connection<H>>,
    pub(crate) id: Option<ConnId>,
    /// Interest registered for the current loop iteration; `None` when the
    /// connection takes no part in the readiness poll
    pub(crate) polled: Option<Interest>,
}

impl<H: ConnectionHandler> Connection<H> {
    pub fn new(handler: H) -> Self {
        Self::with_socket(Socket::new(), handler)
    }

    pub fn with_socket(socket: Socket, handler: H) -> Self {
        Self {
            socket,
            handler,
            crons: CronList::new(),
            id: None,
            polled: None,
        }
    }

    /// Connection over a pipe pair; reads and writes use different descriptors
    #[cfg(unix)]
    pub fn from_pipes(reader: pipe::Receiver, writer: pipe::Sender, handler: H) -> SocketResult<Self> {
        let mut socket = Socket::new();
        socket.set_pipes(reader, writer)?;
        Ok(Self::with_socket(socket, handler))
    }

    /// Identifier assigned by the manager that owns this connection
    pub fn id(&self) -> Option<ConnId> {
        self.id
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn name(&self) -> &str {
        self.socket.name()
    }

    /// Attach a scheduled job
    pub fn add_cron(&mut self, cron: Cron<Connection<H>>) {
        self.crons.add(cron);
    }

    pub fn crons(&self) -> &CronList<Connection<H>> {
        &self.crons
    }

    pub fn crons_mut(&mut self) -> &mut CronList<Connection<H>> {
        &mut self.crons
    }

    fn split(&mut self) -> (&mut H, Context<'_, H>) {
        (
            &mut self.handler,
            Context {
                socket: &mut self.socket,
                crons: &mut self.crons,
            },
        )
    }

    /// Start an outbound connect; a refusal fires the refused hook
    pub fn connect(&mut self, bind_host: Option<&str>) -> SocketResult<()> {
        let result = self.socket.connect(bind_host);
        self.refused_on_err(result)
    }

    /// Start an outbound connect with an encrypted session on top
    pub fn connect_tls(&mut self, bind_host: Option<&str>) -> SocketResult<()> {
        let result = self.socket.connect_tls(bind_host);
        self.refused_on_err(result)
    }

    #[cfg(unix)]
    pub fn connect_unix(&mut self, path: &Path) -> SocketResult<()> {
        let result = self.socket.connect_unix(path);
        self.refused_on_err(result)
    }

    fn refused_on_err(&mut self, result: SocketResult<()>) -> SocketResult<()> {
        if let Err(SocketError::Refused(_)) = &result {
            self.fire_connection_refused();
        }
        result
    }

    pub fn listen(&mut self, port: u16, backlog: u32, bind_host: Option<&str>) -> SocketResult<()> {
        self.socket.listen(port, backlog, bind_host)
    }

    #[cfg(unix)]
    pub fn listen_unix(&mut self, path: &Path) -> SocketResult<()> {
        self.socket.listen_unix(path)
    }

    /// Accept one pending peer, subject to the accept policy hook
    pub fn accept(&mut self) -> SocketResult<Option<Accepted>> {
        let Some(accepted) = self.socket.accept_raw()? else {
            return Ok(None);
        };

        let (handler, mut ctx) = self.split();
        if handler.connection_from(&mut ctx, &accepted.host, accepted.port) {
            Ok(Some(accepted))
        } else {
            debug!("Rejected connection from {}:{}", accepted.host, accepted.port);
            Ok(None)
        }
    }

    /// Queue and send `data`; a refusal fires the refused hook
    pub fn write(&mut self, data: &[u8]) -> Result<(), WriteError> {
        let result = self.socket.write(data);
        if let Err(WriteError::Refused) = &result {
            self.fire_connection_refused();
        }
        result
    }

    pub fn write_line(&mut self, line: &str) -> Result<(), WriteError> {
        let result = self.socket.write_line(line);
        if let Err(WriteError::Refused) = &result {
            self.fire_connection_refused();
        }
        result
    }

    /// Feed inbound bytes to line framing: one line event per terminator,
    /// then the overflow event if the remainder is over the threshold.
    /// Without line mode the bytes are ignored.
    pub fn push_buffer(&mut self, data: &[u8]) {
        if !self.socket.line_mode() {
            return;
        }

        self.socket.buffer_inbound(data);
        while let Some(line) = self.socket.next_line() {
            self.fire_read_line(&line);
        }

        if self.socket.over_threshold() {
            let (handler, mut ctx) = self.split();
            handler.reached_max_buffer(&mut ctx);
        }
    }

    /// One idle check; fires the timeout hook when it trips
    pub fn check_timeout(&mut self) -> bool {
        if self.socket.tick_timeout() {
            let (handler, mut ctx) = self.split();
            handler.timeout(&mut ctx);
            return true;
        }
        false
    }

    /// Run due jobs. Jobs added while running are kept.
    pub fn run_crons(&mut self, now: u64) -> usize {
        let mut crons = self.crons.take_for_run();
        let fired = crons.run(self, now);
        self.crons.restore(crons);
        fired
    }

    /// Mark for removal on the manager's next pass
    pub fn close(&mut self) {
        self.socket.close();
    }

    pub(crate) fn fire_connected(&mut self) {
        let (handler, mut ctx) = self.split();
        handler.connected(&mut ctx);
    }

    pub(crate) fn fire_disconnected(&mut self) {
        let (handler, mut ctx) = self.split();
        handler.disconnected(&mut ctx);
    }

    pub(crate) fn fire_sock_error(&mut self) {
        let (handler, mut ctx) = self.split();
        handler.sock_error(&mut ctx);
    }

    pub(crate) fn fire_connection_refused(&mut self) {
        let (handler, mut ctx) = self.split();
        handler.connection_refused(&mut ctx);
    }

    pub(crate) fn fire_read_data(&mut self, data: &[u8]) {
        let (handler, mut ctx) = self.split();
        handler.read_data(&mut ctx, data);
    }

    fn fire_read_line(&mut self, line: &Bytes) {
        let (handler, mut ctx) = self.split();
        handler.read_line(&mut ctx, line);
    }

    /// Factory hook of a listener
    pub(crate) fn spawn_peer(&mut self, host: &str, port: u16) -> Option<Connection<H>> {
        self.handler.spawn(host, port)
    }
}

impl<H: ConnectionHandler + Default> Default for Connection<H> {
    fn default() -> Self {
        Self::new(H::default())
    }
}

impl<H: ConnectionHandler> fmt::Debug for Connection<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("socket", &self.socket)
            .field("crons", &self.crons.len())
            .finish()
    }
}
