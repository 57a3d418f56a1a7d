//! Connection Event Hooks
//!
//! Applications react to connection events by implementing
//! [`ConnectionHandler`]. Every hook has a no-op default, so a handler only
//! implements what its protocol needs.

use std::ops::{Deref, DerefMut};

use crate::connection::conn::Connection;
use crate::connection::socket::Socket;
use crate::cron::{Cron, CronList};

/// Borrowed view of the connection a hook fires on.
///
/// Derefs to the [`Socket`], so hooks can write, close or inspect it
/// directly, and it can attach scheduled jobs to the connection.
pub struct Context<'a, H: ConnectionHandler> {
    pub(crate) socket: &'a mut Socket,
    pub(crate) crons: &'a mut CronList<Connection<H>>,
}

impl<'a, H: ConnectionHandler> Context<'a, H> {
    /// Attach a job to this connection
    pub fn add_cron(&mut self, cron: Cron<Connection<H>>) {
        self.crons.add(cron);
    }

    /// Stop this connection's jobs called `name`
    pub fn stop_cron(&mut self, name: &str) -> bool {
        self.crons.stop(name)
    }

    pub fn socket(&mut self) -> &mut Socket {
        self.socket
    }
}

impl<'a, H: ConnectionHandler> Deref for Context<'a, H> {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        self.socket
    }
}

impl<'a, H: ConnectionHandler> DerefMut for Context<'a, H> {
    fn deref_mut(&mut self) -> &mut Socket {
        self.socket
    }
}

/// Hooks the connection manager fires as events happen
#[allow(unused_variables)]
pub trait ConnectionHandler: Sized + 'static {
    /// First writability observed; an outbound connect has completed
    fn connected(&mut self, ctx: &mut Context<'_, Self>) {}

    /// The connection is being removed; fires exactly once
    fn disconnected(&mut self, ctx: &mut Context<'_, Self>) {}

    /// No traffic for the configured idle timeout
    fn timeout(&mut self, ctx: &mut Context<'_, Self>) {}

    /// A read failed fatally
    fn sock_error(&mut self, ctx: &mut Context<'_, Self>) {}

    /// A complete line arrived, terminator included. Line mode only.
    fn read_line(&mut self, ctx: &mut Context<'_, Self>, line: &[u8]) {}

    /// Raw bytes as they came off the descriptor
    fn read_data(&mut self, ctx: &mut Context<'_, Self>, data: &[u8]) {}

    /// The line buffer grew past the configured threshold
    fn reached_max_buffer(&mut self, ctx: &mut Context<'_, Self>) {}

    /// Accept policy of a listener; returning false drops the peer
    fn connection_from(&mut self, ctx: &mut Context<'_, Self>, host: &str, port: u16) -> bool {
        true
    }

    /// The peer refused the connection
    fn connection_refused(&mut self, ctx: &mut Context<'_, Self>) {}

    /// Factory used by a listener for each accepted peer. Returning `None`
    /// lets the manager build a default connection.
    fn spawn(&mut self, host: &str, port: u16) -> Option<Connection<Self>> {
        None
    }
}
