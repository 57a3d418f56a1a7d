//! sockmux Library
//!
//! Non-blocking socket connections multiplexed by one readiness loop, with
//! optional TLS, line framing, write-rate shaping and scheduled jobs.

pub mod clock;
pub mod config;
pub mod connection;
pub mod cron;
pub mod error;
pub mod shutdown;

pub use config::Config;
pub use connection::{
    ConnId, ConnType, ConnectOptions, Connection, ConnectionHandler, ConnectionManager, Context,
    ListenOptions, PollStatus, ReadResult, Socket,
};
pub use cron::{Cron, CronList};
pub use error::{SocketError, SocketResult, WriteError};
pub use shutdown::ShutdownCoordinator;

/// Common error type for application-level code
pub type Result<T> = anyhow::Result<T>;
