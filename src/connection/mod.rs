//! Connection Management Module
//!
//! Sockets, encrypted sessions, event hooks and the manager that
//! multiplexes them.

pub mod conn;
pub mod handler;
pub mod manager;
pub mod resolve;
pub mod shaper;
pub mod socket;
pub mod tls;
pub mod transport;
pub mod types;

pub use conn::Connection;
pub use handler::{ConnectionHandler, Context};
pub use manager::{ConnectOptions, ConnectionManager, ListenOptions};
pub use socket::Socket;
pub use transport::Accepted;
pub use types::{ConnId, ConnType, PollStatus, ReadResult, TlsMethod};
