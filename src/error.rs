//! Socket Layer Errors

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by connection setup operations
#[derive(Debug, Error)]
pub enum SocketError {
    /// Host name did not resolve to any address
    #[error("unable to resolve host {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    /// Binding the local address failed, including all retries
    #[error("failure to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// listen(2) failed on a bound socket
    #[error("unable to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// connect(2) failed outright (anything but in-progress)
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Peer actively refused the connection
    #[error("connection refused by {0}")]
    Refused(String),

    /// Credential file missing, unreadable or malformed
    #[error("there is a problem with pem file [{path}]: {reason}")]
    Credentials { path: PathBuf, reason: String },

    /// Cipher string matched none of the available suites
    #[error("could not assign cipher [{0}]")]
    Cipher(String),

    /// Encryption library refused to set up the session
    #[error("tls setup failed: {0}")]
    Tls(#[from] rustls::Error),

    /// Encrypted handshake failed outright
    #[error("tls handshake failed: {0}")]
    Handshake(String),

    /// Operation not supported for this connection's role or state
    #[error("invalid operation: {0}")]
    Misuse(&'static str),

    /// Any other I/O failure
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Why a write could not be completed
#[derive(Debug, Error)]
pub enum WriteError {
    /// The peer refused the connection
    #[error("connection refused")]
    Refused,

    /// The descriptor reported a fatal error
    #[error("write failed: {0}")]
    Io(#[from] io::Error),

    /// The encrypted session was closed by the peer
    #[error("tls session closed by peer")]
    SessionClosed,

    /// The encrypted session reported a protocol failure
    #[error("tls session error: {0}")]
    Session(String),

    /// The connection has no open descriptors
    #[error("connection is closed")]
    NotOpen,
}

pub type SocketResult<T> = std::result::Result<T, SocketError>;
