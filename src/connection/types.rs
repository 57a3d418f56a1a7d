//! Connection Types
//!
//! Roles, result codes and small value types shared by the socket layer
//! and the manager.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Size of a plain read issued by the manager
pub const READ_BLOCK_SIZE: usize = 4096;

/// Default idle timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u32 = 60;

/// Default line-buffer overflow threshold in bytes
pub const DEFAULT_MAX_BUFFER_THRESHOLD: usize = 1024;

/// Default cipher list
pub const DEFAULT_CIPHER: &str = "ALL";

/// Byte that terminates a line in line mode
pub const LINE_TERMINATOR: u8 = b'\n';

/// Role a connection plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnType {
    /// Outbound client connection
    Outbound,
    /// Socket accepting connections
    Listener,
    /// Inbound connection handed over by a listener
    Inbound,
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnType::Outbound => write!(f, "OUTBOUND"),
            ConnType::Listener => write!(f, "LISTENER"),
            ConnType::Inbound => write!(f, "INBOUND"),
        }
    }
}

/// Outcome of a single read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    /// `n > 0` bytes were read
    Data(usize),
    /// Orderly close by the peer
    Eof,
    /// Fatal error, the connection is done
    Error,
    /// Nothing available right now, try again next iteration
    Again,
    /// The peer refused the connection
    Refused,
}

impl ReadResult {
    /// Legacy numeric code: bytes read, or 0 / -1 / -2 / -3
    pub fn code(&self) -> i64 {
        match self {
            ReadResult::Data(n) => *n as i64,
            ReadResult::Eof => 0,
            ReadResult::Error => -1,
            ReadResult::Again => -2,
            ReadResult::Refused => -3,
        }
    }
}

/// Outcome of a readiness poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// At least one descriptor was ready
    Ok,
    /// Nothing became ready within the wait
    Timeout,
    /// Interrupted, retry
    Again,
    /// The poll itself failed
    Error,
}

/// Encrypted-session protocol selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMethod {
    /// Negotiate the best version both sides support
    #[default]
    Flexible,
    /// Pin TLS 1.2
    Tls12,
    /// Pin TLS 1.3
    Tls13,
}

impl fmt::Display for TlsMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsMethod::Flexible => write!(f, "flexible"),
            TlsMethod::Tls12 => write!(f, "TLSv1.2"),
            TlsMethod::Tls13 => write!(f, "TLSv1.3"),
        }
    }
}

/// Identifier the manager assigns to every connection it owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub(crate) usize);

impl ConnId {
    pub fn get(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_result_codes() {
        assert_eq!(ReadResult::Data(12).code(), 12);
        assert_eq!(ReadResult::Eof.code(), 0);
        assert_eq!(ReadResult::Error.code(), -1);
        assert_eq!(ReadResult::Again.code(), -2);
        assert_eq!(ReadResult::Refused.code(), -3);
    }

    #[test]
    fn test_tls_method_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            method: TlsMethod,
        }
        let parsed: Wrapper = toml::from_str("method = \"tls13\"").unwrap();
        assert_eq!(parsed.method, TlsMethod::Tls13);
        assert_eq!(TlsMethod::default(), TlsMethod::Flexible);
    }
}
