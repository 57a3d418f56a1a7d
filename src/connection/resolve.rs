//! Host Name Resolution
//!
//! Resolves host names for connect, bind and listen. Lookups that need the
//! system resolver are serialized through one process-wide lock on targets
//! whose resolver is not known to be reentrant.

use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
#[cfg(not(target_os = "linux"))]
use std::sync::Mutex;

use tracing::debug;

use crate::error::{SocketError, SocketResult};

/// Guards the system resolver while a lookup is in flight
#[cfg(not(target_os = "linux"))]
static RESOLVER_LOCK: Mutex<()> = Mutex::new(());

/// Attempts made while the resolver reports a temporary failure
const RESOLVE_ATTEMPTS: usize = 20;

/// Resolve `host:port`, preferring an address of the family of `prefer`.
///
/// Numeric addresses never touch the resolver.
pub fn resolve(host: &str, port: u16, prefer: Option<&SocketAddr>) -> SocketResult<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let addrs = lookup(host, port).map_err(|source| SocketError::Resolve {
        host: host.to_string(),
        source,
    })?;

    let chosen = match prefer {
        Some(p) => addrs
            .iter()
            .find(|a| a.is_ipv4() == p.is_ipv4())
            .or_else(|| addrs.first()),
        None => addrs.iter().find(|a| a.is_ipv4()).or_else(|| addrs.first()),
    };

    chosen.copied().ok_or_else(|| SocketError::Resolve {
        host: host.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
    })
}

fn lookup(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let mut last_err = None;
    for _ in 0..RESOLVE_ATTEMPTS {
        match locked_lookup(host, port) {
            Ok(addrs) => {
                debug!("Resolved {} to {} addresses", host, addrs.len());
                return Ok(addrs);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "lookup failed")))
}

#[cfg(not(target_os = "linux"))]
fn locked_lookup(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let _guard = RESOLVER_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    (host, port).to_socket_addrs().map(|it| it.collect())
}

#[cfg(target_os = "linux")]
fn locked_lookup(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    // glibc's getaddrinfo is reentrant
    (host, port).to_socket_addrs().map(|it| it.collect())
}
