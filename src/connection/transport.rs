//! Owned OS Descriptors
//!
//! A [`Transport`] is the descriptor pair behind one connection: a TCP or
//! local-domain stream (read and write share one descriptor), a listening
//! socket, or a pipe pair with distinct read and write ends.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::time::Duration;

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use mio::net::{UnixListener, UnixStream};
#[cfg(unix)]
use mio::unix::pipe;
use mio::{Events, Interest, Poll, Registry, Token};
use tracing::{debug, warn};

use crate::connection::types::PollStatus;

/// Token of a connection's read side; the write side of a pipe pair uses
/// the next token
pub(crate) fn read_token(slot: usize) -> Token {
    Token(slot * 2)
}

pub(crate) fn write_token(slot: usize) -> Token {
    Token(slot * 2 + 1)
}

/// Slot encoded in a token produced by [`read_token`]/[`write_token`]
pub(crate) fn slot_of(token: Token) -> usize {
    token.0 / 2
}

/// A peer taken off a listening socket
pub struct Accepted {
    pub(crate) transport: Transport,
    pub host: String,
    pub port: u16,
}

/// Descriptors owned by one connection
pub enum Transport {
    Tcp(TcpStream),
    TcpListener(TcpListener),
    #[cfg(unix)]
    Unix(UnixStream),
    #[cfg(unix)]
    UnixListener { listener: UnixListener, path: PathBuf },
    #[cfg(unix)]
    Pipe {
        reader: pipe::Receiver,
        writer: pipe::Sender,
        writer_registered: bool,
    },
}

impl Transport {
    pub fn is_listener(&self) -> bool {
        match self {
            Transport::TcpListener(_) => true,
            #[cfg(unix)]
            Transport::UnixListener { .. } => true,
            _ => false,
        }
    }

    /// True when reads and writes go through different descriptors
    pub fn has_split_descriptors(&self) -> bool {
        #[cfg(unix)]
        if let Transport::Pipe { .. } = self {
            return true;
        }
        false
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Transport::Tcp(stream) => stream.peer_addr().ok(),
            _ => None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Transport::Tcp(stream) => stream.local_addr().ok(),
            Transport::TcpListener(listener) => listener.local_addr().ok(),
            _ => None,
        }
    }

    /// Pending socket error (SO_ERROR), used to tell a refused
    /// non-blocking connect from a completed one
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Transport::Tcp(stream) => stream.take_error(),
            #[cfg(unix)]
            Transport::Unix(stream) => stream.take_error(),
            _ => Ok(None),
        }
    }

    /// Accept one pending peer, if any
    pub fn accept(&mut self) -> io::Result<Option<Accepted>> {
        let result = match self {
            Transport::TcpListener(listener) => listener.accept().map(|(stream, addr)| Accepted {
                transport: Transport::Tcp(stream),
                host: addr.ip().to_string(),
                port: addr.port(),
            }),
            #[cfg(unix)]
            Transport::UnixListener { listener, path } => {
                listener.accept().map(|(stream, _)| Accepted {
                    transport: Transport::Unix(stream),
                    host: path.display().to_string(),
                    port: 0,
                })
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "accept on a non-listening descriptor",
                ))
            }
        };

        match result {
            Ok(accepted) => Ok(Some(accepted)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// First registration with a poller
    pub(crate) fn register(&mut self, registry: &Registry, slot: usize, interest: Interest) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Transport::Pipe {
                reader,
                writer,
                writer_registered,
            } => {
                if interest.is_readable() {
                    registry.register(reader, read_token(slot), Interest::READABLE)?;
                }
                if interest.is_writable() {
                    registry.register(writer, write_token(slot), Interest::WRITABLE)?;
                    *writer_registered = true;
                }
                Ok(())
            }
            _ => registry.register(self.source(), read_token(slot), interest),
        }
    }

    /// Replace the registered interest. Re-arming every iteration gives
    /// level-triggered readiness on top of mio's edge-triggered events.
    pub(crate) fn reregister(&mut self, registry: &Registry, slot: usize, interest: Interest) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Transport::Pipe {
                reader,
                writer,
                writer_registered,
            } => {
                registry.reregister(reader, read_token(slot), Interest::READABLE)?;
                match (interest.is_writable(), *writer_registered) {
                    (true, true) => registry.reregister(writer, write_token(slot), Interest::WRITABLE)?,
                    (true, false) => {
                        registry.register(writer, write_token(slot), Interest::WRITABLE)?;
                        *writer_registered = true;
                    }
                    (false, true) => {
                        registry.deregister(writer)?;
                        *writer_registered = false;
                    }
                    (false, false) => {}
                }
                Ok(())
            }
            _ => registry.reregister(self.source(), read_token(slot), interest),
        }
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Transport::Pipe {
                reader,
                writer,
                writer_registered,
            } => {
                let read_result = registry.deregister(reader);
                if *writer_registered {
                    *writer_registered = false;
                    registry.deregister(writer)?;
                }
                read_result
            }
            _ => registry.deregister(self.source()),
        }
    }

    /// Wait on this descriptor alone, bounded by `timeout` (`None` waits
    /// until ready)
    pub fn wait_ready(&mut self, interest: Interest, timeout: Option<Duration>) -> PollStatus {
        let mut poll = match Poll::new() {
            Ok(poll) => poll,
            Err(e) => {
                warn!("Unable to create poller: {}", e);
                return PollStatus::Error;
            }
        };

        if let Err(e) = self.register(poll.registry(), 0, interest) {
            debug!("Unable to register descriptor for readiness wait: {}", e);
            return PollStatus::Error;
        }

        let mut events = Events::with_capacity(2);
        let status = match poll.poll(&mut events, timeout) {
            Ok(()) if events.is_empty() => PollStatus::Timeout,
            Ok(()) => PollStatus::Ok,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => PollStatus::Again,
            Err(e) => {
                warn!("Readiness wait failed: {}", e);
                PollStatus::Error
            }
        };

        if let Err(e) = self.deregister(poll.registry()) {
            debug!("Unable to deregister descriptor after readiness wait: {}", e);
        }
        status
    }

    fn source(&mut self) -> &mut dyn Source {
        match self {
            Transport::Tcp(stream) => stream,
            Transport::TcpListener(listener) => listener,
            #[cfg(unix)]
            Transport::Unix(stream) => stream,
            #[cfg(unix)]
            Transport::UnixListener { listener, .. } => listener,
            #[cfg(unix)]
            Transport::Pipe { reader, .. } => reader,
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Transport::Unix(stream) => stream.read(buf),
            #[cfg(unix)]
            Transport::Pipe { reader, .. } => reader.read(buf),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read on a listening descriptor",
            )),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Transport::Unix(stream) => stream.write(buf),
            #[cfg(unix)]
            Transport::Pipe { writer, .. } => writer.write(buf),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write on a listening descriptor",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Transport::Unix(stream) => stream.flush(),
            #[cfg(unix)]
            Transport::Pipe { writer, .. } => writer.flush(),
            _ => Ok(()),
        }
    }
}

#[cfg(unix)]
impl Drop for Transport {
    fn drop(&mut self) {
        if let Transport::UnixListener { path, .. } = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                debug!("Unable to remove socket file {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_round_trip() {
        assert_eq!(slot_of(read_token(7)), 7);
        assert_eq!(slot_of(write_token(7)), 7);
        assert_ne!(read_token(7), write_token(7));
    }

    #[cfg(unix)]
    #[test]
    fn test_pipe_read_write_and_wait() {
        let (sender, receiver) = pipe::new().unwrap();
        let mut transport = Transport::Pipe {
            reader: receiver,
            writer: sender,
            writer_registered: false,
        };
        assert!(transport.has_split_descriptors());
        assert!(!transport.is_listener());

        // Nothing to read yet
        assert_eq!(
            transport.wait_ready(Interest::READABLE, Some(Duration::from_millis(10))),
            PollStatus::Timeout
        );

        assert_eq!(transport.write(b"loop").unwrap(), 4);
        assert_eq!(
            transport.wait_ready(Interest::READABLE, Some(Duration::from_secs(1))),
            PollStatus::Ok
        );

        let mut buf = [0u8; 16];
        let n = transport.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"loop");
    }

    #[test]
    fn test_listener_rejects_stream_io() {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut transport = Transport::TcpListener(listener);
        assert!(transport.is_listener());
        assert!(transport.local_addr().is_some());
        let mut buf = [0u8; 4];
        assert!(transport.read(&mut buf).is_err());
        assert!(transport.accept().unwrap().is_none());
    }
}
