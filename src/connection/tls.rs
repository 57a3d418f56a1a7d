//! Encrypted Session Adapter
//!
//! Wraps a rustls client or server session and drives it over a
//! non-blocking [`Transport`]. Every operation performs at most the work the
//! descriptor allows right now and reports "try again" otherwise, so the
//! manager can step handshakes and transfers from its polling loop.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, DistinguishedName, ProtocolVersion,
    RootCertStore, ServerConfig, ServerConnection, SignatureScheme, SupportedCipherSuite,
    SupportedProtocolVersion,
};
use tracing::{debug, trace, warn};

use crate::config::TlsConfig;
use crate::connection::transport::Transport;
use crate::connection::types::TlsMethod;
use crate::error::{SocketError, SocketResult};

/// Cipher keywords that select every available suite
const CIPHER_ALL_KEYWORDS: [&str; 4] = ["ALL", "DEFAULT", "HIGH", "COMPLEMENTOFDEFAULT"];

/// Why a session stopped working
#[derive(Debug)]
pub enum SessionError {
    Io(io::Error),
    Protocol(rustls::Error),
    /// The peer closed the transport or sent close_notify
    Closed,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Io(e) => write!(f, "{}", e),
            SessionError::Protocol(e) => write!(f, "{}", e),
            SessionError::Closed => write!(f, "session closed"),
        }
    }
}

/// Outcome of one handshake step
#[derive(Debug)]
pub enum HandshakeStatus {
    Complete,
    /// The library wants more I/O; retry once the descriptor is ready
    Pending,
    Failed(SessionError),
}

/// Outcome of one decrypting read
#[derive(Debug)]
pub enum SessionRead {
    Data(usize),
    Again,
    Eof,
    Failed(SessionError),
}

/// Outcome of one encrypting write
#[derive(Debug)]
pub enum SessionWrite {
    /// The session took this many plaintext bytes
    Accepted(usize),
    Again,
    Closed,
    Failed(SessionError),
}

enum Session {
    Server(ServerConnection),
    Client(ClientConnection),
}

/// One encrypted session bound to a connection
pub struct TlsSession {
    session: Session,
}

impl TlsSession {
    /// Server side of a session, for accepted peers
    pub fn server(config: Arc<ServerConfig>) -> SocketResult<Self> {
        let conn = ServerConnection::new(config)?;
        Ok(Self {
            session: Session::Server(conn),
        })
    }

    /// Client side of a session towards `host`
    pub fn client(config: Arc<ClientConfig>, host: &str) -> SocketResult<Self> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| SocketError::Handshake(format!("invalid server name {}: {}", host, e)))?;
        let conn = ClientConnection::new(config, name)?;
        Ok(Self {
            session: Session::Client(conn),
        })
    }

    pub fn is_handshaking(&self) -> bool {
        match &self.session {
            Session::Server(conn) => conn.is_handshaking(),
            Session::Client(conn) => conn.is_handshaking(),
        }
    }

    /// Encrypted bytes are waiting to go out
    pub fn wants_write(&self) -> bool {
        match &self.session {
            Session::Server(conn) => conn.wants_write(),
            Session::Client(conn) => conn.wants_write(),
        }
    }

    fn wants_read(&self) -> bool {
        match &self.session {
            Session::Server(conn) => conn.wants_read(),
            Session::Client(conn) => conn.wants_read(),
        }
    }

    fn read_tls(&mut self, io: &mut Transport) -> io::Result<usize> {
        match &mut self.session {
            Session::Server(conn) => conn.read_tls(io),
            Session::Client(conn) => conn.read_tls(io),
        }
    }

    fn write_tls(&mut self, io: &mut Transport) -> io::Result<usize> {
        match &mut self.session {
            Session::Server(conn) => conn.write_tls(io),
            Session::Client(conn) => conn.write_tls(io),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match &mut self.session {
            Session::Server(conn) => conn.process_new_packets(),
            Session::Client(conn) => conn.process_new_packets(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match &mut self.session {
            Session::Server(conn) => conn.writer(),
            Session::Client(conn) => conn.writer(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match &mut self.session {
            Session::Server(conn) => conn.reader(),
            Session::Client(conn) => conn.reader(),
        }
    }

    /// Advance the handshake as far as the descriptor allows without blocking
    pub fn handshake(&mut self, io: &mut Transport) -> HandshakeStatus {
        loop {
            let mut progressed = false;

            if let Err(e) = self.flush(io) {
                return HandshakeStatus::Failed(e);
            }

            if !self.is_handshaking() {
                return HandshakeStatus::Complete;
            }

            if self.wants_read() {
                match self.read_tls(io) {
                    Ok(0) => return HandshakeStatus::Failed(SessionError::Closed),
                    Ok(n) => {
                        trace!("Read {} handshake bytes", n);
                        if let Err(e) = self.process_new_packets() {
                            // Let the alert reach the peer
                            let _ = self.flush(io);
                            return HandshakeStatus::Failed(SessionError::Protocol(e));
                        }
                        progressed = true;
                    }
                    Err(e) if is_retryable(&e) => {}
                    Err(e) => return HandshakeStatus::Failed(SessionError::Io(e)),
                }
            }

            if !progressed {
                if let Err(e) = self.flush(io) {
                    return HandshakeStatus::Failed(e);
                }
                return if self.is_handshaking() {
                    HandshakeStatus::Pending
                } else {
                    HandshakeStatus::Complete
                };
            }
        }
    }

    /// Decrypt up to `buf.len()` bytes of application data
    pub fn read(&mut self, io: &mut Transport, buf: &mut [u8]) -> SessionRead {
        loop {
            match self.reader().read(buf) {
                Ok(0) if !buf.is_empty() => return SessionRead::Eof,
                Ok(n) => return SessionRead::Data(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return SessionRead::Eof,
                Err(e) => return SessionRead::Failed(SessionError::Io(e)),
            }

            match self.read_tls(io) {
                Ok(0) => return SessionRead::Eof,
                Ok(_) => {
                    if let Err(e) = self.process_new_packets() {
                        let _ = self.flush(io);
                        return SessionRead::Failed(SessionError::Protocol(e));
                    }
                    // Key updates and late handshake messages
                    if let Err(e) = self.flush(io) {
                        return SessionRead::Failed(e);
                    }
                }
                Err(e) if is_retryable(&e) => return SessionRead::Again,
                Err(e) => return SessionRead::Failed(SessionError::Io(e)),
            }
        }
    }

    /// Hand `data` to the session and push out whatever it encrypted.
    ///
    /// A short or zero acceptance means the caller must retry with the
    /// remaining bytes of the same attempt.
    pub fn write(&mut self, io: &mut Transport, data: &[u8]) -> SessionWrite {
        let accepted = if data.is_empty() {
            0
        } else {
            match self.writer().write(data) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                Err(e) => return SessionWrite::Failed(SessionError::Io(e)),
            }
        };

        match self.flush(io) {
            Ok(()) => {}
            Err(SessionError::Closed) => return SessionWrite::Closed,
            Err(e) => return SessionWrite::Failed(e),
        }

        if accepted == 0 && !data.is_empty() {
            SessionWrite::Again
        } else {
            SessionWrite::Accepted(accepted)
        }
    }

    /// Plaintext already decrypted and waiting inside the session
    pub fn pending(&mut self) -> usize {
        match self.process_new_packets() {
            Ok(state) => state.plaintext_bytes_to_read(),
            Err(_) => 0,
        }
    }

    /// Write out encrypted records until done or the descriptor is full
    pub fn flush(&mut self, io: &mut Transport) -> Result<(), SessionError> {
        while self.wants_write() {
            match self.write_tls(io) {
                Ok(0) => return Err(SessionError::Closed),
                Ok(n) => trace!("Wrote {} encrypted bytes", n),
                Err(e) if is_retryable(&e) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Err(SessionError::Closed),
                Err(e) => return Err(SessionError::Io(e)),
            }
        }
        Ok(())
    }

    /// Send close_notify, best effort
    pub fn close(&mut self, io: &mut Transport) {
        match &mut self.session {
            Session::Server(conn) => conn.send_close_notify(),
            Session::Client(conn) => conn.send_close_notify(),
        }
        if let Err(e) = self.flush(io) {
            debug!("Unable to deliver close_notify: {}", e);
        }
    }

    pub fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        match &self.session {
            Session::Server(conn) => conn.peer_certificates(),
            Session::Client(conn) => conn.peer_certificates(),
        }
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        match &self.session {
            Session::Server(conn) => conn.protocol_version(),
            Session::Client(conn) => conn.protocol_version(),
        }
    }
}

/// Would-block and interrupted are retried on the next iteration; a
/// socket whose connect is still in flight reports not-connected
fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::NotConnected
    )
}

/// Build the server context for a listener from its TLS settings
pub fn server_config(config: &TlsConfig) -> SocketResult<Arc<ServerConfig>> {
    let pem_file = config.pem_file.as_deref().ok_or_else(|| SocketError::Credentials {
        path: Default::default(),
        reason: "no pem file configured".to_string(),
    })?;
    let (certs, key) = load_credentials(pem_file)?;

    let provider = Arc::new(provider_for(&config.cipher)?);
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(protocol_versions(config.method))?;

    let builder = if config.require_client_cert {
        builder.with_client_cert_verifier(Arc::new(AcceptAnyClientCert::new(&provider)))
    } else {
        builder.with_no_client_auth()
    };

    let server = builder.with_single_cert(certs, key).map_err(|e| SocketError::Credentials {
        path: pem_file.to_path_buf(),
        reason: e.to_string(),
    })?;
    debug!("Built server tls context from {}", pem_file.display());
    Ok(Arc::new(server))
}

/// Build the client context for an outbound connection.
///
/// Without `ca_file` any server certificate is accepted. A configured pem
/// file is presented as the client certificate.
pub fn client_config(config: &TlsConfig) -> SocketResult<Arc<ClientConfig>> {
    let provider = Arc::new(provider_for(&config.cipher)?);
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(protocol_versions(config.method))?;

    let builder = match &config.ca_file {
        Some(ca_file) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_file)? {
                roots.add(cert)?;
            }
            builder.with_root_certificates(roots)
        }
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(&provider))),
    };

    let client = match &config.pem_file {
        Some(pem_file) => {
            let (certs, key) = load_credentials(pem_file)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| SocketError::Credentials {
                    path: pem_file.to_path_buf(),
                    reason: e.to_string(),
                })?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(client))
}

fn protocol_versions(method: TlsMethod) -> &'static [&'static SupportedProtocolVersion] {
    static TLS12_ONLY: [&SupportedProtocolVersion; 1] = [&rustls::version::TLS12];
    static TLS13_ONLY: [&SupportedProtocolVersion; 1] = [&rustls::version::TLS13];
    match method {
        TlsMethod::Flexible => rustls::ALL_VERSIONS,
        TlsMethod::Tls12 => &TLS12_ONLY,
        TlsMethod::Tls13 => &TLS13_ONLY,
    }
}

/// Ring provider restricted to the suites named by an OpenSSL-style cipher
/// string. TLS 1.3 suites are always kept, as OpenSSL cipher lists only
/// govern older versions.
fn provider_for(cipher: &str) -> SocketResult<CryptoProvider> {
    let mut provider = rustls::crypto::ring::default_provider();
    provider.cipher_suites = select_suites(&provider.cipher_suites, cipher)?;
    Ok(provider)
}

fn select_suites(available: &[SupportedCipherSuite], cipher: &str) -> SocketResult<Vec<SupportedCipherSuite>> {
    let tokens: Vec<String> = cipher
        .split(|c: char| c == ':' || c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .filter(|t| !t.starts_with(['!', '-', '+', '@']))
        .map(|t| t.to_ascii_uppercase())
        .collect();

    if tokens.iter().any(|t| CIPHER_ALL_KEYWORDS.contains(&t.as_str())) {
        return Ok(available.to_vec());
    }

    let wanted: Vec<String> = tokens.iter().map(|t| t.replace(['-', '_'], "")).collect();
    let mut matched = false;
    let selected: Vec<SupportedCipherSuite> = available
        .iter()
        .filter(|suite| {
            let name = format!("{:?}", suite.suite()).replace('_', "").replace("WITH", "");
            let hit = wanted.iter().any(|w| name.contains(w.as_str()));
            matched |= hit;
            hit || matches!(suite, SupportedCipherSuite::Tls13(_))
        })
        .copied()
        .collect();

    if !matched {
        warn!("Could not assign cipher [{}]", cipher);
        return Err(SocketError::Cipher(cipher.to_string()));
    }
    Ok(selected)
}

fn load_certs(path: &Path) -> SocketResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| credentials_error(path, e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| credentials_error(path, e))?;
    if certs.is_empty() {
        return Err(SocketError::Credentials {
            path: path.to_path_buf(),
            reason: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

/// Certificate chain and private key from one PEM file
pub fn load_credentials(path: &Path) -> SocketResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certs = load_certs(path)?;
    let file = File::open(path).map_err(|e| credentials_error(path, e))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| credentials_error(path, e))?
        .ok_or_else(|| SocketError::Credentials {
            path: path.to_path_buf(),
            reason: "no unencrypted private key found".to_string(),
        })?;
    Ok((certs, key))
}

fn credentials_error(path: &Path, e: io::Error) -> SocketError {
    warn!("There is a problem with your pem file [{}]: {}", path.display(), e);
    SocketError::Credentials {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

/// Accepts every server certificate; signatures are still checked
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Demands a client certificate but accepts any that is presented
#[derive(Debug)]
struct AcceptAnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyClientCert {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
