//! TLS-terminated TCP transport over rustls.
//!
//! The socket discipline is inherited from the TCP layer; this module
//! adds the per-side TLS context and the want-read/want-write handshake
//! progression on non-blocking sockets. Server contexts load a PEM
//! certificate chain and private key (consistency-checked at listen
//! time); clients trust the webpki default roots plus an optional pinned
//! anchor, with verification disabled entirely when nothing is pinned.
//!
//! Engine errors other than want-more are fatal: the session is freed
//! before its descriptor closes, which the field order of [`TlsLink`]
//! guarantees.

use crate::config::{ReactorConfig, TlsSettings};
use crate::error::{Error, Result};
use crate::peer::{self, Link, Peer, Readiness, RecvOutcome};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{
    Certificate, ClientConfig, ClientConnection, Connection, OwnedTrustAnchor, PrivateKey,
    RootCertStore, ServerConfig, ServerConnection, ServerName,
};
use std::fs;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tracing::debug;

/// Cap on plaintext the engine will buffer ahead of the wire, so a slow
/// peer shows up as partial-send progress instead of unbounded memory.
const PLAINTEXT_BUFFER_LIMIT: usize = 64 * 1024;

/// Ignore `SIGPIPE` once per process; rustls writes go through plain
/// `write(2)` and a dead peer must surface as `EPIPE`, not a signal.
pub(crate) fn ignore_sigpipe() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

fn load_pem_items(path: &Path) -> Result<Vec<rustls_pemfile::Item>> {
    let data = fs::read(path)
        .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
    rustls_pemfile::read_all(&mut data.as_slice())
        .map_err(|e| Error::config(format!("invalid PEM in {}: {e}", path.display())))
}

/// Load every certificate in a PEM file.
pub(crate) fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let certs: Vec<Certificate> = load_pem_items(path)?
        .into_iter()
        .filter_map(|item| match item {
            rustls_pemfile::Item::X509Certificate(der) => Some(Certificate(der)),
            _ => None,
        })
        .collect();
    if certs.is_empty() {
        return Err(Error::config(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load the first private key in a PEM file (PKCS#8, RSA or SEC1).
pub(crate) fn load_key(path: &Path) -> Result<PrivateKey> {
    for item in load_pem_items(path)? {
        match item {
            rustls_pemfile::Item::PKCS8Key(der)
            | rustls_pemfile::Item::RSAKey(der)
            | rustls_pemfile::Item::ECKey(der) => return Ok(PrivateKey(der)),
            _ => {}
        }
    }
    Err(Error::config(format!(
        "no private key found in {}",
        path.display()
    )))
}

/// Drive a handshake on a non-blocking socket, waiting on readiness for
/// want-read/want-write, bounded by `timeout`.
fn drive_handshake(
    conn: &mut Connection,
    sock: &mut mio::net::TcpStream,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let fd = sock.as_raw_fd();
    while conn.is_handshaking() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::TimedOut {
                what: "tls handshake",
            });
        }
        if conn.wants_write() {
            match conn.write_tls(sock) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    peer::wait_ready(fd, Readiness::Writable, remaining)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::handshake(e)),
            }
            continue;
        }
        match conn.read_tls(sock) {
            Ok(0) => {
                return Err(Error::handshake(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed during handshake",
                )))
            }
            Ok(_) => {
                if let Err(e) = conn.process_new_packets() {
                    // Push the alert out before reporting.
                    let _ = conn.write_tls(sock);
                    return Err(Error::Tls { source: e });
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                peer::wait_ready(fd, Readiness::Readable, remaining)?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::handshake(e)),
        }
    }
    Ok(())
}

/// A TLS session over a non-blocking TCP stream.
///
/// Field order matters: the session drops (and is freed) before the
/// socket, so the descriptor outlives the engine that references it.
#[derive(Debug)]
pub struct TlsLink {
    tls: Connection,
    sock: mio::net::TcpStream,
}

impl Link for TlsLink {
    fn recv(&mut self, buf: &mut [u8]) -> Result<RecvOutcome> {
        let mut total = 0;
        let mut closed = false;
        while total < buf.len() {
            match self.tls.reader().read(&mut buf[total..]) {
                Ok(0) => {
                    // close_notify: orderly end of stream.
                    closed = true;
                    break;
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // No plaintext; pull ciphertext off the wire.
                    match self.tls.read_tls(&mut self.sock) {
                        Ok(0) => {
                            closed = true;
                            break;
                        }
                        Ok(_) => {
                            if let Err(e) = self.tls.process_new_packets() {
                                let _ = self.tls.write_tls(&mut self.sock);
                                return Err(Error::Tls { source: e });
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(Error::transport(e)),
                    }
                }
                Err(e) => return Err(Error::transport(e)),
            }
        }
        Ok(RecvOutcome {
            bytes: total,
            closed,
        })
    }

    fn send(&mut self, data: &[u8]) -> Result<usize> {
        // The engine buffers up to the plaintext limit; what it accepts
        // here is what counts as sent for offset accounting.
        let accepted = self
            .tls
            .writer()
            .write(data)
            .map_err(Error::transport)?;
        self.flush()?;
        Ok(accepted)
    }

    fn flush(&mut self) -> Result<()> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.sock) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::transport(e)),
            }
        }
        Ok(())
    }

    fn wants_flush(&self) -> bool {
        self.tls.wants_write()
    }

    fn source(&mut self) -> &mut mio::net::TcpStream {
        &mut self.sock
    }
}

/// TLS listening transport.
#[derive(Debug)]
pub struct TlsPeer {
    listener: mio::net::TcpListener,
    config: Arc<ServerConfig>,
    recv_timeout: Duration,
}

impl TlsPeer {
    /// Bind a listener and build the server context from PEM material.
    /// The key/certificate consistency check happens here, before the
    /// first accept.
    pub fn listen(ip: &str, port: u16, tls: &TlsSettings, cfg: &ReactorConfig) -> Result<Self> {
        ignore_sigpipe();
        let certs = load_certs(&tls.cert)?;
        let key = load_key(&tls.key)?;
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        let listener =
            mio::net::TcpListener::from_std(super::tcp::bind_listener(ip, port, cfg.backlog)?);
        debug!(addr = %format!("{ip}:{port}"), "tls listener bound");
        Ok(Self {
            listener,
            config: Arc::new(config),
            recv_timeout: cfg.recv_timeout,
        })
    }
}

impl Peer for TlsPeer {
    type Link = TlsLink;

    fn accept(&mut self) -> Result<Option<Self::Link>> {
        let (mut sock, addr) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(Error::transport(e)),
        };
        if let Err(e) = peer::set_recv_timeout(sock.as_raw_fd(), self.recv_timeout) {
            return Err(Error::setup("set SO_RCVTIMEO", e));
        }
        let session = ServerConnection::new(Arc::clone(&self.config))?;
        let mut tls = Connection::from(session);
        tls.set_buffer_limit(Some(PLAINTEXT_BUFFER_LIMIT));
        // A failed handshake drops session then socket; nothing dangles.
        drive_handshake(&mut tls, &mut sock, self.recv_timeout)?;
        debug!(%addr, "tls session established");
        Ok(Some(TlsLink { tls, sock }))
    }

    fn listener(&mut self) -> &mut mio::net::TcpListener {
        &mut self.listener
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::setup("getsockname", e))
    }
}

/// Certificate verifier that accepts anything; the no-pinned-anchor
/// client mode.
struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Build the client context: default roots plus an optional pinned
/// anchor (verification PEER), or no verification when nothing is
/// pinned.
fn client_config(pinned: Option<&Path>) -> Result<ClientConfig> {
    let builder = ClientConfig::builder().with_safe_defaults();
    match pinned {
        Some(path) => {
            let mut roots = RootCertStore::empty();
            roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                OwnedTrustAnchor::from_subject_spki_name_constraints(
                    ta.subject,
                    ta.spki,
                    ta.name_constraints,
                )
            }));
            for cert in load_certs(path)? {
                roots.add(&cert).map_err(|e| {
                    Error::config(format!("invalid trust anchor {}: {e}", path.display()))
                })?;
            }
            Ok(builder.with_root_certificates(roots).with_no_client_auth())
        }
        None => {
            let mut cfg = builder
                .with_root_certificates(RootCertStore::empty())
                .with_no_client_auth();
            cfg.dangerous()
                .set_certificate_verifier(Arc::new(NoVerify));
            Ok(cfg)
        }
    }
}

/// A connected, handshaken TLS client over a blocking socket.
#[derive(Debug)]
pub struct TlsClient {
    tls: ClientConnection,
    sock: std::net::TcpStream,
}

impl TlsClient {
    /// Blocking read/write view of the session, for the framed helpers.
    pub fn stream(&mut self) -> rustls::Stream<'_, ClientConnection, std::net::TcpStream> {
        rustls::Stream::new(&mut self.tls, &mut self.sock)
    }
}

/// Connect and complete the handshake, bounded by `timeout`.
///
/// With a pinned anchor the server certificate is verified against the
/// default roots plus that anchor; without one, verification is off. A
/// verification failure surfaces as a handshake error and leaves no
/// session behind.
pub fn connect(
    ip: &str,
    port: u16,
    pinned: Option<&Path>,
    timeout: Duration,
) -> Result<TlsClient> {
    ignore_sigpipe();
    let mut sock = super::tcp::connect(ip, port, timeout)?;
    let config = client_config(pinned)?;
    let server_name = ServerName::try_from(ip)
        .map_err(|_| Error::config(format!("invalid server name: {ip:?}")))?;
    let mut tls = ClientConnection::new(Arc::new(config), server_name)?;
    while tls.is_handshaking() {
        match tls.complete_io(&mut sock) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::handshake(e)),
        }
    }
    Ok(TlsClient { tls, sock })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_file_is_a_config_error() {
        let cfg = ReactorConfig::default();
        let tls = TlsSettings::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(
            TlsPeer::listen("127.0.0.1", 0, &tls, &cfg),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn pem_without_certificates_is_rejected() {
        let dir = std::env::temp_dir().join(format!("squall-pem-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("empty.pem");
        std::fs::write(&path, "not pem at all\n").unwrap();
        assert!(load_certs(&path).is_err());
        assert!(load_key(&path).is_err());
    }

    #[test]
    fn client_config_builds_in_both_modes() {
        assert!(client_config(None).is_ok());
        assert!(matches!(
            client_config(Some(Path::new("/nonexistent.pem"))),
            Err(Error::Config { .. })
        ));
    }
}
