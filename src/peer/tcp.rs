//! Plain TCP transport.
//!
//! Non-blocking sockets throughout: the listener is built with
//! `SO_REUSEADDR` and `SO_REUSEPORT`, accepted descriptors arrive
//! non-blocking and close-on-exec with a receive timeout applied, sends
//! use `MSG_NOSIGNAL`, and every byte-moving loop stops at would-block
//! and retries on interrupt. `connect` performs a non-blocking connect
//! finalised by a bounded writable wait and an `SO_ERROR` check.

use crate::config::ReactorConfig;
use crate::error::{Error, Result};
use crate::peer::{self, Link, Peer, Readiness, RecvOutcome};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::time::Duration;
use tracing::debug;

/// Parse an IPv4 literal, rejecting everything else before a socket
/// exists.
pub(crate) fn parse_ipv4(ip: &str) -> Result<Ipv4Addr> {
    ip.parse::<Ipv4Addr>()
        .map_err(|_| Error::config(format!("invalid IPv4 literal: {ip:?}")))
}

/// Build a non-blocking listening socket. Each stage fails with its own
/// setup error: socket creation, non-blocking flag, address reuse, port
/// reuse, bind, listen.
pub(crate) fn bind_listener(ip: &str, port: u16, backlog: i32) -> Result<std::net::TcpListener> {
    let ip = parse_ipv4(ip)?;
    let addr = SocketAddr::from((ip, port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::setup("socket", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::setup("set O_NONBLOCK", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::setup("set SO_REUSEADDR", e))?;
    socket
        .set_reuse_port(true)
        .map_err(|e| Error::setup("set SO_REUSEPORT", e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| Error::setup("bind", e))?;
    socket
        .listen(backlog)
        .map_err(|e| Error::setup("listen", e))?;
    Ok(socket.into())
}

/// TCP listening transport.
pub struct TcpPeer {
    listener: mio::net::TcpListener,
    recv_timeout: Duration,
}

impl TcpPeer {
    /// Bind a listener on `ip:port`. Port 0 picks an ephemeral port.
    pub fn listen(ip: &str, port: u16, cfg: &ReactorConfig) -> Result<Self> {
        let listener = mio::net::TcpListener::from_std(bind_listener(ip, port, cfg.backlog)?);
        debug!(addr = %format!("{ip}:{port}"), "tcp listener bound");
        Ok(Self {
            listener,
            recv_timeout: cfg.recv_timeout,
        })
    }
}

impl Peer for TcpPeer {
    type Link = mio::net::TcpStream;

    fn accept(&mut self) -> Result<Option<Self::Link>> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                // Accepted non-blocking and close-on-exec by accept4.
                if let Err(e) = peer::set_recv_timeout(stream.as_raw_fd(), self.recv_timeout) {
                    return Err(Error::setup("set SO_RCVTIMEO", e));
                }
                debug!(%addr, "accepted tcp connection");
                Ok(Some(stream))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::transport(e)),
        }
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

impl Link for mio::net::TcpStream {
    fn recv(&mut self, buf: &mut [u8]) -> Result<RecvOutcome> {
        let mut total = 0;
        let mut closed = false;
        while total < buf.len() {
            match Read::read(self, &mut buf[total..]) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::transport(e)),
            }
        }
        Ok(RecvOutcome {
            bytes: total,
            closed,
        })
    }

    fn send(&mut self, data: &[u8]) -> Result<usize> {
        send_nosignal(self.as_raw_fd(), data)
    }

    fn source(&mut self) -> &mut mio::net::TcpStream {
        self
    }
}

/// Write with `MSG_NOSIGNAL` until drained or would-block.
pub(crate) fn send_nosignal(fd: std::os::fd::RawFd, data: &[u8]) -> Result<usize> {
    let mut sent = 0;
    while sent < data.len() {
        let rest = &data[sent..];
        let n = unsafe {
            libc::send(
                fd,
                rest.as_ptr() as *const libc::c_void,
                rest.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => break,
                io::ErrorKind::Interrupted => continue,
                _ => return Err(Error::transport(err)),
            }
        }
        if n == 0 {
            break;
        }
        sent += n as usize;
    }
    Ok(sent)
}

/// Connect to `ip:port` with a bounded wait.
///
/// The connect itself runs non-blocking; writable readiness plus an
/// `SO_ERROR` check finalises it. The returned stream is switched back
/// to blocking with the receive timeout applied, ready for the framed
/// client helpers.
pub fn connect(ip: &str, port: u16, timeout: Duration) -> Result<std::net::TcpStream> {
    let ip = parse_ipv4(ip)?;
    let addr = SocketAddr::from((ip, port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::setup("socket", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::setup("set O_NONBLOCK", e))?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
            peer::wait_ready(socket.as_raw_fd(), Readiness::Writable, timeout)?;
            match socket.take_error() {
                Ok(None) => {}
                Ok(Some(err)) => return Err(Error::transport(err)),
                Err(err) => return Err(Error::setup("get SO_ERROR", err)),
            }
        }
        Err(e) => return Err(Error::transport(e)),
    }
    socket
        .set_nonblocking(false)
        .map_err(|e| Error::setup("clear O_NONBLOCK", e))?;
    peer::set_recv_timeout(socket.as_raw_fd(), timeout)
        .map_err(|e| Error::setup("set SO_RCVTIMEO", e))?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_ip_literal() {
        let cfg = ReactorConfig::default();
        assert!(matches!(
            TcpPeer::listen("not-an-ip", 0, &cfg),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            TcpPeer::listen("::1", 0, &cfg),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn ephemeral_bind_reports_address() {
        let cfg = ReactorConfig::default();
        let peer = TcpPeer::listen("127.0.0.1", 0, &cfg).unwrap();
        let addr = peer.local_addr().unwrap();
        assert_eq!(addr.ip(), std::net::IpAddr::from(Ipv4Addr::LOCALHOST));
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn accept_reports_would_block_when_idle() {
        let cfg = ReactorConfig::default();
        let mut peer = TcpPeer::listen("127.0.0.1", 0, &cfg).unwrap();
        assert!(peer.accept().unwrap().is_none());
    }

    #[test]
    fn connect_to_dead_port_fails() {
        // Bind then drop, so the port is very likely unbound.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let err = connect("127.0.0.1", port, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(
            err,
            Error::Transport { .. } | Error::TimedOut { .. }
        ));
    }
}
