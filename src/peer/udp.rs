//! UDP socket with the same option discipline as the TCP peer.
//!
//! Non-blocking, address/port reuse, broadcast enabled. Datagram
//! multiplexing stays outside the reactors; this is the standalone
//! send/receive surface.

use crate::error::{Error, Result};
use crate::peer::tcp::parse_ipv4;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};

/// Broadcast-capable UDP endpoint.
pub struct UdpPeer {
    socket: UdpSocket,
}

impl UdpPeer {
    /// Bind on `ip:port` with reuse and broadcast enabled.
    pub fn bind(ip: &str, port: u16) -> Result<Self> {
        let ip = parse_ipv4(ip)?;
        let addr = SocketAddr::from((ip, port));
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
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
            .set_broadcast(true)
            .map_err(|e| Error::setup("set SO_BROADCAST", e))?;
        socket
            .bind(&addr.into())
            .map_err(|e| Error::setup("bind", e))?;
        Ok(Self {
            socket: socket.into(),
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| Error::setup("getsockname", e))
    }

    /// Receive one datagram. `None` when nothing is pending.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        loop {
            match self.socket.recv_from(buf) {
                Ok((n, addr)) => return Ok(Some((n, addr))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::transport(e)),
            }
        }
    }

    /// Send one datagram, retrying interrupts. Returns bytes sent, 0 if
    /// the socket would block.
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<usize> {
        loop {
            match self.socket.send_to(data, addr) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::transport(e)),
            }
        }
    }

    /// Send to an `ip:port` pair given as a literal.
    pub fn send_to_addr(&self, data: &[u8], ip: &str, port: u16) -> Result<usize> {
        let ip = parse_ipv4(ip)?;
        self.send_to(data, SocketAddr::from((ip, port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{wait_ready, Readiness};
    use std::os::fd::AsRawFd;
    use std::time::Duration;

    #[test]
    fn datagram_round_trip_on_loopback() {
        let a = UdpPeer::bind("127.0.0.1", 0).unwrap();
        let b = UdpPeer::bind("127.0.0.1", 0).unwrap();
        let b_addr = b.local_addr().unwrap();

        let sent = a.send_to(b"ping", b_addr).unwrap();
        assert_eq!(sent, 4);

        wait_ready(
            b.socket.as_raw_fd(),
            Readiness::Readable,
            Duration::from_secs(2),
        )
        .unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[test]
    fn empty_receive_reports_none() {
        let peer = UdpPeer::bind("127.0.0.1", 0).unwrap();
        let mut buf = [0u8; 16];
        assert!(peer.recv_from(&mut buf).unwrap().is_none());
    }
}
