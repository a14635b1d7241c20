//! Transport layer: stateless non-blocking socket primitives.
//!
//! The reactors depend on exactly two capabilities and nothing else:
//! a [`Peer`] that owns a listening socket and yields connections, and a
//! [`Link`] that can move bytes with partial-I/O accounting. Plain TCP
//! and TLS-terminated TCP each implement the pair; the reactors are
//! generic over them and monomorphise, so there is no dynamic dispatch
//! on the byte path.

pub mod tcp;
pub mod tls;
pub mod udp;

use crate::error::{Error, Result};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Result of a non-blocking receive drain.
///
/// `bytes` counts what was read before would-block (or the buffer
/// filled); `closed` reports end-of-stream, distinct from any error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvOutcome {
    /// Bytes read into the caller's buffer.
    pub bytes: usize,
    /// The peer closed its end of the stream.
    pub closed: bool,
}

/// A connected byte stream with non-blocking, resumable I/O.
///
/// `send` returns how many bytes moved (would-block stops the loop;
/// interrupts retry); an `Err` means nothing advanced and the connection
/// may be dead — the owner drops it, which closes the descriptor exactly
/// once. `flush`/`wants_flush` exist for engines that buffer ciphertext
/// between the caller's bytes and the wire.
pub trait Link: Send {
    /// Read until the buffer fills or the socket would block.
    fn recv(&mut self, buf: &mut [u8]) -> Result<RecvOutcome>;

    /// Write until drained or the socket would block.
    fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// Push any internally buffered bytes toward the wire.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether internally buffered bytes still wait for a writable edge.
    fn wants_flush(&self) -> bool {
        false
    }

    /// The registration handle for the event loop.
    fn source(&mut self) -> &mut mio::net::TcpStream;
}

/// A listening transport that yields connected links.
pub trait Peer {
    /// Connection type produced by `accept`.
    type Link: Link;

    /// Accept the next pending connection. `Ok(None)` means no
    /// connection is pending (would-block).
    fn accept(&mut self) -> Result<Option<Self::Link>>;

    /// The listening socket, for event-loop registration.
    fn listener(&mut self) -> &mut mio::net::TcpListener;

    /// Address the listener is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;
}

/// Direction for a bounded readiness wait.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Readiness {
    Readable,
    Writable,
}

/// Block on `poll(2)` until the descriptor is ready in the given
/// direction, retrying interrupts against a fixed deadline.
pub(crate) fn wait_ready(fd: RawFd, direction: Readiness, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let events = match direction {
        Readiness::Readable => libc::POLLIN,
        Readiness::Writable => libc::POLLOUT,
    };
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::TimedOut {
                what: "socket readiness",
            });
        }
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let millis = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc > 0 {
            return Ok(());
        }
        if rc == 0 {
            return Err(Error::TimedOut {
                what: "socket readiness",
            });
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(Error::transport(err));
        }
    }
}

/// Apply `SO_RCVTIMEO` to a descriptor.
pub(crate) fn set_recv_timeout(fd: RawFd, timeout: Duration) -> io::Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
