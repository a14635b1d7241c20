//! Reactors: event loops that own connections and drive their
//! receive/send state machines.
//!
//! The readiness variant lives here (edge-triggered epoll via mio);
//! [`uring`] holds the completion variant and [`multi`] the
//! acceptor-plus-workers arrangement over the MPMC ring.
//!
//! Edge-triggered discipline: level transitions are reported exactly
//! once, so readable handling drains until would-block and writable
//! handling writes until would-block or the response is gone. Write
//! interest is armed only while a response is in flight (or, for TLS,
//! while the engine holds unflushed ciphertext).

pub mod multi;
#[cfg(feature = "io-uring")]
pub mod uring;

use crate::config::ReactorConfig;
use crate::error::{Error, Result};
use crate::handler::{Handler, Policy};
use crate::peer::{Link, Peer};
use crate::pool::{Pool, Reset};
use crate::ring::RingBuffer;
use crate::stop::{StopFlag, StopHandle};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Scratch buffer size for the read drain.
const RECV_CHUNK: usize = 4096;

/// Token of the cross-thread waker.
const WAKER_TOKEN: Token = Token(usize::MAX);
/// Token of the listening socket.
const LISTEN_TOKEN: Token = Token(usize::MAX - 1);

/// One pooled connection slot: the link, its interest state and the
/// embedded handler. The slot index doubles as the mio token.
struct Conn<L> {
    link: Option<L>,
    want_write: bool,
    handler: Handler,
}

impl<L> Default for Conn<L> {
    fn default() -> Self {
        Self {
            link: None,
            want_write: false,
            handler: Handler::default(),
        }
    }
}

impl<L> Reset for Conn<L> {
    fn reset(&mut self) {
        // Dropping the link closes the descriptor (and frees a TLS
        // session first, by its field order).
        self.link = None;
        self.want_write = false;
        self.handler.reset();
    }
}

/// Readiness reactor, generic over the transport and the processing
/// policy. One OS thread; all connection state is thread-local.
pub struct Reactor<P: Peer, Pol: Policy> {
    poll: Poll,
    peer: Option<P>,
    conns: Pool<Conn<P::Link>>,
    intake: Option<Arc<RingBuffer<P::Link>>>,
    policy: Pol,
    cfg: ReactorConfig,
    stop: Arc<StopFlag>,
    waker: Arc<Waker>,
}

impl<P: Peer, Pol: Policy> Reactor<P, Pol> {
    fn build(
        peer: Option<P>,
        intake: Option<Arc<RingBuffer<P::Link>>>,
        policy: Pol,
        cfg: ReactorConfig,
    ) -> Result<Self> {
        cfg.validate()?;
        let poll = Poll::new().map_err(|e| Error::setup("epoll_create", e))?;
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKER_TOKEN).map_err(|e| Error::setup("eventfd", e))?,
        );
        let conns = Pool::new(cfg.event_pool);
        Ok(Self {
            poll,
            peer,
            conns,
            intake,
            policy,
            cfg,
            stop: Arc::new(StopFlag::new()),
            waker,
        })
    }

    /// Build a serving reactor: it owns the listener and accepts.
    pub fn serve(mut peer: P, policy: Pol, cfg: ReactorConfig) -> Result<Self> {
        let reactor = Self::build(None, None, policy, cfg)?;
        reactor
            .poll
            .registry()
            .register(peer.listener(), LISTEN_TOKEN, Interest::READABLE)
            .map_err(|e| Error::setup("epoll_ctl", e))?;
        Ok(Self {
            peer: Some(peer),
            ..reactor
        })
    }

    /// Build a worker reactor: no listener, connections arrive through
    /// the handoff ring.
    pub fn worker(
        intake: Arc<RingBuffer<P::Link>>,
        policy: Pol,
        cfg: ReactorConfig,
    ) -> Result<Self> {
        Self::build(None, Some(intake), policy, cfg)
    }

    /// Handle for stopping this reactor from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// The reactor's waker; the acceptor uses it to signal a handoff.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Address of the owned listener, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.peer.as_ref().and_then(|p| p.local_addr().ok())
    }

    /// Run until stopped. Transient conditions never escape; fatal
    /// connection errors close that connection and the loop continues.
    /// Only a failing kernel wait ends the loop with an error.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(self.cfg.max_events);
        let mut scratch = [0u8; RECV_CHUNK];
        info!(
            pool = self.cfg.event_pool,
            worker = self.peer.is_none(),
            "reactor running"
        );
        while !self.stop.is_set() {
            self.drain_intake();
            if let Err(e) = self.poll.poll(&mut events, self.cfg.poll_timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.shutdown();
                return Err(Error::wait(e));
            }
            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {}
                    LISTEN_TOKEN => self.on_accept(),
                    Token(idx) => {
                        let mut close = event.is_error();
                        if !close && event.is_readable() {
                            close = self.on_readable(idx, &mut scratch);
                        }
                        if !close && event.is_writable() {
                            close = self.on_writable(idx);
                        }
                        if close {
                            self.close_conn(idx);
                        }
                    }
                }
            }
        }
        self.shutdown();
        info!("reactor stopped");
        Ok(())
    }

    /// Adopt connections queued by the acceptor.
    fn drain_intake(&mut self) {
        let Some(ring) = self.intake.as_ref().map(Arc::clone) else {
            return;
        };
        while let Some(link) = ring.try_take() {
            self.admit(link);
        }
    }

    /// Register a new connection with read interest.
    fn admit(&mut self, mut link: P::Link) {
        let Some(idx) = self.conns.acquire() else {
            warn!("event pool exhausted; dropping connection");
            return;
        };
        if let Err(e) = self
            .poll
            .registry()
            .register(link.source(), Token(idx), Interest::READABLE)
        {
            warn!(error = %e, "failed to register connection");
            self.conns.release(idx);
            return;
        }
        let conn = self.conns.get_mut(idx);
        conn.link = Some(link);
        conn.want_write = false;
    }

    /// Accept until would-block. Accept failures are degraded-but-
    /// running: log and stop draining this readiness burst.
    fn on_accept(&mut self) {
        loop {
            let Some(peer) = self.peer.as_mut() else {
                return;
            };
            match peer.accept() {
                Ok(Some(link)) => self.admit(link),
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    /// Drain reads, process, and arm write interest when a response
    /// appears. Returns `true` when the connection must close.
    fn on_readable(&mut self, idx: usize, scratch: &mut [u8]) -> bool {
        loop {
            let conn = self.conns.get_mut(idx);
            let Some(link) = conn.link.as_mut() else {
                return false;
            };
            let out = match link.recv(scratch) {
                Ok(out) => out,
                Err(e) => {
                    debug!(error = %e, "recv failed");
                    return true;
                }
            };
            if out.bytes > 0 {
                conn.handler.append_recv(&scratch[..out.bytes]);
                self.policy.process(&mut conn.handler);
                if conn.handler.has_response() {
                    conn.want_write = true;
                    if let Err(e) = self.poll.registry().reregister(
                        link.source(),
                        Token(idx),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(error = %e, "failed to arm write interest");
                        return true;
                    }
                }
            }
            if out.closed {
                return true;
            }
            if out.bytes < scratch.len() {
                // Would-block reached; the next edge will wake us.
                return false;
            }
        }
    }

    /// Write until the response drains or the socket would block; on
    /// drain, pick up any bytes parked during the send, then disarm
    /// write interest. Returns `true` when the connection must close.
    fn on_writable(&mut self, idx: usize) -> bool {
        loop {
            let conn = self.conns.get_mut(idx);
            let Some(link) = conn.link.as_mut() else {
                return false;
            };
            if let Err(e) = link.flush() {
                debug!(error = %e, "flush failed");
                return true;
            }
            if !conn.handler.is_sending() {
                self.policy.process(&mut conn.handler);
                if !conn.handler.has_response() {
                    break;
                }
            }
            let n = match link.send(conn.handler.pending()) {
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "send failed");
                    return true;
                }
            };
            let more = conn.handler.still_sending(n);
            if more && n == 0 {
                // Would-block with bytes left; stay write-armed.
                return false;
            }
        }
        let conn = self.conns.get_mut(idx);
        let Some(link) = conn.link.as_mut() else {
            return false;
        };
        if link.wants_flush() {
            return false;
        }
        if conn.want_write {
            conn.want_write = false;
            if let Err(e) =
                self.poll
                    .registry()
                    .reregister(link.source(), Token(idx), Interest::READABLE)
            {
                warn!(error = %e, "failed to disarm write interest");
                return true;
            }
        }
        false
    }

    /// Deregister, close and recycle a connection slot.
    fn close_conn(&mut self, idx: usize) {
        let conn = self.conns.get_mut(idx);
        if let Some(mut link) = conn.link.take() {
            let _ = self.poll.registry().deregister(link.source());
        }
        self.conns.release(idx);
    }

    /// Close everything this reactor owns.
    fn shutdown(&mut self) {
        for conn in self.conns.slots_mut() {
            if let Some(mut link) = conn.link.take() {
                let _ = self.poll.registry().deregister(link.source());
            }
        }
        if let Some(peer) = self.peer.as_mut() {
            let _ = self.poll.registry().deregister(peer.listener());
        }
    }
}
