//! Multi-reactor arrangement: one acceptor, N worker reactors, and the
//! MPMC ring between them.
//!
//! The acceptor thread owns the listener and does nothing but accept
//! and enqueue. Workers each own an event queue and a thread; they
//! drain the ring at the head of every loop iteration. A successful
//! handoff wakes the target worker's event queue; the worker's short
//! wait timeout bounds the latency if that wake is lost. When the ring
//! stays full through the bounded retries, the acceptor answers with a
//! short framed `busy` sentinel and closes the connection.

use crate::config::MultiConfig;
use crate::error::{Error, Result};
use crate::framing;
use crate::handler::Policy;
use crate::peer::{Link, Peer};
use crate::reactor::Reactor;
use crate::ring::RingBuffer;
use crate::stop::{MultiStopHandle, StopFlag, StopHandle};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);
const LISTEN_TOKEN: Token = Token(usize::MAX - 1);

/// Payload of the refusal frame sent when the ring is full.
pub const BUSY_SENTINEL: &[u8] = b"busy";

/// Accept loop feeding the handoff ring.
pub struct Acceptor<P: Peer> {
    peer: P,
    ring: Arc<RingBuffer<P::Link>>,
    poll: Poll,
    waker: Arc<Waker>,
    stop: Arc<StopFlag>,
    worker_wakers: Vec<Arc<Waker>>,
    next_worker: usize,
    handoff_retries: usize,
    max_events: usize,
}

impl<P: Peer> Acceptor<P> {
    /// Build an acceptor over an existing ring.
    pub fn new(mut peer: P, ring: Arc<RingBuffer<P::Link>>, cfg: &MultiConfig) -> Result<Self> {
        cfg.validate()?;
        let poll = Poll::new().map_err(|e| Error::setup("epoll_create", e))?;
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKER_TOKEN).map_err(|e| Error::setup("eventfd", e))?,
        );
        poll.registry()
            .register(peer.listener(), LISTEN_TOKEN, Interest::READABLE)
            .map_err(|e| Error::setup("epoll_ctl", e))?;
        Ok(Self {
            peer,
            ring,
            poll,
            waker,
            stop: Arc::new(StopFlag::new()),
            worker_wakers: Vec::new(),
            next_worker: 0,
            handoff_retries: cfg.handoff_retries,
            max_events: cfg.reactor.max_events,
        })
    }

    /// Register a worker to be woken after each successful handoff.
    pub fn add_worker_waker(&mut self, waker: Arc<Waker>) {
        self.worker_wakers.push(waker);
    }

    /// Handle for stopping the acceptor from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Address of the owned listener.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.peer.local_addr()
    }

    /// Run until stopped.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(self.max_events);
        info!("acceptor running");
        while !self.stop.is_set() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::wait(e));
            }
            for event in events.iter() {
                if event.token() == LISTEN_TOKEN {
                    self.drain_accepts();
                }
            }
        }
        let _ = self.poll.registry().deregister(self.peer.listener());
        info!("acceptor stopped");
        Ok(())
    }

    fn drain_accepts(&mut self) {
        loop {
            match self.peer.accept() {
                Ok(Some(link)) => self.hand_off(link),
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    /// Transfer ownership of an accepted link to a worker, or refuse it.
    fn hand_off(&mut self, link: P::Link) {
        match self.ring.put(link, self.handoff_retries) {
            Ok(()) => {
                if !self.worker_wakers.is_empty() {
                    let waker = &self.worker_wakers[self.next_worker % self.worker_wakers.len()];
                    self.next_worker = self.next_worker.wrapping_add(1);
                    let _ = waker.wake();
                }
            }
            Err(mut link) => {
                warn!("handoff ring full; refusing connection");
                // Best effort: the peer may never see it on a congested
                // socket, and that is fine.
                let _ = link.send(&framing::encode(BUSY_SENTINEL));
                debug!("refused connection closed");
            }
        }
    }
}

/// One acceptor thread plus N worker reactors.
pub struct MultiReactor<P, Pol>
where
    P: Peer + Send + 'static,
    P::Link: Send + 'static,
    Pol: Policy + Clone + Send + 'static,
{
    acceptor: Acceptor<P>,
    workers: Vec<Reactor<P, Pol>>,
}

impl<P, Pol> MultiReactor<P, Pol>
where
    P: Peer + Send + 'static,
    P::Link: Send + 'static,
    Pol: Policy + Clone + Send + 'static,
{
    /// Build the arrangement: shared ring, N workers (short wait
    /// timeout), and the acceptor wired to wake them.
    pub fn new(peer: P, policy: Pol, cfg: MultiConfig) -> Result<Self> {
        cfg.validate()?;
        let ring = Arc::new(RingBuffer::new(cfg.ring_capacity));
        let mut worker_cfg = cfg.reactor.clone();
        worker_cfg.poll_timeout = Some(cfg.worker_poll);

        let mut workers = Vec::with_capacity(cfg.workers);
        for _ in 0..cfg.workers {
            workers.push(Reactor::worker(
                Arc::clone(&ring),
                policy.clone(),
                worker_cfg.clone(),
            )?);
        }
        let mut acceptor = Acceptor::new(peer, ring, &cfg)?;
        for worker in &workers {
            acceptor.add_worker_waker(worker.waker());
        }
        Ok(Self { acceptor, workers })
    }

    /// Handle covering the acceptor and every worker.
    pub fn stop_handle(&self) -> MultiStopHandle {
        let mut handles = vec![self.acceptor.stop_handle()];
        handles.extend(self.workers.iter().map(|w| w.stop_handle()));
        MultiStopHandle { handles }
    }

    /// Address of the listener.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Spawn the workers and run the acceptor on the calling thread.
    /// Returns after a stop, once every worker has joined.
    pub fn run(mut self) -> Result<()> {
        let worker_stops: Vec<StopHandle> = self.workers.iter().map(|w| w.stop_handle()).collect();
        let mut joins = Vec::with_capacity(self.workers.len());
        for (i, mut worker) in self.workers.drain(..).enumerate() {
            let handle = thread::Builder::new()
                .name(format!("squall-worker-{i}"))
                .spawn(move || worker.run())
                .map_err(|e| Error::setup("spawn worker", e))?;
            joins.push(handle);
        }
        let result = self.acceptor.run();
        if result.is_err() {
            // The acceptor died; take the workers down with it.
            for stop in &worker_stops {
                stop.stop();
            }
        }
        let mut first_err = result.err();
        for handle in joins {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => first_err = first_err.or(Some(e)),
                Err(_) => {
                    first_err =
                        first_err.or_else(|| Some(Error::reactor("worker thread panicked")))
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
