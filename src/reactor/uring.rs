//! Completion reactor over io_uring.
//!
//! Submission/completion model with a kernel-provided buffer group: a
//! configurable depth of one-shot accepts stays in flight (each
//! completion re-arms one), every connection runs a multishot receive
//! that consumes group buffers as bytes arrive, and sends are one-shot
//! submissions re-issued until the handler reports drain.
//!
//! Every in-flight operation carries a pool token in its user-data:
//! the slot index plus an operation kind in the high bits. A slot is
//! reclaimed only when its receive chain has ended (`!CQE_F_MORE`) and
//! no send is in flight, so a stale completion can never observe a
//! recycled slot. Fatal send errors shut the socket down instead of
//! closing it outright, letting the receive chain terminate through the
//! kernel first.

use crate::config::UringConfig;
use crate::error::{Error, Result};
use crate::handler::{Handler, Policy};
use crate::peer::tcp::bind_listener;
use crate::pool::{Pool, Reset};
use crate::stop::StopFlag;
use io_uring::{cqueue, opcode, squeue, types, IoUring, Probe};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use tracing::{debug, info, warn};

const ACCEPT_TOKEN: u64 = u64::MAX;
const TICK_TOKEN: u64 = u64::MAX - 1;
const PROVIDE_TOKEN: u64 = u64::MAX - 2;

const KIND_SHIFT: u32 = 48;
const KIND_RECV: u64 = 1;
const KIND_SEND: u64 = 2;

fn token(kind: u64, idx: usize) -> u64 {
    (kind << KIND_SHIFT) | idx as u64
}

fn split_token(user_data: u64) -> (u64, usize) {
    (
        user_data >> KIND_SHIFT,
        (user_data & ((1u64 << KIND_SHIFT) - 1)) as usize,
    )
}

/// One pooled connection: descriptor, handler, and chain accounting.
#[derive(Default)]
struct UringConn {
    fd: Option<OwnedFd>,
    handler: Handler,
    recv_live: bool,
    sends: u32,
}

impl Reset for UringConn {
    fn reset(&mut self) {
        self.fd = None;
        self.handler.reset();
        self.recv_live = false;
        self.sends = 0;
    }
}

/// Handle for stopping a completion reactor; honoured within one tick.
#[derive(Clone)]
pub struct UringStopHandle {
    flag: Arc<StopFlag>,
}

impl UringStopHandle {
    /// Request a stop.
    pub fn stop(&self) {
        self.flag.request();
    }
}

/// io_uring-based TCP echo reactor.
///
/// Field order is teardown order: the ring drops (and the kernel
/// cancels and drains every in-flight operation) before the buffer
/// memory or the connection slots go away.
pub struct UringReactor<Pol: Policy> {
    ring: IoUring,
    listener: std::net::TcpListener,
    conns: Pool<UringConn>,
    buffers: Vec<u8>,
    tick_ts: types::Timespec,
    policy: Pol,
    cfg: UringConfig,
    bgid: u16,
    stop: Arc<StopFlag>,
}

impl<Pol: Policy> UringReactor<Pol> {
    /// Bind a listener and set up the ring. Fails fast when the kernel
    /// lacks multishot receive or provided buffers.
    pub fn bind(ip: &str, port: u16, policy: Pol, cfg: UringConfig) -> Result<Self> {
        cfg.validate()?;
        if cfg.buf_size > i32::MAX as usize {
            return Err(Error::config("buffer size exceeds i32 range"));
        }
        let listener = bind_listener(ip, port, cfg.backlog)?;
        // io_uring parks operations on readiness internally; the
        // listener stays blocking so completions never spin on EAGAIN.
        listener
            .set_nonblocking(false)
            .map_err(|e| Error::setup("clear O_NONBLOCK", e))?;

        let ring = IoUring::builder()
            .setup_cqsize(cfg.cq_entries)
            .build(cfg.sq_entries)
            .map_err(|e| Error::setup("io_uring_setup", e))?;

        let mut probe = Probe::new();
        ring.submitter()
            .register_probe(&mut probe)
            .map_err(|e| Error::setup("io_uring_probe", e))?;
        for (op, name) in [
            (opcode::RecvMulti::CODE, "multishot receive"),
            (opcode::ProvideBuffers::CODE, "provided buffers"),
            (opcode::Accept::CODE, "async accept"),
        ] {
            if !probe.is_supported(op) {
                return Err(Error::reactor(format!("kernel lacks {name} support")));
            }
        }

        let buffers = vec![0u8; cfg.buf_entries as usize * cfg.buf_size];
        let tick_ts = types::Timespec::new()
            .sec(cfg.tick.as_secs())
            .nsec(cfg.tick.subsec_nanos());
        let conns = Pool::new(cfg.conn_pool);
        info!(
            sq = cfg.sq_entries,
            cq = cfg.cq_entries,
            buffers = cfg.buf_entries,
            "completion reactor bound"
        );
        Ok(Self {
            ring,
            listener,
            conns,
            buffers,
            tick_ts,
            policy,
            cfg,
            bgid: 1,
            stop: Arc::new(StopFlag::new()),
        })
    }

    /// Handle for stopping this reactor from another thread.
    pub fn stop_handle(&self) -> UringStopHandle {
        UringStopHandle {
            flag: Arc::clone(&self.stop),
        }
    }

    /// Address of the owned listener.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::setup("getsockname", e))
    }

    /// Run until stopped. In-flight completions already reaped are
    /// finished before returning; teardown cancels the rest.
    pub fn run(&mut self) -> Result<()> {
        // Install the buffer group, the accept depth and the tick now
        // that the reactor has its final address.
        let base = self.buffers.as_mut_ptr();
        let provide = opcode::ProvideBuffers::new(
            base,
            self.cfg.buf_size as i32,
            self.cfg.buf_entries,
            self.bgid,
            0,
        )
        .build()
        .user_data(PROVIDE_TOKEN);
        self.push(provide)?;
        for _ in 0..self.cfg.accept_depth {
            self.push_accept()?;
        }
        self.push_tick()?;

        info!("completion reactor running");
        while !self.stop.is_set() {
            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::wait(e)),
            }
            loop {
                let Some(cqe) = self.ring.completion().next() else {
                    break;
                };
                // Per-completion failures stay local to the connection
                // involved; only a failing wait ends the loop.
                if let Err(e) = self.on_completion(cqe) {
                    warn!(error = %e, "completion handling failed");
                }
            }
        }
        info!("completion reactor stopped");
        Ok(())
    }

    fn on_completion(&mut self, cqe: cqueue::Entry) -> Result<()> {
        let user_data = cqe.user_data();
        let res = cqe.result();
        let flags = cqe.flags();
        match user_data {
            TICK_TOKEN => {
                // Expires with -ETIME by design; it only bounds the wait.
                self.push_tick()
            }
            PROVIDE_TOKEN => {
                if res < 0 {
                    return Err(Error::setup(
                        "io_uring_provide_buffers",
                        io::Error::from_raw_os_error(-res),
                    ));
                }
                Ok(())
            }
            ACCEPT_TOKEN => {
                self.push_accept()?;
                if res < 0 {
                    let err = io::Error::from_raw_os_error(-res);
                    if err.kind() != io::ErrorKind::WouldBlock {
                        warn!(error = %err, "accept failed");
                    }
                    return Ok(());
                }
                self.admit(res as RawFd)
            }
            _ => {
                let (kind, idx) = split_token(user_data);
                match kind {
                    KIND_RECV => self.on_recv(idx, res, flags),
                    KIND_SEND => self.on_send(idx, res),
                    _ => {
                        warn!(user_data, "completion with unknown token");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Adopt a freshly accepted descriptor and arm its receive chain.
    fn admit(&mut self, raw: RawFd) -> Result<()> {
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let Some(idx) = self.conns.acquire() else {
            warn!("connection pool exhausted; dropping connection");
            return Ok(());
        };
        let recv = opcode::RecvMulti::new(types::Fd(raw), self.bgid)
            .build()
            .user_data(token(KIND_RECV, idx));
        if let Err(e) = self.push(recv) {
            self.conns.release(idx);
            return Err(e);
        }
        let conn = self.conns.get_mut(idx);
        conn.fd = Some(fd);
        conn.recv_live = true;
        debug!(fd = raw, slot = idx, "connection admitted");
        Ok(())
    }

    fn on_recv(&mut self, idx: usize, res: i32, flags: u32) -> Result<()> {
        let more = cqueue::more(flags);
        if res < 0 {
            let err = io::Error::from_raw_os_error(-res);
            if -res == libc::ENOBUFS {
                warn!(slot = idx, "buffer group exhausted; closing connection");
            } else if err.kind() == io::ErrorKind::WouldBlock {
                // Spurious wakeup; re-arm if the chain ended.
                if !more {
                    return self.rearm_recv(idx);
                }
                return Ok(());
            } else {
                debug!(slot = idx, error = %err, "receive failed");
            }
            if !more {
                self.conns.get_mut(idx).recv_live = false;
            }
            self.maybe_close(idx);
            return Ok(());
        }

        if res > 0 {
            if let Some(bid) = cqueue::buffer_select(flags) {
                let n = res as usize;
                let start = bid as usize * self.cfg.buf_size;
                {
                    let conn = self.conns.get_mut(idx);
                    conn.handler.append_recv(&self.buffers[start..start + n]);
                    self.policy.process(&mut conn.handler);
                }
                // The bytes are copied out; hand the buffer straight
                // back to the group.
                self.provide_buffer(bid)?;
                let conn = self.conns.get_mut(idx);
                if conn.handler.has_response() {
                    self.push_send(idx)?;
                }
            }
        }

        if res == 0 || !more {
            // End of stream, or the multishot armed itself out.
            let conn = self.conns.get_mut(idx);
            conn.recv_live = false;
            if res != 0 && conn.fd.is_some() {
                // Chain ended with the peer still alive: re-arm.
                return self.rearm_recv(idx);
            }
            self.maybe_close(idx);
        }
        Ok(())
    }

    fn on_send(&mut self, idx: usize, res: i32) -> Result<()> {
        {
            let conn = self.conns.get_mut(idx);
            conn.sends = conn.sends.saturating_sub(1);
        }
        if res < 0 {
            let err = io::Error::from_raw_os_error(-res);
            debug!(slot = idx, error = %err, "send failed");
            // Let the receive chain terminate through the kernel; the
            // slot is reclaimed when it reports !MORE.
            let conn = self.conns.get_mut(idx);
            if let Some(fd) = conn.fd.as_ref() {
                unsafe { libc::shutdown(fd.as_raw_fd(), libc::SHUT_RDWR) };
            }
            self.maybe_close(idx);
            return Ok(());
        }
        let conn = self.conns.get_mut(idx);
        if conn.handler.still_sending(res as usize) {
            return self.push_send(idx);
        }
        // Drained: pick up bytes parked during the send.
        self.policy.process(&mut conn.handler);
        let conn = self.conns.get_mut(idx);
        if conn.handler.has_response() {
            return self.push_send(idx);
        }
        self.maybe_close(idx);
        Ok(())
    }

    /// Close and recycle once nothing references the slot: the receive
    /// chain is dead and no send is in flight.
    fn maybe_close(&mut self, idx: usize) {
        let conn = self.conns.get_mut(idx);
        if conn.recv_live || conn.sends > 0 || conn.fd.is_none() {
            return;
        }
        debug!(slot = idx, "connection closed");
        self.conns.release(idx);
    }

    fn rearm_recv(&mut self, idx: usize) -> Result<()> {
        let conn = self.conns.get_mut(idx);
        let Some(fd) = conn.fd.as_ref() else {
            return Ok(());
        };
        let recv = opcode::RecvMulti::new(types::Fd(fd.as_raw_fd()), self.bgid)
            .build()
            .user_data(token(KIND_RECV, idx));
        conn.recv_live = true;
        if let Err(e) = self.push(recv) {
            let conn = self.conns.get_mut(idx);
            conn.recv_live = false;
            self.maybe_close(idx);
            return Err(e);
        }
        Ok(())
    }

    fn push_send(&mut self, idx: usize) -> Result<()> {
        let conn = self.conns.get_mut(idx);
        let Some(fd) = conn.fd.as_ref() else {
            return Ok(());
        };
        let pending = conn.handler.pending();
        let send = opcode::Send::new(
            types::Fd(fd.as_raw_fd()),
            pending.as_ptr(),
            pending.len() as u32,
        )
        .flags(libc::MSG_NOSIGNAL)
        .build()
        .user_data(token(KIND_SEND, idx));
        conn.sends += 1;
        if let Err(e) = self.push(send) {
            let conn = self.conns.get_mut(idx);
            conn.sends = conn.sends.saturating_sub(1);
            self.maybe_close(idx);
            return Err(e);
        }
        Ok(())
    }

    fn push_accept(&mut self) -> Result<()> {
        let accept = opcode::Accept::new(
            types::Fd(self.listener.as_raw_fd()),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
        .flags(libc::SOCK_CLOEXEC)
        .build()
        .user_data(ACCEPT_TOKEN);
        self.push(accept)
    }

    fn push_tick(&mut self) -> Result<()> {
        let tick = opcode::Timeout::new(&self.tick_ts)
            .build()
            .user_data(TICK_TOKEN);
        self.push(tick)
    }

    fn provide_buffer(&mut self, bid: u16) -> Result<()> {
        let start = bid as usize * self.cfg.buf_size;
        let addr = self.buffers[start..].as_mut_ptr();
        let provide = opcode::ProvideBuffers::new(addr, self.cfg.buf_size as i32, 1, self.bgid, bid)
            .build()
            .user_data(PROVIDE_TOKEN);
        self.push(provide)
    }

    /// Queue a submission, flushing once if the queue is full.
    fn push(&mut self, sqe: squeue::Entry) -> Result<()> {
        unsafe {
            if self.ring.submission().push(&sqe).is_ok() {
                return Ok(());
            }
        }
        self.ring.submit().map_err(Error::wait)?;
        unsafe {
            self.ring
                .submission()
                .push(&sqe)
                .map_err(|_| Error::reactor("submission queue overflow"))
        }
    }
}
