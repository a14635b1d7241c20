//! # squall: event-driven TCP/TLS server core
//!
//! A Linux-oriented reactor framework: accept many concurrent
//! connections, drive per-connection receive/send state machines off a
//! readiness or completion kernel interface, and hand sessions between
//! acceptor and worker stages through a bounded lock-free queue.
//!
//! ## Architecture
//!
//! ```text
//! listener ── accept ──► Link (TCP or TLS session)
//!     │                     │ single-reactor: adopted directly
//!     │                     ▼
//!     │              MPMC ring buffer ──► worker reactors (multi)
//!     │                     │
//!     ▼                     ▼
//! readiness reactor (epoll, edge-triggered)
//! completion reactor (io_uring, multishot recv + buffer group)
//! ```
//!
//! Per connection, a [`handler::Handler`] accumulates inbound bytes, a
//! [`handler::Policy`] stages the response, and the reactor resumes
//! partial sends until the buffer drains. One OS thread per reactor;
//! the only cross-thread structure is the [`ring::RingBuffer`].
//!
//! ## Quick start
//!
//! ```no_run
//! use squall::{Reactor, Reflect, ReactorConfig, TcpPeer};
//!
//! fn main() -> squall::Result<()> {
//!     let cfg = ReactorConfig::default();
//!     let peer = TcpPeer::listen("127.0.0.1", 7000, &cfg)?;
//!     let mut reactor = Reactor::serve(peer, Reflect, cfg)?;
//!     let stop = reactor.stop_handle();
//!     ctrlc_like_hookup(stop); // signal handling is up to the caller
//!     reactor.run()
//! }
//! # fn ctrlc_like_hookup(_stop: squall::StopHandle) {}
//! ```

#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod framing;
pub mod handler;
pub mod peer;
pub mod pool;
pub mod reactor;
pub mod ring;
pub mod stop;

pub use config::{MultiConfig, ReactorConfig, TlsSettings};
#[cfg(feature = "io-uring")]
pub use config::UringConfig;
pub use error::{Error, Result};
pub use handler::{Handler, Policy, Reflect};
pub use peer::tcp::TcpPeer;
pub use peer::tls::TlsPeer;
pub use peer::udp::UdpPeer;
pub use peer::{Link, Peer, RecvOutcome};
pub use pool::{Pool, Reset};
pub use reactor::multi::{Acceptor, MultiReactor};
#[cfg(feature = "io-uring")]
pub use reactor::uring::{UringReactor, UringStopHandle};
pub use reactor::Reactor;
pub use ring::RingBuffer;
pub use stop::{MultiStopHandle, StopFlag, StopHandle};
