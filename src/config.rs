//! Configuration for the reactors and transports.
//!
//! Plain structs with defaults matching the tuning the server shipped
//! with; `validate()` runs before any kernel resource is created so a
//! bad configuration never gets as far as a socket.

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Tuning for a readiness reactor (single-reactor server or one worker).
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Listen backlog.
    pub backlog: i32,
    /// Receive timeout applied to every accepted descriptor; also bounds
    /// the TLS handshake waits.
    pub recv_timeout: Duration,
    /// Number of preallocated connection event slots.
    pub event_pool: usize,
    /// Capacity of the readiness event buffer per wait.
    pub max_events: usize,
    /// Wait timeout. `None` waits indefinitely (single-reactor mode);
    /// workers use a short timeout to bound handoff latency.
    pub poll_timeout: Option<Duration>,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            backlog: 511,
            recv_timeout: Duration::from_secs(3),
            event_pool: 1024,
            max_events: 1024,
            poll_timeout: None,
        }
    }
}

impl ReactorConfig {
    /// Check the configuration before any resource is created.
    pub fn validate(&self) -> Result<()> {
        if self.backlog <= 0 {
            return Err(Error::config("backlog must be positive"));
        }
        if self.event_pool == 0 {
            return Err(Error::config("event pool must hold at least one slot"));
        }
        if self.max_events == 0 {
            return Err(Error::config("event buffer must hold at least one entry"));
        }
        Ok(())
    }
}

/// Tuning for the multi-reactor arrangement.
#[derive(Debug, Clone)]
pub struct MultiConfig {
    /// Number of worker reactors (and threads).
    pub workers: usize,
    /// Capacity of the handoff ring; must be a power of two >= 2.
    pub ring_capacity: usize,
    /// Bounded retries when the acceptor enqueues onto a full ring.
    pub handoff_retries: usize,
    /// Worker wait timeout; bounds how long a newly queued connection
    /// waits if the wakeup is lost.
    pub worker_poll: Duration,
    /// Per-worker reactor tuning.
    pub reactor: ReactorConfig,
}

impl Default for MultiConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            ring_capacity: 1024,
            handoff_retries: 10,
            worker_poll: Duration::from_millis(10),
            reactor: ReactorConfig::default(),
        }
    }
}

impl MultiConfig {
    /// Check the configuration before any resource is created.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("at least one worker is required"));
        }
        if self.ring_capacity < 2 || !self.ring_capacity.is_power_of_two() {
            return Err(Error::config(
                "ring capacity must be a power of two and at least 2",
            ));
        }
        self.reactor.validate()
    }
}

/// Tuning for the completion (io_uring) reactor.
#[cfg(feature = "io-uring")]
#[derive(Debug, Clone)]
pub struct UringConfig {
    /// Listen backlog.
    pub backlog: i32,
    /// Submission queue entries.
    pub sq_entries: u32,
    /// Completion queue entries.
    pub cq_entries: u32,
    /// One-shot accepts kept in flight.
    pub accept_depth: usize,
    /// Number of preallocated connection slots.
    pub conn_pool: usize,
    /// Entries in the provided buffer group; must be a power of two.
    pub buf_entries: u16,
    /// Size of each provided buffer in bytes.
    pub buf_size: usize,
    /// Period of the timeout operation that bounds the kernel wait, so a
    /// stop request is honoured within one tick.
    pub tick: Duration,
}

#[cfg(feature = "io-uring")]
impl Default for UringConfig {
    fn default() -> Self {
        Self {
            backlog: 511,
            sq_entries: 512,
            cq_entries: 1024,
            accept_depth: 256,
            conn_pool: 256,
            buf_entries: 1024,
            buf_size: 4096,
            tick: Duration::from_millis(100),
        }
    }
}

#[cfg(feature = "io-uring")]
impl UringConfig {
    /// Check the configuration before any resource is created.
    pub fn validate(&self) -> Result<()> {
        if self.backlog <= 0 {
            return Err(Error::config("backlog must be positive"));
        }
        if self.sq_entries == 0 || self.cq_entries == 0 {
            return Err(Error::config("queue sizes must be positive"));
        }
        if self.conn_pool == 0 {
            return Err(Error::config("connection pool must hold at least one slot"));
        }
        if self.accept_depth == 0 {
            return Err(Error::config("at least one in-flight accept is required"));
        }
        if self.buf_entries < 2 || !self.buf_entries.is_power_of_two() {
            return Err(Error::config(
                "buffer group entries must be a power of two and at least 2",
            ));
        }
        if self.buf_size == 0 {
            return Err(Error::config("buffer size must be positive"));
        }
        if self.tick.is_zero() {
            return Err(Error::config("tick must be positive"));
        }
        Ok(())
    }
}

/// Server-side TLS material: PEM certificate chain and private key.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// PEM-encoded certificate chain.
    pub cert: PathBuf,
    /// PEM-encoded private key (PKCS#8, RSA or SEC1).
    pub key: PathBuf,
}

impl TlsSettings {
    /// Build settings from certificate and key paths.
    pub fn new(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ReactorConfig::default().validate().unwrap();
        MultiConfig::default().validate().unwrap();
        #[cfg(feature = "io-uring")]
        UringConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_ring() {
        let cfg = MultiConfig {
            ring_capacity: 100,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_pool() {
        let cfg = ReactorConfig {
            event_pool: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[cfg(feature = "io-uring")]
    #[test]
    fn rejects_odd_buffer_group() {
        let cfg = UringConfig {
            buf_entries: 1000,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
