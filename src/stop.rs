//! Cooperative stop signalling.
//!
//! One writer, many readers: the flag is stored with release ordering
//! and observed with acquire, so whatever the stopping thread did before
//! the request is visible to every reactor that sees it. A mio waker
//! rides along so a reactor blocked in an indefinite kernel wait returns
//! within one wake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared stop flag.
#[derive(Debug, Default)]
pub struct StopFlag {
    stopped: AtomicBool,
}

impl StopFlag {
    /// Create an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop.
    pub fn request(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Whether a stop has been requested.
    pub fn is_set(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Handle for stopping one readiness reactor from any thread.
#[derive(Clone)]
pub struct StopHandle {
    pub(crate) flag: Arc<StopFlag>,
    pub(crate) waker: Arc<mio::Waker>,
}

impl StopHandle {
    /// Request a stop and wake the reactor out of its kernel wait.
    pub fn stop(&self) {
        self.flag.request();
        // A failed wake still stops the reactor at its next wait bound.
        let _ = self.waker.wake();
    }
}

/// Handle for stopping every reactor in a multi-reactor arrangement.
#[derive(Clone, Default)]
pub struct MultiStopHandle {
    pub(crate) handles: Vec<StopHandle>,
}

impl MultiStopHandle {
    /// Stop the acceptor and every worker.
    pub fn stop(&self) {
        for handle in &self.handles {
            handle.stop();
        }
    }
}
