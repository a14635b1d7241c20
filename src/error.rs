//! Error types for the squall server core.
//!
//! One crate-wide enum, sorted by the stage at which things fail:
//! configuration before any resource exists, setup while acquiring
//! kernel resources, and transport once bytes are moving. Transient
//! socket conditions (would-block, interrupted, TLS want-read/want-write)
//! never appear here; the transport primitives absorb them and report
//! partial byte counts instead.

use std::io;

/// Result type alias for squall operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the reactors and transports.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration, rejected before any socket is created.
    #[error("configuration error: {message}")]
    Config {
        /// What was wrong with the configuration.
        message: String,
    },

    /// A resource-acquisition stage failed (socket, bind, listen,
    /// event-queue creation, ...).
    #[error("{stage} failed: {source}")]
    Setup {
        /// The operation that failed.
        stage: &'static str,
        /// The underlying OS error.
        source: io::Error,
    },

    /// A fatal connection-level transport error. The connection is dead;
    /// the owner drops it and the reactor continues.
    #[error("transport error: {source}")]
    Transport {
        /// The underlying OS error.
        source: io::Error,
    },

    /// The TLS engine rejected something other than want-more.
    #[error("tls error: {source}")]
    Tls {
        /// The underlying rustls error.
        #[from]
        source: rustls::Error,
    },

    /// The TLS handshake did not complete.
    #[error("tls handshake failed: {source}")]
    Handshake {
        /// The I/O-level failure, possibly wrapping an alert.
        source: io::Error,
    },

    /// Waiting on the kernel event queue failed; the reactor loop
    /// terminates with this.
    #[error("event wait failed: {source}")]
    Wait {
        /// The underlying OS error.
        source: io::Error,
    },

    /// A bounded wait ran out of time.
    #[error("timed out waiting for {what}")]
    TimedOut {
        /// What was being waited for.
        what: &'static str,
    },

    /// Reactor-internal invariant failure (e.g. submission queue
    /// overflow that survived a flush).
    #[error("reactor error: {message}")]
    Reactor {
        /// Description of the failure.
        message: String,
    },
}

impl Error {
    /// Create a configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a setup error for a named stage.
    pub fn setup(stage: &'static str, source: io::Error) -> Self {
        Self::Setup { stage, source }
    }

    /// Create a fatal transport error.
    pub fn transport(source: io::Error) -> Self {
        Self::Transport { source }
    }

    /// Create a handshake error.
    pub fn handshake(source: io::Error) -> Self {
        Self::Handshake { source }
    }

    /// Create an event-wait error.
    pub fn wait(source: io::Error) -> Self {
        Self::Wait { source }
    }

    /// Create a reactor-internal error.
    pub fn reactor<S: Into<String>>(message: S) -> Self {
        Self::Reactor {
            message: message.into(),
        }
    }

    /// Error category, for logs and exit-code mapping.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Setup { .. } => "setup",
            Self::Transport { .. } => "transport",
            Self::Tls { .. } | Self::Handshake { .. } => "tls",
            Self::Wait { .. } => "wait",
            Self::TimedOut { .. } => "timeout",
            Self::Reactor { .. } => "reactor",
        }
    }
}
