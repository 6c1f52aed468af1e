//! The crate-wide error taxonomy.
//!
//! Scheduled callbacks return `Result<(), Error>`. Most errors are local
//! to the callback that produced them and are routed to the reactor's
//! exception handler; the variants for which [`Error::is_fatal`] returns
//! true stop the loop and surface from
//! [`run_forever`](crate::Reactor::run_forever) instead.

use std::io;

use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// The secure-channel handshake did not complete within its bound.
    #[error("tls handshake timed out")]
    HandshakeTimeout,

    /// The secure-channel shutdown did not complete within its bound.
    #[error("tls shutdown timed out")]
    ShutdownTimeout,

    /// The peer went away outside the orderly shutdown path.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A benign cancellation; never reported through the exception
    /// handler.
    #[error("operation cancelled")]
    Cancelled,

    /// The completion passed to
    /// [`run_until_complete`](crate::Reactor::run_until_complete) was
    /// still unresolved when the loop stopped.
    #[error("the reactor stopped before the completion resolved")]
    NotCompleted,

    /// An interrupt request from outside the loop.
    #[error("interrupted")]
    Interrupted,

    /// An unrecoverable condition raised by a callback.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Whether this error stops the loop instead of being routed to the
    /// exception handler.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Interrupted | Self::Fatal(_))
    }

    /// Whether this error represents a benign cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error came from a handshake or shutdown deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::HandshakeTimeout | Self::ShutdownTimeout)
    }
}
