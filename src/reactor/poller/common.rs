//! Pieces shared by the platform poller backends.

use std::os::fd::RawFd;

/// The readiness directions registered for a file descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Interest {
    /// No interest in either direction. Only the kqueue backend needs
    /// this; its deregistration is expressed as an empty filter set.
    #[allow(dead_code)]
    pub(crate) const NONE: Interest = Interest {
        read: false,
        write: false,
    };
}

/// A cross-thread wake-up handle for a blocked poll call.
///
/// Wraps the backend's wake descriptor: the `eventfd` on Linux, the
/// write end of the self-pipe on macOS. The backend provides the
/// matching `wake` implementation.
pub(crate) struct Waker(pub(crate) RawFd);

// The wrapped descriptor is only ever written to, which is safe from
// any thread.
unsafe impl Send for Waker {}
unsafe impl Sync for Waker {}
