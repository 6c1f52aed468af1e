use std::os::fd::RawFd;

/// An I/O readiness event reported by the poller.
///
/// An `Event` carries readiness information for a registered file
/// descriptor. It is produced by the poller and consumed by the reactor,
/// which turns it into ready-queue entries for the matching registration.
///
/// A descriptor-level error reported by the backend is folded into both
/// directions: the read and write callbacks run and discover the error
/// through the underlying I/O call.
pub(crate) struct Event {
    /// The file descriptor the readiness applies to.
    pub(crate) fd: RawFd,

    /// Indicates that the file descriptor is readable.
    pub(crate) readable: bool,

    /// Indicates that the file descriptor is writable.
    pub(crate) writable: bool,
}
