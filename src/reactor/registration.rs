//! Per-descriptor readiness registrations.

use crate::handle::Handle;
use crate::reactor::poller::Interest;

/// The reader/writer callbacks registered for one file descriptor.
///
/// A registration exists only while at least one slot is occupied; the
/// reactor destroys it (and deregisters the descriptor from the poller)
/// as soon as both interests have been removed. The derived [`Interest`]
/// is always the union of the occupied slots.
pub(crate) struct PollRegistration {
    /// Handle run on read readiness.
    pub(crate) reader: Option<Handle>,

    /// Handle run on write readiness.
    pub(crate) writer: Option<Handle>,
}

impl PollRegistration {
    pub(crate) fn new() -> Self {
        Self {
            reader: None,
            writer: None,
        }
    }

    /// The interest mask matching the occupied slots.
    pub(crate) fn interest(&self) -> Interest {
        Interest {
            read: self.reader.is_some(),
            write: self.writer.is_some(),
        }
    }

    /// Whether both slots are empty and the registration can be dropped.
    pub(crate) fn is_empty(&self) -> bool {
        self.reader.is_none() && self.writer.is_none()
    }

    /// Cancel whichever handles are still registered.
    pub(crate) fn cancel_all(&mut self) {
        if let Some(handle) = self.reader.take() {
            handle.cancel();
        }
        if let Some(handle) = self.writer.take() {
            handle.cancel();
        }
    }
}
