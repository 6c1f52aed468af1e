//! Cancellable callback handles.
//!
//! A [`Handle`] is the atomic unit of scheduled work: a callable captured
//! together with the `tracing` span current at scheduling time and the
//! source location of the scheduling call. Handles created by
//! [`call_soon`](crate::Reactor::call_soon) and the timer methods are
//! one-shot; handles backing reader/writer registrations are persistent
//! and re-run on every readiness report until removed or cancelled.

use std::cell::RefCell;
use std::panic::Location;
use std::rc::Rc;
use std::time::Instant;

use tracing::Span;

use crate::error::Result;
use crate::reactor::Reactor;

/// The callable form every scheduled callback is stored as.
///
/// One-shot callbacks are `FnOnce` closures adapted at the scheduling
/// call; reader/writer callbacks are genuinely re-invocable.
pub(crate) type Callback = Box<dyn FnMut(&mut Reactor) -> Result<()>>;

struct Inner {
    /// The callable, released immediately on cancellation so captured
    /// references are not retained.
    callback: Option<Callback>,

    /// Set once by [`Handle::cancel`]; never cleared.
    cancelled: bool,

    /// Whether the callable is put back after an invocation.
    repeat: bool,

    /// Span current when the handle was scheduled; entered around the
    /// callback so context-local state propagates across the suspension.
    span: Span,

    /// Source location of the scheduling call, surfaced in exception
    /// reports.
    location: &'static Location<'static>,
}

/// A one-shot or persistent scheduled callback.
///
/// Cloning a `Handle` clones the identity, not the work: all clones refer
/// to the same scheduled invocation and cancelling any of them cancels it.
#[derive(Clone)]
pub struct Handle {
    inner: Rc<RefCell<Inner>>,
}

impl Handle {
    #[track_caller]
    pub(crate) fn new(callback: Callback, repeat: bool) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                callback: Some(callback),
                cancelled: false,
                repeat,
                span: Span::current(),
                location: Location::caller(),
            })),
        }
    }

    /// Cancel the handle.
    ///
    /// The callable and everything it captured are released immediately.
    /// Cancelling a handle whose callback is currently executing has no
    /// effect on that execution.
    pub fn cancel(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.cancelled = true;
        inner.callback = None;
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.borrow().cancelled
    }

    /// Source location of the scheduling call.
    pub(crate) fn location(&self) -> &'static Location<'static> {
        self.inner.borrow().location
    }

    /// Invoke the callback.
    ///
    /// A cancelled handle is a no-op. The callable is moved out of the
    /// slot for the duration of the call, so the callback may freely
    /// schedule, cancel (including itself), or remove registrations
    /// without re-entering the slot. Persistent callables are put back
    /// afterwards unless the handle was cancelled mid-execution.
    pub(crate) fn run(&self, reactor: &mut Reactor) -> Result<()> {
        let (callback, span) = {
            let mut inner = self.inner.borrow_mut();
            if inner.cancelled {
                return Ok(());
            }
            (inner.callback.take(), inner.span.clone())
        };

        let Some(mut callback) = callback else {
            return Ok(());
        };

        let result = {
            let _guard = span.enter();
            callback(reactor)
        };

        let mut inner = self.inner.borrow_mut();
        if inner.repeat && !inner.cancelled {
            inner.callback = Some(callback);
        }

        result
    }
}

/// A [`Handle`] with an absolute deadline.
///
/// Produced by [`call_later`](crate::Reactor::call_later) and
/// [`call_at`](crate::Reactor::call_at). Cancellation marks the handle and
/// releases its callable immediately; the reactor discards the timer-set
/// entry when it surfaces at the top of the heap.
#[derive(Clone)]
pub struct TimerHandle {
    handle: Handle,
    deadline: Instant,
}

impl TimerHandle {
    pub(crate) fn new(handle: Handle, deadline: Instant) -> Self {
        Self { handle, deadline }
    }

    /// Cancel the timer. The callback will never run.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// The absolute deadline the callback is scheduled for.
    pub fn when(&self) -> Instant {
        self.deadline
    }
}
