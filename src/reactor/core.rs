use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::os::fd::RawFd;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::{Duration, Instant};

use tracing::{error, trace};

use super::event::Event;
use super::poller::{Poller, Waker};
use super::registration::PollRegistration;
use crate::error::{Error, Result};
use crate::handle::{Callback, Handle, TimerHandle};

thread_local! {
    /// Guards against two reactors running on the same thread.
    static RUNNING_ON_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// An entry in the reactor timer set.
///
/// Ordered by deadline, ties broken by insertion sequence. The comparison
/// is reversed so a `BinaryHeap<TimerEntry>` behaves as a min-heap where
/// the earliest deadline is popped first.
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    handle: Handle,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A callback submitted from another thread.
struct RemoteCall {
    callback: Box<dyn FnOnce(&mut Reactor) -> Result<()> + Send>,
    cancelled: Arc<AtomicBool>,
}

/// A `Send + Clone` entry point for scheduling work onto the reactor
/// from other threads.
///
/// Obtained from [`Reactor::remote`]. Submissions are appended through a
/// channel and paired with a wake of the poller, so a blocked poll
/// returns promptly and the callback runs on the reactor thread in the
/// next iteration.
#[derive(Clone)]
pub struct RemoteScheduler {
    sender: Sender<RemoteCall>,
    waker: Arc<Waker>,
}

impl RemoteScheduler {
    /// Schedule `callback` to run on the reactor thread.
    ///
    /// Safe to call from any thread. Returns a [`RemoteHandle`] whose
    /// cancellation is best-effort: it prevents execution if it lands
    /// before the reactor dequeues the entry.
    pub fn call_soon(
        &self,
        callback: impl FnOnce(&mut Reactor) -> Result<()> + Send + 'static,
    ) -> RemoteHandle {
        let cancelled = Arc::new(AtomicBool::new(false));

        let _ = self.sender.send(RemoteCall {
            callback: Box::new(callback),
            cancelled: cancelled.clone(),
        });
        self.waker.wake();

        RemoteHandle { cancelled }
    }
}

/// Cancellation token for a cross-thread scheduled callback.
pub struct RemoteHandle {
    cancelled: Arc<AtomicBool>,
}

impl RemoteHandle {
    /// Request cancellation. Best-effort; see
    /// [`RemoteScheduler::call_soon`].
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Release);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }
}

/// Structured context handed to the exception handler.
///
/// Carries at minimum a human-readable message; the error value and the
/// source location of the scheduling call are attached when available.
pub struct ExceptionContext<'a> {
    /// Human-readable description of the failure.
    pub message: String,

    /// The error value, when the failure carries one.
    pub error: Option<&'a Error>,

    /// Where the failing callback was scheduled from.
    pub location: Option<&'static Location<'static>>,
}

/// The callback invoked for errors that are local to a scheduled callback.
pub type ExceptionHandler = Box<dyn FnMut(&ExceptionContext<'_>)>;

/// A single-threaded, run-to-completion callback reactor.
///
/// The reactor owns the ready queue, the timer set, and the per-descriptor
/// registration table. Each iteration it blocks in the poller (bounded by
/// the nearest timer deadline), turns readiness into queued handles,
/// promotes due timers, and drains a snapshot of the ready queue in FIFO
/// order, running exactly one callback at a time to completion.
///
/// All scheduling methods take the reactor explicitly; there is no ambient
/// global. The reactor is not `Send`: it is created, run, and closed on
/// one thread, and the only cross-thread entry point is the
/// [`RemoteScheduler`] returned by [`remote`](Self::remote).
pub struct Reactor {
    /// FIFO of handles due to run this or the next iteration.
    ready: VecDeque<Handle>,

    /// Timer set, ordered by (deadline, insertion sequence).
    timers: BinaryHeap<TimerEntry>,

    /// Insertion counter breaking deadline ties.
    timer_seq: u64,

    /// Per-descriptor reader/writer registrations.
    polls: HashMap<RawFd, PollRegistration>,

    /// Platform readiness backend.
    poller: Poller,

    /// Reusable readiness event buffer.
    events: Vec<Event>,

    /// Receiving side of the cross-thread submission channel.
    remote_rx: Receiver<RemoteCall>,

    /// Kept so `remote()` can mint new schedulers after creation.
    remote_tx: Sender<RemoteCall>,

    /// Poller wake handle shared with remote schedulers.
    waker: Arc<Waker>,

    running: bool,
    stopping: bool,
    closed: bool,

    /// Replaceable sink for callback-local errors.
    exception_handler: Option<ExceptionHandler>,

    /// Fatal error recorded during draining, re-raised from
    /// `run_forever` after the loop unwinds.
    fatal: Option<Error>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    /// Create a new reactor.
    pub fn new() -> Self {
        let poller = Poller::new();
        let waker = poller.waker();
        let (remote_tx, remote_rx) = channel();

        Self {
            ready: VecDeque::new(),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            polls: HashMap::new(),
            poller,
            events: Vec::with_capacity(64),
            remote_rx,
            remote_tx,
            waker,
            running: false,
            stopping: false,
            closed: false,
            exception_handler: None,
            fatal: None,
        }
    }

    /// The reactor's monotonic clock, used for [`call_at`](Self::call_at)
    /// deadlines.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Whether the reactor is currently inside
    /// [`run_forever`](Self::run_forever).
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Schedule `callback` to run on the next loop iteration.
    ///
    /// Callbacks scheduled this way run in FIFO registration order
    /// relative to each other.
    ///
    /// # Panics
    ///
    /// Panics if the reactor has been closed.
    #[track_caller]
    pub fn call_soon(
        &mut self,
        callback: impl FnOnce(&mut Reactor) -> Result<()> + 'static,
    ) -> Handle {
        self.check_closed("call_soon");

        let handle = Handle::new(adapt_once(callback), false);
        self.ready.push_back(handle.clone());
        handle
    }

    /// Schedule `callback` to run after `delay`.
    ///
    /// A zero delay is normalized to an immediate ready-queue entry
    /// rather than a timer.
    ///
    /// # Panics
    ///
    /// Panics if the reactor has been closed.
    #[track_caller]
    pub fn call_later(
        &mut self,
        delay: Duration,
        callback: impl FnOnce(&mut Reactor) -> Result<()> + 'static,
    ) -> TimerHandle {
        self.call_at(Instant::now() + delay, callback)
    }

    /// Schedule `callback` to run at the absolute `deadline`.
    ///
    /// A deadline at or before now is normalized to an immediate
    /// ready-queue entry rather than a timer.
    ///
    /// # Panics
    ///
    /// Panics if the reactor has been closed.
    #[track_caller]
    pub fn call_at(
        &mut self,
        deadline: Instant,
        callback: impl FnOnce(&mut Reactor) -> Result<()> + 'static,
    ) -> TimerHandle {
        self.check_closed("call_at");

        let handle = Handle::new(adapt_once(callback), false);

        if deadline <= Instant::now() {
            self.ready.push_back(handle.clone());
        } else {
            self.timer_seq += 1;
            self.timers.push(TimerEntry {
                deadline,
                seq: self.timer_seq,
                handle: handle.clone(),
            });
        }

        TimerHandle::new(handle, deadline)
    }

    /// Return a `Send + Clone` scheduler for submitting callbacks from
    /// other threads.
    pub fn remote(&self) -> RemoteScheduler {
        RemoteScheduler {
            sender: self.remote_tx.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Register (or replace) the read-readiness callback for `fd`.
    ///
    /// The callback runs each time the descriptor reports readable and
    /// stays registered until [`remove_reader`](Self::remove_reader) or
    /// cancellation. Replacing an existing reader cancels the previous
    /// handle without disturbing a writer registered on the same
    /// descriptor.
    ///
    /// # Panics
    ///
    /// Panics if the reactor has been closed.
    #[track_caller]
    pub fn add_reader(
        &mut self,
        fd: RawFd,
        callback: impl FnMut(&mut Reactor) -> Result<()> + 'static,
    ) -> Handle {
        self.check_closed("add_reader");

        let handle = Handle::new(Box::new(callback), true);
        let registration = self.polls.entry(fd).or_insert_with(PollRegistration::new);
        let existed = !registration.is_empty();

        if let Some(previous) = registration.reader.replace(handle.clone()) {
            previous.cancel();
        }

        let interest = registration.interest();
        if existed {
            self.poller.reregister(fd, interest);
        } else {
            self.poller.register(fd, interest);
        }

        handle
    }

    /// Register (or replace) the write-readiness callback for `fd`.
    ///
    /// See [`add_reader`](Self::add_reader).
    ///
    /// # Panics
    ///
    /// Panics if the reactor has been closed.
    #[track_caller]
    pub fn add_writer(
        &mut self,
        fd: RawFd,
        callback: impl FnMut(&mut Reactor) -> Result<()> + 'static,
    ) -> Handle {
        self.check_closed("add_writer");

        let handle = Handle::new(Box::new(callback), true);
        let registration = self.polls.entry(fd).or_insert_with(PollRegistration::new);
        let existed = !registration.is_empty();

        if let Some(previous) = registration.writer.replace(handle.clone()) {
            previous.cancel();
        }

        let interest = registration.interest();
        if existed {
            self.poller.reregister(fd, interest);
        } else {
            self.poller.register(fd, interest);
        }

        handle
    }

    /// Remove the read-readiness callback for `fd`.
    ///
    /// Returns whether a reader was registered. The registration is
    /// destroyed outright when no writer remains.
    pub fn remove_reader(&mut self, fd: RawFd) -> bool {
        let Some(registration) = self.polls.get_mut(&fd) else {
            return false;
        };

        let Some(handle) = registration.reader.take() else {
            return false;
        };
        handle.cancel();

        if registration.is_empty() {
            self.polls.remove(&fd);
            self.poller.deregister(fd);
        } else {
            let interest = registration.interest();
            self.poller.reregister(fd, interest);
        }

        true
    }

    /// Remove the write-readiness callback for `fd`.
    ///
    /// Returns whether a writer was registered.
    pub fn remove_writer(&mut self, fd: RawFd) -> bool {
        let Some(registration) = self.polls.get_mut(&fd) else {
            return false;
        };

        let Some(handle) = registration.writer.take() else {
            return false;
        };
        handle.cancel();

        if registration.is_empty() {
            self.polls.remove(&fd);
            self.poller.deregister(fd);
        } else {
            let interest = registration.interest();
            self.poller.reregister(fd, interest);
        }

        true
    }

    /// Replace the exception handler.
    ///
    /// The handler receives every error that is local to a scheduled
    /// callback. The default handler logs at `error` level.
    pub fn set_exception_handler(&mut self, handler: impl FnMut(&ExceptionContext<'_>) + 'static) {
        self.exception_handler = Some(Box::new(handler));
    }

    /// Route an error context through the installed exception handler,
    /// or the logging default when none is installed.
    pub fn call_exception_handler(&mut self, context: &ExceptionContext<'_>) {
        // Taken out for the duration of the call so the handler itself
        // may replace it.
        match self.exception_handler.take() {
            Some(mut handler) => {
                handler(context);
                if self.exception_handler.is_none() {
                    self.exception_handler = Some(handler);
                }
            }
            None => {
                error!(
                    message = %context.message,
                    error = ?context.error,
                    location = ?context.location.map(|l| l.to_string()),
                    "unhandled error in scheduled callback"
                );
            }
        }
    }

    /// Run the loop until [`stop`](Self::stop) is called.
    ///
    /// A fatal error recorded while draining callbacks is returned after
    /// the loop has unwound.
    ///
    /// # Panics
    ///
    /// Panics if the reactor is closed, already running, or another
    /// reactor is already running on this thread.
    pub fn run_forever(&mut self) -> Result<()> {
        assert!(!self.closed, "run_forever called on a closed reactor");
        assert!(!self.running, "reactor is already running");
        RUNNING_ON_THREAD.with(|active| {
            assert!(
                !active.get(),
                "another reactor is already running on this thread"
            );
            active.set(true);
        });

        self.running = true;
        self.stopping = false;
        trace!("reactor started");

        let result = loop {
            if let Err(err) = self.turn() {
                break Err(err);
            }
            if let Some(err) = self.fatal.take() {
                break Err(err);
            }
            if self.stopping {
                break Ok(());
            }
        };

        self.running = false;
        self.stopping = false;
        RUNNING_ON_THREAD.with(|active| active.set(false));
        trace!("reactor stopped");

        result
    }

    /// Run a single loop iteration.
    ///
    /// Blocks in the poller until the next event, timer deadline, or
    /// remote wake-up when no work is ready. Exposed so embedders and
    /// tests can step the loop deterministically.
    ///
    /// # Panics
    ///
    /// Panics if the reactor has been closed.
    pub fn run_once(&mut self) -> Result<()> {
        assert!(!self.closed, "run_once called on a closed reactor");

        self.turn()?;
        match self.fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run the loop until `completion` resolves.
    ///
    /// Attaches a done-callback that stops the loop, then delegates to
    /// [`run_forever`](Self::run_forever). Returns
    /// [`Error::NotCompleted`] if the loop stopped before the completion
    /// was resolved.
    pub fn run_until_complete<T: 'static>(
        &mut self,
        completion: crate::completion::Completion<T>,
    ) -> Result<T> {
        completion.on_done(self, |reactor| {
            reactor.stop();
            Ok(())
        });

        self.run_forever()?;

        completion.try_take().ok_or(Error::NotCompleted)
    }

    /// Request the loop to stop.
    ///
    /// Implemented as a scheduled handle that sets the stopping flag, so
    /// all work queued before the stop request still runs before
    /// [`run_forever`](Self::run_forever) returns.
    pub fn stop(&mut self) {
        let _ = self.call_soon(|reactor| {
            reactor.stopping = true;
            Ok(())
        });
    }

    /// Close the reactor.
    ///
    /// Cancels every queued handle and timer and releases all poll
    /// registrations. Irreversible; idempotent after the first call.
    ///
    /// # Panics
    ///
    /// Panics if called while the reactor is running.
    pub fn close(&mut self) {
        assert!(!self.running, "cannot close a running reactor");

        if self.closed {
            return;
        }
        self.closed = true;

        for handle in self.ready.drain(..) {
            handle.cancel();
        }
        while let Some(entry) = self.timers.pop() {
            entry.handle.cancel();
        }
        for (fd, mut registration) in self.polls.drain() {
            registration.cancel_all();
            self.poller.deregister(fd);
        }

        trace!("reactor closed");
    }

    /// One full iteration: poll, dispatch readiness, drain remote
    /// submissions, promote due timers, drain the ready-queue snapshot.
    fn turn(&mut self) -> Result<()> {
        let timeout = self.poll_timeout();
        self.poller.poll(&mut self.events, timeout)?;

        // Readiness becomes queued handles; the callbacks themselves run
        // from the ready queue below, interleaved with due timers.
        let events = std::mem::take(&mut self.events);
        for event in &events {
            if let Some(registration) = self.polls.get(&event.fd) {
                if event.readable {
                    if let Some(handle) = &registration.reader {
                        self.ready.push_back(handle.clone());
                    }
                }
                if event.writable {
                    if let Some(handle) = &registration.writer {
                        self.ready.push_back(handle.clone());
                    }
                }
            }
        }
        self.events = events;

        while let Ok(call) = self.remote_rx.try_recv() {
            let RemoteCall {
                callback,
                cancelled,
            } = call;
            if cancelled.load(AtomicOrdering::Acquire) {
                continue;
            }

            let mut callback = Some(callback);
            let handle = Handle::new(
                Box::new(move |reactor| {
                    if cancelled.load(AtomicOrdering::Acquire) {
                        return Ok(());
                    }
                    match callback.take() {
                        Some(callback) => callback(reactor),
                        None => Ok(()),
                    }
                }),
                false,
            );
            self.ready.push_back(handle);
        }

        let now = Instant::now();
        while let Some(entry) = self.timers.peek() {
            if entry.handle.is_cancelled() {
                self.timers.pop();
                continue;
            }
            if entry.deadline > now {
                break;
            }

            let entry = self.timers.pop().expect("peeked timer entry");
            self.ready.push_back(entry.handle);
        }

        // Snapshot drain: handles scheduled by callbacks in this
        // iteration run in the next one.
        let ntodo = self.ready.len();
        for _ in 0..ntodo {
            let Some(handle) = self.ready.pop_front() else {
                break;
            };
            if handle.is_cancelled() {
                continue;
            }

            if let Err(err) = handle.run(self) {
                self.report_callback_error(&handle, err);
            }
            if self.fatal.is_some() {
                break;
            }
        }

        Ok(())
    }

    /// Compute how long the poller may block.
    fn poll_timeout(&mut self) -> Option<Duration> {
        if !self.ready.is_empty() {
            return Some(Duration::ZERO);
        }

        // Cancelled entries at the top of the heap are discarded here so
        // they do not shorten the wait.
        while let Some(entry) = self.timers.peek() {
            if entry.handle.is_cancelled() {
                self.timers.pop();
                continue;
            }
            return Some(entry.deadline.saturating_duration_since(Instant::now()));
        }

        None
    }

    /// Route a callback error: fatal classes stop the loop, everything
    /// else goes to the exception handler.
    fn report_callback_error(&mut self, handle: &Handle, err: Error) {
        if err.is_fatal() {
            self.fatal = Some(err);
            self.stopping = true;
            return;
        }

        let context = ExceptionContext {
            message: format!("error in callback scheduled at {}", handle.location()),
            error: Some(&err),
            location: Some(handle.location()),
        };
        self.call_exception_handler(&context);
    }

    fn check_closed(&self, what: &str) {
        assert!(!self.closed, "{what} called on a closed reactor");
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if !self.running && !self.closed {
            self.close();
        }
    }
}

/// Adapt a one-shot closure to the stored callable form.
fn adapt_once(callback: impl FnOnce(&mut Reactor) -> Result<()> + 'static) -> Callback {
    let mut callback = Some(callback);
    Box::new(move |reactor| match callback.take() {
        Some(callback) => callback(reactor),
        None => Ok(()),
    })
}
