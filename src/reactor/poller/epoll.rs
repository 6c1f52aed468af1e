//! Linux `epoll`-based poller implementation.
//!
//! This module provides the Linux backend for the reactor.
//! It is functionally equivalent to the macOS `kqueue` poller and
//! exposes the same interface to the reactor.
//!
//! Responsibilities:
//! - Register file descriptors with read/write interests
//! - Block waiting for I/O readiness, bounded by the nearest timer
//! - Wake the reactor when work is submitted from another thread
//!
//! This backend is selected automatically on Linux targets.

use super::common::{Interest, Waker};
use crate::reactor::event::Event;

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLOUT, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Reserved descriptor marker used internally for the wake-up event.
///
/// This value must never collide with a real file descriptor.
/// Using `u64::MAX` guarantees uniqueness.
const WAKE_TOKEN: u64 = u64::MAX;

/// Linux `epoll` poller.
///
/// This poller owns:
/// - an `epoll` instance,
/// - an internal `eventfd` used as a wake-up signal,
/// - a reusable event buffer.
///
/// The wake-up mechanism allows other threads (remote schedulers)
/// to interrupt a blocking `epoll_wait()` call.
pub(crate) struct EpollPoller {
    /// Epoll file descriptor.
    epoll: RawFd,

    /// Reusable buffer for epoll events.
    events: Vec<epoll_event>,

    /// Waker wrapping the internal eventfd.
    waker: Arc<Waker>,
}

unsafe impl Send for EpollPoller {}

impl Waker {
    /// Wake the poller.
    ///
    /// This writes to the internal `eventfd`, causing `epoll_wait`
    /// to return immediately.
    pub(crate) fn wake(&self) {
        let buf: u64 = 1;
        unsafe {
            libc::write(self.0, &buf as *const _ as *const _, 8);
        }
    }
}

impl EpollPoller {
    /// Create a new `EpollPoller`.
    ///
    /// This:
    /// - creates the epoll instance,
    /// - creates a non-blocking `eventfd`,
    /// - registers the eventfd into epoll as a persistent wake source.
    pub(crate) fn new() -> Self {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        assert!(epoll >= 0, "epoll_create1 failed");

        let eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(eventfd >= 0, "eventfd failed");

        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };

        let rc = unsafe { epoll_ctl(epoll, EPOLL_CTL_ADD, eventfd, &mut event) };
        assert!(rc == 0, "failed to register wake eventfd");

        Self {
            epoll,
            events: Vec::with_capacity(64),
            waker: Arc::new(Waker(eventfd)),
        }
    }

    /// Return the poller waker.
    ///
    /// The reactor hands this to remote schedulers so a blocked
    /// `epoll_wait` is interrupted when cross-thread work arrives.
    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Register a file descriptor with the poller.
    pub(crate) fn register(&self, fd: RawFd, interest: Interest) {
        let mut event = epoll_event {
            events: interest_flags(interest),
            u64: fd as u64,
        };

        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_ADD, fd, &mut event) };
        debug_assert_eq!(rc, 0);
    }

    /// Update interest flags for an already registered descriptor.
    pub(crate) fn reregister(&self, fd: RawFd, interest: Interest) {
        let mut event = epoll_event {
            events: interest_flags(interest),
            u64: fd as u64,
        };

        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_MOD, fd, &mut event) };
        debug_assert_eq!(rc, 0);
    }

    /// Remove a file descriptor from the poller.
    pub(crate) fn deregister(&self, fd: RawFd) {
        unsafe {
            epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    /// Poll for I/O readiness events.
    ///
    /// Blocks until:
    /// - at least one file descriptor becomes ready,
    /// - the wake event is triggered,
    /// - or the optional timeout expires.
    pub(crate) fn poll(
        &mut self,
        events: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let timeout_ms = timeout.map(duration_to_ms).unwrap_or(-1);

        unsafe {
            self.events.set_len(self.events.capacity());
        }

        let n = unsafe {
            epoll_wait(
                self.epoll,
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                unsafe {
                    self.events.set_len(0);
                }
                return Ok(());
            }
            return Err(err);
        }

        unsafe {
            self.events.set_len(n as usize);
        }

        events.clear();

        for ev in &self.events {
            // Wake-up event
            if ev.u64 == WAKE_TOKEN {
                let mut buf = 0u64;
                unsafe {
                    libc::read(self.waker.0, &mut buf as *mut _ as *mut _, 8);
                }
                continue;
            }

            let fd = ev.u64 as RawFd;

            // Descriptor errors count as readiness in both directions.
            let failed = ev.events & ((EPOLLERR | EPOLLHUP) as u32) != 0;
            let readable = failed || ev.events & (EPOLLIN as u32) != 0;
            let writable = failed || ev.events & (EPOLLOUT as u32) != 0;

            if let Some(e) = events.iter_mut().find(|e| e.fd == fd) {
                e.readable |= readable;
                e.writable |= writable;
            } else {
                events.push(Event {
                    fd,
                    readable,
                    writable,
                });
            }
        }

        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.waker.0);
            libc::close(self.epoll);
        }
    }
}

/// Convert an [`Interest`] into epoll flag bits.
fn interest_flags(interest: Interest) -> u32 {
    let mut flags = 0;

    if interest.read {
        flags |= EPOLLIN;
    }
    if interest.write {
        flags |= EPOLLOUT;
    }

    flags as u32
}

/// Convert a poll timeout into whole milliseconds, rounding up so a
/// sub-millisecond timer deadline does not spin at zero. Deadlines
/// beyond the `i32` range saturate; they must not wrap negative, which
/// `epoll_wait` would read as an unbounded block.
fn duration_to_ms(timeout: Duration) -> i32 {
    let mut ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    if timeout.subsec_nanos() % 1_000_000 != 0 {
        ms = ms.saturating_add(1);
    }
    ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_millisecond_timeouts_round_up() {
        assert_eq!(duration_to_ms(Duration::from_micros(100)), 1);
        assert_eq!(duration_to_ms(Duration::from_millis(5)), 5);
        assert_eq!(duration_to_ms(Duration::ZERO), 0);
    }

    #[test]
    fn distant_deadlines_saturate_instead_of_wrapping() {
        let forty_days = Duration::from_secs(60 * 60 * 24 * 40);
        assert_eq!(duration_to_ms(forty_days), i32::MAX);
        assert_eq!(duration_to_ms(Duration::MAX), i32::MAX);
    }
}
