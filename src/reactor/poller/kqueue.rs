//! macOS `kqueue`-based poller implementation.
//!
//! This module provides the macOS backend for the reactor.
//! It is functionally equivalent to the Linux `epoll` poller and
//! exposes the same interface to the reactor.
//!
//! Responsibilities:
//! - Register file descriptors with read/write filters
//! - Block waiting for I/O readiness, bounded by the nearest timer
//! - Wake the reactor when work is submitted from another thread
//!
//! This backend is selected automatically on macOS targets.

use super::common::{Interest, Waker};
use crate::reactor::event::Event;

use libc::{
    EV_ADD, EV_DELETE, EV_EOF, EV_ERROR, EVFILT_READ, EVFILT_WRITE, kevent, kqueue, timespec,
};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// macOS `kqueue` poller.
///
/// This poller owns:
/// - a `kqueue` instance,
/// - a self-pipe used as a wake-up signal,
/// - a reusable event buffer.
///
/// The wake-up mechanism allows other threads (remote schedulers)
/// to interrupt a blocking `kevent()` call.
pub(crate) struct KqueuePoller {
    /// Kqueue file descriptor.
    kq: RawFd,

    /// Read end of the self-pipe.
    wake_rx: RawFd,

    /// Reusable buffer for kernel events.
    events: Vec<libc::kevent>,

    /// Waker wrapping the write end of the self-pipe.
    waker: Arc<Waker>,
}

unsafe impl Send for KqueuePoller {}

impl Waker {
    /// Wake the poller.
    ///
    /// This writes a byte to the self-pipe, causing `kevent`
    /// to return immediately.
    pub(crate) fn wake(&self) {
        let buf: u8 = 1;
        unsafe {
            libc::write(self.0, &buf as *const _ as *const _, 1);
        }
    }
}

impl KqueuePoller {
    /// Create a new `KqueuePoller`.
    ///
    /// This:
    /// - creates the kqueue instance,
    /// - creates a non-blocking self-pipe,
    /// - registers the pipe's read end as a persistent wake source.
    pub(crate) fn new() -> Self {
        let kq = unsafe { kqueue() };
        assert!(kq >= 0, "kqueue failed");

        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert!(rc == 0, "pipe failed");

        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }

        let change = libc::kevent {
            ident: fds[0] as usize,
            filter: EVFILT_READ,
            flags: EV_ADD,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        };

        let rc = unsafe { kevent(kq, &change, 1, std::ptr::null_mut(), 0, std::ptr::null()) };
        assert!(rc == 0, "failed to register wake pipe");

        Self {
            kq,
            wake_rx: fds[0],
            events: Vec::with_capacity(64),
            waker: Arc::new(Waker(fds[1])),
        }
    }

    /// Return the poller waker.
    ///
    /// The reactor hands this to remote schedulers so a blocked
    /// `kevent` is interrupted when cross-thread work arrives.
    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Register a file descriptor with the poller.
    pub(crate) fn register(&self, fd: RawFd, interest: Interest) {
        self.apply(fd, interest);
    }

    /// Update interest filters for an already registered descriptor.
    pub(crate) fn reregister(&self, fd: RawFd, interest: Interest) {
        self.apply(fd, interest);
    }

    /// Remove a file descriptor from the poller.
    pub(crate) fn deregister(&self, fd: RawFd) {
        self.apply(fd, Interest::NONE);
    }

    /// Add or delete the read/write filters so they match `interest`.
    ///
    /// Deleting a filter that was never added reports `ENOENT` per
    /// change; those slots are ignored.
    fn apply(&self, fd: RawFd, interest: Interest) {
        let changes = [
            filter_change(fd, EVFILT_READ, interest.read),
            filter_change(fd, EVFILT_WRITE, interest.write),
        ];

        unsafe {
            kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as i32,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            );
        }
    }

    /// Poll for I/O readiness events.
    ///
    /// Blocks until:
    /// - at least one file descriptor becomes ready,
    /// - the wake pipe is written to,
    /// - or the optional timeout expires.
    pub(crate) fn poll(
        &mut self,
        events: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let ts = timeout.map(|t| timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map(|t| t as *const timespec)
            .unwrap_or(std::ptr::null());

        unsafe {
            self.events.set_len(self.events.capacity());
        }

        let n = unsafe {
            kevent(
                self.kq,
                std::ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                ts_ptr,
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
            let fd = ev.ident as RawFd;

            // Wake-up event: drain the pipe and continue.
            if fd == self.wake_rx {
                let mut buf = [0u8; 8];
                unsafe {
                    libc::read(self.wake_rx, buf.as_mut_ptr() as *mut _, buf.len());
                }
                continue;
            }

            // Descriptor errors count as readiness in both directions.
            let failed = ev.flags & (EV_ERROR | EV_EOF) != 0;
            let readable = failed || ev.filter == EVFILT_READ;
            let writable = failed || ev.filter == EVFILT_WRITE;

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

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.waker.0);
            libc::close(self.wake_rx);
            libc::close(self.kq);
        }
    }
}

/// Build a kevent change entry adding or deleting one filter.
fn filter_change(fd: RawFd, filter: i16, wanted: bool) -> libc::kevent {
    libc::kevent {
        ident: fd as usize,
        filter,
        flags: if wanted { EV_ADD } else { EV_DELETE },
        fflags: 0,
        data: 0,
        udata: std::ptr::null_mut(),
    }
}
