//! Platform-specific I/O poller abstraction.
//!
//! This module provides a unified interface over platform-specific
//! readiness mechanisms (epoll on Linux, kqueue on macOS).
//!
//! The poller is used by the reactor to:
//! - wait for I/O readiness events, bounded by the nearest timer deadline,
//! - wake the reactor when work is submitted from another thread,
//! - report per-descriptor readiness back to the registration table.
//!
//! The concrete implementation is selected at compile time
//! depending on the target operating system.

pub(crate) mod common;

pub(crate) use common::{Interest, Waker};

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "macos")]
mod kqueue;

#[cfg(target_os = "linux")]
pub(crate) type Poller = epoll::EpollPoller;

#[cfg(target_os = "macos")]
pub(crate) type Poller = kqueue::KqueuePoller;
