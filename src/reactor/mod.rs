//! Reactor core and event handling.
//!
//! This module implements the reactor component of the crate.
//! The reactor is responsible for:
//! - draining the ready queue of scheduled callbacks,
//! - managing the timer set,
//! - driving I/O readiness through the platform poller.
//!
//! Callers interact with it through the scheduling and lifecycle API on
//! [`Reactor`]; the poller and registration table are internal.

mod core;
mod event;
mod registration;

pub(crate) mod poller;

pub use core::{ExceptionContext, ExceptionHandler, Reactor, RemoteHandle, RemoteScheduler};
