//! One-shot completion cells.
//!
//! A [`Completion`] is the minimal awaitable the callback model needs:
//! a slot that is resolved exactly once, with callbacks that run on the
//! reactor when it resolves. It exists so
//! [`run_until_complete`](crate::Reactor::run_until_complete) has
//! something to wait on without converting the crate to async/await.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;
use crate::reactor::Reactor;

type DoneCallback = Box<dyn FnOnce(&mut Reactor) -> Result<()>>;

struct Inner<T> {
    value: Option<T>,
    done: bool,
    callbacks: Vec<DoneCallback>,
}

/// A one-shot, clonable completion cell.
///
/// All clones refer to the same slot. Resolving schedules every attached
/// done-callback on the reactor's ready queue, preserving the FIFO
/// guarantees of [`call_soon`](crate::Reactor::call_soon).
pub struct Completion<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Completion<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                value: None,
                done: false,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Whether the completion has been resolved.
    pub fn is_done(&self) -> bool {
        self.inner.borrow().done
    }

    /// Resolve the completion and schedule the attached callbacks.
    ///
    /// # Panics
    ///
    /// Panics if the completion was already resolved.
    pub fn set(&self, reactor: &mut Reactor, value: T) {
        let callbacks = {
            let mut inner = self.inner.borrow_mut();
            assert!(!inner.done, "completion resolved twice");
            inner.done = true;
            inner.value = Some(value);
            std::mem::take(&mut inner.callbacks)
        };

        for callback in callbacks {
            reactor.call_soon(callback);
        }
    }

    /// Attach a callback to run once the completion resolves.
    ///
    /// If it already has, the callback is scheduled immediately.
    pub fn on_done(
        &self,
        reactor: &mut Reactor,
        callback: impl FnOnce(&mut Reactor) -> Result<()> + 'static,
    ) {
        let mut inner = self.inner.borrow_mut();
        if inner.done {
            drop(inner);
            reactor.call_soon(callback);
        } else {
            inner.callbacks.push(Box::new(callback));
        }
    }

    /// Take the resolved value out of the cell, if any.
    pub fn try_take(&self) -> Option<T> {
        self.inner.borrow_mut().value.take()
    }
}
