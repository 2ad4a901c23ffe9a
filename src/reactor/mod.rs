//! Reactor contract
//!
//! The scheduler never owns the event loop's logic; it only needs to drive it
//! when no fiber is runnable, to post a wake-up into it from any thread, and to
//! hold keep-alive tokens so the loop does not consider itself idle while
//! suspended fibers still exist.
//!
//! [`EventLoop`] is a small built-in implementation of the contract.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

pub mod event_loop;

pub use event_loop::{EventLoop, EventLoopConfig, EventLoopHandle, TimerId, Work};

/// A token that keeps a reactor from returning while it is alive
pub trait KeepAlive {
    /// Give the token back to the reactor
    fn release(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}

/// Thread-safe handle used to interrupt a blocked reactor
pub trait Remote: Send + Sync {
    /// Post a no-op event so a blocking drive returns
    fn wake(&self);
}

/// Event loop driven by the scheduler
pub trait Reactor {
    /// Token type returned by [`Reactor::keep_alive`]
    type KeepAlive: KeepAlive;

    /// Handle at least one pending completion, blocking while the reactor
    /// has outstanding work. Returns the number of completions handled; 0
    /// means the reactor is idle.
    fn drive_once(&self) -> usize;

    /// Handle ready completions; if there are none, block until one arrives
    /// or `deadline` passes.
    fn drive_until(&self, deadline: Instant) -> usize;

    /// Acquire a token that marks the reactor as having pending work
    fn keep_alive(&self) -> Self::KeepAlive;

    /// Get a handle that can wake the reactor from any thread
    fn remote(&self) -> Arc<dyn Remote>;
}

impl<R: Reactor + ?Sized> Reactor for Rc<R> {
    type KeepAlive = R::KeepAlive;

    fn drive_once(&self) -> usize {
        (**self).drive_once()
    }

    fn drive_until(&self, deadline: Instant) -> usize {
        (**self).drive_until(deadline)
    }

    fn keep_alive(&self) -> Self::KeepAlive {
        (**self).keep_alive()
    }

    fn remote(&self) -> Arc<dyn Remote> {
        (**self).remote()
    }
}
