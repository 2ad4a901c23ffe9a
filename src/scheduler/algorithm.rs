//! Scheduling algorithm interface
//!
//! Every scheduling policy implements [`Algorithm`]. Methods take `&self`
//! because fibers call back into the algorithm while it is resuming them;
//! implementations keep their state behind cells and never hold a borrow
//! across a resume.
//!
//! None of these methods block. Operations that suspend the caller (`wait`,
//! `wait_until`, `yield_now`, `join`) only park the active context; the
//! [`Scheduler`](super::Scheduler) futures turn that into a suspension for a
//! fiber, or into a loop over [`Algorithm::run`] for the main context.

use std::sync::Arc;
use std::task::Waker;
use std::time::Instant;

use crate::error::Result;
use crate::fiber::{Fiber, FiberId};
use crate::notify::MainNotifier;

/// A scheduling policy for the fibers of one owning thread
pub trait Algorithm {
    /// Admit a new fiber as runnable
    ///
    /// Fails with `InvalidState` if the fiber is already known to this
    /// algorithm or has already terminated.
    fn spawn(&self, fiber: Fiber) -> Result<()>;

    /// Set a fiber's scheduling weight (greater = more urgent)
    ///
    /// Has no effect on a terminated fiber.
    fn priority(&self, fiber: &Fiber, value: i32);

    /// One step of joining `fiber` from the active context
    ///
    /// Returns `Ok(true)` if the fiber has terminated. Otherwise registers
    /// `waker` to be woken on termination, parks the active context, and
    /// returns `Ok(false)`. Joining the active fiber is a
    /// `SelfJoinDeadlock`; joining a fiber this algorithm never admitted is a
    /// `PreconditionViolation`.
    fn join(&self, fiber: &Fiber, waker: &Waker) -> Result<bool>;

    /// Identity of the context currently running, [`FiberId::MAIN`] when no
    /// fiber is being resumed
    fn active(&self) -> FiberId;

    /// Execute one scheduling round
    ///
    /// Returns `false` only when no fibers exist and the reactor is idle.
    /// Must be called from the main context.
    fn run(&self) -> Result<bool>;

    /// Park the active context until it is woken
    fn wait(&self);

    /// Park the active context until it is woken or `deadline` passes
    fn wait_until(&self, deadline: Instant);

    /// Whether the active context's last park ended because its deadline
    /// passed, as opposed to a wake
    fn timed_out(&self) -> bool;

    /// Re-admit the active fiber at the tail of the ready sequence
    fn yield_now(&self);

    /// Number of fibers ever admitted by this algorithm
    fn spawned(&self) -> usize;

    /// Identity representing the main context
    fn main_id(&self) -> FiberId;

    /// Notifier representing the main context
    fn main_notifier(&self) -> Arc<MainNotifier>;
}
