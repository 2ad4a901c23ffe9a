//! Fiber handles
//!
//! A fiber is a cooperatively scheduled unit of work. Here it wraps a local
//! future: resuming the fiber polls the future once, and every `.await` on a
//! scheduler future is a point where the fiber hands control back.
//!
//! Handles are reference counted. The spawner, the wait queue, the active
//! slot of the algorithm and any join-waiter may all hold one at the same
//! time; the future itself is dropped as soon as the fiber terminates.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};

use futures::future::{FutureExt, LocalBoxFuture};

/// Unique identifier for a fiber
///
/// Ids are issued from a process-wide counter and never reused, so a stale id
/// can never alias a newer fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    /// Sentinel identity of the owning thread's own (non-fiber) context
    pub const MAIN: FiberId = FiberId(0);

    fn next() -> Self {
        static FIBER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
        FiberId(FIBER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether this is the main-context sentinel
    pub fn is_main(&self) -> bool {
        *self == FiberId::MAIN
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_main() {
            f.write_str("main")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Lifecycle state of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Runnable, waiting for its turn
    Ready,
    /// Currently being resumed
    Running,
    /// Parked without a deadline until explicitly woken
    Waiting,
    /// Parked until woken or until its deadline passes
    Suspended,
    /// Finished; will never run again
    Terminated,
}

struct FiberInner {
    id: FiberId,
    name: Option<String>,
    state: Cell<FiberState>,
    priority: Cell<i32>,
    /// Set when the last park ended by deadline expiry rather than a wake
    timed_out: Cell<bool>,
    future: RefCell<Option<LocalBoxFuture<'static, ()>>>,
    joiners: RefCell<Vec<Waker>>,
}

/// A shared handle to a fiber
#[derive(Clone)]
pub struct Fiber {
    inner: Rc<FiberInner>,
}

impl Fiber {
    /// Wrap a future into a new, not yet spawned fiber
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = ()> + 'static,
    {
        Self::build(future.boxed_local(), None)
    }

    /// Wrap a future into a new fiber carrying a name for logs and debugging
    pub fn with_name<F>(future: F, name: impl Into<String>) -> Self
    where
        F: Future<Output = ()> + 'static,
    {
        Self::build(future.boxed_local(), Some(name.into()))
    }

    fn build(future: LocalBoxFuture<'static, ()>, name: Option<String>) -> Self {
        Self {
            inner: Rc::new(FiberInner {
                id: FiberId::next(),
                name,
                state: Cell::new(FiberState::Ready),
                priority: Cell::new(0),
                timed_out: Cell::new(false),
                future: RefCell::new(Some(future)),
                joiners: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Get the fiber's identity
    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    /// Get the fiber's name, if it was given one
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Get the current lifecycle state
    pub fn state(&self) -> FiberState {
        self.inner.state.get()
    }

    /// Check if the fiber has finished
    pub fn is_terminated(&self) -> bool {
        self.state() == FiberState::Terminated
    }

    /// Get the scheduling weight (greater = more urgent)
    pub fn priority(&self) -> i32 {
        self.inner.priority.get()
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.inner.state.set(state);
    }

    pub(crate) fn set_priority(&self, value: i32) {
        self.inner.priority.set(value);
    }

    pub(crate) fn timed_out(&self) -> bool {
        self.inner.timed_out.get()
    }

    pub(crate) fn set_timed_out(&self, timed_out: bool) {
        self.inner.timed_out.set(timed_out);
    }

    /// Poll the fiber's future once. Returns `true` once the fiber has
    /// terminated.
    pub(crate) fn resume(&self, waker: &Waker) -> bool {
        let mut slot = self.inner.future.borrow_mut();
        let Some(future) = slot.as_mut() else {
            return true;
        };

        let mut cx = Context::from_waker(waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                *slot = None;
                true
            }
            Poll::Pending => false,
        }
    }

    /// Register a waker to be woken when this fiber terminates
    pub(crate) fn add_joiner(&self, waker: &Waker) {
        let mut joiners = self.inner.joiners.borrow_mut();
        if !joiners.iter().any(|w| w.will_wake(waker)) {
            joiners.push(waker.clone());
        }
    }

    /// Wake every registered join-waiter. Returns how many were woken.
    pub(crate) fn notify_joiners(&self) -> usize {
        let joiners = std::mem::take(&mut *self.inner.joiners.borrow_mut());
        let count = joiners.len();
        for waker in joiners {
            waker.wake();
        }
        count
    }

    /// Whether both handles name the same fiber
    pub fn ptr_eq(&self, other: &Fiber) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Fiber {}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.inner.state.get())
            .field("priority", &self.inner.priority.get())
            .finish()
    }
}
