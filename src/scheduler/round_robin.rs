//! Round-robin scheduling driven by a reactor
//!
//! Fibers run in FIFO order. Whenever nothing is runnable the algorithm hands
//! the thread to the reactor, bounded by the nearest wake deadline, so I/O
//! completions and timers can wake fibers early.
//!
//! Every queued entry holds one keep-alive token from the reactor. The token
//! is released when the entry is popped for resumption, so the reactor never
//! considers itself idle while a suspended fiber still exists.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use futures::task::ArcWake;

use super::algorithm::Algorithm;
use super::queue::{Entry, WaitQueue};
use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberId, FiberState};
use crate::notify::MainNotifier;
use crate::reactor::{KeepAlive, Reactor, Remote};

/// Round-robin configuration
#[derive(Debug, Clone)]
pub struct RoundRobinConfig {
    /// Upper bound on a reactor drive while fibers are parked (`None` = wait
    /// as long as the nearest deadline requires)
    pub max_park: Option<Duration>,
    /// Poll the reactor without blocking after every resume
    pub poll_after_resume: bool,
}

impl Default for RoundRobinConfig {
    fn default() -> Self {
        Self {
            max_park: None,
            poll_after_resume: true,
        }
    }
}

/// Round-robin statistics
#[derive(Debug, Default)]
pub struct RoundRobinStats {
    /// Fibers admitted
    pub fibers_spawned: AtomicUsize,
    /// Fibers that ran to completion
    pub fibers_completed: AtomicUsize,
    /// Total resumes
    pub resumes: AtomicUsize,
    /// Explicit yields
    pub yields: AtomicUsize,
    /// Entries made ready by deadline expiry
    pub expired: AtomicUsize,
    /// Entries made ready by a waker
    pub woken: AtomicUsize,
    /// Keep-alive tokens taken from the reactor
    pub keep_alive_acquired: AtomicUsize,
    /// Keep-alive tokens given back to the reactor
    pub keep_alive_released: AtomicUsize,
    /// Calls into the reactor
    pub reactor_drives: AtomicUsize,
}

impl Clone for RoundRobinStats {
    fn clone(&self) -> Self {
        let load = |counter: &AtomicUsize| AtomicUsize::new(counter.load(Ordering::Relaxed));
        RoundRobinStats {
            fibers_spawned: load(&self.fibers_spawned),
            fibers_completed: load(&self.fibers_completed),
            resumes: load(&self.resumes),
            yields: load(&self.yields),
            expired: load(&self.expired),
            woken: load(&self.woken),
            keep_alive_acquired: load(&self.keep_alive_acquired),
            keep_alive_released: load(&self.keep_alive_released),
            reactor_drives: load(&self.reactor_drives),
        }
    }
}

/// Ids woken by fiber wakers, drained at the start of every round
struct WakeQueue {
    ids: SegQueue<FiberId>,
    remote: Arc<dyn Remote>,
}

struct FiberWaker {
    id: FiberId,
    wakeups: Arc<WakeQueue>,
}

impl ArcWake for FiberWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.wakeups.ids.push(arc_self.id);
        arc_self.wakeups.remote.wake();
    }
}

/// Round-robin scheduling algorithm
pub struct RoundRobin<R: Reactor> {
    config: RoundRobinConfig,
    reactor: R,
    queue: RefCell<WaitQueue<R::KeepAlive>>,
    active: RefCell<Option<Fiber>>,
    /// Fibers admitted and not yet terminated, with their wakers
    known: RefCell<HashMap<FiberId, Waker>>,
    wakeups: Arc<WakeQueue>,
    main: Arc<MainNotifier>,
    stats: RoundRobinStats,
}

impl<R: Reactor> RoundRobin<R> {
    /// Create a round-robin algorithm driving `reactor`
    pub fn new(reactor: R) -> Self {
        Self::with_config(reactor, RoundRobinConfig::default())
    }

    /// Create a round-robin algorithm with custom configuration
    pub fn with_config(reactor: R, config: RoundRobinConfig) -> Self {
        log::info!("Creating round-robin scheduler (max park {:?})", config.max_park);

        let remote = reactor.remote();
        Self {
            config,
            queue: RefCell::new(WaitQueue::new()),
            active: RefCell::new(None),
            known: RefCell::new(HashMap::new()),
            wakeups: Arc::new(WakeQueue {
                ids: SegQueue::new(),
                remote: Arc::clone(&remote),
            }),
            main: MainNotifier::new(remote),
            stats: RoundRobinStats::default(),
            reactor,
        }
    }

    /// Get the driven reactor
    pub fn reactor(&self) -> &R {
        &self.reactor
    }

    /// Get the configuration
    pub fn config(&self) -> &RoundRobinConfig {
        &self.config
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> RoundRobinStats {
        self.stats.clone()
    }

    /// Number of queued entries, ready and waiting
    pub fn queued(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Whether `id` names a live fiber admitted by this algorithm
    pub fn is_known(&self, id: FiberId) -> bool {
        self.known.borrow().contains_key(&id)
    }

    fn entry(&self, fiber: Fiber, deadline: Option<Instant>) -> Entry<R::KeepAlive> {
        self.stats.keep_alive_acquired.fetch_add(1, Ordering::Relaxed);
        Entry::with_deadline(fiber, deadline, self.reactor.keep_alive())
    }

    fn waker_for(&self, id: FiberId) -> Waker {
        if let Some(waker) = self.known.borrow().get(&id) {
            return waker.clone();
        }
        futures::task::waker(Arc::new(FiberWaker {
            id,
            wakeups: Arc::clone(&self.wakeups),
        }))
    }

    fn absorb_wakeups(&self) {
        let mut queue = self.queue.borrow_mut();
        while let Some(id) = self.wakeups.ids.pop() {
            if queue.wake(id) {
                self.stats.woken.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Park whatever context is active, with an optional deadline
    fn park_active(&self, deadline: Option<Instant>) {
        let active = self.active.borrow().clone();
        match active {
            None => self.main.park(deadline),
            Some(fiber) if fiber.state() == FiberState::Running => {
                let entry = self.entry(fiber, deadline);
                self.queue.borrow_mut().push_waiting(entry);
            }
            // Already parked during this resume; only a deadline can tighten it
            Some(fiber) => {
                if let Some(deadline) = deadline {
                    self.queue.borrow_mut().tighten(fiber.id(), deadline);
                }
            }
        }
    }

    fn resume(&self, entry: Entry<R::KeepAlive>) {
        let (fiber, keep_alive) = entry.into_parts();
        keep_alive.release();
        self.stats.keep_alive_released.fetch_add(1, Ordering::Relaxed);

        let waker = self.waker_for(fiber.id());
        fiber.set_state(FiberState::Running);
        *self.active.borrow_mut() = Some(fiber.clone());
        log::trace!("Resuming fiber {}", fiber.id());

        let finished = fiber.resume(&waker);

        *self.active.borrow_mut() = None;
        self.stats.resumes.fetch_add(1, Ordering::Relaxed);

        if finished {
            fiber.set_state(FiberState::Terminated);
            self.known.borrow_mut().remove(&fiber.id());
            self.stats.fibers_completed.fetch_add(1, Ordering::Relaxed);
            let joiners = fiber.notify_joiners();
            log::debug!("Fiber {} terminated, woke {} joiner(s)", fiber.id(), joiners);
        } else if fiber.state() == FiberState::Running {
            // Pending on a foreign future; its waker brings it back
            let entry = self.entry(fiber, None);
            self.queue.borrow_mut().push_waiting(entry);
        }
    }

    fn drive(&self, deadline: Option<Instant>) -> usize {
        self.stats.reactor_drives.fetch_add(1, Ordering::Relaxed);
        match deadline {
            Some(deadline) => self.reactor.drive_until(deadline),
            None => self.reactor.drive_once(),
        }
    }

    fn park_bound(&self, deadline: Option<Instant>) -> Option<Instant> {
        let cap = self.config.max_park.map(|max| Instant::now() + max);
        match (deadline, cap) {
            (Some(deadline), Some(cap)) => Some(deadline.min(cap)),
            (deadline, cap) => deadline.or(cap),
        }
    }
}

impl<R: Reactor> Algorithm for RoundRobin<R> {
    fn spawn(&self, fiber: Fiber) -> Result<()> {
        let id = fiber.id();
        if fiber.is_terminated() {
            return Err(Error::invalid_state(format!("fiber {} has already terminated", id)));
        }
        if self.is_known(id) {
            return Err(Error::invalid_state(format!("fiber {} is already spawned", id)));
        }

        let waker = self.waker_for(id);
        self.known.borrow_mut().insert(id, waker);
        let entry = self.entry(fiber, None);
        self.queue.borrow_mut().push_ready(entry);

        self.stats.fibers_spawned.fetch_add(1, Ordering::Relaxed);
        log::debug!("Spawned fiber {}", id);
        Ok(())
    }

    fn priority(&self, fiber: &Fiber, value: i32) {
        if !fiber.is_terminated() {
            fiber.set_priority(value);
        }
    }

    fn join(&self, fiber: &Fiber, waker: &Waker) -> Result<bool> {
        if fiber.is_terminated() {
            return Ok(true);
        }
        if self.active() == fiber.id() {
            return Err(Error::SelfJoinDeadlock { id: fiber.id() });
        }
        if !self.is_known(fiber.id()) {
            return Err(Error::precondition(format!(
                "fiber {} was never spawned on this scheduler",
                fiber.id()
            )));
        }

        fiber.add_joiner(waker);
        self.park_active(None);
        Ok(false)
    }

    fn active(&self) -> FiberId {
        self.active.borrow().as_ref().map_or(FiberId::MAIN, Fiber::id)
    }

    fn run(&self) -> Result<bool> {
        if let Some(fiber) = self.active.borrow().as_ref() {
            return Err(Error::invalid_state(format!(
                "run() called from inside fiber {}",
                fiber.id()
            )));
        }

        self.absorb_wakeups();
        let now = Instant::now();
        let expired = self.queue.borrow_mut().promote_expired(now);
        self.stats.expired.fetch_add(expired, Ordering::Relaxed);

        let next = self.queue.borrow_mut().pop_ready();
        if let Some(entry) = next {
            self.resume(entry);
            if self.config.poll_after_resume {
                self.drive(Some(Instant::now()));
            }
            return Ok(true);
        }

        if self.main.is_woken() {
            self.drive(Some(now));
            return Ok(true);
        }

        let (queued, next_deadline) = {
            let queue = self.queue.borrow();
            (!queue.is_empty(), queue.next_deadline())
        };
        let main_deadline = self.main.deadline();
        if queued || main_deadline.is_some() {
            let deadline = match (next_deadline, main_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            log::trace!("No runnable fiber, parking until {:?}", deadline);
            self.drive(self.park_bound(deadline));
            return Ok(true);
        }

        Ok(self.drive(None) > 0)
    }

    fn wait(&self) {
        self.park_active(None);
    }

    fn wait_until(&self, deadline: Instant) {
        self.park_active(Some(deadline));
    }

    fn timed_out(&self) -> bool {
        match self.active.borrow().as_ref() {
            Some(fiber) => fiber.timed_out(),
            None => self.main.timed_out(),
        }
    }

    fn yield_now(&self) {
        let active = self.active.borrow().clone();
        match active {
            None => self.main.park(Some(Instant::now())),
            Some(fiber) if fiber.state() == FiberState::Running => {
                self.stats.yields.fetch_add(1, Ordering::Relaxed);
                let entry = self.entry(fiber, Some(Instant::now()));
                self.queue.borrow_mut().push_ready(entry);
            }
            Some(_) => {}
        }
    }

    fn spawned(&self) -> usize {
        self.stats.fibers_spawned.load(Ordering::Relaxed)
    }

    fn main_id(&self) -> FiberId {
        FiberId::MAIN
    }

    fn main_notifier(&self) -> Arc<MainNotifier> {
        Arc::clone(&self.main)
    }
}
