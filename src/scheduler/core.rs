//! Scheduler coordination
//!
//! A [`Scheduler`] belongs to one owning thread. It is created by that
//! thread's top-level code and passed explicitly to every fiber; there is no
//! ambient global. It holds the installed [`Algorithm`], forwards lifecycle
//! calls to it, and turns the algorithm's non-blocking park operations into
//! futures a fiber can `.await` or the main context can [`block_on`].
//!
//! [`block_on`]: Scheduler::block_on

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use super::algorithm::Algorithm;
use super::round_robin::RoundRobin;
use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberId};
use crate::notify::MainNotifier;
use crate::reactor::Reactor;

struct Inner {
    algorithm: RefCell<Rc<dyn Algorithm>>,
}

/// Per-thread handle to the installed scheduling algorithm
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

impl Scheduler {
    /// Create a scheduler running `algorithm`
    pub fn new(algorithm: Rc<dyn Algorithm>) -> Self {
        Self {
            inner: Rc::new(Inner {
                algorithm: RefCell::new(algorithm),
            }),
        }
    }

    /// Create a scheduler running the round-robin algorithm over `reactor`
    pub fn round_robin<R: Reactor + 'static>(reactor: R) -> Self {
        Self::new(Rc::new(RoundRobin::new(reactor)))
    }

    /// Get the installed algorithm
    pub fn algorithm(&self) -> Rc<dyn Algorithm> {
        self.inner.algorithm.borrow().clone()
    }

    /// Install a different algorithm
    ///
    /// Only allowed while the installed algorithm has never admitted a
    /// fiber, whichever path spawned it; afterwards the call fails with
    /// `InvalidState` and the installed algorithm stays in place.
    pub fn replace(&self, algorithm: Rc<dyn Algorithm>) -> Result<()> {
        if self.algorithm().spawned() > 0 {
            return Err(Error::invalid_state(
                "cannot replace the scheduling algorithm after fibers have been spawned",
            ));
        }

        let mut installed = self.inner.algorithm.try_borrow_mut().map_err(|_| {
            Error::invalid_state("scheduling algorithm is in use")
        })?;
        *installed = algorithm;
        log::info!("Replaced scheduling algorithm");
        Ok(())
    }

    /// Spawn a fiber running the future built by `f`
    ///
    /// `f` receives a clone of this scheduler so the fiber can yield, wait,
    /// join and spawn further fibers.
    pub fn spawn<F, Fut>(&self, f: F) -> Result<Fiber>
    where
        F: FnOnce(Scheduler) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let fiber = Fiber::new(f(self.clone()));
        self.spawn_fiber(fiber.clone())?;
        Ok(fiber)
    }

    /// Spawn a named fiber
    pub fn spawn_named<F, Fut>(&self, name: impl Into<String>, f: F) -> Result<Fiber>
    where
        F: FnOnce(Scheduler) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let fiber = Fiber::with_name(f(self.clone()), name);
        self.spawn_fiber(fiber.clone())?;
        Ok(fiber)
    }

    /// Admit an existing fiber handle
    pub fn spawn_fiber(&self, fiber: Fiber) -> Result<()> {
        self.algorithm().spawn(fiber)
    }

    /// Set a fiber's scheduling weight (greater = more urgent)
    pub fn priority(&self, fiber: &Fiber, value: i32) {
        self.algorithm().priority(fiber, value);
    }

    /// Identity of the running context
    pub fn active(&self) -> FiberId {
        self.algorithm().active()
    }

    /// Identity of the main context
    pub fn main_id(&self) -> FiberId {
        self.algorithm().main_id()
    }

    /// Notifier of the main context
    pub fn main_notifier(&self) -> Arc<MainNotifier> {
        self.algorithm().main_notifier()
    }

    /// Execute one scheduling round
    pub fn run(&self) -> Result<bool> {
        self.algorithm().run()
    }

    /// Run scheduling rounds until no fibers remain and the reactor is idle
    pub fn run_until_idle(&self) -> Result<()> {
        while self.run()? {}
        Ok(())
    }

    /// Give other fibers a turn
    pub fn yield_now(&self) -> Yield {
        Yield {
            scheduler: self.clone(),
            yielded: false,
        }
    }

    /// Park until woken; `lock` is released while parked and not re-acquired
    pub fn wait<L>(&self, lock: L) -> Wait<L> {
        Wait {
            scheduler: self.clone(),
            lock: Some(lock),
            parked: false,
        }
    }

    /// Park until woken or until `deadline`
    ///
    /// Resolves to `true` if a wake ended the wait, even when the context
    /// only got to run after the deadline, and `false` if the deadline
    /// expired first.
    pub fn wait_until<L>(&self, deadline: Instant, lock: L) -> WaitUntil<L> {
        WaitUntil {
            scheduler: self.clone(),
            deadline,
            lock: Some(lock),
            parked: false,
        }
    }

    /// Sleep until `deadline`
    pub fn sleep_until(&self, deadline: Instant) -> WaitUntil<()> {
        self.wait_until(deadline, ())
    }

    /// Sleep for `duration`
    pub fn sleep_for(&self, duration: Duration) -> WaitUntil<()> {
        self.sleep_until(Instant::now() + duration)
    }

    /// Wait for `fiber` to terminate
    pub fn join(&self, fiber: &Fiber) -> Join {
        Join {
            scheduler: self.clone(),
            fiber: fiber.clone(),
        }
    }

    /// Run `future` on the main context, scheduling fibers until it completes
    ///
    /// Fails with `InvalidState` when called from inside a fiber, or when
    /// the main context is blocked and nothing is left that could wake it.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        let algorithm = self.algorithm();
        let active = algorithm.active();
        if active != algorithm.main_id() {
            return Err(Error::invalid_state(format!(
                "block_on called from inside fiber {}",
                active
            )));
        }

        let main = algorithm.main_notifier();
        let waker = main.waker();
        let mut cx = Context::from_waker(&waker);
        futures::pin_mut!(future);

        main.reset();
        let result = loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                break Ok(output);
            }
            if let Err(err) = Self::drive_main(&*algorithm, &main) {
                break Err(err);
            }
            main.settle(Instant::now());
        };
        main.reset();
        result
    }

    /// Run rounds until the parked main context may continue
    fn drive_main(algorithm: &dyn Algorithm, main: &MainNotifier) -> Result<()> {
        loop {
            let more = algorithm.run()?;
            if main.is_ready(Instant::now()) {
                return Ok(());
            }
            if !more && main.deadline().is_none() {
                return Err(Error::invalid_state(
                    "main context is blocked and no fiber or reactor event can wake it",
                ));
            }
        }
    }
}

/// Future returned by [`Scheduler::yield_now`]
pub struct Yield {
    scheduler: Scheduler,
    yielded: bool,
}

impl Future for Yield {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.yielded {
            return Poll::Ready(());
        }
        this.scheduler.algorithm().yield_now();
        this.yielded = true;
        Poll::Pending
    }
}

/// Future returned by [`Scheduler::wait`]
pub struct Wait<L> {
    scheduler: Scheduler,
    lock: Option<L>,
    parked: bool,
}

impl<L> Unpin for Wait<L> {}

impl<L> Future for Wait<L> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.parked {
            return Poll::Ready(());
        }
        this.scheduler.algorithm().wait();
        this.parked = true;
        drop(this.lock.take());
        Poll::Pending
    }
}

/// Future returned by [`Scheduler::wait_until`] and the sleep functions
pub struct WaitUntil<L> {
    scheduler: Scheduler,
    deadline: Instant,
    lock: Option<L>,
    parked: bool,
}

impl<L> Unpin for WaitUntil<L> {}

impl<L> Future for WaitUntil<L> {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<bool> {
        let this = self.get_mut();
        if this.parked {
            return Poll::Ready(!this.scheduler.algorithm().timed_out());
        }
        this.scheduler.algorithm().wait_until(this.deadline);
        this.parked = true;
        drop(this.lock.take());
        Poll::Pending
    }
}

/// Future returned by [`Scheduler::join`]
pub struct Join {
    scheduler: Scheduler,
    fiber: Fiber,
}

impl Future for Join {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        match self.scheduler.algorithm().join(&self.fiber, cx.waker()) {
            Ok(true) => Poll::Ready(Ok(())),
            Ok(false) => Poll::Pending,
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}
