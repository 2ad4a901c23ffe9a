//! Common test harness for rust-fibers tests
//!
//! Builds a round-robin scheduler over an [`EventLoop`] wrapped in a
//! [`CountingReactor`], so every test can check that each keep-alive token
//! the scheduler acquired was also released.

#![allow(dead_code)]

use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use rust_fibers::prelude::*;
use rust_fibers::reactor::Work;

/// Keep-alive bookkeeping shared between a reactor and its tokens
#[derive(Debug, Default)]
pub struct TokenCounts {
    acquired: Cell<usize>,
    released: Cell<usize>,
}

impl TokenCounts {
    pub fn acquired(&self) -> usize {
        self.acquired.get()
    }

    pub fn released(&self) -> usize {
        self.released.get()
    }

    pub fn outstanding(&self) -> usize {
        self.acquired() - self.released()
    }
}

/// Token that records its own release
pub struct CountedToken {
    _work: Work,
    counts: Rc<TokenCounts>,
}

impl Drop for CountedToken {
    fn drop(&mut self) {
        self.counts.released.set(self.counts.released.get() + 1);
    }
}

impl KeepAlive for CountedToken {}

/// Event loop that counts the keep-alive tokens handed out
pub struct CountingReactor {
    event_loop: Rc<EventLoop>,
    counts: Rc<TokenCounts>,
}

impl Reactor for CountingReactor {
    type KeepAlive = CountedToken;

    fn drive_once(&self) -> usize {
        self.event_loop.drive_once()
    }

    fn drive_until(&self, deadline: Instant) -> usize {
        self.event_loop.drive_until(deadline)
    }

    fn keep_alive(&self) -> CountedToken {
        self.counts.acquired.set(self.counts.acquired.get() + 1);
        CountedToken {
            _work: self.event_loop.work(),
            counts: Rc::clone(&self.counts),
        }
    }

    fn remote(&self) -> Arc<dyn Remote> {
        self.event_loop.remote()
    }
}

/// A scheduler together with the pieces tests inspect
pub struct Harness {
    pub scheduler: Scheduler,
    pub algorithm: Rc<RoundRobin<CountingReactor>>,
    pub event_loop: Rc<EventLoop>,
    pub tokens: Rc<TokenCounts>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(RoundRobinConfig::default())
    }

    pub fn with_config(config: RoundRobinConfig) -> Self {
        let event_loop = Rc::new(EventLoop::new());
        let tokens = Rc::new(TokenCounts::default());
        let reactor = CountingReactor {
            event_loop: Rc::clone(&event_loop),
            counts: Rc::clone(&tokens),
        };
        let algorithm = Rc::new(RoundRobin::with_config(reactor, config));
        Self {
            scheduler: Scheduler::new(algorithm.clone()),
            algorithm,
            event_loop,
            tokens,
        }
    }

    /// Every token acquired so far has been released
    pub fn assert_tokens_balanced(&self) {
        assert_eq!(
            self.tokens.acquired(),
            self.tokens.released(),
            "keep-alive tokens leaked"
        );
        assert_eq!(self.event_loop.outstanding_work(), 0);
    }
}

/// Run an async test on the main context of a fresh scheduler
///
/// Remaining fibers are run to completion afterwards, and the keep-alive
/// tokens must balance.
pub fn run_test<F, Fut>(test_fn: F)
where
    F: FnOnce(Scheduler) -> Fut,
    Fut: Future<Output = ()>,
{
    let harness = Harness::new();
    let scheduler = harness.scheduler.clone();
    harness
        .scheduler
        .block_on(test_fn(scheduler))
        .expect("main context deadlocked");
    harness
        .scheduler
        .run_until_idle()
        .expect("scheduling round failed");
    harness.assert_tokens_balanced();
}

/// Macro to define a test that runs on a scheduler's main context
///
/// Usage:
/// ```ignore
/// fiber_test!(async fn my_test(sched) {
///     // test code here
/// });
/// ```
#[macro_export]
macro_rules! fiber_test {
    (async fn $name:ident($sched:ident) $body:block) => {
        #[test]
        fn $name() {
            $crate::common::run_test(|$sched| async move $body);
        }
    };
}
