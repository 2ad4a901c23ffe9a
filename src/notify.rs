//! Wait/notify primitives
//!
//! [`Notifier`] is a condition variable for fibers: a context registers
//! itself, releases the caller's lock, and stays parked until notified. It is
//! built on [`Waker`]s, so the same object works for real fibers and for the
//! owning thread's main context, and it can be notified from other threads.
//!
//! [`MainNotifier`] gives the owning thread's own execution context an
//! identity and a waker, so it can wait and be woken exactly like a fiber.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use futures::task::ArcWake;
use parking_lot::Mutex;

use crate::fiber::FiberId;
use crate::reactor::Remote;
use crate::scheduler::Scheduler;

/// The owning thread's main context, seen as a notifiable identity
pub struct MainNotifier {
    woken: AtomicBool,
    deadline: Mutex<Option<Instant>>,
    /// How the last park ended: `true` if only the deadline released it
    timed_out: AtomicBool,
    remote: Arc<dyn Remote>,
}

impl MainNotifier {
    pub(crate) fn new(remote: Arc<dyn Remote>) -> Arc<Self> {
        Arc::new(Self {
            woken: AtomicBool::new(false),
            deadline: Mutex::new(None),
            timed_out: AtomicBool::new(false),
            remote,
        })
    }

    /// Identity of the main context
    pub fn id(&self) -> FiberId {
        FiberId::MAIN
    }

    /// Get a waker that notifies the main context
    pub fn waker(self: &Arc<Self>) -> Waker {
        futures::task::waker(Arc::clone(self))
    }

    /// Wake the main context and interrupt the reactor if it is blocked
    pub fn notify(&self) {
        self.woken.store(true, Ordering::Release);
        self.remote.wake();
    }

    /// Check if the main context has been notified since it last parked
    pub fn is_woken(&self) -> bool {
        self.woken.load(Ordering::Acquire)
    }

    /// Deadline the main context is parked with, if any
    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    /// Whether the main context may continue: notified, or its deadline has
    /// passed
    pub fn is_ready(&self, now: Instant) -> bool {
        self.is_woken() || self.deadline().is_some_and(|deadline| deadline <= now)
    }

    /// Park the main context. Parking twice keeps the earlier deadline.
    pub(crate) fn park(&self, deadline: Option<Instant>) {
        let Some(deadline) = deadline else {
            return;
        };
        let mut current = self.deadline.lock();
        *current = Some(current.map_or(deadline, |existing| existing.min(deadline)));
    }

    /// Whether the last park ended by its deadline passing without a wake
    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    /// End a park: remember whether it was released by a wake or by its
    /// deadline, then clear it for the next one
    pub(crate) fn settle(&self, now: Instant) {
        let mut deadline = self.deadline.lock();
        let woken = self.woken.swap(false, Ordering::AcqRel);
        let expired = deadline.is_some_and(|deadline| deadline <= now);
        self.timed_out.store(!woken && expired, Ordering::Release);
        *deadline = None;
    }

    pub(crate) fn reset(&self) {
        self.woken.store(false, Ordering::Release);
        self.timed_out.store(false, Ordering::Release);
        *self.deadline.lock() = None;
    }
}

impl ArcWake for MainNotifier {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.notify();
    }
}

struct Waiter {
    notified: AtomicBool,
    waker: Mutex<Waker>,
}

/// Condition variable for fibers and the main context
#[derive(Default)]
pub struct Notifier {
    waiters: Mutex<VecDeque<Arc<Waiter>>>,
}

impl Notifier {
    /// Create a notifier with no waiters
    pub fn new() -> Self {
        Self::default()
    }

    /// Park the calling context until notified
    ///
    /// `lock` is dropped once the context is registered and parked; it is not
    /// re-acquired on wake-up.
    pub fn wait<'a, L>(&'a self, scheduler: &'a Scheduler, lock: L) -> Notified<'a, L> {
        Notified {
            waiting: Waiting::new(self, scheduler, None, lock),
        }
    }

    /// Park the calling context until notified or until `deadline` passes
    ///
    /// Resolves to `true` when notified and `false` on timeout.
    pub fn wait_until<'a, L>(
        &'a self,
        scheduler: &'a Scheduler,
        deadline: Instant,
        lock: L,
    ) -> NotifiedUntil<'a, L> {
        NotifiedUntil {
            waiting: Waiting::new(self, scheduler, Some(deadline), lock),
        }
    }

    /// Wake the longest-waiting context. Returns `false` if nobody waited.
    pub fn notify_one(&self) -> bool {
        let waiter = {
            let mut waiters = self.waiters.lock();
            let waiter = waiters.pop_front();
            if let Some(waiter) = &waiter {
                waiter.notified.store(true, Ordering::Release);
            }
            waiter
        };

        match waiter {
            Some(waiter) => {
                waiter.waker.lock().wake_by_ref();
                true
            }
            None => false,
        }
    }

    /// Wake every waiting context. Returns how many were woken.
    pub fn notify_all(&self) -> usize {
        let waiters: Vec<_> = {
            let mut waiters = self.waiters.lock();
            for waiter in waiters.iter() {
                waiter.notified.store(true, Ordering::Release);
            }
            waiters.drain(..).collect()
        };

        for waiter in &waiters {
            waiter.waker.lock().wake_by_ref();
        }
        waiters.len()
    }

    /// Number of contexts currently waiting
    pub fn waiters(&self) -> usize {
        self.waiters.lock().len()
    }

    fn register(&self, waker: &Waker) -> Arc<Waiter> {
        let waiter = Arc::new(Waiter {
            notified: AtomicBool::new(false),
            waker: Mutex::new(waker.clone()),
        });
        self.waiters.lock().push_back(Arc::clone(&waiter));
        waiter
    }

    /// Remove a waiter; `false` means a notification already claimed it
    fn deregister(&self, waiter: &Arc<Waiter>) -> bool {
        let mut waiters = self.waiters.lock();
        match waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            Some(index) => {
                waiters.remove(index);
                true
            }
            None => false,
        }
    }
}

struct Waiting<'a, L> {
    notifier: &'a Notifier,
    scheduler: &'a Scheduler,
    deadline: Option<Instant>,
    lock: Option<L>,
    waiter: Option<Arc<Waiter>>,
}

impl<'a, L> Waiting<'a, L> {
    fn new(
        notifier: &'a Notifier,
        scheduler: &'a Scheduler,
        deadline: Option<Instant>,
        lock: L,
    ) -> Self {
        Self {
            notifier,
            scheduler,
            deadline,
            lock: Some(lock),
            waiter: None,
        }
    }

    fn poll_wait(&mut self, cx: &mut Context<'_>) -> Poll<bool> {
        match self.waiter.clone() {
            None => {
                self.waiter = Some(self.notifier.register(cx.waker()));
            }
            Some(waiter) => {
                if waiter.notified.load(Ordering::Acquire) {
                    self.waiter = None;
                    return Poll::Ready(true);
                }
                if self.deadline.is_some_and(|deadline| deadline <= Instant::now()) {
                    // Not in the list any more means a notification won the race
                    let timed_out = self.notifier.deregister(&waiter);
                    self.waiter = None;
                    return Poll::Ready(!timed_out);
                }
                // Spurious wake-up: stay registered, possibly under a new waker
                *waiter.waker.lock() = cx.waker().clone();
            }
        }

        let algorithm = self.scheduler.algorithm();
        match self.deadline {
            Some(deadline) => algorithm.wait_until(deadline),
            None => algorithm.wait(),
        }
        drop(self.lock.take());
        Poll::Pending
    }
}

impl<L> Drop for Waiting<'_, L> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            self.notifier.deregister(&waiter);
        }
    }
}

/// Future returned by [`Notifier::wait`]
pub struct Notified<'a, L> {
    waiting: Waiting<'a, L>,
}

impl<L> Unpin for Notified<'_, L> {}

impl<L> Future for Notified<'_, L> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.get_mut().waiting.poll_wait(cx).map(|_| ())
    }
}

/// Future returned by [`Notifier::wait_until`]
pub struct NotifiedUntil<'a, L> {
    waiting: Waiting<'a, L>,
}

impl<L> Unpin for NotifiedUntil<'_, L> {}

impl<L> Future for NotifiedUntil<'_, L> {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        self.get_mut().waiting.poll_wait(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{EventLoop, Reactor};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_main_notifier_keeps_earliest_deadline() {
        let main = MainNotifier::new(EventLoop::new().remote());
        let now = Instant::now();
        assert!(!main.is_ready(now));

        main.park(Some(now + Duration::from_millis(50)));
        main.park(Some(now + Duration::from_millis(10)));
        main.park(None);
        assert_eq!(main.deadline(), Some(now + Duration::from_millis(10)));
        assert!(main.is_ready(now + Duration::from_millis(10)));

        main.settle(now + Duration::from_millis(10));
        assert!(main.timed_out());
        assert_eq!(main.deadline(), None);

        main.park(Some(now));
        main.waker().wake();
        assert!(main.is_woken());
        assert!(main.is_ready(now));
        // A wake takes precedence over an expired deadline
        main.settle(now + Duration::from_millis(10));
        assert!(!main.timed_out());
        assert!(!main.is_woken());

        main.reset();
        assert!(!main.timed_out());
    }

    #[test]
    fn test_notify_one_wakes_in_registration_order() {
        let scheduler = Scheduler::round_robin(EventLoop::new());
        let notifier = Rc::new(Notifier::new());
        let order = Rc::new(RefCell::new(Vec::new()));
        assert!(!notifier.notify_one());

        for i in 0..3 {
            let notifier = Rc::clone(&notifier);
            let order = Rc::clone(&order);
            scheduler
                .spawn(move |sched| async move {
                    notifier.wait(&sched, ()).await;
                    order.borrow_mut().push(i);
                })
                .unwrap();
        }
        for _ in 0..3 {
            assert!(scheduler.run().unwrap());
        }
        assert_eq!(notifier.waiters(), 3);

        assert!(notifier.notify_one());
        assert!(scheduler.run().unwrap());
        assert_eq!(*order.borrow(), vec![0]);

        assert_eq!(notifier.notify_all(), 2);
        scheduler.run_until_idle().unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert_eq!(notifier.waiters(), 0);
    }

    #[test]
    fn test_wait_until_times_out_and_deregisters() {
        let scheduler = Scheduler::round_robin(EventLoop::new());
        let notifier = Rc::new(Notifier::new());
        let outcome = Rc::new(Cell::new(None));

        let notifier_clone = Rc::clone(&notifier);
        let outcome_clone = Rc::clone(&outcome);
        scheduler
            .spawn(move |sched| async move {
                let deadline = Instant::now() + Duration::from_millis(20);
                let notified = notifier_clone.wait_until(&sched, deadline, ()).await;
                outcome_clone.set(Some(notified));
            })
            .unwrap();

        let start = Instant::now();
        scheduler.run_until_idle().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(outcome.get(), Some(false));
        assert_eq!(notifier.waiters(), 0);
    }

    #[test]
    fn test_notification_wins_over_late_deadline() {
        let scheduler = Scheduler::round_robin(EventLoop::new());
        let notifier = Rc::new(Notifier::new());
        let outcome = Rc::new(Cell::new(None));

        let notifier_clone = Rc::clone(&notifier);
        let outcome_clone = Rc::clone(&outcome);
        scheduler
            .spawn(move |sched| async move {
                let deadline = Instant::now() + Duration::from_millis(5);
                let notified = notifier_clone.wait_until(&sched, deadline, ()).await;
                outcome_clone.set(Some(notified));
            })
            .unwrap();

        assert!(scheduler.run().unwrap());
        thread::sleep(Duration::from_millis(10));
        assert!(notifier.notify_one());

        scheduler.run_until_idle().unwrap();
        assert_eq!(outcome.get(), Some(true));
    }

    #[test]
    fn test_lock_released_while_parked() {
        let scheduler = Scheduler::round_robin(EventLoop::new());
        let notifier = Rc::new(Notifier::new());
        let state = Rc::new(RefCell::new(0));

        let notifier_clone = Rc::clone(&notifier);
        let state_clone = Rc::clone(&state);
        scheduler
            .spawn(move |sched| async move {
                let guard = state_clone.borrow_mut();
                notifier_clone.wait(&sched, guard).await;
                *state_clone.borrow_mut() += 10;
            })
            .unwrap();

        assert!(scheduler.run().unwrap());
        // Would panic if the fiber still held the borrow
        *state.borrow_mut() += 1;

        notifier.notify_one();
        scheduler.run_until_idle().unwrap();
        assert_eq!(*state.borrow(), 11);
    }

    #[test]
    fn test_main_context_woken_from_another_thread() {
        let event_loop = Rc::new(EventLoop::new());
        let scheduler = Scheduler::round_robin(Rc::clone(&event_loop));
        let notifier = Arc::new(Notifier::new());

        // Keeps the loop blocking instead of reporting a deadlock
        let work = event_loop.handle().work();
        let remote = Arc::clone(&notifier);
        let notifying = thread::spawn(move || {
            while remote.waiters() == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            assert!(remote.notify_one());
            drop(work);
        });

        scheduler.block_on(notifier.wait(&scheduler, ())).unwrap();
        notifying.join().unwrap();
        assert_eq!(notifier.waiters(), 0);
    }
}
