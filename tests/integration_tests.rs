//! Integration tests for rust-fibers
//!
//! These tests combine fibers, notifiers and the event loop in realistic
//! producer/consumer and cross-thread scenarios.

mod common;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::Harness;
use rust_fibers::prelude::*;

fiber_test!(async fn test_producer_consumer_pattern(sched) {
    let queue = Rc::new(RefCell::new(VecDeque::new()));
    let ready = Rc::new(Notifier::new());
    let sum = Rc::new(RefCell::new(0));

    let consumer = {
        let queue = Rc::clone(&queue);
        let ready = Rc::clone(&ready);
        let sum = Rc::clone(&sum);
        sched
            .spawn(move |sched| async move {
                loop {
                    let item = queue.borrow_mut().pop_front();
                    match item {
                        Some(None) => break,
                        Some(Some(value)) => *sum.borrow_mut() += value,
                        None => ready.wait(&sched, ()).await,
                    }
                }
            })
            .unwrap()
    };

    let producer = {
        let queue = Rc::clone(&queue);
        let ready = Rc::clone(&ready);
        sched
            .spawn(move |sched| async move {
                for i in 0..100 {
                    queue.borrow_mut().push_back(Some(i));
                    ready.notify_one();
                    if i % 10 == 0 {
                        sched.yield_now().await;
                    }
                }
                queue.borrow_mut().push_back(None);
                ready.notify_all();
            })
            .unwrap()
    };

    sched.join(&producer).await.unwrap();
    sched.join(&consumer).await.unwrap();
    // 0 + 1 + ... + 99
    assert_eq!(*sum.borrow(), 4950);
});

fiber_test!(async fn test_sleepers_finish_in_deadline_order(sched) {
    let order = Rc::new(RefCell::new(Vec::new()));
    let mut fibers = Vec::new();

    for ms in [30u64, 10, 20] {
        let order = Rc::clone(&order);
        let fiber = sched
            .spawn(move |sched| async move {
                sched.sleep_for(Duration::from_millis(ms)).await;
                order.borrow_mut().push(ms);
            })
            .unwrap();
        fibers.push(fiber);
    }

    for fiber in &fibers {
        sched.join(fiber).await.unwrap();
    }
    assert_eq!(*order.borrow(), vec![10, 20, 30]);
});

fiber_test!(async fn test_main_context_sleeps_between_fibers(sched) {
    let start = Instant::now();
    let ticks = Rc::new(RefCell::new(0));

    let ticks_clone = Rc::clone(&ticks);
    sched
        .spawn(move |sched| async move {
            for _ in 0..3 {
                *ticks_clone.borrow_mut() += 1;
                sched.sleep_for(Duration::from_millis(5)).await;
            }
        })
        .unwrap();

    let expired = !sched.sleep_for(Duration::from_millis(25)).await;
    assert!(expired);
    assert!(start.elapsed() >= Duration::from_millis(25));
    assert_eq!(*ticks.borrow(), 3);
});

#[test]
fn test_fiber_woken_from_another_thread() {
    let harness = Harness::new();
    let scheduler = &harness.scheduler;
    let notifier = Arc::new(Notifier::new());
    let received = Rc::new(RefCell::new(None));

    let waiting = Arc::clone(&notifier);
    let received_clone = Rc::clone(&received);
    scheduler
        .spawn(move |sched| async move {
            waiting.wait(&sched, ()).await;
            *received_clone.borrow_mut() = Some(sched.active());
        })
        .unwrap();

    let remote = Arc::clone(&notifier);
    let notifying = thread::spawn(move || {
        while remote.waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(10));
        remote.notify_one()
    });

    // The parked fiber's keep-alive token holds the reactor open until the
    // notification arrives
    scheduler.run_until_idle().unwrap();
    assert!(notifying.join().unwrap());
    assert!(received.borrow().is_some_and(|id| !id.is_main()));
    harness.assert_tokens_balanced();
}

#[test]
fn test_reactor_handlers_run_while_fibers_sleep() {
    let harness = Harness::new();
    let scheduler = &harness.scheduler;
    let handled = Arc::new(AtomicUsize::new(0));

    let handle = harness.event_loop.handle();
    let poster = {
        let handled = Arc::clone(&handled);
        thread::spawn(move || {
            for _ in 0..5 {
                let handled = Arc::clone(&handled);
                handle
                    .post(move || {
                        handled.fetch_add(1, Ordering::Relaxed);
                    })
                    .unwrap();
                thread::sleep(Duration::from_millis(2));
            }
        })
    };

    let sleeper = scheduler
        .spawn(|sched| async move {
            sched.sleep_for(Duration::from_millis(40)).await;
        })
        .unwrap();

    scheduler.block_on(scheduler.join(&sleeper)).unwrap().unwrap();
    poster.join().unwrap();
    scheduler.run_until_idle().unwrap();

    assert_eq!(handled.load(Ordering::Relaxed), 5);
    harness.assert_tokens_balanced();
}

#[test]
fn test_independent_schedulers_per_thread() {
    let threads: Vec<_> = (0..4)
        .map(|t| {
            thread::spawn(move || {
                let harness = Harness::new();
                let scheduler = harness.scheduler.clone();
                let count = Rc::new(RefCell::new(0));

                for _ in 0..10 {
                    let count = Rc::clone(&count);
                    scheduler
                        .spawn(move |sched| async move {
                            sched.yield_now().await;
                            *count.borrow_mut() += t;
                        })
                        .unwrap();
                }

                scheduler.run_until_idle().unwrap();
                harness.assert_tokens_balanced();
                let total = *count.borrow();
                total
            })
        })
        .collect();

    let totals: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    assert_eq!(totals, vec![0, 10, 20, 30]);
}
