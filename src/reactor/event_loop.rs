//! Built-in event loop
//!
//! A small single-threaded reactor in the spirit of an I/O service: handlers
//! can be posted from any thread through a bounded channel, timers live in a
//! loop-local min-heap, and [`Work`] guards keep the loop from reporting itself
//! idle. The loop has work while any guard is alive, a timer is pending, or an
//! event is queued.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};

use super::{KeepAlive, Reactor, Remote};
use crate::error::{Error, Result};

/// Timer ID for tracking individual timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

/// A timer entry in the heap
struct TimerEntry {
    id: TimerId,
    deadline: Instant,
    callback: Box<dyn FnOnce() + 'static>,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // reversed for a min-heap; equal deadlines fire in scheduling order
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TimerEntry {}

type Handler = Box<dyn FnOnce() + Send + 'static>;

enum Event {
    Handler(Handler),
    Wake,
}

/// Event loop configuration
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Capacity of the cross-thread event channel
    pub queue_capacity: usize,
    /// Name used in log messages
    pub name: String,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            name: "event-loop".to_string(),
        }
    }
}

/// Keep-alive guard: the loop is never idle while one exists
#[derive(Debug)]
pub struct Work {
    count: Arc<AtomicUsize>,
}

impl Work {
    fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self { count }
    }
}

impl Clone for Work {
    fn clone(&self) -> Self {
        Work::new(Arc::clone(&self.count))
    }
}

impl Drop for Work {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

impl KeepAlive for Work {}

/// Cloneable, thread-safe handle to an [`EventLoop`]
#[derive(Clone)]
pub struct EventLoopHandle {
    sender: Sender<Event>,
    work: Arc<AtomicUsize>,
    capacity: usize,
}

impl EventLoopHandle {
    /// Post a handler to run on the loop's thread
    ///
    /// Never blocks. Fails with `EventLoopFull` while the event channel is
    /// full and with `EventLoopClosed` once the loop has been dropped; the
    /// handler is not queued in either case. On the loop's own thread use
    /// [`EventLoop::post`], which cannot fail.
    pub fn post(&self, handler: impl FnOnce() + Send + 'static) -> Result<()> {
        match self.sender.try_send(Event::Handler(Box::new(handler))) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::EventLoopFull {
                capacity: self.capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(Error::EventLoopClosed),
        }
    }

    /// Acquire a keep-alive guard from any thread
    pub fn work(&self) -> Work {
        Work::new(Arc::clone(&self.work))
    }
}

impl Remote for EventLoopHandle {
    fn wake(&self) {
        // A full channel already guarantees the loop will wake up
        let _ = self.sender.try_send(Event::Wake);
    }
}

/// Single-threaded reactor with posted handlers and timers
pub struct EventLoop {
    config: EventLoopConfig,
    sender: Sender<Event>,
    receiver: Receiver<Event>,
    /// Handlers posted on the loop thread while the channel was full
    overflow: RefCell<VecDeque<Handler>>,
    work: Arc<AtomicUsize>,
    timers: RefCell<BinaryHeap<TimerEntry>>,
    cancelled: RefCell<HashSet<TimerId>>,
    next_timer_id: Cell<usize>,
}

impl EventLoop {
    /// Create an event loop with default configuration
    pub fn new() -> Self {
        Self::with_config(EventLoopConfig::default())
    }

    /// Create an event loop with custom configuration
    pub fn with_config(config: EventLoopConfig) -> Self {
        log::info!(
            "Creating {} with event queue capacity {}",
            config.name,
            config.queue_capacity
        );

        let (sender, receiver) = bounded(config.queue_capacity);
        Self {
            config,
            sender,
            receiver,
            overflow: RefCell::new(VecDeque::new()),
            work: Arc::new(AtomicUsize::new(0)),
            timers: RefCell::new(BinaryHeap::new()),
            cancelled: RefCell::new(HashSet::new()),
            next_timer_id: Cell::new(0),
        }
    }

    /// Get the loop configuration
    pub fn config(&self) -> &EventLoopConfig {
        &self.config
    }

    /// Get a handle usable from other threads
    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle {
            sender: self.sender.clone(),
            work: Arc::clone(&self.work),
            capacity: self.config.queue_capacity,
        }
    }

    /// Post a handler to run on the next drive
    ///
    /// Never blocks: once the channel is full, handlers posted here wait in a
    /// loop-local overflow queue, still in posting order.
    pub fn post(&self, handler: impl FnOnce() + Send + 'static) {
        let handler: Handler = Box::new(handler);
        let mut overflow = self.overflow.borrow_mut();
        if !overflow.is_empty() {
            overflow.push_back(handler);
            return;
        }
        match self.sender.try_send(Event::Handler(handler)) {
            Ok(()) => {}
            Err(TrySendError::Full(Event::Handler(handler))) => overflow.push_back(handler),
            // The loop owns a receiver, so the channel cannot be disconnected
            Err(_) => {}
        }
    }

    /// Acquire a keep-alive guard
    pub fn work(&self) -> Work {
        Work::new(Arc::clone(&self.work))
    }

    /// Number of live keep-alive guards
    pub fn outstanding_work(&self) -> usize {
        self.work.load(Ordering::Acquire)
    }

    /// Schedule a callback to run after the specified duration
    pub fn schedule(&self, duration: Duration, callback: impl FnOnce() + 'static) -> TimerId {
        self.schedule_at(Instant::now() + duration, callback)
    }

    /// Schedule a callback to run once `deadline` has passed
    pub fn schedule_at(&self, deadline: Instant, callback: impl FnOnce() + 'static) -> TimerId {
        let id = TimerId(self.next_timer_id.get());
        self.next_timer_id.set(id.0 + 1);

        self.timers.borrow_mut().push(TimerEntry {
            id,
            deadline,
            callback: Box::new(callback),
        });
        id
    }

    /// Cancel a scheduled timer
    pub fn cancel(&self, timer_id: TimerId) -> bool {
        let pending = self.timers.borrow().iter().any(|e| e.id == timer_id);
        pending && self.cancelled.borrow_mut().insert(timer_id)
    }

    /// Number of timers that have neither fired nor been cancelled
    pub fn pending_timers(&self) -> usize {
        self.timers.borrow().len() - self.cancelled.borrow().len()
    }

    /// Whether the loop has anything that could still produce an event
    pub fn has_work(&self) -> bool {
        self.outstanding_work() > 0
            || self.pending_timers() > 0
            || !self.receiver.is_empty()
            || !self.overflow.borrow().is_empty()
    }

    /// Drive the loop until it runs out of work. Returns the number of
    /// completions handled.
    pub fn run(&self) -> usize {
        let mut total = 0;
        loop {
            let handled = self.drive_once();
            if handled == 0 {
                return total;
            }
            total += handled;
        }
    }

    /// Deadline of the earliest live timer
    fn next_timer(&self) -> Option<Instant> {
        let mut timers = self.timers.borrow_mut();
        let mut cancelled = self.cancelled.borrow_mut();
        while let Some(top) = timers.peek() {
            if cancelled.remove(&top.id) {
                timers.pop();
            } else {
                return Some(top.deadline);
            }
        }
        None
    }

    fn fire_timers(&self, now: Instant) -> usize {
        let mut fired = 0;
        loop {
            // Callbacks may schedule new timers; release the heap first
            let entry = {
                let mut timers = self.timers.borrow_mut();
                match timers.peek() {
                    Some(top) if top.deadline <= now => timers.pop(),
                    _ => None,
                }
            };
            let Some(entry) = entry else {
                return fired;
            };
            if self.cancelled.borrow_mut().remove(&entry.id) {
                continue;
            }
            (entry.callback)();
            fired += 1;
        }
    }

    fn dispatch(&self, event: Event) -> usize {
        match event {
            Event::Handler(handler) => handler(),
            Event::Wake => {}
        }
        1
    }

    /// Handle everything that is ready right now without blocking
    fn poll_ready(&self) -> usize {
        let mut handled = self.fire_timers(Instant::now());
        loop {
            if let Ok(event) = self.receiver.try_recv() {
                handled += self.dispatch(event);
                continue;
            }
            // Handlers may post again; release the overflow queue first
            let next = self.overflow.borrow_mut().pop_front();
            match next {
                Some(handler) => {
                    handler();
                    handled += 1;
                }
                None => return handled,
            }
        }
    }

    fn wait_event(&self, deadline: Option<Instant>) -> usize {
        let event = match deadline {
            Some(deadline) => self.receiver.recv_deadline(deadline).ok(),
            None => self.receiver.recv().ok(),
        };
        event.map_or(0, |event| self.dispatch(event))
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor for EventLoop {
    type KeepAlive = Work;

    fn drive_once(&self) -> usize {
        loop {
            let handled = self.poll_ready();
            if handled > 0 || !self.has_work() {
                return handled;
            }
            let handled = self.wait_event(self.next_timer());
            if handled > 0 {
                return handled + self.poll_ready();
            }
        }
    }

    fn drive_until(&self, deadline: Instant) -> usize {
        let handled = self.poll_ready();
        if handled > 0 {
            return handled;
        }

        let until = self
            .next_timer()
            .map_or(deadline, |timer| timer.min(deadline));
        if until > Instant::now() {
            let handled = self.wait_event(Some(until));
            if handled > 0 {
                return handled + self.poll_ready();
            }
        }
        self.poll_ready()
    }

    fn keep_alive(&self) -> Work {
        self.work()
    }

    fn remote(&self) -> Arc<dyn Remote> {
        Arc::new(self.handle())
    }
}
