//! Wait queue for suspended and runnable fibers
//!
//! Entries live in one of two FIFO sequences: `ready` holds fibers that may be
//! resumed now, `waiting` holds fibers parked until woken or until their
//! deadline passes. Each entry carries the keep-alive token that was acquired
//! when it was queued; the token leaves the queue together with the entry.

use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::time::Instant;

use crate::fiber::{Fiber, FiberId, FiberState};

/// A queued fiber with its wake deadline and keep-alive token
pub struct Entry<K> {
    fiber: Fiber,
    /// `None` means no deadline
    deadline: Option<Instant>,
    keep_alive: K,
    /// Set once a higher-priority entry has been placed ahead of this one
    passed: bool,
}

impl<K> Entry<K> {
    /// Create an entry without a deadline
    pub fn new(fiber: Fiber, keep_alive: K) -> Self {
        Self::with_deadline(fiber, None, keep_alive)
    }

    /// Create an entry with an optional deadline
    pub fn with_deadline(fiber: Fiber, deadline: Option<Instant>, keep_alive: K) -> Self {
        Self {
            fiber,
            deadline,
            keep_alive,
            passed: false,
        }
    }

    /// Get the queued fiber
    pub fn fiber(&self) -> &Fiber {
        &self.fiber
    }

    /// Get the wake deadline
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the deadline has been reached at `now`
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Split the entry into its fiber and keep-alive token
    pub fn into_parts(self) -> (Fiber, K) {
        (self.fiber, self.keep_alive)
    }
}

impl<K> Debug for Entry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("fiber", &self.fiber.id())
            .field("deadline", &self.deadline)
            .field("passed", &self.passed)
            .finish()
    }
}

/// Ready and waiting sequences of fibers
pub struct WaitQueue<K> {
    ready: VecDeque<Entry<K>>,
    waiting: VecDeque<Entry<K>>,
}

impl<K> WaitQueue<K> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            waiting: VecDeque::new(),
        }
    }

    /// Append a runnable entry
    ///
    /// The entry goes to the tail, except that it moves ahead of the trailing
    /// run of lower-priority entries that have not been passed over before.
    /// Every entry it passes is marked, so no entry is ever passed twice.
    pub fn push_ready(&mut self, mut entry: Entry<K>) {
        let priority = entry.fiber.priority();
        let mut at = self.ready.len();
        while at > 0 {
            let prev = &self.ready[at - 1];
            if prev.passed || prev.fiber.priority() >= priority {
                break;
            }
            at -= 1;
        }
        for passed in self.ready.range_mut(at..) {
            passed.passed = true;
        }

        entry.passed = false;
        entry.fiber.set_state(FiberState::Ready);
        self.ready.insert(at, entry);
    }

    /// Append a parked entry to the waiting sequence
    pub fn push_waiting(&mut self, entry: Entry<K>) {
        let state = if entry.deadline.is_some() {
            FiberState::Suspended
        } else {
            FiberState::Waiting
        };
        entry.fiber.set_state(state);
        entry.fiber.set_timed_out(false);
        self.waiting.push_back(entry);
    }

    /// Move every waiting entry whose deadline is at or before `now` to the
    /// ready sequence, in queue order, marking each fiber as timed out.
    /// Returns how many moved.
    pub fn promote_expired(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        let mut index = 0;
        while index < self.waiting.len() {
            if self.waiting[index].is_expired(now) {
                if let Some(entry) = self.waiting.remove(index) {
                    entry.fiber.set_timed_out(true);
                    self.push_ready(entry);
                    promoted += 1;
                }
            } else {
                index += 1;
            }
        }
        promoted
    }

    /// Move a waiting fiber to the ready sequence. Returns `false` if the
    /// fiber was not waiting.
    pub fn wake(&mut self, id: FiberId) -> bool {
        match self.waiting.iter().position(|e| e.fiber.id() == id) {
            Some(index) => {
                if let Some(entry) = self.waiting.remove(index) {
                    self.push_ready(entry);
                }
                true
            }
            None => false,
        }
    }

    /// Remove a fiber's entry from either sequence
    pub fn remove(&mut self, id: FiberId) -> Option<Entry<K>> {
        if let Some(index) = self.ready.iter().position(|e| e.fiber.id() == id) {
            return self.ready.remove(index);
        }
        let index = self.waiting.iter().position(|e| e.fiber.id() == id)?;
        self.waiting.remove(index)
    }

    /// Bring a waiting fiber's deadline forward to `deadline` if it is earlier
    pub fn tighten(&mut self, id: FiberId, deadline: Instant) -> bool {
        match self.waiting.iter_mut().find(|e| e.fiber.id() == id) {
            Some(entry) => {
                let tightened = entry.deadline.map_or(deadline, |d| d.min(deadline));
                entry.deadline = Some(tightened);
                entry.fiber.set_state(FiberState::Suspended);
                true
            }
            None => false,
        }
    }

    /// Take the next runnable entry
    pub fn pop_ready(&mut self) -> Option<Entry<K>> {
        self.ready.pop_front()
    }

    /// Earliest deadline among waiting entries
    pub fn next_deadline(&self) -> Option<Instant> {
        self.waiting.iter().filter_map(|e| e.deadline).min()
    }

    /// Whether the fiber has an entry in either sequence
    pub fn contains(&self, id: FiberId) -> bool {
        self.ready.iter().chain(self.waiting.iter()).any(|e| e.fiber.id() == id)
    }

    /// Number of runnable entries
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Number of parked entries
    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Total number of entries
    pub fn len(&self) -> usize {
        self.ready.len() + self.waiting.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.waiting.is_empty()
    }
}

impl<K> Default for WaitQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}
