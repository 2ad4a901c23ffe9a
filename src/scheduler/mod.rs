//! Cooperative fiber scheduling
//!
//! This module provides the scheduling algorithm interface, its round-robin
//! implementation with the wait queue it runs on, and the per-thread
//! [`Scheduler`] that fibers talk to.

pub mod algorithm;
pub mod core;
pub mod queue;
pub mod round_robin;

pub use algorithm::Algorithm;
pub use self::core::{Join, Scheduler, Wait, WaitUntil, Yield};
pub use queue::{Entry, WaitQueue};
pub use round_robin::{RoundRobin, RoundRobinConfig, RoundRobinStats};
