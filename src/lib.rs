//! # RustFibers
//!
//! Cooperative fibers for Rust, scheduled per thread on top of a reactor.
//!
//! ## Features
//!
//! - **Fibers**: Lightweight cooperative tasks that suspend only at explicit points
//! - **Scheduling algorithms**: A pluggable [`Algorithm`] with a round-robin default
//! - **Reactor integration**: The scheduler drives an event loop whenever nothing is runnable
//! - **Notifiers**: Condition-variable style waits that can be woken from any thread
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rust_fibers::prelude::*;
//! use std::time::Duration;
//!
//! let scheduler = Scheduler::round_robin(EventLoop::new());
//!
//! let worker = scheduler
//!     .spawn(|sched| async move {
//!         sched.sleep_for(Duration::from_millis(10)).await;
//!         println!("worker done");
//!     })
//!     .unwrap();
//!
//! scheduler.block_on(scheduler.join(&worker)).unwrap().unwrap();
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod error;
pub mod fiber;
pub mod notify;
pub mod reactor;
pub mod scheduler;

/// Convenient re-exports for common functionality
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::fiber::{Fiber, FiberId, FiberState};
    pub use crate::notify::{MainNotifier, Notifier};
    pub use crate::reactor::{EventLoop, EventLoopConfig, KeepAlive, Reactor, Remote};
    pub use crate::scheduler::{Algorithm, RoundRobin, RoundRobinConfig, Scheduler};
}

pub use prelude::*;
