//! Error types for rust-fibers
//!
//! This module provides error handling types used throughout the library.

use thiserror::Error;

use crate::fiber::FiberId;

/// Main error type for scheduler operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Operation issued on a fiber or scheduler whose state forbids it
    #[error("Invalid state: {reason}")]
    InvalidState {
        /// What made the state invalid
        reason: String,
    },

    /// A fiber attempted to join itself
    #[error("Fiber {id} attempted to join itself")]
    SelfJoinDeadlock {
        /// The fiber that tried to join itself
        id: FiberId,
    },

    /// A required fiber handle was absent or unknown to the scheduler
    #[error("Precondition violated: {reason}")]
    PreconditionViolation {
        /// Which precondition failed
        reason: String,
    },

    /// The event loop's channel is full
    #[error("Event loop queue is full (capacity {capacity})")]
    EventLoopFull {
        /// Configured channel capacity
        capacity: usize,
    },

    /// The event loop has been dropped
    #[error("Event loop is closed")]
    EventLoopClosed,
}

impl Error {
    pub(crate) fn invalid_state(reason: impl Into<String>) -> Self {
        Error::InvalidState { reason: reason.into() }
    }

    pub(crate) fn precondition(reason: impl Into<String>) -> Self {
        Error::PreconditionViolation { reason: reason.into() }
    }
}

/// Convenient result type alias
pub type Result<T> = std::result::Result<T, Error>;
