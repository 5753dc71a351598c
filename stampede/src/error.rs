//! Error types for request coalescing.
//!
//! Every waiter bound to an in-flight computation receives the same
//! [`CoalesceError`]. Factory errors are wrapped once in an [`Arc`] so that
//! all waiters observe the identical error value, not a copy or a rewrite.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why a request was rejected before registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidArgumentReason {
    /// The key was empty.
    EmptyKey,
}

impl fmt::Display for InvalidArgumentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyKey => write!(f, "key must not be empty"),
        }
    }
}

/// Errors delivered by [`RequestCoalescer`](crate::coalesce::RequestCoalescer).
///
/// `E` is the factory's own error type. It is never transformed: the
/// [`Factory`](Self::Factory) variant holds the exact value the factory
/// returned, shared between waiters.
#[derive(Debug, Error)]
pub enum CoalesceError<E> {
    /// Rejected before any registration took place
    #[error("invalid argument: {0}")]
    InvalidArgument(InvalidArgumentReason),

    /// The factory returned an error
    #[error("{0}")]
    Factory(Arc<E>),

    /// The factory panicked while being invoked or polled
    #[error("factory panicked: {0}")]
    Panicked(Arc<str>),

    /// The shared computation was cancelled before it settled
    #[error("in-flight computation cancelled")]
    Cancelled,

    /// The shared computation exceeded the configured factory timeout
    #[error("factory timed out after {0:?}")]
    TimedOut(Duration),
}

impl<E> CoalesceError<E> {
    /// Returns the factory error, if this is one.
    pub fn factory_error(&self) -> Option<&E> {
        match self {
            Self::Factory(e) => Some(e.as_ref()),
            _ => None,
        }
    }

    /// Returns the shared handle to the factory error, if this is one.
    pub fn into_factory_error(self) -> Option<Arc<E>> {
        match self {
            Self::Factory(e) => Some(e),
            _ => None,
        }
    }

    /// Returns true if the shared computation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true if the shared computation hit the factory timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }

    /// Returns true if the request was rejected before registration.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

// Manual impl: cloning only touches the `Arc`, so `E` need not be `Clone`.
impl<E> Clone for CoalesceError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::InvalidArgument(reason) => Self::InvalidArgument(*reason),
            Self::Factory(e) => Self::Factory(Arc::clone(e)),
            Self::Panicked(msg) => Self::Panicked(Arc::clone(msg)),
            Self::Cancelled => Self::Cancelled,
            Self::TimedOut(d) => Self::TimedOut(*d),
        }
    }
}
