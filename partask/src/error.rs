//!
//! Error taxonomy
//!
//! Every failure a caller can observe is one of the five kinds below. The
//! first four are runtime conditions of the scheduler itself; `UserFailure`
//! wraps whatever a submitted closure reported.
//!

use std::sync::Arc;

/// A user closure's error, boxed so `PartaskError` can stay `Clone` (a
/// cancellation reason is read by every future in a group, not consumed
/// once).
pub type BoxError = Arc<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PartaskError {
    /// A group was cancelled while a member was running or waiting, for no
    /// recorded user-failure reason (an external `cancel_group` call).
    #[error("task interrupted: group was cancelled")]
    Interrupted,

    /// A `join` on a group whose cancellation accumulated multiple causes.
    /// The list is the set of distinct user failures collected across the
    /// group subtree, in the order they were recorded.
    #[error("{} aggregate failure(s) in cancelled group", .0.len())]
    AggregateFailure(Vec<PartaskError>),

    /// A fatal programmer error: double-fulfillment, `join` called while
    /// holding a synchronized cell's critical section, enqueue on a group
    /// after shutdown, or `fulfill` on a non-promise. Not recoverable.
    #[error("misuse: {0}")]
    Misuse(String),

    /// `timed_access`'s deadline passed before the guard condition held.
    #[error("unavailable: deadline exceeded")]
    Unavailable,

    /// Whatever a user closure reported.
    #[error("user closure failed: {0}")]
    UserFailure(BoxError),
}

impl PartaskError {
    /// Wrap an arbitrary error as a `UserFailure`.
    pub fn from_user<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        PartaskError::UserFailure(Arc::new(err))
    }

    /// True for `Interrupted` and `AggregateFailure` — i.e. the failure
    /// originates from cancellation rather than from the closure itself.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PartaskError::Interrupted | PartaskError::AggregateFailure(_))
    }

    /// Flatten a cancellation into the group's collected failures, if any,
    /// so the earliest root cause surfaces instead of a bare `Interrupted`.
    /// Used by `join` per §4.4.
    pub fn flatten_with(self, collected: Vec<PartaskError>) -> PartaskError {
        match self {
            PartaskError::Interrupted if !collected.is_empty() => {
                if collected.len() == 1 {
                    collected.into_iter().next().unwrap()
                } else {
                    PartaskError::AggregateFailure(collected)
                }
            }
            other => other,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("a simple string-backed user error: {0}")]
pub struct StringError(pub String);

impl StringError {
    pub fn new(msg: impl Into<String>) -> Self {
        StringError(msg.into())
    }
}
