//! Carriers that flow through a callback chain.
//!
//! The chain is monomorphic: links consume and produce type-erased,
//! shared payloads, and the typed methods on
//! [`Deferred`](crate::Deferred) are thin adapters over them.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use crate::deferred::Deferred;
use crate::failure::Failure;

/// A success payload carried along a chain.
///
/// Payloads are shared rather than owned: every observer of a settled
/// deferred (a joiner, a group notifier, a continuation adopting an
/// inner result) sees the same allocation.
pub type Value = Arc<dyn Any + Send + Sync>;

/// The value currently carried by a chain.
///
/// An `Err` is of *error kind* and selects the error path at the next
/// pair of links; an `Ok` selects the success path.
pub type Outcome = Result<Value, Failure>;

/// What a link hands back to the chain.
pub enum Reply {
    /// The chain continues with this outcome.
    Settled(Outcome),
    /// The chain suspends until the given deferred completes, then
    /// continues with whatever outcome it produced.
    Deferred(Deferred),
}

impl Reply {
    /// A settled success carrying `value`.
    pub fn value<T: Any + Send + Sync>(value: T) -> Reply {
        Reply::Settled(Ok(Arc::new(value)))
    }

    /// A settled failure; the next pair of links runs its error side.
    pub fn failure(failure: impl Into<Failure>) -> Reply {
        Reply::Settled(Err(failure.into()))
    }
}

impl From<Outcome> for Reply {
    fn from(outcome: Outcome) -> Reply {
        Reply::Settled(outcome)
    }
}

impl From<Failure> for Reply {
    fn from(failure: Failure) -> Reply {
        Reply::Settled(Err(failure))
    }
}

impl From<Deferred> for Reply {
    fn from(deferred: Deferred) -> Reply {
        Reply::Deferred(deferred)
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Settled(Ok(_)) => fmt.write_str("Settled(Ok(..))"),
            Reply::Settled(Err(failure)) => write!(fmt, "Settled(Err({:?}))", failure),
            Reply::Deferred(deferred) => write!(fmt, "Deferred({:?})", deferred),
        }
    }
}

/// Unwraps a success payload produced by a chain.
///
/// # Panics
///
/// Panics when the payload is not a `T`. Expecting the wrong type from
/// a chain is a programming error, not a recoverable failure.
pub fn downcast<T: Any + Send + Sync>(value: Value) -> Arc<T> {
    match value.downcast::<T>() {
        Ok(value) => value,
        Err(_) => panic!("expected the chain to carry a `{}`", type_name::<T>()),
    }
}
