#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

//! A thread-safe deferred result with a dynamic callback chain.
//!
//! A [`Deferred`] associates an ordered chain of transformations with a
//! result that becomes available later. It differs from a plain future
//! in three ways: links can be appended after the result is already
//! known (they then run immediately on the appending thread); a link
//! may return another deferred, suspending the chain until that inner
//! deferred settles and transparently inlining its outcome; and every
//! pair of links carries a parallel error path, with the carried
//! [`Outcome`] moving between paths as links fail and recover.
//!
//! The crate creates no threads and performs no I/O. Links execute on
//! whichever thread posts a result, appends to an already-completed
//! deferred, or completes an inner deferred the chain was paused on.
//!
//! ```
//! use std::sync::Arc;
//! use deferred::{downcast, Deferred, Reply};
//!
//! let d = Deferred::new();
//! d.on_success(|n: Arc<i32>| Reply::value(*n * 2))
//!     .on_success(|n: Arc<i32>| Reply::value(*n + 1));
//! d.complete(Reply::value(10));
//! assert_eq!(*downcast::<i32>(d.join().unwrap()), 21);
//! ```

mod chain;
mod deferred;
mod failure;
mod group;
mod outcome;

pub use crate::deferred::Deferred;
pub use crate::failure::{Failure, GroupFailure, JoinError};
pub use crate::outcome::{downcast, Outcome, Reply, Value};
