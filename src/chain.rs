//! Storage for a deferred's registered callback pairs.

use smallvec::SmallVec;

use crate::failure::Failure;
use crate::outcome::{Outcome, Reply, Value};

/// A success-path transformation.
pub(crate) type SuccessFn = Box<dyn FnOnce(Value) -> Reply + Send>;

/// An error-path transformation.
pub(crate) type ErrorFn = Box<dyn FnOnce(Failure) -> Reply + Send>;

/// A transformation attached to both paths at once.
pub(crate) type EitherFn = Box<dyn FnOnce(Outcome) -> Reply + Send>;

/// One registered callback pair.
///
/// Exactly one side runs, selected by the kind of the carried outcome;
/// an absent side passes the outcome through unchanged. A pair is one
/// value, so pairs are appended and consumed atomically and the
/// success/error sides cannot fall out of alignment.
pub(crate) enum Link {
    /// Independent success and error transformations.
    Callbacks {
        ok: Option<SuccessFn>,
        err: Option<ErrorFn>,
    },
    /// A single transformation that runs on whichever path is taken.
    Both(EitherFn),
}

impl Link {
    /// Runs the side selected by `outcome`, consuming the pair. The
    /// unselected side is dropped here, releasing its captures.
    pub(crate) fn invoke(self, outcome: Outcome) -> Reply {
        match self {
            Link::Callbacks { ok, err } => match outcome {
                Ok(value) => match ok {
                    Some(f) => f(value),
                    None => Reply::Settled(Ok(value)),
                },
                Err(failure) => match err {
                    Some(f) => f(failure),
                    None => Reply::Settled(Err(failure)),
                },
            },
            Link::Both(f) => f(outcome),
        }
    }
}

/// Upper bound on registered pairs, enforced by the `u16` window
/// indices. The bound doubles as the terminator for cyclic continuation
/// chains, which keep appending resume links until they trip it.
pub(crate) const MAX_CHAIN: u16 = 16_383;

/// Dense window of callback pairs.
///
/// `cursor` indexes the next pair to run and `end` the first free slot;
/// the live window is `[cursor, end)`. Executed slots are vacated so a
/// link's captures are released as soon as it has run, and the window
/// is shifted back to the front of the storage before the backing
/// vector is allowed to grow.
pub(crate) struct Chain {
    slots: SmallVec<[Option<Link>; 4]>,
    cursor: u16,
    end: u16,
}

impl Chain {
    pub(crate) fn new() -> Chain {
        Chain {
            slots: SmallVec::new(),
            cursor: 0,
            end: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.cursor == self.end
    }

    /// Number of pairs not yet executed.
    pub(crate) fn len(&self) -> u16 {
        self.end - self.cursor
    }

    /// Appends a pair at `end`.
    ///
    /// # Panics
    ///
    /// Panics when the pair would exceed [`MAX_CHAIN`].
    pub(crate) fn push(&mut self, link: Link) {
        if self.len() >= MAX_CHAIN {
            panic!(
                "too many callbacks registered on one deferred (max {})",
                MAX_CHAIN
            );
        }
        if self.cursor > 0 && self.slots.len() == self.slots.capacity() {
            // Reclaim vacated slots before the storage doubles.
            self.slots.drain(..self.cursor as usize);
            self.end -= self.cursor;
            self.cursor = 0;
        }
        self.slots.push(Some(link));
        self.end += 1;
    }

    /// Takes the next pair, or `None` when the window is empty. Once
    /// the window drains, it resets to the front of the storage.
    pub(crate) fn pop(&mut self) -> Option<Link> {
        if self.is_empty() {
            return None;
        }
        let link = self.slots[self.cursor as usize].take();
        debug_assert!(link.is_some(), "vacant slot inside the live window");
        self.cursor += 1;
        if self.cursor == self.end {
            self.cursor = 0;
            self.end = 0;
            self.slots.clear();
        }
        link
    }
}
