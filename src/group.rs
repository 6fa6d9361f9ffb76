//! N-to-1 demultiplexing of deferreds.

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::chain::Link;
use crate::deferred::Deferred;
use crate::failure::Failure;
use crate::outcome::{Outcome, Reply};

/// Builds the parent deferred over `children`. With `ordered` set,
/// outcomes land in the slot of their originating child; otherwise they
/// are gathered in completion order.
pub(crate) fn demux(children: Vec<Deferred>, ordered: bool) -> Deferred {
    let parent = Deferred::new();
    let count = children.len();
    if count == 0 {
        parent.complete(Reply::value(Vec::<Outcome>::new()));
        return parent;
    }
    let group = Arc::new(Group {
        parent: parent.clone(),
        state: Mutex::new(GroupState {
            collected: if ordered {
                Collected::Indexed(vec![None; count])
            } else {
                Collected::Arrival(Vec::with_capacity(count))
            },
            remaining: count,
        }),
    });
    for (index, child) in children.into_iter().enumerate() {
        let group = group.clone();
        // The notifier leaves the child's own chain behavior untouched:
        // it records the outcome and passes it along unchanged.
        child.push(Link::Both(Box::new(move |outcome: Outcome| {
            group.record(index, outcome.clone());
            Reply::Settled(outcome)
        })));
    }
    parent
}

struct Group {
    parent: Deferred,
    state: Mutex<GroupState>,
}

struct GroupState {
    collected: Collected,
    remaining: usize,
}

/// How child outcomes are gathered.
enum Collected {
    /// Appended as children complete.
    Arrival(Vec<Outcome>),
    /// Written into the slot of the originating child.
    Indexed(Vec<Option<Outcome>>),
}

impl Group {
    fn record(&self, index: usize, outcome: Outcome) {
        let finished = {
            let mut state = self.state.lock();
            match &mut state.collected {
                Collected::Arrival(list) => list.push(outcome),
                Collected::Indexed(slots) => {
                    debug_assert!(slots[index].is_none(), "group child reported twice");
                    slots[index] = Some(outcome);
                }
            }
            state.remaining -= 1;
            if state.remaining == 0 {
                Some(std::mem::replace(
                    &mut state.collected,
                    Collected::Arrival(Vec::new()),
                ))
            } else {
                None
            }
        };
        // The parent completes with the group lock released, so its
        // links never run under the lock.
        if let Some(collected) = finished {
            self.finish(collected);
        }
    }

    fn finish(&self, collected: Collected) {
        let outcomes: Vec<Outcome> = match collected {
            Collected::Arrival(list) => list,
            Collected::Indexed(slots) => slots
                .into_iter()
                .map(|slot| slot.expect("bug: group finished with an empty slot"))
                .collect(),
        };
        debug!(
            "group of {} children finished, completing {:?}",
            outcomes.len(),
            self.parent
        );
        let first_failure = outcomes
            .iter()
            .find_map(|outcome| outcome.as_ref().err().cloned());
        match first_failure {
            Some(first) => self
                .parent
                .complete(Reply::Settled(Err(Failure::grouped(outcomes, first)))),
            None => self.parent.complete(Reply::value(outcomes)),
        }
    }
}
