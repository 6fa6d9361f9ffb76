//! The error taxonomy carried along deferred chains.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::outcome::Outcome;

/// An error of the kind that travels a chain's error path.
///
/// `Failure`s are cheap to clone, so the same failure can sit in a
/// settled deferred, be handed to a joiner, and be recorded by a group
/// all at once. Only failures are caught from links; panics unwind
/// through the chain unchanged.
#[derive(Clone, Debug, Error)]
pub enum Failure {
    /// An error raised by application code, described by a message.
    #[error("{0}")]
    Message(Arc<str>),

    /// An error adopted from another error type.
    #[error("{0}")]
    Wrapped(Arc<dyn std::error::Error + Send + Sync>),

    /// The aggregated failure of a group of deferreds.
    #[error("{0}")]
    Grouped(Arc<GroupFailure>),
}

impl Failure {
    /// A failure described by `message`.
    pub fn new(message: impl Into<String>) -> Failure {
        Failure::Message(message.into().into())
    }

    /// Adopts an existing error as a failure.
    pub fn wrap(error: impl std::error::Error + Send + Sync + 'static) -> Failure {
        Failure::Wrapped(Arc::new(error))
    }

    pub(crate) fn grouped(outcomes: Vec<Outcome>, first: Failure) -> Failure {
        Failure::Grouped(Arc::new(GroupFailure { outcomes, first }))
    }

    /// The aggregated details when this is a group failure.
    pub fn group(&self) -> Option<&GroupFailure> {
        match self {
            Failure::Grouped(group) => Some(group),
            _ => None,
        }
    }
}

impl From<&str> for Failure {
    fn from(message: &str) -> Failure {
        Failure::Message(message.into())
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Failure {
        Failure::Message(message.into())
    }
}

/// Aggregated failure of a group: the outcome of every child together
/// with the first failure encountered in traversal order.
pub struct GroupFailure {
    outcomes: Vec<Outcome>,
    first: Failure,
}

impl GroupFailure {
    /// Every child's outcome. Under an ordered group, entry `i` belongs
    /// to child `i`; otherwise entries appear in completion order.
    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    /// The first failure encountered in traversal order.
    pub fn first(&self) -> &Failure {
        &self.first
    }
}

impl fmt::Display for GroupFailure {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self
            .outcomes
            .iter()
            .filter(|outcome| outcome.is_err())
            .count();
        write!(
            fmt,
            "{} of {} grouped deferreds failed, first failure: {}",
            failed,
            self.outcomes.len(),
            self.first
        )
    }
}

impl fmt::Debug for GroupFailure {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("GroupFailure")
            .field("children", &self.outcomes.len())
            .field("first", &self.first)
            .finish()
    }
}

impl std::error::Error for GroupFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.first)
    }
}

/// Why a blocking join did not produce a value.
#[derive(Clone, Debug, Error)]
pub enum JoinError {
    /// The deferred settled on its error path.
    #[error(transparent)]
    Failed(#[from] Failure),

    /// The deadline elapsed before the deferred settled.
    #[error("timed out after {0} ms waiting for a deferred")]
    TimedOut(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn message_display() {
        let failure = Failure::new("boom");
        assert_eq!(failure.to_string(), "boom");
    }

    #[test]
    fn wrapped_display_forwards_to_the_source() {
        let failure = Failure::wrap(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk on fire",
        ));
        assert_eq!(failure.to_string(), "disk on fire");
    }

    #[test]
    fn grouped_display_counts_failures() {
        let first = Failure::new("boom");
        let outcomes: Vec<Outcome> = vec![
            Ok(Arc::new(1u32)),
            Err(first.clone()),
            Err(Failure::new("later")),
        ];
        let failure = Failure::grouped(outcomes, first);
        assert_eq!(
            failure.to_string(),
            "2 of 3 grouped deferreds failed, first failure: boom"
        );
        assert_eq!(failure.group().unwrap().outcomes().len(), 3);
    }

    #[test]
    fn join_error_from_failure() {
        let err = JoinError::from(Failure::new("boom"));
        assert_eq!(err.to_string(), "boom");
    }
}
