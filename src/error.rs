//! Central engine-fault error type.
//!
//! Validation findings (the expected output of running a document against a
//! grammar) are ordinary values — see [`crate::grammar::ValidationError`] —
//! and never travel through this type. `Error` covers implementation faults
//! only: a broken cycle invariant, an impossible event index, a query aimed
//! at a node the engine cannot address. Diese Fehler sind fatal: der
//! Scheduler stoppt und der Validator darf nicht weiterverwendet werden.

use core::fmt;
use std::borrow::Cow;

/// Fatal engine faults.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The cooperative cycle was re-entered while already running.
    ///
    /// Der Zyklus ist nicht reentrant; ein Listener oder Host-Callback hat
    /// waehrend eines laufenden Zyklus erneut in den Scheduler gerufen.
    ReentrantCycle,
    /// An event index was computed that cannot exist in the stream.
    ///
    /// Raised while locating a walker for a query when the annotations the
    /// computation relies on are missing or inconsistent.
    EventIndex {
        /// The index the computation arrived at (u64::MAX when unknown).
        computed: u64,
        /// Where in the engine the impossible index surfaced.
        context: Cow<'static, str>,
    },
    /// A query addressed a node kind that cannot anchor validation.
    ///
    /// Nur Element-, Text- und Dokumentknoten sind als Query-Container
    /// zulaessig.
    InvalidQueryTarget {
        /// The offending node kind, as a display name.
        kind: &'static str,
    },
    /// The walker cache contradicts the traversal state.
    CacheCorrupted(Cow<'static, str>),
    /// A node handle does not belong to the validated document.
    ForeignNode,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReentrantCycle => write!(f, "validation cycle re-entered while running"),
            Self::EventIndex { computed, context } => {
                if *computed == u64::MAX {
                    write!(f, "impossible event index in {context}")
                } else {
                    write!(f, "impossible event index {computed} in {context}")
                }
            }
            Self::InvalidQueryTarget { kind } => {
                write!(f, "query target must be an element, text or document node, got {kind}")
            }
            Self::CacheCorrupted(msg) => write!(f, "walker cache corrupted: {msg}"),
            Self::ForeignNode => write!(f, "node does not belong to the validated document"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Erstellt einen `EventIndex`-Fehler mit Kontext.
    pub(crate) fn event_index(computed: u64, context: impl Into<Cow<'static, str>>) -> Self {
        Self::EventIndex {
            computed,
            context: context.into(),
        }
    }
}

/// A convenience `Result` type alias using [`Error`].
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentrant_cycle_display() {
        let msg = Error::ReentrantCycle.to_string();
        assert!(msg.contains("re-entered"), "{msg}");
    }

    #[test]
    fn event_index_display() {
        let e = Error::event_index(42, "walker_at");
        let msg = e.to_string();
        assert!(msg.contains("42"), "{msg}");
        assert!(msg.contains("walker_at"), "{msg}");
    }

    #[test]
    fn event_index_unknown_display() {
        let e = Error::event_index(u64::MAX, "reset");
        let msg = e.to_string();
        assert!(!msg.contains("18446744073709551615"), "{msg}");
        assert!(msg.contains("reset"), "{msg}");
    }

    #[test]
    fn invalid_query_target_display() {
        let e = Error::InvalidQueryTarget { kind: "comment" };
        let msg = e.to_string();
        assert!(msg.contains("comment"), "{msg}");
    }

    #[test]
    fn result_type_alias_works() {
        let ok: Result<u32> = Ok(7);
        assert_eq!(ok.unwrap(), 7);
        let err: Result<u32> = Err(Error::ForeignNode);
        assert!(err.is_err());
    }
}
