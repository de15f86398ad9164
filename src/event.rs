//! The six grammar events fired during tree traversal.
//!
//! Events borrow their strings from the document; they exist only for the
//! duration of a single `fire_event` call. Die Indizes im Event-Strom werden
//! nicht hier, sondern vom Traversal-Zustandsautomaten vergeben.

use core::fmt;

/// One atomic notification fed into a grammar walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationEvent<'a> {
    /// Opens the start tag of an element with the given expanded name.
    EnterStartTag {
        /// Namespace URI (empty for "no namespace").
        ns: &'a str,
        /// Local name.
        name: &'a str,
    },
    /// Names an attribute of the currently open start tag.
    AttributeName {
        /// Namespace URI (empty for "no namespace").
        ns: &'a str,
        /// Local name.
        name: &'a str,
    },
    /// The value of the most recently named attribute.
    AttributeValue {
        /// Attribute value, as written.
        value: &'a str,
    },
    /// Closes the currently open start tag.
    LeaveStartTag,
    /// Character data.
    Text {
        /// The text content.
        text: &'a str,
    },
    /// Closes the named element.
    EndTag {
        /// Namespace URI (empty for "no namespace").
        ns: &'a str,
        /// Local name.
        name: &'a str,
    },
}

impl ValidationEvent<'_> {
    /// The discriminant of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::EnterStartTag { .. } => EventKind::EnterStartTag,
            Self::AttributeName { .. } => EventKind::AttributeName,
            Self::AttributeValue { .. } => EventKind::AttributeValue,
            Self::LeaveStartTag => EventKind::LeaveStartTag,
            Self::Text { .. } => EventKind::Text,
            Self::EndTag { .. } => EventKind::EndTag,
        }
    }
}

impl fmt::Display for ValidationEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnterStartTag { ns, name } if ns.is_empty() => {
                write!(f, "enterStartTag({name})")
            }
            Self::EnterStartTag { ns, name } => write!(f, "enterStartTag({{{ns}}}{name})"),
            Self::AttributeName { ns, name } if ns.is_empty() => {
                write!(f, "attributeName({name})")
            }
            Self::AttributeName { ns, name } => write!(f, "attributeName({{{ns}}}{name})"),
            Self::AttributeValue { value } => write!(f, "attributeValue({value:?})"),
            Self::LeaveStartTag => write!(f, "leaveStartTag"),
            Self::Text { text } => write!(f, "text({text:?})"),
            Self::EndTag { ns, name } if ns.is_empty() => write!(f, "endTag({name})"),
            Self::EndTag { ns, name } => write!(f, "endTag({{{ns}}}{name})"),
        }
    }
}

/// Event discriminant, fuer Possibility-Sets und Dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `enterStartTag`
    EnterStartTag,
    /// `attributeName`
    AttributeName,
    /// `attributeValue`
    AttributeValue,
    /// `leaveStartTag`
    LeaveStartTag,
    /// `text`
    Text,
    /// `endTag`
    EndTag,
}
