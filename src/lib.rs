//! rngine – incremental, pausable Relax NG validation for mutable XML
//! document trees.
//!
//! Given a pre-compiled grammar and a document tree, a [`Validator`]
//! progressively fires the event stream implied by an in-order traversal
//! into a grammar walker, reports findings as they are discovered, and lets
//! the host mutate the tree and cheaply re-validate from a point close to
//! the edit. Scheduling is strictly single-threaded cooperative: the host
//! pumps the validator between its own work.
//!
//! # Beispiel
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use rngine::grammar::GrammarBuilder;
//! use rngine::{safe_parse, Validator, ValidatorOptions, WorkingState};
//!
//! // element a { element b { empty } }
//! let b = GrammarBuilder::new();
//! let inner = b.element(b.name("", "b"), b.empty());
//! let start = b.element(b.name("", "a"), inner);
//! let grammar = b.finish(start);
//!
//! let doc = Rc::new(RefCell::new(safe_parse("<a><b/></a>").unwrap()));
//! let mut validator = Validator::new(grammar, Rc::clone(&doc), ValidatorOptions::default());
//! let snapshot = validator.run_to_completion().unwrap();
//! assert_eq!(snapshot.state, WorkingState::Valid);
//! assert!(validator.errors().is_empty());
//! ```

pub mod dom;
pub mod emitter;
pub mod error;
pub mod event;
pub mod grammar;
pub mod parse;
pub mod qname;
pub mod validator;

mod annotations;
mod cache;

pub use error::{Error, Result};

/// HashMap mit ahash (schneller, nicht DoS-resistent). Oeffentlich, weil
/// Namespace-Mappings in der API diese Form haben.
pub type FastHashMap<K, V> = hashbrown::HashMap<K, V, ahash::RandomState>;

/// HashSet mit ahash.
pub type FastHashSet<K> = hashbrown::HashSet<K, ahash::RandomState>;

/// IndexMap mit ahash (deterministische Iteration + schnelles Hashing).
pub type FastIndexMap<K, V> = indexmap::IndexMap<K, V, ahash::RandomState>;

// Public API: validator
pub use validator::{
    ErrorRecord, Validator, ValidatorOptions, WorkingState, WorkingStateSnapshot,
};

// Public API: grammar
pub use grammar::{
    FireResult, Grammar, GrammarBuilder, GrammarWalker, NameClass, PossibleEvents,
    ValidationError,
};

// Public API: tree & names
pub use dom::{Attribute, Document, NodeId, NodeKind};
pub use qname::{ExpandedName, NamespaceResolver, QName};

// Public API: events & observers
pub use emitter::{Dispatch, Emitter, EventName, ListenerId, ValidatorEvent};
pub use event::{EventKind, ValidationEvent};

// Public API: parsing & annotations
pub use annotations::PropertyValue;
pub use parse::{ParsingError, safe_parse};
