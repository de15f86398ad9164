//! Relax NG pattern grammar and its derivative walker.
//!
//! Patterns are interned into a shared arena ([`PatId`] is a `Copy` index,
//! memoized smart constructors keep the arena deduplicated). A
//! [`GrammarWalker`] is a cursor over the grammar's derivative state: it
//! consumes [`ValidationEvent`]s one at a time and answers which events are
//! possible next. Walker-Klone sind billig (Arena per `Rc` geteilt, Zustand
//! ist ein Index plus Namespace-Scope-Kette), darauf beruht der gesamte
//! Walker-Cache.
//!
//! The derivative computation follows the classic Clark algorithm: `After`
//! patterns carry the continuation across element boundaries, `apply_after`
//! rewrites the continuation of every `After` leaf.
//!
//! Ein fehlgeschlagenes Event laesst den Walker in einem Recovery-Zustand
//! zurueck: unbekannte Elemente werden samt Teilbaum konsumiert, fehlende
//! Pflicht-Attribute und unvollstaendiger Inhalt werden erzwungen, damit die
//! Traversierung weiterlaufen und weitere Fehler einsammeln kann.

use core::fmt;
use std::cell::RefCell;
use std::rc::Rc;

use crate::FastHashMap;
use crate::event::{EventKind, ValidationEvent};
use crate::qname::{ExpandedName, NamespaceResolver};

// ==================== Name classes ====================

/// A Relax NG name class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NameClass {
    /// Exactly one expanded name.
    Name(ExpandedName),
    /// Any local name within one namespace, minus an exception.
    NsName {
        /// The namespace URI.
        ns: Rc<str>,
        /// Names excluded from the class.
        except: Option<Box<NameClass>>,
    },
    /// Any name at all, minus an exception.
    AnyName {
        /// Names excluded from the class.
        except: Option<Box<NameClass>>,
    },
    /// Union of two name classes.
    Choice(Box<NameClass>, Box<NameClass>),
}

impl NameClass {
    /// True when `name` belongs to this class.
    pub fn contains(&self, name: &ExpandedName) -> bool {
        self.wildcard_match(name).is_some()
    }

    /// `Some(is_wildcard)` when `name` belongs to this class.
    ///
    /// `is_wildcard` is false when some exact-name leaf admits the name, and
    /// true when only `AnyName`/`NsName` leaves do. Das ist die Grundlage
    /// des `PossibleDueToWildcard`-Trackings.
    pub fn wildcard_match(&self, name: &ExpandedName) -> Option<bool> {
        match self {
            Self::Name(n) => (n == name).then_some(false),
            Self::NsName { ns, except } => {
                let excluded = except.as_ref().is_some_and(|e| e.contains(name));
                (**ns == *name.uri && !excluded).then_some(true)
            }
            Self::AnyName { except } => {
                let excluded = except.as_ref().is_some_and(|e| e.contains(name));
                (!excluded).then_some(true)
            }
            Self::Choice(a, b) => match (a.wildcard_match(name), b.wildcard_match(name)) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), _) | (_, Some(true)) => Some(true),
                _ => None,
            },
        }
    }

    fn collect_namespaces(&self, out: &mut Vec<Rc<str>>) {
        match self {
            Self::Name(n) => {
                if !out.contains(&n.uri) {
                    out.push(n.uri.clone());
                }
            }
            Self::NsName { ns, except } => {
                if !out.contains(ns) {
                    out.push(ns.clone());
                }
                if let Some(e) = except {
                    e.collect_namespaces(out);
                }
            }
            Self::AnyName { except } => {
                if let Some(e) = except {
                    e.collect_namespaces(out);
                }
            }
            Self::Choice(a, b) => {
                a.collect_namespaces(out);
                b.collect_namespaces(out);
            }
        }
    }
}

impl fmt::Display for NameClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(n) => write!(f, "{n}"),
            Self::NsName { ns, .. } => write!(f, "{{{ns}}}*"),
            Self::AnyName { .. } => write!(f, "*"),
            Self::Choice(a, b) => write!(f, "{a}|{b}"),
        }
    }
}

// ==================== Validation errors ====================

/// A validation finding. Ordinary domain output, never thrown.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    /// An element appeared where its name is not admitted.
    ElementNotAllowed {
        /// The offending element name.
        name: ExpandedName,
    },
    /// An attribute appeared that the element does not admit.
    AttributeNotAllowed {
        /// The offending attribute name.
        name: ExpandedName,
    },
    /// An admitted attribute carried a value the grammar rejects.
    InvalidAttributeValue {
        /// The attribute name.
        name: ExpandedName,
        /// The rejected value.
        value: Box<str>,
    },
    /// The start tag closed while required attributes were missing.
    RequiredAttributesMissing {
        /// Display forms of the missing attribute name classes.
        expected: Vec<String>,
    },
    /// Character data appeared where the grammar admits none.
    TextNotAllowed,
    /// An element closed before its content model was satisfied.
    ElementIncomplete {
        /// The element being closed.
        name: ExpandedName,
        /// Display forms of what the content model still expected.
        expected: Vec<String>,
    },
    /// The document ended while the grammar expected more.
    DocumentIncomplete,
    /// A finding appended by a document-level check outside the grammar.
    Custom(Box<str>),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ElementNotAllowed { name } => write!(f, "element {name} not allowed here"),
            Self::AttributeNotAllowed { name } => write!(f, "attribute {name} not allowed here"),
            Self::InvalidAttributeValue { name, value } => {
                write!(f, "invalid value {value:?} for attribute {name}")
            }
            Self::RequiredAttributesMissing { expected } => {
                write!(f, "required attributes missing: {}", expected.join(", "))
            }
            Self::TextNotAllowed => write!(f, "text not allowed here"),
            Self::ElementIncomplete { name, expected } => {
                if expected.is_empty() {
                    write!(f, "element {name} incomplete")
                } else {
                    write!(f, "element {name} incomplete, expected {}", expected.join(" or "))
                }
            }
            Self::DocumentIncomplete => write!(f, "document incomplete"),
            Self::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

/// Result of firing one event into a walker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireResult {
    /// The event was consumed without findings.
    Matched,
    /// The event produced findings; the walker has recovered and can
    /// continue consuming the stream.
    Errors(Vec<ValidationError>),
}

impl FireResult {
    /// True when no findings were produced.
    pub fn is_matched(&self) -> bool {
        matches!(self, Self::Matched)
    }
}

// ==================== Pattern arena ====================

/// Index into the pattern arena. `Copy`, kein Heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PatId(u32);

const NOT_ALLOWED: PatId = PatId(0);
const EMPTY: PatId = PatId(1);
const TEXT: PatId = PatId(2);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Pat {
    Empty,
    NotAllowed,
    Text,
    Choice(PatId, PatId),
    Group(PatId, PatId),
    Interleave(PatId, PatId),
    OneOrMore(PatId),
    // Name classes are boxed to keep the enum small; cloning a Pat during
    // derivative computation must stay cheap.
    Attribute(Box<NameClass>, PatId),
    Element(Box<NameClass>, PatId),
    Value(Box<str>),
    After(PatId, PatId),
}

#[derive(Debug, Default)]
struct Inner {
    memo: FastHashMap<Pat, PatId>,
    patterns: Vec<Pat>,
    nullable: Vec<bool>,
}

/// Shared, memoizing pattern store. Waechst waehrend der Validierung um die
/// abgeleiteten Muster; Dedup haelt das Wachstum klein.
#[derive(Debug)]
struct PatternArena {
    inner: RefCell<Inner>,
}

impl PatternArena {
    fn new() -> Self {
        let arena = Self {
            inner: RefCell::new(Inner::default()),
        };
        // Feste Indizes fuer die drei Basis-Muster.
        assert_eq!(arena.intern(Pat::NotAllowed), NOT_ALLOWED);
        assert_eq!(arena.intern(Pat::Empty), EMPTY);
        assert_eq!(arena.intern(Pat::Text), TEXT);
        arena
    }

    fn intern(&self, p: Pat) -> PatId {
        let mut inner = self.inner.borrow_mut();
        if let Some(&id) = inner.memo.get(&p) {
            return id;
        }
        let nullable = match &p {
            Pat::Empty | Pat::Text => true,
            Pat::NotAllowed
            | Pat::Attribute(..)
            | Pat::Element(..)
            | Pat::Value(_)
            | Pat::After(..) => false,
            Pat::Choice(a, b) => inner.nullable[a.0 as usize] || inner.nullable[b.0 as usize],
            Pat::Group(a, b) | Pat::Interleave(a, b) => {
                inner.nullable[a.0 as usize] && inner.nullable[b.0 as usize]
            }
            Pat::OneOrMore(a) => inner.nullable[a.0 as usize],
        };
        let id = PatId(u32::try_from(inner.patterns.len()).expect("pattern arena overflow"));
        inner.patterns.push(p.clone());
        inner.nullable.push(nullable);
        inner.memo.insert(p, id);
        id
    }

    fn get(&self, id: PatId) -> Pat {
        self.inner.borrow().patterns[id.0 as usize].clone()
    }

    fn nullable(&self, id: PatId) -> bool {
        self.inner.borrow().nullable[id.0 as usize]
    }

    // ---------- smart constructors ----------

    fn choice(&self, a: PatId, b: PatId) -> PatId {
        if a == b || b == NOT_ALLOWED {
            return a;
        }
        if a == NOT_ALLOWED {
            return b;
        }
        self.intern(Pat::Choice(a, b))
    }

    fn group(&self, a: PatId, b: PatId) -> PatId {
        if a == NOT_ALLOWED || b == NOT_ALLOWED {
            return NOT_ALLOWED;
        }
        if a == EMPTY {
            return b;
        }
        if b == EMPTY {
            return a;
        }
        self.intern(Pat::Group(a, b))
    }

    fn interleave(&self, a: PatId, b: PatId) -> PatId {
        if a == NOT_ALLOWED || b == NOT_ALLOWED {
            return NOT_ALLOWED;
        }
        if a == EMPTY {
            return b;
        }
        if b == EMPTY {
            return a;
        }
        self.intern(Pat::Interleave(a, b))
    }

    fn one_or_more(&self, p: PatId) -> PatId {
        if p == NOT_ALLOWED || p == EMPTY {
            return p;
        }
        self.intern(Pat::OneOrMore(p))
    }

    fn after(&self, a: PatId, b: PatId) -> PatId {
        if a == NOT_ALLOWED || b == NOT_ALLOWED {
            return NOT_ALLOWED;
        }
        self.intern(Pat::After(a, b))
    }

    // ---------- derivatives ----------

    /// Rewrites the continuation of every `After` leaf with `f`.
    fn apply_after(&self, p: PatId, f: &dyn Fn(PatId) -> PatId) -> PatId {
        match self.get(p) {
            Pat::After(x, y) => self.after(x, f(y)),
            Pat::Choice(a, b) => {
                let a = self.apply_after(a, f);
                let b = self.apply_after(b, f);
                self.choice(a, b)
            }
            Pat::NotAllowed => NOT_ALLOWED,
            // startTagOpenDeriv erzeugt nur After/Choice/NotAllowed.
            other => unreachable!("apply_after on {other:?}"),
        }
    }

    /// `force` laesst jeden Element-Namen passen (Recovery: das fremde
    /// Element wird behandelt, als waere es eines der hier erlaubten).
    fn start_tag_open_deriv(&self, p: PatId, name: &ExpandedName, force: bool) -> PatId {
        match self.get(p) {
            Pat::Choice(a, b) => {
                let a = self.start_tag_open_deriv(a, name, force);
                let b = self.start_tag_open_deriv(b, name, force);
                self.choice(a, b)
            }
            Pat::Element(nc, inner) => {
                if force || nc.contains(name) {
                    self.after(inner, EMPTY)
                } else {
                    NOT_ALLOWED
                }
            }
            Pat::Interleave(a, b) => {
                let da = self.start_tag_open_deriv(a, name, force);
                let left = self.apply_after(da, &|d| self.interleave(d, b));
                let db = self.start_tag_open_deriv(b, name, force);
                let right = self.apply_after(db, &|d| self.interleave(a, d));
                self.choice(left, right)
            }
            Pat::OneOrMore(inner) => {
                let d = self.start_tag_open_deriv(inner, name, force);
                let rest = self.choice(self.one_or_more(inner), EMPTY);
                self.apply_after(d, &|x| self.group(x, rest))
            }
            Pat::Group(a, b) => {
                let da = self.start_tag_open_deriv(a, name, force);
                let x = self.apply_after(da, &|d| self.group(d, b));
                if self.nullable(a) {
                    let db = self.start_tag_open_deriv(b, name, force);
                    self.choice(x, db)
                } else {
                    x
                }
            }
            Pat::After(a, b) => {
                let da = self.start_tag_open_deriv(a, name, force);
                self.apply_after(da, &|d| self.after(d, b))
            }
            _ => NOT_ALLOWED,
        }
    }

    fn att_deriv(&self, p: PatId, name: &ExpandedName, value: &str, force: bool) -> PatId {
        match self.get(p) {
            Pat::After(a, b) => {
                let da = self.att_deriv(a, name, value, force);
                self.after(da, b)
            }
            Pat::Choice(a, b) => {
                let da = self.att_deriv(a, name, value, force);
                let db = self.att_deriv(b, name, value, force);
                self.choice(da, db)
            }
            Pat::Group(a, b) => {
                let left = self.group(self.att_deriv(a, name, value, force), b);
                let right = self.group(a, self.att_deriv(b, name, value, force));
                self.choice(left, right)
            }
            Pat::Interleave(a, b) => {
                let left = self.interleave(self.att_deriv(a, name, value, force), b);
                let right = self.interleave(a, self.att_deriv(b, name, value, force));
                self.choice(left, right)
            }
            Pat::OneOrMore(inner) => {
                let d = self.att_deriv(inner, name, value, force);
                self.group(d, self.choice(self.one_or_more(inner), EMPTY))
            }
            Pat::Attribute(nc, pv) => {
                if nc.contains(name) && (force || self.value_match(pv, value)) {
                    EMPTY
                } else {
                    NOT_ALLOWED
                }
            }
            _ => NOT_ALLOWED,
        }
    }

    fn value_match(&self, p: PatId, value: &str) -> bool {
        (self.nullable(p) && is_xml_whitespace(value)) || {
            let d = self.text_deriv(p, value);
            self.nullable(d)
        }
    }

    fn text_deriv(&self, p: PatId, text: &str) -> PatId {
        match self.get(p) {
            Pat::Choice(a, b) => {
                let da = self.text_deriv(a, text);
                let db = self.text_deriv(b, text);
                self.choice(da, db)
            }
            Pat::Interleave(a, b) => {
                let left = self.interleave(self.text_deriv(a, text), b);
                let right = self.interleave(a, self.text_deriv(b, text));
                self.choice(left, right)
            }
            Pat::Group(a, b) => {
                let x = self.group(self.text_deriv(a, text), b);
                if self.nullable(a) {
                    self.choice(x, self.text_deriv(b, text))
                } else {
                    x
                }
            }
            Pat::After(a, b) => {
                let da = self.text_deriv(a, text);
                self.after(da, b)
            }
            Pat::OneOrMore(inner) => {
                let d = self.text_deriv(inner, text);
                self.group(d, self.choice(self.one_or_more(inner), EMPTY))
            }
            // Text bleibt Text: beliebig viele Character-Events.
            Pat::Text => p,
            Pat::Value(v) => {
                if token_eq(&v, text) {
                    EMPTY
                } else {
                    NOT_ALLOWED
                }
            }
            _ => NOT_ALLOWED,
        }
    }

    /// `force` ersetzt offene Attribut-Pflichten durch `Empty` statt die
    /// Ableitung scheitern zu lassen (Recovery nach Fehlermeldung).
    fn start_tag_close_deriv(&self, p: PatId, force: bool) -> PatId {
        match self.get(p) {
            Pat::After(a, b) => {
                let da = self.start_tag_close_deriv(a, force);
                self.after(da, b)
            }
            Pat::Choice(a, b) => {
                let da = self.start_tag_close_deriv(a, force);
                let db = self.start_tag_close_deriv(b, force);
                self.choice(da, db)
            }
            Pat::Group(a, b) => {
                let da = self.start_tag_close_deriv(a, force);
                let db = self.start_tag_close_deriv(b, force);
                self.group(da, db)
            }
            Pat::Interleave(a, b) => {
                let da = self.start_tag_close_deriv(a, force);
                let db = self.start_tag_close_deriv(b, force);
                self.interleave(da, db)
            }
            Pat::OneOrMore(inner) => {
                let d = self.start_tag_close_deriv(inner, force);
                self.one_or_more(d)
            }
            Pat::Attribute(..) => {
                if force {
                    EMPTY
                } else {
                    NOT_ALLOWED
                }
            }
            _ => p,
        }
    }

    /// `force` schliesst das Element auch bei unvollstaendigem Inhalt.
    fn end_tag_deriv(&self, p: PatId, force: bool) -> PatId {
        match self.get(p) {
            Pat::Choice(a, b) => {
                let da = self.end_tag_deriv(a, force);
                let db = self.end_tag_deriv(b, force);
                self.choice(da, db)
            }
            Pat::After(a, b) => {
                if force || self.nullable(a) {
                    b
                } else {
                    NOT_ALLOWED
                }
            }
            _ => NOT_ALLOWED,
        }
    }

    // ---------- possibility sets ----------

    fn expected_starts(&self, p: PatId, out: &mut Vec<NameClass>) {
        match self.get(p) {
            Pat::Choice(a, b) | Pat::Interleave(a, b) => {
                self.expected_starts(a, out);
                self.expected_starts(b, out);
            }
            Pat::Group(a, b) => {
                self.expected_starts(a, out);
                if self.nullable(a) {
                    self.expected_starts(b, out);
                }
            }
            Pat::OneOrMore(inner) => self.expected_starts(inner, out),
            Pat::After(a, _) => self.expected_starts(a, out),
            Pat::Element(nc, _) => {
                let nc = *nc;
                if !out.contains(&nc) {
                    out.push(nc);
                }
            }
            _ => {}
        }
    }

    fn expected_attributes(&self, p: PatId, out: &mut Vec<NameClass>) {
        match self.get(p) {
            Pat::Choice(a, b) | Pat::Interleave(a, b) | Pat::Group(a, b) => {
                // Attribute sind innerhalb einer Gruppe ungeordnet.
                self.expected_attributes(a, out);
                self.expected_attributes(b, out);
            }
            Pat::OneOrMore(inner) => self.expected_attributes(inner, out),
            Pat::After(a, _) => self.expected_attributes(a, out),
            Pat::Attribute(nc, _) => {
                let nc = *nc;
                if !out.contains(&nc) {
                    out.push(nc);
                }
            }
            _ => {}
        }
    }

    fn text_possible(&self, p: PatId) -> bool {
        match self.get(p) {
            Pat::Choice(a, b) | Pat::Interleave(a, b) => {
                self.text_possible(a) || self.text_possible(b)
            }
            Pat::Group(a, b) => {
                self.text_possible(a) || (self.nullable(a) && self.text_possible(b))
            }
            Pat::OneOrMore(inner) => self.text_possible(inner),
            Pat::After(a, _) => self.text_possible(a),
            Pat::Text | Pat::Value(_) => true,
            _ => false,
        }
    }

    fn end_tag_possible(&self, p: PatId) -> bool {
        match self.get(p) {
            Pat::Choice(a, b) => self.end_tag_possible(a) || self.end_tag_possible(b),
            Pat::After(a, _) => self.nullable(a),
            _ => false,
        }
    }
}

fn is_xml_whitespace(s: &str) -> bool {
    s.bytes().all(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
}

/// Token-Vergleich: Whitespace-normalisiert.
fn token_eq(a: &str, b: &str) -> bool {
    a.split_whitespace().eq(b.split_whitespace())
}

// ==================== Grammar & builder ====================

/// An immutable, pre-compiled grammar. Cheap to clone and share.
#[derive(Debug, Clone)]
pub struct Grammar {
    arena: Rc<PatternArena>,
    start: PatId,
}

impl Grammar {
    /// A fresh walker positioned before the document element.
    pub fn start_walker(&self) -> GrammarWalker {
        GrammarWalker {
            grammar: self.clone(),
            pat: self.start,
            resolver: NamespaceResolver::new(),
            pending_attribute: None,
            recovery_depth: 0,
        }
    }

    /// Every namespace URI mentioned by the grammar's name classes.
    pub fn namespaces(&self) -> Vec<String> {
        let mut uris: Vec<Rc<str>> = Vec::new();
        let inner = self.arena.inner.borrow();
        for pat in &inner.patterns {
            match pat {
                Pat::Element(nc, _) | Pat::Attribute(nc, _) => nc.collect_namespaces(&mut uris),
                _ => {}
            }
        }
        uris.iter().map(|u| u.to_string()).collect()
    }
}

/// Opaque handle to a pattern under construction.
#[derive(Debug, Clone, Copy)]
pub struct PatternRef(PatId);

/// Programmatic grammar assembly.
///
/// # Beispiel
///
/// ```
/// use rngine::grammar::GrammarBuilder;
///
/// // element a { element b { empty } }
/// let b = GrammarBuilder::new();
/// let inner = b.element(b.name("", "b"), b.empty());
/// let start = b.element(b.name("", "a"), inner);
/// let grammar = b.finish(start);
/// assert_eq!(grammar.namespaces(), vec![String::new()]);
/// ```
#[derive(Debug)]
pub struct GrammarBuilder {
    arena: PatternArena,
}

impl Default for GrammarBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GrammarBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self {
            arena: PatternArena::new(),
        }
    }

    /// The `empty` pattern.
    pub fn empty(&self) -> PatternRef {
        PatternRef(EMPTY)
    }

    /// The `notAllowed` pattern.
    pub fn not_allowed(&self) -> PatternRef {
        PatternRef(NOT_ALLOWED)
    }

    /// The `text` pattern.
    pub fn text(&self) -> PatternRef {
        PatternRef(TEXT)
    }

    /// A fixed token value (whitespace-normalized comparison).
    pub fn value(&self, token: &str) -> PatternRef {
        PatternRef(self.arena.intern(Pat::Value(Box::from(token))))
    }

    /// `a | b`
    pub fn choice(&self, a: PatternRef, b: PatternRef) -> PatternRef {
        PatternRef(self.arena.choice(a.0, b.0))
    }

    /// `a, b`
    pub fn group(&self, a: PatternRef, b: PatternRef) -> PatternRef {
        PatternRef(self.arena.group(a.0, b.0))
    }

    /// `a & b`
    pub fn interleave(&self, a: PatternRef, b: PatternRef) -> PatternRef {
        PatternRef(self.arena.interleave(a.0, b.0))
    }

    /// `p+`
    pub fn one_or_more(&self, p: PatternRef) -> PatternRef {
        PatternRef(self.arena.one_or_more(p.0))
    }

    /// `p?`
    pub fn optional(&self, p: PatternRef) -> PatternRef {
        PatternRef(self.arena.choice(p.0, EMPTY))
    }

    /// `p*`
    pub fn zero_or_more(&self, p: PatternRef) -> PatternRef {
        self.optional(self.one_or_more(p))
    }

    /// An attribute with text content.
    pub fn attribute(&self, name: NameClass) -> PatternRef {
        self.attribute_with(name, self.text())
    }

    /// An attribute with an explicit value pattern.
    pub fn attribute_with(&self, name: NameClass, value: PatternRef) -> PatternRef {
        PatternRef(self.arena.intern(Pat::Attribute(Box::new(name), value.0)))
    }

    /// An element with the given content pattern (attributes included).
    pub fn element(&self, name: NameClass, content: PatternRef) -> PatternRef {
        PatternRef(self.arena.intern(Pat::Element(Box::new(name), content.0)))
    }

    /// Name class matching exactly `{uri}local_name`.
    pub fn name(&self, uri: &str, local_name: &str) -> NameClass {
        NameClass::Name(ExpandedName::new(uri, local_name))
    }

    /// Name class matching any local name in `uri`.
    pub fn ns_name(&self, uri: &str) -> NameClass {
        NameClass::NsName {
            ns: Rc::from(uri),
            except: None,
        }
    }

    /// Name class matching any name.
    pub fn any_name(&self) -> NameClass {
        NameClass::AnyName { except: None }
    }

    /// Name class matching any name outside `except`.
    pub fn any_name_except(&self, except: NameClass) -> NameClass {
        NameClass::AnyName {
            except: Some(Box::new(except)),
        }
    }

    /// Union of two name classes.
    pub fn name_choice(&self, a: NameClass, b: NameClass) -> NameClass {
        NameClass::Choice(Box::new(a), Box::new(b))
    }

    /// Seals the builder into a grammar starting at `start`.
    pub fn finish(self, start: PatternRef) -> Grammar {
        Grammar {
            arena: Rc::new(self.arena),
            start: start.0,
        }
    }
}

// ==================== Possibility sets ====================

/// What a walker would accept next.
#[derive(Debug, Clone, Default)]
pub struct PossibleEvents {
    /// Name classes admitted for `enterStartTag`.
    pub start_tags: Vec<NameClass>,
    /// Name classes admitted for `attributeName`.
    pub attributes: Vec<NameClass>,
    /// An `attributeValue` is expected (an attribute name is open).
    pub attribute_value: bool,
    /// `leaveStartTag` would succeed.
    pub leave_start_tag: bool,
    /// Character data is admitted.
    pub text: bool,
    /// `endTag` would succeed.
    pub end_tag: bool,
}

impl PossibleEvents {
    fn any() -> Self {
        Self {
            start_tags: vec![NameClass::AnyName { except: None }],
            attributes: vec![NameClass::AnyName { except: None }],
            attribute_value: false,
            leave_start_tag: true,
            text: true,
            end_tag: true,
        }
    }

    /// Whether the given event would be admitted here.
    pub fn allows(&self, event: &ValidationEvent<'_>) -> bool {
        match event {
            ValidationEvent::EnterStartTag { ns, name } => {
                let n = ExpandedName::new(ns, name);
                self.start_tags.iter().any(|nc| nc.contains(&n))
            }
            ValidationEvent::AttributeName { ns, name } => {
                let n = ExpandedName::new(ns, name);
                self.attributes.iter().any(|nc| nc.contains(&n))
            }
            ValidationEvent::AttributeValue { .. } => self.attribute_value,
            ValidationEvent::LeaveStartTag => self.leave_start_tag,
            ValidationEvent::Text { .. } => self.text,
            ValidationEvent::EndTag { .. } => self.end_tag,
        }
    }

    /// True when `name` is admitted for `kind`, but only through wildcard
    /// name classes (`AnyName`/`NsName`).
    pub fn only_wildcard(&self, kind: EventKind, name: &ExpandedName) -> bool {
        let classes = match kind {
            EventKind::EnterStartTag => &self.start_tags,
            EventKind::AttributeName => &self.attributes,
            _ => return false,
        };
        let mut admitted = false;
        for nc in classes {
            match nc.wildcard_match(name) {
                Some(false) => return false,
                Some(true) => admitted = true,
                None => {}
            }
        }
        admitted
    }
}

// ==================== Walker ====================

#[derive(Debug, Clone)]
enum PendingAttribute {
    /// Name matched; waiting for the value event.
    Open(ExpandedName),
    /// Name was rejected or skipped; swallow the value event.
    Skip,
}

/// A cursor over the grammar's derivative state.
///
/// Cloning is cheap: the pattern arena and the namespace scope chain are
/// shared, the rest is a handful of words. Der Walker besitzt seinen eigenen
/// Namespace-Kontext; `enter_context_with_mapping`/`leave_context` werden von
/// der Traversierung entlang der xmlns-Deklarationen gerufen.
#[derive(Debug, Clone)]
pub struct GrammarWalker {
    grammar: Grammar,
    pat: PatId,
    resolver: NamespaceResolver,
    pending_attribute: Option<PendingAttribute>,
    recovery_depth: u32,
}

impl GrammarWalker {
    /// Consumes one event. Findings are returned, never thrown; the walker
    /// recovers internally and stays usable.
    pub fn fire_event(&mut self, event: &ValidationEvent<'_>) -> FireResult {
        if self.recovery_depth > 0 {
            // Unbekanntes Element: Teilbaum wird ohne Ableitung konsumiert.
            match event {
                ValidationEvent::EnterStartTag { .. } => self.recovery_depth += 1,
                ValidationEvent::EndTag { .. } => self.recovery_depth -= 1,
                _ => {}
            }
            return FireResult::Matched;
        }
        let arena = Rc::clone(&self.grammar.arena);
        match event {
            ValidationEvent::EnterStartTag { ns, name } => {
                let n = ExpandedName::new(ns, name);
                let d = arena.start_tag_open_deriv(self.pat, &n, false);
                if d == NOT_ALLOWED {
                    // Recovery: das Element als eines der hier erlaubten
                    // behandeln; ist gar keines erlaubt, den ganzen Teilbaum
                    // ohne Ableitung konsumieren.
                    let forced = arena.start_tag_open_deriv(self.pat, &n, true);
                    if forced == NOT_ALLOWED {
                        self.recovery_depth = 1;
                    } else {
                        self.pat = forced;
                    }
                    return FireResult::Errors(vec![ValidationError::ElementNotAllowed { name: n }]);
                }
                self.pat = d;
                FireResult::Matched
            }
            ValidationEvent::AttributeName { ns, name } => {
                let n = ExpandedName::new(ns, name);
                let mut expected = Vec::new();
                arena.expected_attributes(self.pat, &mut expected);
                if expected.iter().any(|nc| nc.contains(&n)) {
                    self.pending_attribute = Some(PendingAttribute::Open(n));
                    FireResult::Matched
                } else {
                    self.pending_attribute = Some(PendingAttribute::Skip);
                    FireResult::Errors(vec![ValidationError::AttributeNotAllowed { name: n }])
                }
            }
            ValidationEvent::AttributeValue { value } => {
                match self.pending_attribute.take() {
                    Some(PendingAttribute::Open(n)) => {
                        let d = arena.att_deriv(self.pat, &n, value, false);
                        if d == NOT_ALLOWED {
                            // Wert passt nicht: Attribut-Pflicht trotzdem
                            // konsumieren, damit leaveStartTag nicht
                            // denselben Fehler noch einmal meldet.
                            let forced = arena.att_deriv(self.pat, &n, value, true);
                            if forced != NOT_ALLOWED {
                                self.pat = forced;
                            }
                            return FireResult::Errors(vec![ValidationError::InvalidAttributeValue {
                                name: n,
                                value: Box::from(*value),
                            }]);
                        }
                        self.pat = d;
                        FireResult::Matched
                    }
                    Some(PendingAttribute::Skip) => FireResult::Matched,
                    None => {
                        debug_assert!(false, "attributeValue without attributeName");
                        FireResult::Matched
                    }
                }
            }
            ValidationEvent::LeaveStartTag => {
                let d = arena.start_tag_close_deriv(self.pat, false);
                if d == NOT_ALLOWED {
                    let mut expected = Vec::new();
                    arena.expected_attributes(self.pat, &mut expected);
                    self.pat = arena.start_tag_close_deriv(self.pat, true);
                    return FireResult::Errors(vec![ValidationError::RequiredAttributesMissing {
                        expected: expected.iter().map(|nc| nc.to_string()).collect(),
                    }]);
                }
                self.pat = d;
                FireResult::Matched
            }
            ValidationEvent::Text { text } => {
                let d = arena.text_deriv(self.pat, text);
                if d == NOT_ALLOWED {
                    if is_xml_whitespace(text) {
                        // Whitespace zwischen Elementen ist insignifikant.
                        return FireResult::Matched;
                    }
                    return FireResult::Errors(vec![ValidationError::TextNotAllowed]);
                }
                self.pat = d;
                FireResult::Matched
            }
            ValidationEvent::EndTag { ns, name } => {
                let d = arena.end_tag_deriv(self.pat, false);
                if d == NOT_ALLOWED {
                    let expected = self.expected_content();
                    self.pat = arena.end_tag_deriv(self.pat, true);
                    return FireResult::Errors(vec![ValidationError::ElementIncomplete {
                        name: ExpandedName::new(ns, name),
                        expected,
                    }]);
                }
                self.pat = d;
                FireResult::Matched
            }
        }
    }

    /// Display forms of what the content model still expects here.
    fn expected_content(&self) -> Vec<String> {
        let arena = &self.grammar.arena;
        let mut starts = Vec::new();
        arena.expected_starts(self.pat, &mut starts);
        let mut out: Vec<String> = starts.iter().map(|nc| format!("element {nc}")).collect();
        if arena.text_possible(self.pat) {
            out.push("text".to_string());
        }
        out
    }

    /// The set of events admitted at the current state.
    pub fn possible(&self) -> PossibleEvents {
        if self.recovery_depth > 0 {
            return PossibleEvents::any();
        }
        if self.pending_attribute.is_some() {
            return PossibleEvents {
                attribute_value: true,
                ..PossibleEvents::default()
            };
        }
        let arena = &self.grammar.arena;
        let mut start_tags = Vec::new();
        arena.expected_starts(self.pat, &mut start_tags);
        let mut attributes = Vec::new();
        arena.expected_attributes(self.pat, &mut attributes);
        PossibleEvents {
            start_tags,
            attributes,
            attribute_value: false,
            leave_start_tag: arena.start_tag_close_deriv(self.pat, false) != NOT_ALLOWED,
            text: arena.text_possible(self.pat),
            end_tag: arena.end_tag_possible(self.pat),
        }
    }

    /// Whether the stream may end here.
    pub fn can_end(&self) -> bool {
        self.recovery_depth == 0 && self.grammar.arena.nullable(self.pat)
    }

    /// Ends the stream, returning findings for unfinished content.
    pub fn end(&mut self) -> Vec<ValidationError> {
        if self.can_end() {
            Vec::new()
        } else {
            vec![ValidationError::DocumentIncomplete]
        }
    }

    // ---------- namespace context ----------

    /// Pushes a namespace scope with the given prefix → URI bindings.
    pub fn enter_context_with_mapping(&mut self, mapping: FastHashMap<Box<str>, Box<str>>) {
        self.resolver.enter_context_with_mapping(mapping);
    }

    /// Pops the innermost namespace scope.
    pub fn leave_context(&mut self) {
        self.resolver.leave_context();
    }

    /// Resolves a lexical name against the in-scope mapping.
    pub fn resolve_name(&self, name: &str, attribute: bool) -> Option<ExpandedName> {
        self.resolver.resolve_name(name, attribute)
    }

    /// Finds a lexical form for an expanded name under the in-scope mapping.
    pub fn unresolve_name(&self, uri: &str, local_name: &str) -> Option<String> {
        self.resolver.unresolve_name(uri, local_name)
    }
}
