//! Qualified names and in-scope namespace resolution.
//!
//! A [`QName`] carries the full lexical identity of an element (URI,
//! local name, optional prefix). The validation-significant identity is the
//! [`ExpandedName`] (URI + local name only); two names with the same
//! expansion are equal regardless of prefix.
//!
//! [`NamespaceResolver`] ist die In-Scope-Abbildung Praefix → URI, als
//! persistente Scope-Kette: `enter_context` teilt alle aeusseren Scopes per
//! `Rc`, sodass ein Walker-Klon die Kette in O(1) mitnimmt.

use core::fmt;
use std::rc::Rc;

use crate::FastHashMap;

/// Namespace URI permanently bound to the `xml` prefix.
pub const XML_NS_URI: &str = "http://www.w3.org/XML/1998/namespace";

/// A qualified name: URI, local name, and the prefix it was written with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QName {
    /// The namespace URI (empty string for "no namespace").
    pub uri: Rc<str>,
    /// The local part of the name.
    pub local_name: Rc<str>,
    /// The lexical prefix, if the name was written with one.
    pub prefix: Option<Rc<str>>,
}

impl QName {
    /// Creates a QName without prefix information.
    pub fn new(uri: &str, local_name: &str) -> Self {
        Self {
            uri: Rc::from(uri),
            local_name: Rc::from(local_name),
            prefix: None,
        }
    }

    /// Creates a QName with an explicit prefix.
    pub fn with_prefix(uri: &str, local_name: &str, prefix: &str) -> Self {
        Self {
            uri: Rc::from(uri),
            local_name: Rc::from(local_name),
            prefix: Some(Rc::from(prefix)),
        }
    }

    /// Die validierungsrelevante Identitaet (URI + local name).
    pub fn expanded(&self) -> ExpandedName {
        ExpandedName {
            uri: self.uri.clone(),
            local_name: self.local_name.clone(),
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(p) if !p.is_empty() => write!(f, "{p}:{}", self.local_name),
            _ => write!(f, "{}", self.local_name),
        }
    }
}

/// Expanded name: URI + local name, without prefix.
///
/// Zwei QNames sind gleich wenn URI und local name uebereinstimmen,
/// unabhaengig vom Praefix.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ExpandedName {
    /// The namespace URI (empty string for "no namespace").
    pub uri: Rc<str>,
    /// The local part of the name.
    pub local_name: Rc<str>,
}

impl ExpandedName {
    /// Creates an expanded name from string parts.
    pub fn new(uri: &str, local_name: &str) -> Self {
        Self {
            uri: Rc::from(uri),
            local_name: Rc::from(local_name),
        }
    }

    /// True when the name lives in no namespace.
    pub fn is_unqualified(&self) -> bool {
        self.uri.is_empty()
    }
}

impl fmt::Debug for ExpandedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExpandedName({self})")
    }
}

impl fmt::Display for ExpandedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.uri.is_empty() {
            write!(f, "{}", self.local_name)
        } else {
            // James-Clark-Notation.
            write!(f, "{{{}}}{}", self.uri, self.local_name)
        }
    }
}

/// One scope of prefix → URI bindings, linked to its parent.
#[derive(Debug)]
struct Scope {
    mapping: FastHashMap<Box<str>, Box<str>>,
    parent: Option<Rc<Scope>>,
}

/// In-scope namespace mapping as a persistent scope chain.
///
/// The `xml` prefix is pre-bound in the root scope. The default namespace is
/// the binding of the empty prefix; it never applies to attributes.
#[derive(Debug, Clone)]
pub struct NamespaceResolver {
    top: Rc<Scope>,
}

impl Default for NamespaceResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceResolver {
    /// Creates a resolver with only the `xml` prefix bound.
    pub fn new() -> Self {
        let mut mapping: FastHashMap<Box<str>, Box<str>> = FastHashMap::default();
        mapping.insert("xml".into(), XML_NS_URI.into());
        Self {
            top: Rc::new(Scope { mapping, parent: None }),
        }
    }

    /// Pushes an empty scope.
    pub fn enter_context(&mut self) {
        self.enter_context_with_mapping(FastHashMap::default());
    }

    /// Pushes a scope with the given prefix → URI bindings.
    ///
    /// Ein leerer URI hebt die Bindung des Praefixes auf (xmlns="" bzw.
    /// xmlns:p="" nach Namespaces 1.1).
    pub fn enter_context_with_mapping(&mut self, mapping: FastHashMap<Box<str>, Box<str>>) {
        let parent = Rc::clone(&self.top);
        self.top = Rc::new(Scope {
            mapping,
            parent: Some(parent),
        });
    }

    /// Pops the innermost scope. Popping the root scope is a no-op.
    pub fn leave_context(&mut self) {
        if let Some(parent) = self.top.parent.as_ref() {
            self.top = Rc::clone(parent);
        }
    }

    /// Bindet ein Praefix im innersten Scope.
    pub fn define_prefix(&mut self, prefix: &str, uri: &str) {
        // Scope-Kette ist geteilt; copy-on-write des innersten Scopes.
        let mut mapping = self.top.mapping.clone();
        mapping.insert(prefix.into(), uri.into());
        let parent = self.top.parent.clone();
        self.top = Rc::new(Scope { mapping, parent });
    }

    /// Looks up the URI bound to `prefix`, innermost scope first.
    ///
    /// Returns `Some("")` when the prefix was explicitly unbound.
    pub fn uri_for_prefix(&self, prefix: &str) -> Option<&str> {
        let mut scope = Some(&self.top);
        while let Some(s) = scope {
            if let Some(uri) = s.mapping.get(prefix) {
                return Some(uri);
            }
            scope = s.parent.as_ref();
        }
        None
    }

    /// Resolves a lexical name (`prefix:local` or `local`) to an expanded name.
    ///
    /// `attribute` controls default-namespace handling: unprefixed attribute
    /// names are always in no namespace.
    pub fn resolve_name(&self, name: &str, attribute: bool) -> Option<ExpandedName> {
        match name.split_once(':') {
            Some((prefix, local)) => {
                if prefix.is_empty() || local.is_empty() || local.contains(':') {
                    return None;
                }
                let uri = self.uri_for_prefix(prefix)?;
                if uri.is_empty() {
                    // Aufgehobene Bindung: Praefix ist nicht aufloesbar.
                    return None;
                }
                Some(ExpandedName::new(uri, local))
            }
            None => {
                if attribute {
                    return Some(ExpandedName::new("", name));
                }
                let uri = self.uri_for_prefix("").unwrap_or("");
                Some(ExpandedName::new(uri, name))
            }
        }
    }

    /// Finds a lexical form for `(uri, local_name)` under the current scopes.
    ///
    /// Innermost bindings win; shadowed bindings are skipped. Returns `None`
    /// when no in-scope prefix maps to `uri`.
    pub fn unresolve_name(&self, uri: &str, local_name: &str) -> Option<String> {
        if uri.is_empty() {
            // No-namespace geht nur ohne Praefix, und nur wenn kein
            // Default-Namespace in Kraft ist.
            return match self.uri_for_prefix("") {
                Some(default) if !default.is_empty() => None,
                _ => Some(local_name.to_string()),
            };
        }
        let mut scope = Some(&self.top);
        let mut shadowed: Vec<Box<str>> = Vec::new();
        while let Some(s) = scope {
            for (prefix, bound) in &s.mapping {
                if shadowed.iter().any(|p| p == prefix) {
                    continue;
                }
                if &**bound == uri {
                    return Some(if prefix.is_empty() {
                        local_name.to_string()
                    } else {
                        format!("{prefix}:{local_name}")
                    });
                }
            }
            shadowed.extend(s.mapping.keys().cloned());
            scope = s.parent.as_ref();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expanded_name_identitaet() {
        let a = QName::with_prefix("http://x", "item", "x").expanded();
        let b = QName::with_prefix("http://x", "item", "y").expanded();
        assert_eq!(a, b);
    }

    #[test]
    fn expanded_name_display_clark() {
        assert_eq!(ExpandedName::new("http://x", "a").to_string(), "{http://x}a");
        assert_eq!(ExpandedName::new("", "a").to_string(), "a");
    }

    #[test]
    fn xml_prefix_vorgebunden() {
        let r = NamespaceResolver::new();
        let n = r.resolve_name("xml:lang", true).unwrap();
        assert_eq!(&*n.uri, XML_NS_URI);
        assert_eq!(&*n.local_name, "lang");
    }

    #[test]
    fn default_namespace_nur_fuer_elemente() {
        let mut r = NamespaceResolver::new();
        let mut m: FastHashMap<Box<str>, Box<str>> = FastHashMap::default();
        m.insert("".into(), "http://d".into());
        r.enter_context_with_mapping(m);

        let el = r.resolve_name("a", false).unwrap();
        assert_eq!(&*el.uri, "http://d");
        let at = r.resolve_name("a", true).unwrap();
        assert_eq!(&*at.uri, "");
    }

    #[test]
    fn innerer_scope_schattet() {
        let mut r = NamespaceResolver::new();
        let mut outer: FastHashMap<Box<str>, Box<str>> = FastHashMap::default();
        outer.insert("p".into(), "http://outer".into());
        r.enter_context_with_mapping(outer);
        let mut inner: FastHashMap<Box<str>, Box<str>> = FastHashMap::default();
        inner.insert("p".into(), "http://inner".into());
        r.enter_context_with_mapping(inner);

        assert_eq!(r.uri_for_prefix("p"), Some("http://inner"));
        r.leave_context();
        assert_eq!(r.uri_for_prefix("p"), Some("http://outer"));
    }

    #[test]
    fn unbekanntes_praefix_unaufloesbar() {
        let r = NamespaceResolver::new();
        assert!(r.resolve_name("nope:a", true).is_none());
    }

    #[test]
    fn aufgehobene_bindung_unaufloesbar() {
        let mut r = NamespaceResolver::new();
        let mut m: FastHashMap<Box<str>, Box<str>> = FastHashMap::default();
        m.insert("p".into(), "http://x".into());
        r.enter_context_with_mapping(m);
        let mut undecl: FastHashMap<Box<str>, Box<str>> = FastHashMap::default();
        undecl.insert("p".into(), "".into());
        r.enter_context_with_mapping(undecl);

        assert!(r.resolve_name("p:a", true).is_none());
    }

    #[test]
    fn unresolve_findet_innerstes_praefix() {
        let mut r = NamespaceResolver::new();
        let mut m: FastHashMap<Box<str>, Box<str>> = FastHashMap::default();
        m.insert("p".into(), "http://x".into());
        r.enter_context_with_mapping(m);

        assert_eq!(r.unresolve_name("http://x", "a").as_deref(), Some("p:a"));
        assert_eq!(r.unresolve_name("http://y", "a"), None);
    }

    #[test]
    fn unresolve_respektiert_schattierung() {
        let mut r = NamespaceResolver::new();
        let mut outer: FastHashMap<Box<str>, Box<str>> = FastHashMap::default();
        outer.insert("p".into(), "http://x".into());
        r.enter_context_with_mapping(outer);
        let mut inner: FastHashMap<Box<str>, Box<str>> = FastHashMap::default();
        inner.insert("p".into(), "http://other".into());
        r.enter_context_with_mapping(inner);

        // p ist jetzt an http://other gebunden; http://x hat keine lexikalische Form mehr.
        assert_eq!(r.unresolve_name("http://x", "a"), None);
    }

    #[test]
    fn unresolve_no_namespace_mit_default_ns() {
        let mut r = NamespaceResolver::new();
        assert_eq!(r.unresolve_name("", "a").as_deref(), Some("a"));
        let mut m: FastHashMap<Box<str>, Box<str>> = FastHashMap::default();
        m.insert("".into(), "http://d".into());
        r.enter_context_with_mapping(m);
        assert_eq!(r.unresolve_name("", "a"), None);
    }

    #[test]
    fn klon_teilt_scope_kette() {
        let mut r = NamespaceResolver::new();
        let mut m: FastHashMap<Box<str>, Box<str>> = FastHashMap::default();
        m.insert("p".into(), "http://x".into());
        r.enter_context_with_mapping(m);

        let clone = r.clone();
        r.leave_context();
        assert_eq!(r.uri_for_prefix("p"), None);
        assert_eq!(clone.uri_for_prefix("p"), Some("http://x"));
    }
}
