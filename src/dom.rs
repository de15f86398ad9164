//! Arena-backed mutable document tree.
//!
//! Nodes live in a `Vec` arena owned by [`Document`]; a [`NodeId`] is a
//! `Copy` handle that stays valid for the lifetime of the document (ids are
//! never reused, auch nicht nach `remove_child`). Attributes are not nodes:
//! each element carries an ordered attribute list.
//!
//! Element names are stored fully resolved ([`QName`] with URI). Attribute
//! names are stored *unresolved* (prefix + local name) and are resolved
//! against the in-scope namespace mapping at validation time. Namespace
//! declarations (`xmlns`, `xmlns:p`) stay in the attribute list; they feed
//! the in-scope mapping and are never validated as attributes.
//!
//! Hosts mutating the tree must keep text nodes normalized (no adjacent and
//! no empty text nodes); [`Document::append_text`] coalesces for the common
//! case.

use crate::qname::QName;
use crate::{FastHashMap, FastIndexMap};

/// Handle to a node in a [`Document`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// The node kinds the tree can hold.
///
/// Validation concerns elements and text; comments and processing
/// instructions are carried but skipped by traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// The document root (exactly one per tree).
    Document,
    /// An element.
    Element,
    /// Character data.
    Text,
    /// A comment.
    Comment,
    /// A processing instruction.
    ProcessingInstruction,
}

impl NodeKind {
    /// Display-Name fuer Fehlermeldungen.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Element => "element",
            Self::Text => "text",
            Self::Comment => "comment",
            Self::ProcessingInstruction => "processing-instruction",
        }
    }
}

/// An attribute of an element, name unresolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// The lexical prefix, if any.
    pub prefix: Option<Box<str>>,
    /// The local part of the attribute name.
    pub local_name: Box<str>,
    /// The attribute value.
    pub value: Box<str>,
}

impl Attribute {
    /// Creates an attribute from its lexical parts.
    pub fn new(prefix: Option<&str>, local_name: &str, value: &str) -> Self {
        Self {
            prefix: prefix.map(Box::from),
            local_name: Box::from(local_name),
            value: Box::from(value),
        }
    }

    /// True for `xmlns` and `xmlns:p` attributes.
    pub fn is_namespace_declaration(&self) -> bool {
        match &self.prefix {
            Some(p) => &**p == "xmlns",
            None => &*self.local_name == "xmlns",
        }
    }

    /// For a namespace declaration: the prefix being bound (`""` for the
    /// default namespace). `None` for ordinary attributes.
    pub fn declared_prefix(&self) -> Option<&str> {
        match &self.prefix {
            Some(p) if &**p == "xmlns" => Some(&self.local_name),
            Some(_) => None,
            None if &*self.local_name == "xmlns" => Some(""),
            None => None,
        }
    }

    /// The name as written (`p:local` or `local`).
    pub fn qualified_name(&self) -> String {
        match &self.prefix {
            Some(p) => format!("{p}:{}", self.local_name),
            None => self.local_name.to_string(),
        }
    }
}

#[derive(Debug)]
struct NodeData {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    /// Element name; PI target is stored as a no-namespace QName.
    name: Option<QName>,
    attributes: Vec<Attribute>,
    /// Text, comment or PI data.
    content: Option<String>,
}

impl NodeData {
    fn leaf(kind: NodeKind, content: String) -> Self {
        Self {
            kind,
            parent: None,
            children: Vec::new(),
            name: None,
            attributes: Vec::new(),
            content: Some(content),
        }
    }
}

/// A mutable XML-shaped document tree.
#[derive(Debug)]
pub struct Document {
    nodes: Vec<NodeData>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Creates a document containing only the document node.
    pub fn new() -> Self {
        Self {
            nodes: vec![NodeData {
                kind: NodeKind::Document,
                parent: None,
                children: Vec::new(),
                name: None,
                attributes: Vec::new(),
                content: None,
            }],
        }
    }

    /// The document node.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// The first element child of the document node, if any.
    pub fn document_element(&self) -> Option<NodeId> {
        self.nodes[0]
            .children
            .iter()
            .copied()
            .find(|&c| self.kind(c) == NodeKind::Element)
    }

    /// True when `id` is a handle into this document.
    pub fn contains(&self, id: NodeId) -> bool {
        id.index() < self.nodes.len()
    }

    fn push(&mut self, data: NodeData) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).expect("node arena overflow"));
        self.nodes.push(data);
        id
    }

    fn data(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.index()]
    }

    fn data_mut(&mut self, id: NodeId) -> &mut NodeData {
        &mut self.nodes[id.index()]
    }

    // ==================== Konstruktion ====================

    /// Creates a detached element node.
    pub fn create_element(&mut self, name: QName) -> NodeId {
        self.push(NodeData {
            kind: NodeKind::Element,
            parent: None,
            children: Vec::new(),
            name: Some(name),
            attributes: Vec::new(),
            content: None,
        })
    }

    /// Creates a detached text node. The text must not be empty.
    pub fn create_text(&mut self, text: &str) -> NodeId {
        assert!(!text.is_empty(), "text nodes must not be empty");
        self.push(NodeData::leaf(NodeKind::Text, text.to_string()))
    }

    /// Creates a detached comment node.
    pub fn create_comment(&mut self, text: &str) -> NodeId {
        self.push(NodeData::leaf(NodeKind::Comment, text.to_string()))
    }

    /// Creates a detached processing-instruction node.
    pub fn create_processing_instruction(&mut self, target: &str, data: &str) -> NodeId {
        let mut node = NodeData::leaf(NodeKind::ProcessingInstruction, data.to_string());
        node.name = Some(QName::new("", target));
        self.push(node)
    }

    // ==================== Navigation ====================

    /// The node's kind.
    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.data(id).kind
    }

    /// The element name (or PI target). `None` for other kinds.
    pub fn name(&self, id: NodeId) -> Option<&QName> {
        self.data(id).name.as_ref()
    }

    /// Text, comment or PI content. `None` for elements and the document.
    pub fn text(&self, id: NodeId) -> Option<&str> {
        self.data(id).content.as_deref()
    }

    /// The node's children, in document order.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.data(id).children
    }

    /// The node's parent, `None` for the document node and detached nodes.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.data(id).parent
    }

    /// The node's position among its parent's children.
    pub fn child_index(&self, id: NodeId) -> Option<usize> {
        let parent = self.parent(id)?;
        self.children(parent).iter().position(|&c| c == id)
    }

    /// Iterates the node's ancestors, starting at its parent.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let mut current = self.parent(id);
        core::iter::from_fn(move || {
            let next = current?;
            current = self.parent(next);
            Some(next)
        })
    }

    /// True when `ancestor` is a proper ancestor of `node`.
    pub fn is_ancestor_of(&self, ancestor: NodeId, node: NodeId) -> bool {
        self.ancestors(node).any(|a| a == ancestor)
    }

    // ==================== Attribute ====================

    /// The element's attributes, in document order.
    pub fn attributes(&self, id: NodeId) -> &[Attribute] {
        &self.data(id).attributes
    }

    /// Sets an attribute, replacing an existing one with the same lexical name.
    pub fn set_attribute(&mut self, element: NodeId, prefix: Option<&str>, local_name: &str, value: &str) {
        assert_eq!(self.kind(element), NodeKind::Element, "attributes only on elements");
        let attr = Attribute::new(prefix, local_name, value);
        let attrs = &mut self.data_mut(element).attributes;
        if let Some(existing) = attrs
            .iter_mut()
            .find(|a| a.prefix.as_deref() == prefix && &*a.local_name == local_name)
        {
            existing.value = attr.value;
        } else {
            attrs.push(attr);
        }
    }

    /// Removes an attribute by lexical name. Returns whether one was removed.
    pub fn remove_attribute(&mut self, element: NodeId, prefix: Option<&str>, local_name: &str) -> bool {
        let attrs = &mut self.data_mut(element).attributes;
        let before = attrs.len();
        attrs.retain(|a| !(a.prefix.as_deref() == prefix && &*a.local_name == local_name));
        attrs.len() != before
    }

    /// Die xmlns-Deklarationen eines Elements als Praefix → URI Abbildung.
    ///
    /// `None` wenn das Element keine Deklarationen traegt (dann wird kein
    /// neuer Namespace-Scope betreten).
    pub fn namespace_mapping(&self, element: NodeId) -> Option<FastHashMap<Box<str>, Box<str>>> {
        let mut mapping: Option<FastHashMap<Box<str>, Box<str>>> = None;
        for attr in self.attributes(element) {
            if let Some(prefix) = attr.declared_prefix() {
                mapping
                    .get_or_insert_with(FastHashMap::default)
                    .insert(prefix.into(), attr.value.clone());
            }
        }
        mapping
    }

    /// Fresh scan of all namespace declarations: prefix → URIs, document order.
    pub fn document_namespaces(&self) -> FastIndexMap<String, Vec<String>> {
        let mut out: FastIndexMap<String, Vec<String>> = FastIndexMap::default();
        let mut stack = vec![self.root()];
        while let Some(node) = stack.pop() {
            if self.kind(node) == NodeKind::Element {
                for attr in self.attributes(node) {
                    if let Some(prefix) = attr.declared_prefix() {
                        let uris = out.entry(prefix.to_string()).or_default();
                        let uri = attr.value.to_string();
                        if !uris.contains(&uri) {
                            uris.push(uri);
                        }
                    }
                }
            }
            // Kinder in umgekehrter Reihenfolge, damit der Stack
            // Dokumentreihenfolge liefert.
            stack.extend(self.children(node).iter().rev());
        }
        out
    }

    // ==================== Mutation ====================

    fn attach(&mut self, parent: NodeId, index: usize, child: NodeId) {
        assert!(self.data(child).parent.is_none(), "child is already attached");
        assert!(
            child != parent && !self.is_ancestor_of(child, parent),
            "attaching would create a cycle"
        );
        let parent_kind = self.kind(parent);
        assert!(
            matches!(parent_kind, NodeKind::Document | NodeKind::Element),
            "cannot attach children to a {} node",
            parent_kind.as_str()
        );
        self.data_mut(child).parent = Some(parent);
        self.data_mut(parent).children.insert(index, child);
    }

    /// Appends a detached node as the last child of `parent`.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        let index = self.children(parent).len();
        self.attach(parent, index, child);
    }

    /// Inserts a detached node at `index` among `parent`'s children.
    pub fn insert_child(&mut self, parent: NodeId, index: usize, child: NodeId) {
        assert!(index <= self.children(parent).len(), "insert index out of range");
        self.attach(parent, index, child);
    }

    /// Detaches `child` from its parent. The subtree stays alive and can be
    /// re-attached elsewhere.
    pub fn remove_child(&mut self, child: NodeId) {
        let Some(parent) = self.data(child).parent else {
            return;
        };
        self.data_mut(parent).children.retain(|&c| c != child);
        self.data_mut(child).parent = None;
    }

    /// Appends text under `parent`, coalescing with a trailing text child.
    ///
    /// Returns the text node that received the content. Leere Strings sind
    /// ein No-op und liefern den letzten Text-Knoten, falls vorhanden.
    pub fn append_text(&mut self, parent: NodeId, text: &str) -> Option<NodeId> {
        let last = self.children(parent).last().copied();
        if let Some(last) = last
            && self.kind(last) == NodeKind::Text
        {
            if !text.is_empty() {
                self.data_mut(last)
                    .content
                    .as_mut()
                    .expect("text node has content")
                    .push_str(text);
            }
            return Some(last);
        }
        if text.is_empty() {
            return None;
        }
        let node = self.create_text(text);
        self.append_child(parent, node);
        Some(node)
    }
}
