//! Per-node annotation side table.
//!
//! The validator never attaches anything to the tree itself; all bookkeeping
//! lives in this table, keyed by node identity. Hosts read annotations
//! through prefixed string keys (`"<prefix>EventIndexAfter"` etc., prefix
//! configurable per validator), die Engine selbst greift direkt auf die
//! Records zu.
//!
//! Index-Annotationen tragen Zaehlerstaende *nach* einem Ereignis; ein Reset
//! auf Index `n` loescht genau die Eintraege mit Wert `> n`.

use crate::FastIndexMap;
use crate::dom::NodeId;

/// Annotations of one node.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct NodeRecord {
    /// Stream position after the node was fully validated.
    pub event_index_after: Option<u64>,
    /// Stream position after the element's start tag (post `leaveStartTag`).
    pub event_index_after_start: Option<u64>,
    /// Stream position just before the element's attribute events.
    pub event_index_before_attributes: Option<u64>,
    /// Stream position just after the element's attribute events.
    pub event_index_after_attributes: Option<u64>,
    /// The element was admitted only through a wildcard name class.
    pub possible_due_to_wildcard: Option<bool>,
    /// Wildcard-admission per attribute, keyed by lexical attribute name.
    pub attribute_wildcard: FastIndexMap<Box<str>, bool>,
    /// Monotonic stamp linking the node to the findings it owns.
    pub error_id: Option<u64>,
}

impl NodeRecord {
    fn is_empty(&self) -> bool {
        self.event_index_after.is_none()
            && self.event_index_after_start.is_none()
            && self.event_index_before_attributes.is_none()
            && self.event_index_after_attributes.is_none()
            && self.possible_due_to_wildcard.is_none()
            && self.attribute_wildcard.is_empty()
            && self.error_id.is_none()
    }
}

/// A value read back through the public key interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyValue {
    /// An event-stream index.
    Index(u64),
    /// A boolean flag.
    Flag(bool),
}

/// The side table plus the configured key prefix.
#[derive(Debug, Default)]
pub(crate) struct AnnotationTable {
    prefix: Box<str>,
    records: FastIndexMap<NodeId, NodeRecord>,
}

impl AnnotationTable {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: Box::from(prefix),
            records: FastIndexMap::default(),
        }
    }

    pub fn record(&self, node: NodeId) -> Option<&NodeRecord> {
        self.records.get(&node)
    }

    pub fn record_mut(&mut self, node: NodeId) -> &mut NodeRecord {
        self.records.entry(node).or_default()
    }

    /// Clears every index annotation beyond `index` and drops records that
    /// become empty. Wildcard flags fall together with the start-tag stamp,
    /// weil der erneute Durchlauf sie neu setzt.
    pub fn erase_after(&mut self, index: u64) {
        self.records.retain(|_, rec| {
            if rec.event_index_after.is_some_and(|v| v > index) {
                rec.event_index_after = None;
            }
            if rec.event_index_after_start.is_some_and(|v| v > index) {
                rec.event_index_after_start = None;
            }
            if rec.event_index_after_attributes.is_some_and(|v| v > index) {
                rec.event_index_after_attributes = None;
            }
            if rec.event_index_before_attributes.is_some_and(|v| v > index) {
                rec.event_index_before_attributes = None;
                rec.possible_due_to_wildcard = None;
                rec.attribute_wildcard.clear();
            }
            !rec.is_empty()
        });
    }

    /// Loescht das `ErrorId`-Stempelfeld eines Knotens.
    pub fn clear_error_id(&mut self, node: NodeId) {
        if let Some(rec) = self.records.get_mut(&node) {
            rec.error_id = None;
            if rec.is_empty() {
                self.records.shift_remove(&node);
            }
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Public read access by prefixed key.
    pub fn property(&self, node: NodeId, key: &str) -> Option<PropertyValue> {
        let name = key.strip_prefix(&*self.prefix)?;
        let rec = self.records.get(&node)?;
        match name {
            "EventIndexAfter" => rec.event_index_after.map(PropertyValue::Index),
            "EventIndexAfterStart" => rec.event_index_after_start.map(PropertyValue::Index),
            "EventIndexBeforeAttributes" => {
                rec.event_index_before_attributes.map(PropertyValue::Index)
            }
            "EventIndexAfterAttributes" => {
                rec.event_index_after_attributes.map(PropertyValue::Index)
            }
            "PossibleDueToWildcard" => rec.possible_due_to_wildcard.map(PropertyValue::Flag),
            "ErrorId" => rec.error_id.map(PropertyValue::Index),
            _ => None,
        }
    }
}
