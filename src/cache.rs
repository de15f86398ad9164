//! Sparse cache of cloned walkers along the event stream.
//!
//! Entries are keyed by `(node, phase)` and ordered by event index. The
//! spacing policy keeps neighbouring entries at least `gap` events apart;
//! lookups return the entry with the greatest index at or before the target
//! and clone it — der Cache-Eintrag selbst wird nie konsumiert.
//!
//! Ein Reset auf Index `n` verwirft alle Eintraege mit Index `>= n`; der
//! Groessendeckel verdraengt den aeltesten Eintrag, aber nie den Eintrag,
//! auf dem der aktuelle Traversierungs-Cursor aufsetzen wuerde.

use std::collections::BTreeMap;

use log::trace;

use crate::FastHashMap;
use crate::dom::NodeId;
use crate::grammar::GrammarWalker;

/// Which point of an element's lifecycle a cache entry captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum CachePhase {
    /// Right after `leaveStartTag` (before the first child).
    AfterStart,
    /// Right after `endTag` (element fully validated).
    AfterElement,
}

/// A cloned walker handed out by a lookup.
#[derive(Debug, Clone)]
pub(crate) struct CachedWalker {
    pub node: NodeId,
    pub phase: CachePhase,
    pub event_index: u64,
    pub walker: GrammarWalker,
}

#[derive(Debug)]
pub(crate) struct WalkerCache {
    gap: u64,
    max: usize,
    by_index: BTreeMap<u64, (NodeId, CachePhase, GrammarWalker)>,
    keys: FastHashMap<(NodeId, CachePhase), u64>,
}

impl WalkerCache {
    pub fn new(gap: u64, max: usize) -> Self {
        Self {
            gap: gap.max(1),
            max: max.max(1),
            by_index: BTreeMap::new(),
            keys: FastHashMap::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    /// Stores a clone of `walker` unless the previous entry on the stream is
    /// closer than the configured gap. `cursor` is the engine's current
    /// stream position; the entry covering it is never evicted.
    pub fn maybe_insert(
        &mut self,
        node: NodeId,
        phase: CachePhase,
        event_index: u64,
        walker: &GrammarWalker,
        cursor: u64,
    ) -> bool {
        if let Some((&prev, _)) = self.by_index.range(..event_index).next_back()
            && event_index - prev < self.gap
        {
            return false;
        }
        if self.by_index.contains_key(&event_index) {
            return false;
        }
        trace!("cache insert at event {event_index} ({node:?}, {phase:?})");
        self.by_index.insert(event_index, (node, phase, walker.clone()));
        self.keys.insert((node, phase), event_index);
        self.enforce_max(cursor);
        true
    }

    fn enforce_max(&mut self, cursor: u64) {
        while self.by_index.len() > self.max {
            let needed = self
                .by_index
                .range(..=cursor)
                .next_back()
                .map(|(&idx, _)| idx);
            let victim = self
                .by_index
                .keys()
                .copied()
                .find(|idx| Some(*idx) != needed);
            let Some(victim) = victim else {
                break;
            };
            trace!("cache evict at event {victim}");
            if let Some((node, phase, _)) = self.by_index.remove(&victim) {
                self.keys.remove(&(node, phase));
            }
        }
    }

    /// The entry with the greatest event index `<= index`, cloned.
    pub fn best_at_or_before(&self, index: u64) -> Option<CachedWalker> {
        let (&event_index, (node, phase, walker)) = self.by_index.range(..=index).next_back()?;
        Some(CachedWalker {
            node: *node,
            phase: *phase,
            event_index,
            walker: walker.clone(),
        })
    }

    /// Drops every entry with event index `>= index`.
    pub fn purge_from(&mut self, index: u64) {
        let dropped = self.by_index.split_off(&index);
        for (node, phase, _) in dropped.into_values() {
            self.keys.remove(&(node, phase));
        }
    }

    pub fn clear(&mut self) {
        self.by_index.clear();
        self.keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::GrammarBuilder;

    fn walker() -> GrammarWalker {
        let b = GrammarBuilder::new();
        let start = b.element(b.name("", "a"), b.empty());
        b.finish(start).start_walker()
    }

    fn ids(doc: &mut crate::dom::Document, n: usize) -> Vec<NodeId> {
        (0..n)
            .map(|_| doc.create_element(crate::qname::QName::new("", "e")))
            .collect()
    }

    #[test]
    fn abstand_wird_eingehalten() {
        let mut doc = crate::dom::Document::new();
        let nodes = ids(&mut doc, 3);
        let w = walker();
        let mut cache = WalkerCache::new(10, 100);

        assert!(cache.maybe_insert(nodes[0], CachePhase::AfterStart, 0, &w, 0));
        // Zu nah am Vorgaenger.
        assert!(!cache.maybe_insert(nodes[1], CachePhase::AfterStart, 5, &w, 5));
        assert!(cache.maybe_insert(nodes[1], CachePhase::AfterElement, 10, &w, 10));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn lookup_groesster_index_davor() {
        let mut doc = crate::dom::Document::new();
        let nodes = ids(&mut doc, 3);
        let w = walker();
        let mut cache = WalkerCache::new(1, 100);
        cache.maybe_insert(nodes[0], CachePhase::AfterStart, 2, &w, 2);
        cache.maybe_insert(nodes[1], CachePhase::AfterElement, 7, &w, 7);
        cache.maybe_insert(nodes[2], CachePhase::AfterElement, 12, &w, 12);

        assert_eq!(cache.best_at_or_before(1).map(|c| c.event_index), None);
        assert_eq!(cache.best_at_or_before(7).map(|c| c.event_index), Some(7));
        assert_eq!(cache.best_at_or_before(11).map(|c| c.event_index), Some(7));
        assert_eq!(cache.best_at_or_before(100).map(|c| c.event_index), Some(12));
    }

    #[test]
    fn purge_ab_index() {
        let mut doc = crate::dom::Document::new();
        let nodes = ids(&mut doc, 3);
        let w = walker();
        let mut cache = WalkerCache::new(1, 100);
        cache.maybe_insert(nodes[0], CachePhase::AfterStart, 2, &w, 2);
        cache.maybe_insert(nodes[1], CachePhase::AfterElement, 7, &w, 7);
        cache.maybe_insert(nodes[2], CachePhase::AfterElement, 12, &w, 12);

        cache.purge_from(7);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.best_at_or_before(100).map(|c| c.event_index), Some(2));
        // Schluessel der entfernten Eintraege sind wieder frei.
        assert!(cache.maybe_insert(nodes[1], CachePhase::AfterElement, 7, &w, 7));
    }

    #[test]
    fn verdraengung_schont_den_cursor_eintrag() {
        let mut doc = crate::dom::Document::new();
        let nodes = ids(&mut doc, 4);
        let w = walker();
        let mut cache = WalkerCache::new(1, 2);
        cache.maybe_insert(nodes[0], CachePhase::AfterElement, 1, &w, 1);
        cache.maybe_insert(nodes[1], CachePhase::AfterElement, 5, &w, 5);
        // Cursor steht bei 6: Eintrag 5 ist der benoetigte, Eintrag 1 fliegt.
        cache.maybe_insert(nodes[2], CachePhase::AfterElement, 9, &w, 6);

        assert_eq!(cache.len(), 2);
        assert!(cache.best_at_or_before(1).is_none());
        assert_eq!(cache.best_at_or_before(6).map(|c| c.event_index), Some(5));
    }
}
