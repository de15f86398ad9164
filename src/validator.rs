//! The incremental validation engine.
//!
//! [`Validator`] drives the sequence of parse events implied by an in-order
//! traversal of the document into a [`GrammarWalker`], collects findings,
//! annotates nodes with stream positions, and keeps a sparse cache of cloned
//! walkers so that validation can resume near an arbitrary point after an
//! edit. Die Traversierung ist ein expliziter Zustandsautomat (Frame-Stack
//! mit Stage-Feld), kein Koroutinen-Konstrukt: nur so lassen sich
//! Unterbrechung, Wiederaufnahme und tiefe Resets beherrschen.
//!
//! # Cooperative scheduling
//!
//! The engine is strictly single-threaded. `start()` arms a deferred cycle;
//! the host pumps it with [`Validator::pump`] (or drains it with
//! [`Validator::run_to_completion`]). A cycle runs traversal steps until the
//! document is consumed or the `max_timespan` budget is spent, then yields.
//! `stop()` cancels the armed cycle. Zyklen sind nicht reentrant.
//!
//! # Edits
//!
//! The engine observes nothing; after mutating the tree the host must call
//! [`Validator::reset_to`] (or [`Validator::restart_at`]) with a node at or
//! before the edit. The reset is queued and applied at the next cycle
//! boundary (immediately while stopped).
//!
//! # Observer callbacks
//!
//! Listeners run synchronously on the engine's thread while the engine may
//! hold a read borrow on the document: callbacks must treat the document as
//! read-only and must not call back into the validator. Mutations and
//! control calls (`stop`, `start`, `reset_to`) belong between pumps.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::annotations::{AnnotationTable, PropertyValue};
use crate::cache::{CachePhase, CachedWalker, WalkerCache};
use crate::dom::{Document, NodeId, NodeKind};
use crate::emitter::{Emitter, ValidatorEvent};
use crate::error::{Error, Result};
use crate::event::{EventKind, ValidationEvent};
use crate::grammar::{FireResult, Grammar, GrammarWalker, PossibleEvents, ValidationError};
use crate::parse::safe_parse;
use crate::qname::ExpandedName;
use crate::{FastHashMap, FastIndexMap};

/// Overall validation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkingState {
    /// Validation has not run to completion and is not scheduled.
    Incomplete = 1,
    /// Validation is in progress.
    Working = 2,
    /// The whole document was consumed and findings exist. Terminal.
    Invalid = 3,
    /// The whole document was consumed without findings. Terminal.
    Valid = 4,
}

impl WorkingState {
    /// The numeric code of this state.
    pub fn code(self) -> u8 {
        self as u8
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Invalid | Self::Valid)
    }
}

/// State plus progress, as handed to observers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkingStateSnapshot {
    /// Current state.
    pub state: WorkingState,
    /// Fraction of the document validated so far, 1.0 exactly at terminal.
    pub part_done: f64,
}

/// A finding together with its semantic owner.
///
/// Content findings (wrong child, missing child, stray element) are owned by
/// the element whose content model is violated, `index` being the child
/// position involved. Attribute findings are owned by the element holding
/// the attribute. Text findings are owned by the text node's parent.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    /// The finding itself.
    pub error: ValidationError,
    /// The owning node, if one could be determined.
    pub node: Option<NodeId>,
    /// Child position within the owner, where applicable.
    pub index: Option<usize>,
}

#[derive(Debug, Clone)]
struct CapturedError {
    record: ErrorRecord,
    /// Stream position after the event that produced the finding.
    at: u64,
}

/// Construction-time knobs.
#[derive(Debug, Clone)]
pub struct ValidatorOptions {
    /// Prefix for the public annotation keys.
    pub prefix: String,
    /// Milliseconds between cycles (0 = next pump).
    pub timeout: u64,
    /// Wall-clock budget per cycle in milliseconds (0 = uncapped).
    pub max_timespan: u64,
    /// Minimum event distance between cached walkers.
    pub walker_cache_gap: u64,
    /// Upper bound on cached walkers.
    pub walker_cache_max: usize,
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        Self {
            prefix: "rngine".to_string(),
            timeout: 0,
            max_timespan: 100,
            walker_cache_gap: 100,
            walker_cache_max: 1024,
        }
    }
}

impl ValidatorOptions {
    /// Sets the annotation key prefix.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// Sets the inter-cycle timeout in milliseconds.
    pub fn with_timeout(mut self, ms: u64) -> Self {
        self.timeout = ms;
        self
    }

    /// Sets the per-cycle budget in milliseconds (0 = uncapped).
    pub fn with_max_timespan(mut self, ms: u64) -> Self {
        self.max_timespan = ms;
        self
    }

    /// Sets the walker cache spacing in events.
    pub fn with_walker_cache_gap(mut self, gap: u64) -> Self {
        self.walker_cache_gap = gap;
        self
    }

    /// Sets the walker cache size bound.
    pub fn with_walker_cache_max(mut self, max: usize) -> Self {
        self.walker_cache_max = max;
        self
    }
}

/// Per-element lifecycle stage of a stack frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Start tag fired; attributes and `leaveStartTag` are next.
    StartTagAndAttributes,
    /// Children are being processed.
    Contents,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    element: NodeId,
    /// Index of the next child to process (points at an open child while
    /// that child's frame is on the stack).
    child_cursor: usize,
    stage: Stage,
    pushed_context: bool,
    progress_base: f64,
    progress_share: f64,
}

/// Where a synchronous drive should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// Consume the whole document and end the walker.
    Complete,
    /// Stop just before the events of child `index` of `container`
    /// (`index == len` stops before the container's end tag).
    BeforeChild { container: NodeId, index: usize },
    /// Stop right after the element's start tag was fully processed.
    AfterStart { element: NodeId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Progress,
    ReachedTarget,
    Done,
}

type DocumentCheck = Box<dyn FnMut(&Document) -> Vec<ValidationError>>;

/// The incremental, pausable validator.
pub struct Validator {
    grammar: Grammar,
    doc: Rc<RefCell<Document>>,
    options: ValidatorOptions,
    emitter: Emitter,

    walker: GrammarWalker,
    stack: Vec<Frame>,
    event_index: u64,
    done: bool,

    annotations: AnnotationTable,
    cache: WalkerCache,
    errors: Vec<CapturedError>,
    errors_by_owner: FastHashMap<NodeId, Vec<usize>>,
    next_error_id: u64,

    state: WorkingState,
    part_done: f64,

    pending_cycle: Option<Instant>,
    cycle_entered: bool,
    resetting: bool,
    queued_reset: Option<NodeId>,

    document_check: Option<DocumentCheck>,
}

impl Validator {
    /// Creates a validator over `doc` against `grammar`.
    pub fn new(grammar: Grammar, doc: Rc<RefCell<Document>>, options: ValidatorOptions) -> Self {
        let walker = grammar.start_walker();
        let root = doc.borrow().root();
        let annotations = AnnotationTable::new(&options.prefix);
        let cache = WalkerCache::new(options.walker_cache_gap, options.walker_cache_max);
        Self {
            grammar,
            doc,
            options,
            emitter: Emitter::new(),
            walker,
            stack: vec![Frame {
                element: root,
                child_cursor: 0,
                stage: Stage::Contents,
                pushed_context: false,
                progress_base: 0.0,
                progress_share: 1.0,
            }],
            event_index: 0,
            done: false,
            annotations,
            cache,
            errors: Vec::new(),
            errors_by_owner: FastHashMap::default(),
            next_error_id: 0,
            state: WorkingState::Incomplete,
            part_done: 0.0,
            pending_cycle: None,
            cycle_entered: false,
            resetting: false,
            queued_reset: None,
            document_check: None,
        }
    }

    /// The observer registry.
    pub fn events(&self) -> &Emitter {
        &self.emitter
    }

    /// The validated document.
    pub fn document(&self) -> Rc<RefCell<Document>> {
        Rc::clone(&self.doc)
    }

    /// Installs a document-level check run once after the grammar walker was
    /// successfully ended; its findings are appended like grammar findings.
    pub fn set_document_check(&mut self, check: impl FnMut(&Document) -> Vec<ValidationError> + 'static) {
        self.document_check = Some(Box::new(check));
    }

    // ==================== Scheduler ====================

    /// Arms the next cycle. Idempotent while running; a no-op once the
    /// validator reached a terminal state.
    pub fn start(&mut self) {
        if self.pending_cycle.is_some() || self.state.is_terminal() {
            return;
        }
        debug!("validation armed (timeout {} ms)", self.options.timeout);
        self.set_state(WorkingState::Working);
        self.pending_cycle = Some(Instant::now() + Duration::from_millis(self.options.timeout));
    }

    /// Cancels the armed cycle. State becomes `Incomplete` unless terminal.
    pub fn stop(&mut self) {
        self.pending_cycle = None;
        if !self.state.is_terminal() {
            self.set_state(WorkingState::Incomplete);
        }
    }

    /// Runs the armed cycle if it is due. The host's deferred-execution
    /// hook: call this from the event loop.
    pub fn pump(&mut self) -> Result<WorkingStateSnapshot> {
        if let Some(due) = self.pending_cycle
            && Instant::now() >= due
        {
            self.pending_cycle = None;
            if let Err(e) = self.cycle() {
                self.pending_cycle = None;
                return Err(e);
            }
            if !self.done && self.state == WorkingState::Working {
                self.pending_cycle = Some(Instant::now() + Duration::from_millis(self.options.timeout));
            }
        }
        Ok(self.working_state())
    }

    /// Starts and drains the scheduler until a terminal state (or `stop()`
    /// from a queued reset boundary) is reached.
    pub fn run_to_completion(&mut self) -> Result<WorkingStateSnapshot> {
        self.start();
        while self.pending_cycle.is_some() {
            self.pending_cycle = None;
            if let Err(e) = self.cycle() {
                self.pending_cycle = None;
                return Err(e);
            }
            if !self.done && self.state == WorkingState::Working {
                self.pending_cycle = Some(Instant::now());
            }
        }
        Ok(self.working_state())
    }

    fn cycle(&mut self) -> Result<()> {
        if self.cycle_entered {
            return Err(Error::ReentrantCycle);
        }
        self.cycle_entered = true;
        let result = self.cycle_inner();
        self.cycle_entered = false;
        result
    }

    fn cycle_inner(&mut self) -> Result<()> {
        if let Some(node) = self.queued_reset.take() {
            self.apply_reset(node)?;
        }
        let budget = self.options.max_timespan;
        let begin = Instant::now();
        loop {
            match self.step(Target::Complete)? {
                StepOutcome::Done => {
                    self.finish();
                    return Ok(());
                }
                StepOutcome::ReachedTarget | StepOutcome::Progress => {}
            }
            if budget != 0 && begin.elapsed() >= Duration::from_millis(budget) {
                break;
            }
        }
        trace!("cycle yielded at event {} ({:.3} done)", self.event_index, self.part_done);
        if !self.resetting {
            self.emit_state();
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.part_done = 1.0;
        self.pending_cycle = None;
        let state = if self.errors.is_empty() {
            WorkingState::Valid
        } else {
            WorkingState::Invalid
        };
        debug!("validation finished: {state:?} with {} finding(s)", self.errors.len());
        self.set_state(state);
    }

    fn set_state(&mut self, state: WorkingState) {
        if self.state != state {
            self.state = state;
            if !self.resetting {
                self.emit_state();
            }
        }
    }

    fn emit_state(&self) {
        self.emitter
            .emit(&ValidatorEvent::StateUpdate(self.working_state()));
    }

    // ==================== Traversal state machine ====================

    /// Performs the next logical traversal action.
    fn step(&mut self, target: Target) -> Result<StepOutcome> {
        if self.done {
            return Ok(StepOutcome::Done);
        }
        let doc_rc = Rc::clone(&self.doc);
        let doc = doc_rc.borrow();

        let frame = *self.stack.last().ok_or(Error::CacheCorrupted("empty traversal stack".into()))?;
        match frame.stage {
            Stage::StartTagAndAttributes => {
                self.process_attributes(&doc, frame.element);
                if let Some(top) = self.stack.last_mut() {
                    top.stage = Stage::Contents;
                }
                if target == (Target::AfterStart { element: frame.element }) {
                    return Ok(StepOutcome::ReachedTarget);
                }
                Ok(StepOutcome::Progress)
            }
            Stage::Contents => {
                if target
                    == (Target::BeforeChild {
                        container: frame.element,
                        index: frame.child_cursor,
                    })
                {
                    return Ok(StepOutcome::ReachedTarget);
                }
                let children = doc.children(frame.element);
                if let Some(&child) = children.get(frame.child_cursor) {
                    match doc.kind(child) {
                        NodeKind::Comment | NodeKind::ProcessingInstruction => {
                            self.advance_child(&doc);
                        }
                        NodeKind::Text => {
                            let text = doc.text(child).expect("text node has content");
                            self.fire(
                                &ValidationEvent::Text { text },
                                Some(frame.element),
                                Some(frame.child_cursor),
                            );
                            self.annotations.record_mut(child).event_index_after = Some(self.event_index);
                            self.advance_child(&doc);
                        }
                        NodeKind::Element => {
                            self.enter_element(&doc, child, frame.child_cursor);
                        }
                        NodeKind::Document => {
                            return Err(Error::CacheCorrupted("document node as child".into()));
                        }
                    }
                    Ok(StepOutcome::Progress)
                } else if self.stack.len() > 1 {
                    self.leave_element(&doc, frame);
                    Ok(StepOutcome::Progress)
                } else {
                    // Document consumed. The walker is ended only by the
                    // complete-document driver.
                    if target == Target::Complete {
                        self.end_document(&doc);
                        Ok(StepOutcome::Done)
                    } else {
                        Ok(StepOutcome::ReachedTarget)
                    }
                }
            }
        }
    }

    fn enter_element(&mut self, doc: &Document, element: NodeId, index: usize) {
        let mapping = doc.namespace_mapping(element);
        let pushed_context = mapping.is_some();
        if let Some(m) = mapping {
            self.walker.enter_context_with_mapping(m);
        }
        self.annotations.record_mut(element).event_index_before_attributes = Some(self.event_index);

        let name = doc.name(element).expect("element node has a name").clone();
        let expanded = name.expanded();
        let wildcard = self
            .walker
            .possible()
            .only_wildcard(EventKind::EnterStartTag, &expanded);
        self.stamp_wildcard(element, wildcard);

        let parent = self.stack.last().map(|f| f.element);
        self.fire(
            &ValidationEvent::EnterStartTag {
                ns: &expanded.uri,
                name: &expanded.local_name,
            },
            parent,
            Some(index),
        );

        let (progress_base, progress_share) = self.child_progress(doc, index);
        self.stack.push(Frame {
            element,
            child_cursor: 0,
            stage: Stage::StartTagAndAttributes,
            pushed_context,
            progress_base,
            progress_share,
        });
    }

    /// Fires the attribute events and `leaveStartTag` of the open element.
    fn process_attributes(&mut self, doc: &Document, element: NodeId) {
        for attr in doc.attributes(element) {
            if attr.is_namespace_declaration() {
                continue;
            }
            let resolved = match &attr.prefix {
                Some(prefix) => {
                    let lexical = format!("{prefix}:{}", attr.local_name);
                    match self.walker.resolve_name(&lexical, true) {
                        Some(n) => n,
                        None => {
                            // Unaufloesbares Praefix: Attribut stillschweigend
                            // ueberspringen.
                            trace!("skipping attribute {lexical} with unresolvable prefix");
                            continue;
                        }
                    }
                }
                None => ExpandedName::new("", &attr.local_name),
            };
            let wildcard = self
                .walker
                .possible()
                .only_wildcard(EventKind::AttributeName, &resolved);
            self.stamp_attribute_wildcard(element, &attr.qualified_name(), wildcard);
            self.fire(
                &ValidationEvent::AttributeName {
                    ns: &resolved.uri,
                    name: &resolved.local_name,
                },
                Some(element),
                None,
            );
            self.fire(&ValidationEvent::AttributeValue { value: &attr.value }, Some(element), None);
        }
        self.annotations.record_mut(element).event_index_after_attributes = Some(self.event_index);
        self.fire(&ValidationEvent::LeaveStartTag, Some(element), None);
        self.annotations.record_mut(element).event_index_after_start = Some(self.event_index);
        self.cache.maybe_insert(
            element,
            CachePhase::AfterStart,
            self.event_index,
            &self.walker,
            self.event_index,
        );
    }

    fn leave_element(&mut self, doc: &Document, frame: Frame) {
        let name = doc.name(frame.element).expect("element node has a name").clone();
        let expanded = name.expanded();
        self.fire(
            &ValidationEvent::EndTag {
                ns: &expanded.uri,
                name: &expanded.local_name,
            },
            Some(frame.element),
            Some(doc.children(frame.element).len()),
        );
        if frame.pushed_context {
            self.walker.leave_context();
        }
        self.annotations.record_mut(frame.element).event_index_after = Some(self.event_index);
        self.cache.maybe_insert(
            frame.element,
            CachePhase::AfterElement,
            self.event_index,
            &self.walker,
            self.event_index,
        );
        self.stack.pop();
        self.advance_child(doc);
    }

    fn end_document(&mut self, doc: &Document) {
        let end_errors = self.walker.end();
        let owner = doc.document_element();
        for error in end_errors {
            self.capture_error(error, owner, None);
        }
        if let Some(mut check) = self.document_check.take() {
            for error in check(doc) {
                self.capture_error(error, owner, None);
            }
            self.document_check = Some(check);
        }
        self.annotations.record_mut(doc.root()).event_index_after = Some(self.event_index);
        self.done = true;
    }

    /// Moves the top frame past its current child and updates progress.
    fn advance_child(&mut self, doc: &Document) {
        let Some(top) = self.stack.last_mut() else {
            return;
        };
        top.child_cursor += 1;
        let len = doc.children(top.element).len().max(1);
        let done = top.progress_base + (top.child_cursor.min(len) as f64 / len as f64) * top.progress_share;
        if done > self.part_done {
            self.part_done = done;
        }
    }

    /// Progress share of the child at `index` of the current top frame.
    fn child_progress(&self, doc: &Document, index: usize) -> (f64, f64) {
        let Some(top) = self.stack.last() else {
            return (0.0, 1.0);
        };
        let len = doc.children(top.element).len().max(1);
        let share = top.progress_share / len as f64;
        (top.progress_base + index as f64 * share, share)
    }

    // ==================== Event firing & error collection ====================

    fn fire(&mut self, event: &ValidationEvent<'_>, owner: Option<NodeId>, index: Option<usize>) {
        trace!("event {}: {event}", self.event_index);
        let result = self.walker.fire_event(event);
        self.event_index += 1;
        if let FireResult::Errors(errors) = result {
            for error in errors {
                self.capture_error(error, owner, index);
            }
        }
    }

    fn capture_error(&mut self, error: ValidationError, node: Option<NodeId>, index: Option<usize>) {
        if let Some(owner) = node {
            let rec = self.annotations.record_mut(owner);
            if rec.error_id.is_none() {
                rec.error_id = Some(self.next_error_id);
                self.next_error_id += 1;
            }
        }
        let record = ErrorRecord { error, node, index };
        let position = self.errors.len();
        self.errors.push(CapturedError {
            record: record.clone(),
            at: self.event_index,
        });
        if let Some(owner) = node {
            self.errors_by_owner.entry(owner).or_default().push(position);
        }
        self.emitter.emit(&ValidatorEvent::Error(record));
    }

    fn stamp_wildcard(&mut self, element: NodeId, value: bool) {
        let rec = self.annotations.record_mut(element);
        let prior = rec.possible_due_to_wildcard.replace(value);
        if prior.is_some_and(|p| p != value) {
            self.emitter
                .emit(&ValidatorEvent::PossibleDueToWildcardChange(element));
        }
    }

    fn stamp_attribute_wildcard(&mut self, element: NodeId, attribute: &str, value: bool) {
        let rec = self.annotations.record_mut(element);
        let prior = rec.attribute_wildcard.insert(Box::from(attribute), value);
        if prior.is_some_and(|p| p != value) {
            self.emitter
                .emit(&ValidatorEvent::PossibleDueToWildcardChange(element));
        }
    }

    // ==================== Reset ====================

    /// Queues a reset to a point at or before `node`. Applied at the next
    /// cycle boundary, or immediately while no cycle is armed.
    pub fn reset_to(&mut self, node: NodeId) -> Result<()> {
        if !self.doc.borrow().contains(node) {
            return Err(Error::ForeignNode);
        }
        self.queued_reset = Some(match self.queued_reset {
            // Von mehreren Resets gewinnt der fruehere Punkt.
            Some(prev) if self.reset_index_for(prev) <= self.reset_index_for(node) => prev,
            _ => node,
        });
        if self.pending_cycle.is_none() && !self.cycle_entered {
            let node = self.queued_reset.take().expect("reset just queued");
            self.apply_reset(node)?;
        }
        Ok(())
    }

    /// `reset_to` followed by `start`.
    pub fn restart_at(&mut self, node: NodeId) -> Result<()> {
        self.reset_to(node)?;
        self.start();
        Ok(())
    }

    fn apply_reset(&mut self, node: NodeId) -> Result<()> {
        self.resetting = true;
        let reset_index = self.reset_index_for(node);
        debug!("reset to {node:?} at event {reset_index}");

        let entry = self.cache.best_at_or_before(reset_index);
        self.restore_from(entry)?;
        self.cache.purge_from(reset_index);
        self.annotations.erase_after(reset_index);
        self.drop_errors_from(reset_index);
        self.emitter.emit(&ValidatorEvent::ResetErrors { at: reset_index });

        self.done = false;
        self.resetting = false;
        self.set_state(WorkingState::Working);
        Ok(())
    }

    /// The stream position just before `node`'s first event, derived from
    /// surviving annotations.
    fn reset_index_for(&self, node: NodeId) -> u64 {
        if let Some(rec) = self.annotations.record(node)
            && let Some(i) = rec.event_index_before_attributes
        {
            return i;
        }
        let doc = self.doc.borrow();
        let mut current = node;
        loop {
            let Some(parent) = doc.parent(current) else {
                return 0;
            };
            let children = doc.children(parent);
            let position = children.iter().position(|&c| c == current).unwrap_or(0);
            for &sibling in children[..position].iter().rev() {
                if let Some(rec) = self.annotations.record(sibling)
                    && let Some(i) = rec.event_index_after
                {
                    return i;
                }
            }
            if let Some(rec) = self.annotations.record(parent) {
                if let Some(i) = rec.event_index_after_start {
                    return i;
                }
                if let Some(i) = rec.event_index_before_attributes {
                    return i;
                }
            }
            current = parent;
        }
    }

    /// Rebuilds walker, stack and position from a cache entry (or from
    /// scratch when none survives).
    fn restore_from(&mut self, entry: Option<CachedWalker>) -> Result<()> {
        let doc_rc = Rc::clone(&self.doc);
        let doc = doc_rc.borrow();
        match entry {
            None => {
                self.walker = self.grammar.start_walker();
                self.event_index = 0;
                self.part_done = 0.0;
                self.stack = vec![Frame {
                    element: doc.root(),
                    child_cursor: 0,
                    stage: Stage::Contents,
                    pushed_context: false,
                    progress_base: 0.0,
                    progress_share: 1.0,
                }];
            }
            Some(e) => {
                let chain = open_chain(&doc, e.node, e.phase)?;
                let mut stack: Vec<Frame> = Vec::with_capacity(chain.len());
                let mut base = 0.0f64;
                let mut share = 1.0f64;
                for (depth, &(element, child_cursor)) in chain.iter().enumerate() {
                    if depth > 0 {
                        let (parent, _) = chain[depth - 1];
                        let len = doc.children(parent).len().max(1);
                        let index = doc
                            .child_index(element)
                            .ok_or(Error::CacheCorrupted("cached node detached".into()))?;
                        base += (index as f64 / len as f64) * share;
                        share /= len as f64;
                    }
                    stack.push(Frame {
                        element,
                        child_cursor,
                        stage: Stage::Contents,
                        pushed_context: doc.namespace_mapping(element).is_some(),
                        progress_base: base,
                        progress_share: share,
                    });
                }
                self.walker = e.walker;
                self.event_index = e.event_index;
                self.stack = stack;
                // Fortschritt auf die wiederhergestellte Position setzen.
                if let Some(top) = self.stack.last() {
                    let len = doc.children(top.element).len().max(1);
                    self.part_done = top.progress_base
                        + (top.child_cursor.min(len) as f64 / len as f64) * top.progress_share;
                }
            }
        }
        Ok(())
    }

    fn drop_errors_from(&mut self, reset_index: u64) {
        let mut dropped_owners: Vec<NodeId> = Vec::new();
        self.errors.retain(|e| {
            if e.at > reset_index {
                if let Some(owner) = e.record.node
                    && !dropped_owners.contains(&owner)
                {
                    dropped_owners.push(owner);
                }
                false
            } else {
                true
            }
        });
        self.errors_by_owner.clear();
        for (position, e) in self.errors.iter().enumerate() {
            if let Some(owner) = e.record.node {
                self.errors_by_owner.entry(owner).or_default().push(position);
            }
        }
        for owner in dropped_owners {
            if !self.errors_by_owner.contains_key(&owner) {
                self.annotations.clear_error_id(owner);
            }
        }
    }

    // ==================== Queries ====================

    /// Current state and progress.
    pub fn working_state(&self) -> WorkingStateSnapshot {
        WorkingStateSnapshot {
            state: self.state,
            part_done: self.part_done,
        }
    }

    /// Snapshot of all findings, in capture order.
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().map(|e| e.record.clone()).collect()
    }

    /// Findings owned by `node`.
    pub fn errors_for(&self, node: NodeId) -> Vec<ErrorRecord> {
        self.errors_by_owner
            .get(&node)
            .map(|positions| {
                positions
                    .iter()
                    .map(|&p| self.errors[p].record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Namespace URIs the grammar can validate.
    pub fn schema_namespaces(&self) -> Vec<String> {
        self.grammar.namespaces()
    }

    /// Fresh scan of the namespace declarations in the document.
    pub fn document_namespaces(&self) -> FastIndexMap<String, Vec<String>> {
        self.doc.borrow().document_namespaces()
    }

    /// Read-only annotation access by prefixed key.
    pub fn node_property(&self, node: NodeId, key: &str) -> Option<PropertyValue> {
        self.annotations.property(node, key)
    }

    /// Wildcard-admission flag stamped for an attribute (by lexical name).
    pub fn attribute_wildcard(&self, element: NodeId, attribute: &str) -> Option<bool> {
        self.annotations
            .record(element)?
            .attribute_wildcard
            .get(attribute)
            .copied()
    }

    /// Normalizes a query anchor: text containers address their own
    /// position within the parent.
    fn normalize_anchor(&self, container: NodeId, index: usize) -> Result<(NodeId, usize)> {
        let doc = self.doc.borrow();
        match doc.kind(container) {
            NodeKind::Element | NodeKind::Document => Ok((container, index)),
            NodeKind::Text => {
                let parent = doc.parent(container).ok_or(Error::ForeignNode)?;
                let position = doc.child_index(container).ok_or(Error::ForeignNode)?;
                Ok((parent, position))
            }
            kind => Err(Error::InvalidQueryTarget { kind: kind.as_str() }),
        }
    }

    /// Synchronously drives the engine's own walker until `target`, unless
    /// annotations show the point was already passed.
    fn validate_up_to(&mut self, target: Target) -> Result<()> {
        if self.cycle_entered {
            return Err(Error::ReentrantCycle);
        }
        if self.already_past(target) {
            return Ok(());
        }
        loop {
            match self.step(target)? {
                StepOutcome::Progress => {}
                StepOutcome::ReachedTarget => return Ok(()),
                StepOutcome::Done => {
                    self.finish();
                    return Ok(());
                }
            }
        }
    }

    fn already_past(&self, target: Target) -> bool {
        let doc = self.doc.borrow();
        match target {
            Target::Complete => self.done,
            Target::AfterStart { element } => self
                .annotations
                .record(element)
                .is_some_and(|r| r.event_index_after_start.is_some()),
            Target::BeforeChild { container, index } => {
                for &child in doc.children(container).iter().skip(index) {
                    match doc.kind(child) {
                        NodeKind::Element => {
                            return self
                                .annotations
                                .record(child)
                                .is_some_and(|r| r.event_index_before_attributes.is_some());
                        }
                        NodeKind::Text => {
                            return self
                                .annotations
                                .record(child)
                                .is_some_and(|r| r.event_index_after.is_some());
                        }
                        _ => {}
                    }
                }
                // Kein validierungsrelevantes Kind mehr: der Punkt ist
                // passiert, sobald der Container geschlossen wurde.
                self.annotations
                    .record(container)
                    .is_some_and(|r| r.event_index_after.is_some())
            }
        }
    }

    /// The stream position of `target`, from annotations. Fails with an
    /// event-index fault when the annotations are missing.
    fn target_event_index(&self, target: Target) -> Result<u64> {
        let doc = self.doc.borrow();
        let missing = |ctx: &'static str| Error::event_index(u64::MAX, ctx);
        match target {
            Target::Complete => Err(missing("complete target has no single index")),
            Target::AfterStart { element } => self
                .annotations
                .record(element)
                .and_then(|r| r.event_index_after_start)
                .ok_or(missing("walker_at: element start not validated")),
            Target::BeforeChild { container, index } => {
                // Die Position vor Kind `index` ist der After-Stempel des
                // letzten validierungsrelevanten Geschwisters davor.
                let children = doc.children(container);
                let bound = index.min(children.len());
                for &sibling in children[..bound].iter().rev() {
                    match doc.kind(sibling) {
                        NodeKind::Element | NodeKind::Text => {
                            return self
                                .annotations
                                .record(sibling)
                                .and_then(|r| r.event_index_after)
                                .ok_or(missing("walker_at: preceding sibling not validated"));
                        }
                        _ => {}
                    }
                }
                if doc.kind(container) == NodeKind::Document {
                    Ok(0)
                } else {
                    self.annotations
                        .record(container)
                        .and_then(|r| r.event_index_after_start)
                        .ok_or(missing("walker_at: container start not validated"))
                }
            }
        }
    }

    /// Clones a walker positioned at `(container, index)`.
    ///
    /// With `attributes` set, `index` addresses the container's attribute
    /// list and the walker stops mid start tag, right before the event of
    /// attribute `index`. The returned walker is the caller's property; the
    /// engine walker and the cache are not perturbed beyond the forward
    /// validation needed to cover the point.
    pub fn walker_at(&mut self, container: NodeId, index: usize, attributes: bool) -> Result<GrammarWalker> {
        let (container, index) = if attributes {
            let kind = self.doc.borrow().kind(container);
            if kind != NodeKind::Element {
                return Err(Error::InvalidQueryTarget { kind: kind.as_str() });
            }
            (container, index)
        } else {
            self.normalize_anchor(container, index)?
        };

        let (lookup_index, replay_target) = if attributes {
            self.validate_up_to(Target::AfterStart { element: container })?;
            let before = self
                .annotations
                .record(container)
                .and_then(|r| r.event_index_before_attributes)
                .ok_or(Error::event_index(u64::MAX, "walker_at: start tag not validated"))?;
            (
                before,
                ReplayTarget::MidAttributes {
                    element: container,
                    attr_index: index,
                },
            )
        } else {
            let target = Target::BeforeChild { container, index };
            self.validate_up_to(target)?;
            let lookup = self.target_event_index(target)?;
            (lookup, ReplayTarget::BeforeChild { container, index })
        };

        let doc_rc = Rc::clone(&self.doc);
        let doc = doc_rc.borrow();
        let seed = self.cache.best_at_or_before(lookup_index);
        let (walker, stack) = match seed {
            Some(e) => {
                let chain = open_chain(&doc, e.node, e.phase)?;
                (e.walker, chain)
            }
            None => (self.grammar.start_walker(), vec![(doc.root(), 0)]),
        };
        replay(&doc, walker, stack, replay_target)
    }

    /// The walker's possibility set at `(container, index)`.
    pub fn possible_at(&mut self, container: NodeId, index: usize, attributes: bool) -> Result<PossibleEvents> {
        Ok(self.walker_at(container, index, attributes)?.possible())
    }

    /// Every child index of `container` (0 through `children.len()`
    /// inclusive) at which `event` would be admitted.
    pub fn possible_where(&mut self, container: NodeId, event: &ValidationEvent<'_>) -> Result<Vec<usize>> {
        let (container, _) = self.normalize_anchor(container, 0)?;
        let len = self.doc.borrow().children(container).len();
        let mut admitted = Vec::new();
        for index in 0..=len {
            if self.possible_at(container, index, false)?.allows(event) {
                admitted.push(index);
            }
        }
        Ok(admitted)
    }

    /// Validates `items` (nodes of `fragment`) as if inserted at
    /// `(container, index)`. Returns `None` when the insertion would be
    /// clean, the findings otherwise. The engine's walker, cache, findings
    /// and annotations are untouched; no observer events fire.
    pub fn speculatively_validate(
        &mut self,
        container: NodeId,
        index: usize,
        fragment: &Document,
        items: &[NodeId],
    ) -> Result<Option<Vec<ErrorRecord>>> {
        let (container, index) = self.normalize_anchor(container, index)?;
        let mut walker = self.walker_at(container, index, false)?;
        let mut findings = Vec::new();
        for (offset, &item) in items.iter().enumerate() {
            match fragment.kind(item) {
                NodeKind::Element => {
                    speculative_fire_element(
                        &mut walker,
                        fragment,
                        item,
                        Some(container),
                        index + offset,
                        &mut findings,
                    );
                }
                NodeKind::Text => {
                    let text = fragment.text(item).expect("text node has content");
                    if let FireResult::Errors(errors) =
                        walker.fire_event(&ValidationEvent::Text { text })
                    {
                        for error in errors {
                            findings.push(ErrorRecord {
                                error,
                                node: Some(container),
                                index: Some(index + offset),
                            });
                        }
                    }
                }
                NodeKind::Comment | NodeKind::ProcessingInstruction => {}
                NodeKind::Document => {
                    return Err(Error::InvalidQueryTarget { kind: "document" });
                }
            }
        }
        Ok((!findings.is_empty()).then_some(findings))
    }

    /// Parses `source` and speculatively validates its top-level nodes at
    /// `(container, index)`. A fragment that does not even parse reports a
    /// single finding carrying the parser diagnostic.
    pub fn speculatively_validate_fragment(
        &mut self,
        container: NodeId,
        index: usize,
        source: &str,
    ) -> Result<Option<Vec<ErrorRecord>>> {
        let fragment = match safe_parse(source) {
            Ok(doc) => doc,
            Err(parse_error) => {
                return Ok(Some(vec![ErrorRecord {
                    error: ValidationError::Custom(parse_error.to_string().into_boxed_str()),
                    node: None,
                    index: None,
                }]));
            }
        };
        let items: Vec<NodeId> = fragment.children(fragment.root()).to_vec();
        self.speculatively_validate(container, index, &fragment, &items)
    }

    /// Resolves a lexical name under the namespace scopes in force at
    /// `(container, index)`.
    pub fn resolve_name_at(
        &mut self,
        container: NodeId,
        index: usize,
        name: &str,
        attribute: bool,
    ) -> Result<Option<ExpandedName>> {
        Ok(self.walker_at(container, index, false)?.resolve_name(name, attribute))
    }

    /// Finds a lexical form for an expanded name under the scopes in force
    /// at `(container, index)`.
    pub fn unresolve_name_at(
        &mut self,
        container: NodeId,
        index: usize,
        uri: &str,
        local_name: &str,
    ) -> Result<Option<String>> {
        Ok(self.walker_at(container, index, false)?.unresolve_name(uri, local_name))
    }
}

// ==================== Replay ====================

/// Where a replay stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayTarget {
    BeforeChild { container: NodeId, index: usize },
    /// Mid start tag: after `enterStartTag` and the events of the first
    /// `attr_index` attributes of `element`.
    MidAttributes { element: NodeId, attr_index: usize },
}

/// Open-element chain (element, child cursor) from the document node down to
/// the position a cache entry captures.
fn open_chain(doc: &Document, node: NodeId, phase: CachePhase) -> Result<Vec<(NodeId, usize)>> {
    let mut lineage: Vec<NodeId> = vec![node];
    lineage.extend(doc.ancestors(node));
    lineage.reverse();

    let mut frames: Vec<(NodeId, usize)> = Vec::with_capacity(lineage.len());
    for pair in lineage.windows(2) {
        let child_index = doc
            .child_index(pair[1])
            .ok_or(Error::CacheCorrupted("cached node detached".into()))?;
        frames.push((pair[0], child_index));
    }
    match phase {
        CachePhase::AfterStart => frames.push((node, 0)),
        CachePhase::AfterElement => {
            let last = frames
                .last_mut()
                .ok_or(Error::CacheCorrupted("cache entry at document node".into()))?;
            last.1 += 1;
        }
    }
    Ok(frames)
}

/// Fast-forwards a cloned walker from a seeded position to `target`,
/// firing events silently (findings are the engine's business, not the
/// replay's).
fn replay(
    doc: &Document,
    mut walker: GrammarWalker,
    mut stack: Vec<(NodeId, usize)>,
    target: ReplayTarget,
) -> Result<GrammarWalker> {
    loop {
        let &(top, cursor) = stack
            .last()
            .ok_or(Error::event_index(u64::MAX, "replay ran past the document end"))?;
        if target == (ReplayTarget::BeforeChild { container: top, index: cursor }) {
            return Ok(walker);
        }
        let children = doc.children(top);
        if let Some(&child) = children.get(cursor) {
            match doc.kind(child) {
                NodeKind::Comment | NodeKind::ProcessingInstruction => {
                    if let Some(last) = stack.last_mut() {
                        last.1 += 1;
                    }
                }
                NodeKind::Text => {
                    let text = doc.text(child).expect("text node has content");
                    walker.fire_event(&ValidationEvent::Text { text });
                    if let Some(last) = stack.last_mut() {
                        last.1 += 1;
                    }
                }
                NodeKind::Element => {
                    let stop_at = match target {
                        ReplayTarget::MidAttributes { element, attr_index } if element == child => {
                            Some(attr_index)
                        }
                        _ => None,
                    };
                    replay_start_tag(&mut walker, doc, child, stop_at);
                    if stop_at.is_some() {
                        return Ok(walker);
                    }
                    stack.push((child, 0));
                }
                NodeKind::Document => {
                    return Err(Error::CacheCorrupted("document node as child".into()));
                }
            }
        } else {
            if stack.len() == 1 {
                return Err(Error::event_index(u64::MAX, "replay ran past the document end"));
            }
            let name = doc.name(top).expect("element node has a name").clone();
            let expanded = name.expanded();
            walker.fire_event(&ValidationEvent::EndTag {
                ns: &expanded.uri,
                name: &expanded.local_name,
            });
            if doc.namespace_mapping(top).is_some() {
                walker.leave_context();
            }
            stack.pop();
            if let Some(last) = stack.last_mut() {
                last.1 += 1;
            }
        }
    }
}

/// Fires the start-tag event block of `element` into `walker`. With
/// `stop_before_attr`, only the attribute events before that list position
/// are fired and `leaveStartTag` is withheld.
fn replay_start_tag(
    walker: &mut GrammarWalker,
    doc: &Document,
    element: NodeId,
    stop_before_attr: Option<usize>,
) {
    if let Some(mapping) = doc.namespace_mapping(element) {
        walker.enter_context_with_mapping(mapping);
    }
    let name = doc.name(element).expect("element node has a name").clone();
    let expanded = name.expanded();
    walker.fire_event(&ValidationEvent::EnterStartTag {
        ns: &expanded.uri,
        name: &expanded.local_name,
    });
    for (position, attr) in doc.attributes(element).iter().enumerate() {
        if stop_before_attr.is_some_and(|stop| position >= stop) {
            return;
        }
        if attr.is_namespace_declaration() {
            continue;
        }
        let resolved = match &attr.prefix {
            Some(prefix) => {
                let lexical = format!("{prefix}:{}", attr.local_name);
                match walker.resolve_name(&lexical, true) {
                    Some(n) => n,
                    None => continue,
                }
            }
            None => ExpandedName::new("", &attr.local_name),
        };
        walker.fire_event(&ValidationEvent::AttributeName {
            ns: &resolved.uri,
            name: &resolved.local_name,
        });
        walker.fire_event(&ValidationEvent::AttributeValue { value: &attr.value });
    }
    if stop_before_attr.is_some() {
        return;
    }
    walker.fire_event(&ValidationEvent::LeaveStartTag);
}

/// Full speculative sub-traversal of one fragment element.
fn speculative_fire_element(
    walker: &mut GrammarWalker,
    doc: &Document,
    element: NodeId,
    owner: Option<NodeId>,
    index: usize,
    findings: &mut Vec<ErrorRecord>,
) {
    let mut capture = |result: FireResult, node: Option<NodeId>, index: Option<usize>, findings: &mut Vec<ErrorRecord>| {
        if let FireResult::Errors(errors) = result {
            for error in errors {
                findings.push(ErrorRecord { error, node, index });
            }
        }
    };

    if let Some(mapping) = doc.namespace_mapping(element) {
        walker.enter_context_with_mapping(mapping);
    }
    let name = doc.name(element).expect("element node has a name").clone();
    let expanded = name.expanded();
    let r = walker.fire_event(&ValidationEvent::EnterStartTag {
        ns: &expanded.uri,
        name: &expanded.local_name,
    });
    capture(r, owner, Some(index), findings);

    for attr in doc.attributes(element) {
        if attr.is_namespace_declaration() {
            continue;
        }
        let resolved = match &attr.prefix {
            Some(prefix) => {
                let lexical = format!("{prefix}:{}", attr.local_name);
                match walker.resolve_name(&lexical, true) {
                    Some(n) => n,
                    None => continue,
                }
            }
            None => ExpandedName::new("", &attr.local_name),
        };
        let r = walker.fire_event(&ValidationEvent::AttributeName {
            ns: &resolved.uri,
            name: &resolved.local_name,
        });
        capture(r, Some(element), None, findings);
        let r = walker.fire_event(&ValidationEvent::AttributeValue { value: &attr.value });
        capture(r, Some(element), None, findings);
    }
    let r = walker.fire_event(&ValidationEvent::LeaveStartTag);
    capture(r, Some(element), None, findings);

    for (position, &child) in doc.children(element).to_vec().iter().enumerate() {
        match doc.kind(child) {
            NodeKind::Element => {
                speculative_fire_element(walker, doc, child, Some(element), position, findings);
            }
            NodeKind::Text => {
                let text = doc.text(child).expect("text node has content");
                let r = walker.fire_event(&ValidationEvent::Text { text });
                capture(r, Some(element), Some(position), findings);
            }
            _ => {}
        }
    }

    let r = walker.fire_event(&ValidationEvent::EndTag {
        ns: &expanded.uri,
        name: &expanded.local_name,
    });
    capture(r, Some(element), Some(doc.children(element).len()), findings);
    if doc.namespace_mapping(element).is_some() {
        walker.leave_context();
    }
}
