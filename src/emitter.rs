//! Name-keyed event subscription with snapshot dispatch.
//!
//! The validator talks to its observers through four named events; listeners
//! subscribe per name or through a single wildcard subscription that
//! receives every event. Die Listener-Liste wird beim Dispatch
//! geschnappschossen: ein Listener, der waehrend des Dispatch Listener
//! hinzufuegt, liefert das laufende Event nicht an die neuen; ein Listener,
//! der sich selbst entfernt, wird fuer das laufende Event nicht mehr
//! gerufen. Returning [`Dispatch::Halt`] stops later listeners for the
//! current dispatch only.

use core::cell::{Cell, RefCell};
use core::fmt;
use std::rc::Rc;

use crate::FastIndexMap;
use crate::dom::NodeId;
use crate::validator::{ErrorRecord, WorkingStateSnapshot};

/// The four observer event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    /// A validation finding was recorded.
    Error,
    /// Findings at or after an event index were dropped by a reset.
    ResetErrors,
    /// Working state or progress changed.
    StateUpdate,
    /// A node's wildcard-admission flag changed.
    PossibleDueToWildcardChange,
}

impl EventName {
    /// The wire name of the event.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::ResetErrors => "reset-errors",
            Self::StateUpdate => "state-update",
            Self::PossibleDueToWildcardChange => "possible-due-to-wildcard-change",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observer notification, tagged by name.
#[derive(Debug, Clone)]
pub enum ValidatorEvent {
    /// `error`: a finding with its owner.
    Error(ErrorRecord),
    /// `reset-errors`: findings from `at` onwards were dropped.
    ResetErrors {
        /// First invalidated event index.
        at: u64,
    },
    /// `state-update`: current state and progress.
    StateUpdate(WorkingStateSnapshot),
    /// `possible-due-to-wildcard-change`: the affected node.
    PossibleDueToWildcardChange(NodeId),
}

impl ValidatorEvent {
    /// The name this event dispatches under.
    pub fn name(&self) -> EventName {
        match self {
            Self::Error(_) => EventName::Error,
            Self::ResetErrors { .. } => EventName::ResetErrors,
            Self::StateUpdate(_) => EventName::StateUpdate,
            Self::PossibleDueToWildcardChange(_) => EventName::PossibleDueToWildcardChange,
        }
    }
}

/// Listener verdict: keep dispatching or halt this dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Later listeners still run.
    Continue,
    /// Later listeners are skipped for this event only.
    Halt,
}

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerFn = Rc<RefCell<dyn FnMut(&ValidatorEvent) -> Dispatch>>;

struct Entry {
    /// `None` abonniert alle Events (Wildcard).
    name: Option<EventName>,
    listener: ListenerFn,
    once: bool,
}

/// The subscription registry.
#[derive(Default)]
pub struct Emitter {
    next_id: Cell<u64>,
    entries: RefCell<FastIndexMap<u64, Entry>>,
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.entries.borrow().len())
            .finish()
    }
}

impl Emitter {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, name: Option<EventName>, listener: ListenerFn, once: bool) -> ListenerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.entries.borrow_mut().insert(id, Entry { name, listener, once });
        ListenerId(id)
    }

    /// Subscribes to one event name.
    pub fn add(
        &self,
        name: EventName,
        listener: impl FnMut(&ValidatorEvent) -> Dispatch + 'static,
    ) -> ListenerId {
        self.insert(Some(name), Rc::new(RefCell::new(listener)), false)
    }

    /// Subscribes to every event (`*`).
    pub fn add_any(
        &self,
        listener: impl FnMut(&ValidatorEvent) -> Dispatch + 'static,
    ) -> ListenerId {
        self.insert(None, Rc::new(RefCell::new(listener)), false)
    }

    /// Subscribes for exactly one delivery.
    pub fn add_once(
        &self,
        name: EventName,
        listener: impl FnMut(&ValidatorEvent) -> Dispatch + 'static,
    ) -> ListenerId {
        self.insert(Some(name), Rc::new(RefCell::new(listener)), true)
    }

    /// Removes a listener. Returns whether it was still registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        self.entries.borrow_mut().shift_remove(&id.0).is_some()
    }

    /// Dispatches one event to the matching listeners.
    pub fn emit(&self, event: &ValidatorEvent) {
        let name = event.name();
        // Schnappschuss: Mutationen der Liste waehrend des Dispatch wirken
        // erst auf das naechste Event.
        let snapshot: Vec<(u64, ListenerFn, bool)> = self
            .entries
            .borrow()
            .iter()
            .filter(|(_, e)| e.name.is_none() || e.name == Some(name))
            .map(|(&id, e)| (id, Rc::clone(&e.listener), e.once))
            .collect();
        for (id, listener, once) in snapshot {
            // Selbst-Entfernung waehrend des Dispatch respektieren.
            if !self.entries.borrow().contains_key(&id) {
                continue;
            }
            if once {
                self.entries.borrow_mut().shift_remove(&id);
            }
            let verdict = (&mut *listener.borrow_mut())(event);
            if verdict == Dispatch::Halt {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::WorkingState;

    fn state_event() -> ValidatorEvent {
        ValidatorEvent::StateUpdate(WorkingStateSnapshot {
            state: WorkingState::Working,
            part_done: 0.5,
        })
    }

    fn reset_event(at: u64) -> ValidatorEvent {
        ValidatorEvent::ResetErrors { at }
    }

    #[test]
    fn benannte_und_wildcard_zustellung() {
        let em = Emitter::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s = Rc::clone(&seen);
        em.add(EventName::StateUpdate, move |e| {
            s.borrow_mut().push(format!("named:{}", e.name()));
            Dispatch::Continue
        });
        let s = Rc::clone(&seen);
        em.add_any(move |e| {
            s.borrow_mut().push(format!("any:{}", e.name()));
            Dispatch::Continue
        });

        em.emit(&state_event());
        em.emit(&reset_event(3));

        assert_eq!(
            *seen.borrow(),
            vec!["named:state-update", "any:state-update", "any:reset-errors"]
        );
    }

    #[test]
    fn halt_stoppt_nur_diesen_dispatch() {
        let em = Emitter::new();
        let count = Rc::new(Cell::new(0u32));

        em.add(EventName::StateUpdate, |_| Dispatch::Halt);
        let c = Rc::clone(&count);
        em.add(EventName::StateUpdate, move |_| {
            c.set(c.get() + 1);
            Dispatch::Continue
        });

        em.emit(&state_event());
        assert_eq!(count.get(), 0);
        em.emit(&state_event());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn once_wird_genau_einmal_gerufen() {
        let em = Emitter::new();
        let count = Rc::new(Cell::new(0u32));
        let c = Rc::clone(&count);
        em.add_once(EventName::StateUpdate, move |_| {
            c.set(c.get() + 1);
            Dispatch::Continue
        });

        em.emit(&state_event());
        em.emit(&state_event());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn hinzufuegen_waehrend_dispatch_sieht_laufendes_event_nicht() {
        let em = Rc::new(Emitter::new());
        let count = Rc::new(Cell::new(0u32));

        let em2 = Rc::clone(&em);
        let c = Rc::clone(&count);
        em.add(EventName::StateUpdate, move |_| {
            let c = Rc::clone(&c);
            em2.add(EventName::StateUpdate, move |_| {
                c.set(c.get() + 1);
                Dispatch::Continue
            });
            Dispatch::Continue
        });

        em.emit(&state_event());
        assert_eq!(count.get(), 0, "new listener must not see the current event");
        em.emit(&state_event());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn selbst_entfernung_waehrend_dispatch() {
        let em = Rc::new(Emitter::new());
        let removed_calls = Rc::new(Cell::new(0u32));

        // Erster Listener entfernt den zweiten, bevor dieser drankommt.
        let target: Rc<Cell<Option<ListenerId>>> = Rc::new(Cell::new(None));
        let em2 = Rc::clone(&em);
        let t = Rc::clone(&target);
        em.add(EventName::StateUpdate, move |_| {
            if let Some(id) = t.get() {
                em2.remove(id);
            }
            Dispatch::Continue
        });
        let c = Rc::clone(&removed_calls);
        let id = em.add(EventName::StateUpdate, move |_| {
            c.set(c.get() + 1);
            Dispatch::Continue
        });
        target.set(Some(id));

        em.emit(&state_event());
        assert_eq!(removed_calls.get(), 0);
    }

    #[test]
    fn remove_meldet_status() {
        let em = Emitter::new();
        let id = em.add(EventName::Error, |_| Dispatch::Continue);
        assert!(em.remove(id));
        assert!(!em.remove(id));
    }
}
