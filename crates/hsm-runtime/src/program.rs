//! The compiled program description: machines, states, events, and the
//! function pointers a front-end compiler would have resolved ahead of time.
//! Treated as an immutable input by the executor. Nothing here is mutated
//! after a [`Program`] is built.

use hsm_value::{EventId, Payload};

use crate::error::RuntimeResult;
use crate::event_set::EventSet;

/// Index into a [`Program`]'s machine declaration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MachineDeclIndex(pub u32);

/// Index into a [`MachineDecl`]'s state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateIndex(pub u32);

/// Whether a transition suspends the current state (push) or leaves it
/// (goto).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Goto,
    Push,
}

/// Declared payload type and queueing bound for one event in the event
/// space.
#[derive(Debug, Clone)]
pub struct EventDecl {
    pub name: &'static str,
    /// 0 means unbounded.
    pub max_instances: u32,
}

impl EventDecl {
    pub fn unbounded(name: &'static str) -> Self {
        Self {
            name,
            max_instances: 0,
        }
    }

    pub fn bounded(name: &'static str, max_instances: u32) -> Self {
        Self {
            name,
            max_instances,
        }
    }
}

/// An entry, exit, action, or transition function: runs with exclusive access
/// to the machine and the payload that triggered it. Returns `Err` only for
/// `InvalidPop` (raised by [`crate::context::MachineCx::pop`]); any other
/// error the executor detects is classified after the handler returns, from
/// `last_operation` and the stack state, not from this return value.
pub type HandlerFn<P> = fn(&mut crate::context::MachineCx<P>, P) -> RuntimeResult<()>;

/// `HandlerFn<P>` is a bare function pointer, so this struct is `Copy`
/// regardless of whether `P` itself is, but a derived `Copy` would add a
/// spurious `P: Copy` bound, so the impls are written by hand.
pub struct ActionDecl<P: Payload> {
    pub event: EventId,
    pub handler: HandlerFn<P>,
}

impl<P: Payload> Clone for ActionDecl<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Payload> Copy for ActionDecl<P> {}

/// See [`ActionDecl`] on why `Copy`/`Clone` are implemented by hand.
pub struct TransitionDecl<P: Payload> {
    pub event: EventId,
    pub target: StateIndex,
    pub kind: TransitionKind,
    pub handler: Option<HandlerFn<P>>,
}

impl<P: Payload> Clone for TransitionDecl<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Payload> Copy for TransitionDecl<P> {}

/// One state in a machine's push-down hierarchy.
pub struct StateDecl<P: Payload> {
    pub name: &'static str,
    entry: Option<HandlerFn<P>>,
    exit: Option<HandlerFn<P>>,
    deferred: EventSet,
    actions: Vec<ActionDecl<P>>,
    actions_set: EventSet,
    transitions: Vec<TransitionDecl<P>>,
    transitions_set: EventSet,
    pub has_default_transition: bool,
    pub has_default_action: bool,
}

impl<P: Payload> StateDecl<P> {
    pub fn new(
        name: &'static str,
        num_events: u32,
        deferred: impl IntoIterator<Item = u32>,
        actions: Vec<ActionDecl<P>>,
        transitions: Vec<TransitionDecl<P>>,
    ) -> Self {
        let deferred_set = EventSet::from_events(num_events, deferred);
        let actions_set = EventSet::from_events(num_events, actions.iter().map(|a| a.event.0));
        let transitions_set =
            EventSet::from_events(num_events, transitions.iter().map(|t| t.event.0));
        let has_default_transition = transitions.iter().any(|t| t.event == EventId::NULL);
        let has_default_action = actions.iter().any(|a| a.event == EventId::NULL);
        Self {
            name,
            entry: None,
            exit: None,
            deferred: deferred_set,
            actions,
            actions_set,
            transitions,
            transitions_set,
            has_default_transition,
            has_default_action,
        }
    }

    pub fn with_entry(mut self, f: HandlerFn<P>) -> Self {
        self.entry = Some(f);
        self
    }

    pub fn with_exit(mut self, f: HandlerFn<P>) -> Self {
        self.exit = Some(f);
        self
    }

    pub fn entry(&self) -> Option<HandlerFn<P>> {
        self.entry
    }

    pub fn exit(&self) -> Option<HandlerFn<P>> {
        self.exit
    }

    pub fn deferred_set(&self) -> &EventSet {
        &self.deferred
    }

    /// The events this state installs a `do`-action for, *not* including
    /// anything inherited from an enclosing state.
    pub fn own_actions_set(&self) -> &EventSet {
        &self.actions_set
    }

    /// The events this state transitions on. Used to subtract out of an
    /// inherited actions set so "transitions override inherited actions"
    /// holds.
    pub fn own_transitions_set(&self) -> &EventSet {
        &self.transitions_set
    }

    pub fn transition_for(&self, event: EventId) -> Option<&TransitionDecl<P>> {
        self.transitions.iter().find(|t| t.event == event)
    }

    /// Looks up this state's own `do`-handler, ignoring inheritance. The
    /// caller walks the stack itself to find the nearest installing
    /// ancestor (see `ActionPhase` in the executor).
    pub fn own_action_for(&self, event: EventId) -> Option<HandlerFn<P>> {
        self.actions
            .iter()
            .find(|a| a.event == event)
            .map(|a| a.handler)
    }
}

/// One machine declaration: its variable layout, state list, and entry
/// point.
pub struct MachineDecl<P: Payload> {
    pub name: &'static str,
    pub num_vars: usize,
    pub init_state: StateIndex,
    pub states: Vec<StateDecl<P>>,
}

impl<P: Payload> MachineDecl<P> {
    pub fn state(&self, index: StateIndex) -> &StateDecl<P> {
        &self.states[index.0 as usize]
    }
}

/// The whole compiled program: every machine and event declaration in the
/// process.
pub struct Program<P: Payload> {
    pub events: Vec<EventDecl>,
    pub machines: Vec<MachineDecl<P>>,
}

impl<P: Payload> Program<P> {
    pub fn num_events(&self) -> u32 {
        self.events.len() as u32
    }

    pub fn event(&self, id: EventId) -> &EventDecl {
        &self.events[id.0 as usize]
    }

    pub fn machine(&self, index: MachineDeclIndex) -> &MachineDecl<P> {
        &self.machines[index.0 as usize]
    }
}
