//! Per-machine mutable state: the event queue, the push-down state stack
//! with its inherited handler sets, and the dispatch-phase bookkeeping the
//! executor's drive loop reads after every handler invocation.

use hsm_value::{EventId, MachineId, Payload};

use crate::error::{RuntimeError, RuntimeResult};
use crate::event_set::EventSet;
use crate::process::Process;
use crate::program::{MachineDeclIndex, StateDecl, StateIndex};

/// Which of the three dispatch phases the drive loop is about to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Entry,
    Action,
    Dequeue,
}

/// What the handler that just returned asked the drive loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LastOperation {
    #[default]
    Return,
    Raise,
    Push,
    Pop,
}

/// One frame of the push-down state stack.
struct Frame<P: Payload> {
    state: StateIndex,
    /// The event that triggered the push into this frame; re-delivered to
    /// the restored parent's `ActionPhase` when this frame pops.
    curr_event: (EventId, P),
    inherited_deferred: EventSet,
    inherited_actions: EventSet,
}

/// The execution half of one machine's state: the push-down stack and
/// dispatch bookkeeping. The mailbox (queue, running/halted flags) lives
/// separately in [`crate::process::Mailbox`] and is locked independently.
/// See the module docs on `process` for why the split exists.
pub struct MachineContext<P: Payload> {
    pub(crate) id: MachineId,
    pub(crate) decl_index: MachineDeclIndex,
    num_events: u32,
    vars: Vec<P>,
    phase: DispatchPhase,
    current_event: (EventId, P),
    last_operation: LastOperation,
    pending_push_target: Option<StateIndex>,
    stack: Vec<Frame<P>>,
    current_deferred: EventSet,
    current_actions: EventSet,
}

impl<P: Payload> MachineContext<P> {
    pub(crate) fn new(
        id: MachineId,
        decl_index: MachineDeclIndex,
        num_vars: usize,
        num_events: u32,
        init_state: StateIndex,
        constructor_payload: P,
    ) -> Self {
        let vars = (0..num_vars).map(|_| constructor_payload.clone()).collect();
        let top = Frame {
            state: init_state,
            curr_event: (EventId::NULL, constructor_payload.clone()),
            inherited_deferred: EventSet::empty(num_events),
            inherited_actions: EventSet::empty(num_events),
        };
        Self {
            id,
            decl_index,
            num_events,
            vars,
            phase: DispatchPhase::Entry,
            current_event: (EventId::NULL, constructor_payload),
            last_operation: LastOperation::Return,
            pending_push_target: None,
            stack: vec![top],
            current_deferred: EventSet::empty(num_events),
            current_actions: EventSet::empty(num_events),
        }
    }

    pub fn id(&self) -> MachineId {
        self.id
    }

    /// Clears the stack, the terminal state recorded by the executor when a
    /// machine's last frame pops.
    pub(crate) fn clear_stack(&mut self) {
        self.stack.clear();
    }

    pub fn current_state(&self) -> StateIndex {
        self.stack
            .last()
            .expect("stack is never empty while live")
            .state
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn phase(&self) -> DispatchPhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: DispatchPhase) {
        self.phase = phase;
    }

    pub fn current_deferred_set(&self) -> &EventSet {
        &self.current_deferred
    }

    pub fn current_actions_set(&self) -> &EventSet {
        &self.current_actions
    }

    pub(crate) fn current_event(&self) -> &(EventId, P) {
        &self.current_event
    }

    pub(crate) fn set_current_event(&mut self, event: EventId, payload: P) {
        self.current_event = (event, payload);
    }

    pub(crate) fn last_operation(&self) -> LastOperation {
        self.last_operation
    }

    pub(crate) fn clear_last_operation(&mut self) {
        self.last_operation = LastOperation::Return;
    }

    pub(crate) fn take_pending_push_target(&mut self) -> Option<StateIndex> {
        self.pending_push_target.take()
    }

    /// Recomputes `current_deferred`/`current_actions` for the current top
    /// frame from its inherited sets and `state_decl`'s own sets.
    /// Transitions always win over inherited actions.
    pub(crate) fn recompute_current_sets(&mut self, state_decl: &StateDecl<P>) {
        let top = self.stack.last().expect("stack is never empty while live");
        let mut deferred = EventSet::empty(self.num_events);
        EventSet::union_into(
            &mut deferred,
            &top.inherited_deferred,
            state_decl.deferred_set(),
        );

        let mut actions_with_inherited = EventSet::empty(self.num_events);
        EventSet::union_into(
            &mut actions_with_inherited,
            &top.inherited_actions,
            state_decl.own_actions_set(),
        );
        let mut actions = EventSet::empty(self.num_events);
        EventSet::difference_into(
            &mut actions,
            &actions_with_inherited,
            state_decl.own_transitions_set(),
        );

        self.current_deferred = deferred;
        self.current_actions = actions;
    }

    /// Replaces the top frame's state in place (a `goto` transition). The
    /// frame is not popped or pushed; only the state index and the derived
    /// sets change.
    pub(crate) fn goto(&mut self, target: StateIndex) {
        self.stack
            .last_mut()
            .expect("stack is never empty while live")
            .state = target;
    }

    /// Extends the stack with a new frame for `target`, snapshotting the
    /// current sets as the new frame's inherited sets. Fails with
    /// `StackOverflow` at the configured depth limit.
    pub(crate) fn push_frame(
        &mut self,
        target: StateIndex,
        triggering_event: (EventId, P),
        max_depth: usize,
    ) -> RuntimeResult<()> {
        if self.stack.len() >= max_depth {
            return Err(RuntimeError::StackOverflow(self.id));
        }
        self.stack.push(Frame {
            state: target,
            curr_event: triggering_event,
            inherited_deferred: self.current_deferred.deep_clone(),
            inherited_actions: self.current_actions.deep_clone(),
        });
        Ok(())
    }

    /// Pops the top frame and returns its `curr_event`, the event that
    /// triggered the push into it, to re-deliver to the restored parent's
    /// `ActionPhase`. Returns `None` if the stack is now empty (the machine
    /// should halt).
    pub(crate) fn pop_frame(&mut self) -> Option<(EventId, P)> {
        let popped = self.stack.pop().expect("pop_frame called on empty stack");
        if self.stack.is_empty() {
            None
        } else {
            Some(popped.curr_event)
        }
    }

    /// Walks the stack from the top down for the nearest frame whose state
    /// declares an action for `event`, per "transitions override inherited
    /// actions, actions are resolved by the installing ancestor". Falls
    /// back to each frame's default (`EventId::NULL`) action if it has no
    /// handler for the specific event.
    pub(crate) fn resolve_action(
        &self,
        program_states: &[StateDecl<P>],
        event: EventId,
    ) -> Option<crate::program::HandlerFn<P>> {
        self.stack.iter().rev().find_map(|frame| {
            let state = &program_states[frame.state.0 as usize];
            state
                .own_action_for(event)
                .or_else(|| state.own_action_for(EventId::NULL))
        })
    }

    /// Walks the stack from the top down for the nearest frame declaring a
    /// transition on `event`, falling back to that frame's default
    /// (`EventId::NULL`) transition. Transitions are looked up the same way
    /// as actions so a pushed child state inherits its ancestors' handling of
    /// an event it does not itself override.
    pub(crate) fn resolve_transition<'p>(
        &self,
        program_states: &'p [StateDecl<P>],
        event: EventId,
    ) -> Option<&'p crate::program::TransitionDecl<P>> {
        self.stack.iter().rev().find_map(|frame| {
            let state = &program_states[frame.state.0 as usize];
            state
                .transition_for(event)
                .or_else(|| state.transition_for(EventId::NULL))
        })
    }
}

/// The handler-facing view of a machine: what entry/exit/action/transition
/// functions are allowed to touch. A narrow, borrowed capability object
/// rather than the full execution context.
pub struct MachineCx<'a, P: Payload> {
    ctx: &'a mut MachineContext<P>,
    process: &'a Process<P>,
}

impl<'a, P: Payload> MachineCx<'a, P> {
    pub(crate) fn new(ctx: &'a mut MachineContext<P>, process: &'a Process<P>) -> Self {
        Self { ctx, process }
    }

    pub fn self_id(&self) -> MachineId {
        self.ctx.id
    }

    pub fn var(&self, index: usize) -> &P {
        &self.ctx.vars[index]
    }

    pub fn set_var(&mut self, index: usize, value: P) {
        self.ctx.vars[index] = value;
    }

    /// Raises `event` on this machine. Preempts the queue: it is handled in
    /// `ActionPhase` before the next dequeue, not appended to the mailbox.
    pub fn raise(&mut self, event: EventId, payload: P) {
        self.ctx.set_current_event(event, payload);
        self.ctx.last_operation = LastOperation::Raise;
    }

    /// Requests a push to `target` once the running handler returns.
    pub fn push(&mut self, target: StateIndex) {
        self.ctx.pending_push_target = Some(target);
        self.ctx.last_operation = LastOperation::Push;
    }

    /// Requests a pop once the running handler returns. Fails if the stack
    /// only has the entry frame (nothing to return to).
    pub fn pop(&mut self) -> RuntimeResult<()> {
        if self.ctx.stack.len() <= 1 {
            return Err(RuntimeError::InvalidPop(self.ctx.id));
        }
        self.ctx.last_operation = LastOperation::Pop;
        Ok(())
    }

    /// Sends `event` to `target`, driving it to quiescence on this thread if
    /// it was idle.
    pub fn send(&self, target: MachineId, event: EventId, payload: P) -> RuntimeResult<()> {
        self.process.send(target, event, payload)
    }
}
