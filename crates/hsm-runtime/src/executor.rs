//! The drive loop: `EntryPhase` → `ActionPhase` → `DequeuePhase`, repeated
//! until the machine's queue has nothing deliverable and its current state
//! offers no default handler to fall back on.
//!
//! Entered from [`crate::process::Process::create_machine`] (to run the
//! initial state's entry) and from [`crate::process::Process::send`] when a
//! send wakes an idle machine. Holds the machine's `exec` lock for its entire
//! run; see the `process` module docs for why a reentrant send never needs
//! to re-enter it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use hsm_value::{EventId, Payload};

use crate::context::{DispatchPhase, LastOperation, MachineCx, MachineContext};
use crate::error::{RuntimeError, RuntimeResult};
use crate::hooks::{self, DispatchStep, ExecutorHooks};
use crate::process::{Machine, Process};
use crate::program::{HandlerFn, StateDecl, TransitionKind};

/// What the current phase handler wants the drive loop to do next.
enum Step {
    Continue,
    /// The queue had nothing deliverable and the state has no default
    /// handler: the machine goes back to sleep, still alive.
    Idle,
    /// The state stack emptied (or the reserved halt event fired): the
    /// machine is done for good.
    Halted,
}

pub(crate) fn drive<P: Payload>(machine: &Arc<Machine<P>>, process: &Process<P>) -> RuntimeResult<()> {
    let hooks = process.hooks();
    let mut exec = machine.lock_exec();
    let span = tracing::debug_span!("machine", id = exec.id().0);
    let _entered = span.enter();

    loop {
        let states = &process.program().machine(exec.decl_index).states;
        let outcome = match exec.phase() {
            DispatchPhase::Entry => run_entry(&mut exec, states, process, hooks),
            DispatchPhase::Action => run_action(&mut exec, states, process, hooks),
            DispatchPhase::Dequeue => run_dequeue(&mut exec, states, machine, hooks),
        };
        match outcome {
            Ok(Step::Continue) => continue,
            Ok(Step::Idle) => return Ok(()),
            Ok(Step::Halted) => {
                halt(&mut exec, machine, hooks);
                return Ok(());
            }
            Err(error) => {
                hooks::log_error(hooks, &error);
                if error.is_fatal() {
                    halt(&mut exec, machine, hooks);
                    return Err(error);
                }
                // Recoverable: drop the offending event and keep driving.
                exec.clear_last_operation();
                exec.set_phase(DispatchPhase::Dequeue);
            }
        }
    }
}

fn run_entry<P: Payload>(
    exec: &mut MachineContext<P>,
    states: &[StateDecl<P>],
    process: &Process<P>,
    hooks: &dyn ExecutorHooks,
) -> RuntimeResult<Step> {
    let state = &states[exec.current_state().0 as usize];
    exec.recompute_current_sets(state);
    hooks::log_step(hooks, exec.id(), DispatchStep::Entry);
    match state.entry() {
        Some(entry) => run_handler_and_apply(exec, states, entry, process),
        None => {
            exec.set_phase(DispatchPhase::Dequeue);
            Ok(Step::Continue)
        }
    }
}

fn run_action<P: Payload>(
    exec: &mut MachineContext<P>,
    states: &[StateDecl<P>],
    process: &Process<P>,
    hooks: &dyn ExecutorHooks,
) -> RuntimeResult<Step> {
    let event = exec.current_event().0;

    if event == EventId::HALT {
        hooks::log_step(hooks, exec.id(), DispatchStep::Halt);
        return Ok(Step::Halted);
    }

    if let Some(transition) = exec.resolve_transition(states, event) {
        let kind = transition.kind;
        let target = transition.target;
        let handler = transition.handler;
        hooks::log_step(hooks, exec.id(), DispatchStep::Action);

        if let Some(handler) = handler {
            // The transition's own `kind`/`target` decide control flow
            // unconditionally; any raise/push/pop the handler itself
            // requests is not honored.
            run_handler(exec, handler, process)?;
            exec.clear_last_operation();
        }

        match kind {
            TransitionKind::Goto => {
                let old_state = &states[exec.current_state().0 as usize];
                if let Some(exit) = old_state.exit() {
                    hooks::log_step(hooks, exec.id(), DispatchStep::Exit);
                    run_handler(exec, exit, process)?;
                    exec.clear_last_operation();
                }
                exec.goto(target);
            }
            TransitionKind::Push => {
                let triggering = exec.current_event().clone();
                let max_depth = process.limits().max_stack_depth();
                exec.push_frame(target, triggering, max_depth)?;
            }
        }
        exec.set_phase(DispatchPhase::Entry);
        return Ok(Step::Continue);
    }

    if let Some(handler) = exec.resolve_action(states, event) {
        hooks::log_step(hooks, exec.id(), DispatchStep::Action);
        return run_handler_and_apply(exec, states, handler, process);
    }

    Err(RuntimeError::UnhandledEvent(exec.id(), event))
}

fn run_dequeue<P: Payload>(
    exec: &mut MachineContext<P>,
    states: &[StateDecl<P>],
    machine: &Machine<P>,
    hooks: &dyn ExecutorHooks,
) -> RuntimeResult<Step> {
    let deferred = exec.current_deferred_set().clone();
    let popped = {
        let mut mailbox = machine.lock_mailbox();
        mailbox.queue.take_deliverable(&deferred)
    };
    match popped {
        Some((event, payload)) => {
            hooks::log_step(hooks, exec.id(), DispatchStep::Dequeue);
            exec.set_current_event(event, payload);
            exec.set_phase(DispatchPhase::Action);
            Ok(Step::Continue)
        }
        None => {
            let state = &states[exec.current_state().0 as usize];
            if state.has_default_transition || state.has_default_action {
                exec.set_current_event(EventId::NULL, P::default());
                exec.set_phase(DispatchPhase::Action);
                Ok(Step::Continue)
            } else {
                machine.mark_idle();
                Ok(Step::Idle)
            }
        }
    }
}

fn halt<P: Payload>(exec: &mut MachineContext<P>, machine: &Machine<P>, hooks: &dyn ExecutorHooks) {
    exec.clear_stack();
    machine.mark_halted();
    hooks::log_step(hooks, exec.id(), DispatchStep::Halt);
}

/// Runs `handler`, then applies `LastOperation` (raise/push/pop/return) to
/// decide the next phase. Shared by `EntryPhase` and the action branch of
/// `ActionPhase`, which both react to a handler's outward effects the same
/// way.
fn run_handler_and_apply<P: Payload>(
    exec: &mut MachineContext<P>,
    states: &[StateDecl<P>],
    handler: HandlerFn<P>,
    process: &Process<P>,
) -> RuntimeResult<Step> {
    run_handler(exec, handler, process)?;
    match exec.last_operation() {
        LastOperation::Return => {
            exec.clear_last_operation();
            exec.set_phase(DispatchPhase::Dequeue);
            Ok(Step::Continue)
        }
        LastOperation::Raise => {
            exec.clear_last_operation();
            exec.set_phase(DispatchPhase::Action);
            Ok(Step::Continue)
        }
        LastOperation::Push => {
            let target = exec
                .take_pending_push_target()
                .expect("Push always sets a pending target");
            let triggering = exec.current_event().clone();
            let max_depth = process.limits().max_stack_depth();
            exec.clear_last_operation();
            exec.push_frame(target, triggering, max_depth)?;
            exec.set_phase(DispatchPhase::Entry);
            Ok(Step::Continue)
        }
        LastOperation::Pop => {
            exec.clear_last_operation();
            match exec.pop_frame() {
                Some((event, payload)) => {
                    let state = &states[exec.current_state().0 as usize];
                    exec.recompute_current_sets(state);
                    exec.set_current_event(event, payload);
                    exec.set_phase(DispatchPhase::Action);
                    Ok(Step::Continue)
                }
                None => Ok(Step::Halted),
            }
        }
    }
}

/// Invokes `handler`, converting a panic into `HandlerPanicked` instead of
/// unwinding through the drive loop (which may span other machines' call
/// frames, on a cross-machine send).
fn run_handler<P: Payload>(
    exec: &mut MachineContext<P>,
    handler: HandlerFn<P>,
    process: &Process<P>,
) -> RuntimeResult<()> {
    let payload = exec.current_event().1.clone();
    let id = exec.id();
    let mut cx = MachineCx::new(exec, process);
    match catch_unwind(AssertUnwindSafe(|| handler(&mut cx, payload))) {
        Ok(inner) => inner,
        Err(panic) => Err(RuntimeError::HandlerPanicked(id, panic_message(panic))),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked with a non-string payload".to_string()
    }
}
