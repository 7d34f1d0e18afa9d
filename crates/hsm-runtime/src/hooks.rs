use hsm_value::MachineId;

use crate::error::RuntimeError;

/// A single point in the dispatch loop worth reporting to a host: enqueue,
/// dequeue, entry, exit, raise, push, pop, action, halt, unhandled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStep {
    Enqueue,
    Dequeue,
    Entry,
    Exit,
    Raise,
    Push,
    Pop,
    Action,
    Halt,
    Unhandled,
}

impl DispatchStep {
    fn name(self) -> &'static str {
        match self {
            DispatchStep::Enqueue => "enqueue",
            DispatchStep::Dequeue => "dequeue",
            DispatchStep::Entry => "entry",
            DispatchStep::Exit => "exit",
            DispatchStep::Raise => "raise",
            DispatchStep::Push => "push",
            DispatchStep::Pop => "pop",
            DispatchStep::Action => "action",
            DispatchStep::Halt => "halt",
            DispatchStep::Unhandled => "unhandled",
        }
    }
}

/// Host-installed observer pair, equivalent to the `errorHandler`/`logHandler`
/// function pointers a C embedder installs on a process. Both methods default
/// to no-ops so embedders only implement what they care about; `tracing`
/// events are emitted by the executor through [`log_step`]/[`log_error`]
/// regardless of whether hooks are installed.
pub trait ExecutorHooks: Send + Sync {
    /// Invoked whenever a fallible operation fails. Returning is always
    /// "discard and continue" where the error permits it; hooks cannot
    /// veto a halt that the error classifies as fatal.
    fn on_error(&self, _error: &RuntimeError) {}

    /// Invoked at each significant dispatch step for the given machine.
    fn on_log(&self, _machine: MachineId, _step: DispatchStep) {}
}

/// The default hook set: observes nothing. Used when a [`crate::Process`] is
/// built without an explicit `ExecutorHooks` implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl ExecutorHooks for NoopHooks {}

/// Notifies `hooks` and emits the matching `tracing` event, at a severity
/// scaled to how often the step fires: enqueue/dequeue at `trace`, the rest
/// of the dispatch steps at `debug`, halts at `warn`.
pub(crate) fn log_step(hooks: &dyn ExecutorHooks, machine: MachineId, step: DispatchStep) {
    hooks.on_log(machine, step);
    let name = step.name();
    match step {
        DispatchStep::Enqueue | DispatchStep::Dequeue => {
            tracing::trace!(machine = machine.0, step = name, "dispatch step")
        }
        DispatchStep::Halt | DispatchStep::Unhandled => {
            tracing::warn!(machine = machine.0, step = name, "dispatch step")
        }
        _ => tracing::debug!(machine = machine.0, step = name, "dispatch step"),
    }
}

/// Notifies `hooks` and emits a `tracing` error event for a failed operation.
pub(crate) fn log_error(hooks: &dyn ExecutorHooks, error: &RuntimeError) {
    hooks.on_error(error);
    tracing::error!(machine = error.machine_id().0, %error, "dispatch error");
}
