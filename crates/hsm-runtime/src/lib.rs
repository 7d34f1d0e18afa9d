#![forbid(unsafe_code)]

//! A runtime for communicating hierarchical state machines.
//!
//! A [`Program`] compiles down to a table of machines, states, and events.
//! A [`Process`] instantiates machines from that table and drives them: each
//! machine owns a push-down stack of active states (entry/exit/action
//! functions, deferred events, transitions) and a FIFO mailbox. Sending an
//! event to an idle machine drives it to quiescence synchronously, on the
//! caller's thread, including recursively, when a handler sends to another
//! machine that sends back. No thread is ever spawned by this crate.

mod config;
mod context;
mod error;
mod event_queue;
mod event_set;
mod executor;
mod hooks;
mod process;
mod program;

pub use config::RuntimeLimits;
pub use context::{DispatchPhase, LastOperation, MachineCx};
pub use error::{RuntimeError, RuntimeResult};
pub use event_set::EventSet;
pub use hooks::{DispatchStep, ExecutorHooks, NoopHooks};
pub use process::Process;
pub use program::{
    ActionDecl, EventDecl, HandlerFn, MachineDecl, MachineDeclIndex, Program, StateDecl,
    StateIndex, TransitionDecl, TransitionKind,
};

#[cfg(test)]
mod tests;
