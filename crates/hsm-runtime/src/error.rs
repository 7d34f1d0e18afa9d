use hsm_value::{EventId, MachineId};
use thiserror::Error;

/// Result type for executor operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors surfaced by the executor. All of them are reported to a host's
/// [`crate::hooks::ExecutorHooks::on_error`] in addition to being returned
/// here, so embedders can observe failures either way.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("machine {0:?} has no transition, action, or deferral for event {1:?}")]
    UnhandledEvent(MachineId, EventId),

    #[error("event {1:?} exceeded its max-instances bound on machine {0:?}")]
    QueueOverflow(MachineId, EventId),

    #[error("machine {0:?} push exceeded the maximum state stack depth")]
    StackOverflow(MachineId),

    #[error("allocation failure while growing {1} for machine {0:?}")]
    AllocationFailure(MachineId, &'static str),

    #[error("machine {0:?} popped with no enclosing state to return to")]
    InvalidPop(MachineId),

    #[error("no machine is registered under id {0:?}")]
    MachineNotFound(MachineId),

    #[error("machine {0:?} is already halted")]
    AlreadyHalted(MachineId),

    #[error("handler for machine {0:?} panicked: {1}")]
    HandlerPanicked(MachineId, String),

    #[error("cannot send reserved or out-of-range event {1:?} to machine {0:?}")]
    InvalidEvent(MachineId, EventId),
}

impl RuntimeError {
    /// The machine the error pertains to, when one is known.
    pub fn machine_id(&self) -> MachineId {
        match self {
            RuntimeError::UnhandledEvent(id, _)
            | RuntimeError::QueueOverflow(id, _)
            | RuntimeError::StackOverflow(id)
            | RuntimeError::AllocationFailure(id, _)
            | RuntimeError::InvalidPop(id)
            | RuntimeError::MachineNotFound(id)
            | RuntimeError::AlreadyHalted(id)
            | RuntimeError::HandlerPanicked(id, _)
            | RuntimeError::InvalidEvent(id, _) => *id,
        }
    }

    /// Whether this error is fatal to the owning machine (it halts) as
    /// opposed to recoverable-and-discard (the event is dropped and the
    /// machine continues running).
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RuntimeError::UnhandledEvent(..) | RuntimeError::QueueOverflow(..)
        )
    }
}
