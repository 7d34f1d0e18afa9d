//! Dynamic payload values exchanged between machines.
//!
//! The executor treats payloads as an opaque, cloneable, typed value domain: it
//! never inspects a payload beyond cloning it (for re-delivery across a
//! push/pop) or reading its [`ValueType`] tag for diagnostics. Embedders that
//! need a richer value domain can swap this crate out for their own as long as
//! it satisfies [`Payload`].

use std::fmt;
use std::sync::Arc;

/// Marker bound satisfied by anything that can travel through a machine's
/// event queue: cheap to clone, debug-printable for logging, safe to move
/// across threads on a cross-machine send, and constructible without an
/// event (the payload the executor attaches to a default/null trigger it
/// fires itself in `DequeuePhase`).
pub trait Payload: Clone + fmt::Debug + Default + Send + Sync + 'static {}

impl<T> Payload for T where T: Clone + fmt::Debug + Default + Send + Sync + 'static {}

/// Stable index into the program's event declaration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub u32);

impl EventId {
    /// Reserved event used as the default/null trigger in `DequeuePhase`.
    pub const NULL: EventId = EventId(0);
    /// Reserved event that unconditionally halts a machine.
    pub const HALT: EventId = EventId(1);

    pub fn is_reserved(self) -> bool {
        self == Self::NULL || self == Self::HALT
    }
}

/// Identity of a machine within its owning process. Opaque outside of the
/// registry that minted it; never dereferenced directly by user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MachineId(pub u64);

/// Coarse type tag for a [`Value`], used for diagnostics and the "read-type"
/// slice of the value ADT's interface. Not used for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Unit,
    Bool,
    Int,
    Str,
    MachineId,
    Event,
}

/// The dynamic value domain. `Clone` is cheap: scalars copy, `Str` bumps an
/// `Arc` refcount. There is no explicit "free" function; dropping a `Value`
/// releases whatever it owns, which is the Rust rendition of the ADT's
/// construct/clone/free/read-type interface.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    MachineId(MachineId),
    Event(EventId),
}

impl Value {
    /// Constructs a value from an event id, the one conversion the executor
    /// itself performs (re-raising a trigger as its own payload).
    pub fn from_event(event: EventId) -> Self {
        Value::Event(event)
    }

    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Value::Str(s.into())
    }

    /// Reads the coarse type tag without consuming the value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Unit => ValueType::Unit,
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Str(_) => ValueType::Str,
            Value::MachineId(_) => ValueType::MachineId,
            Value::Event(_) => ValueType::Event,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Unit
    }
}
