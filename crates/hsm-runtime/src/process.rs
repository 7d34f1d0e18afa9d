//! Machine registry and the per-machine lock that drives reentrant sends.
//!
//! A machine's entire state (queue, stack, variables) needs to behave as
//! if it sat behind a single recursive mutex: a handler may synchronously
//! drive a different machine on the same thread, and that machine may send
//! straight back to the original, which must enqueue rather than deadlock or
//! re-enter its own handler. A recursive mutex gets this for free in C
//! because the language has no aliasing rules to violate.
//!
//! Rust does. Reacquiring a lock around the same `RefCell`-style state from a
//! nested call on the same thread is exactly a double mutable borrow, even if
//! the mutex itself permits the reentry. So a machine's state here is split
//! in two instead of one recursively-locked blob: the [`Mailbox`] (queue plus
//! the running/halted flags) is locked only for the instant it takes to push
//! an event and check who should drive; the [`crate::context::MachineContext`]
//! (stack, variables, dispatch phase) is locked once per drive and held for
//! the loop's entire lifetime by whichever thread is driving. A nested
//! self-send only ever touches the mailbox, never the already-held exec lock,
//! so a plain `parking_lot::Mutex` is enough on both sides. No reentrancy is
//! ever attempted.
use std::collections::HashMap;
use std::sync::Arc;

use hsm_value::{EventId, MachineId, Payload};
use parking_lot::{Mutex, RwLock};

use crate::config::RuntimeLimits;
use crate::context::MachineContext;
use crate::error::{RuntimeError, RuntimeResult};
use crate::event_queue::EventQueue;
use crate::executor;
use crate::hooks::{self, DispatchStep, ExecutorHooks, NoopHooks};
use crate::program::{MachineDeclIndex, Program, StateIndex};

/// The queue and lifecycle flags for one machine, locked independently of its
/// execution state (see module docs).
pub(crate) struct Mailbox<P: Payload> {
    pub(crate) queue: EventQueue<P>,
    pub(crate) running: bool,
    pub(crate) halted: bool,
}

/// One registered machine: stable identity plus its two independently locked
/// halves.
pub(crate) struct Machine<P: Payload> {
    id: MachineId,
    mailbox: Mutex<Mailbox<P>>,
    exec: Mutex<MachineContext<P>>,
}

impl<P: Payload> Machine<P> {
    /// Enqueues `event` and reports whether this call is the one that should
    /// drive the machine (the mailbox was idle). Never blocks on `exec`.
    pub(crate) fn enqueue(
        &self,
        event: EventId,
        payload: P,
        max_instances: u32,
    ) -> RuntimeResult<bool> {
        let mut mailbox = self.mailbox.lock();
        if mailbox.halted {
            return Err(RuntimeError::AlreadyHalted(self.id));
        }
        mailbox
            .queue
            .enqueue(event, payload, max_instances)
            .map_err(|_| RuntimeError::QueueOverflow(self.id, event))?;
        if mailbox.running {
            Ok(false)
        } else {
            mailbox.running = true;
            Ok(true)
        }
    }

    pub(crate) fn lock_exec(&self) -> parking_lot::MutexGuard<'_, MachineContext<P>> {
        self.exec.lock()
    }

    pub(crate) fn lock_mailbox(&self) -> parking_lot::MutexGuard<'_, Mailbox<P>> {
        self.mailbox.lock()
    }

    /// Clears the queue and marks the machine halted. Called once by the
    /// drive loop when the state stack empties.
    pub(crate) fn mark_halted(&self) {
        let mut mailbox = self.mailbox.lock();
        mailbox.halted = true;
        mailbox.running = false;
        mailbox.queue = EventQueue::with_capacity(1);
    }

    /// Clears `running` once the drive loop finds no deliverable event and
    /// has no default transition/action to fall back on.
    pub(crate) fn mark_idle(&self) {
        let mut mailbox = self.mailbox.lock();
        mailbox.running = false;
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.mailbox.lock().halted
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.mailbox.lock().queue.len()
    }
}

struct ProcessInner<P: Payload> {
    program: Program<P>,
    limits: RuntimeLimits,
    hooks: Box<dyn ExecutorHooks>,
    registry: RwLock<HashMap<MachineId, Arc<Machine<P>>>>,
    next_id: Mutex<u64>,
    /// Ids freed by `cleanup_machine`/`cleanup_model`, handed back out by
    /// `allocate_id` before the counter grows.
    free_ids: Mutex<Vec<MachineId>>,
}

/// A process: one program plus every machine instantiated from it. A
/// process owns the machines it creates and is the unit of cross-machine
/// `send`.
///
/// Cheap to clone; every clone shares the same registry and program.
#[derive(Clone)]
pub struct Process<P: Payload> {
    inner: Arc<ProcessInner<P>>,
}

impl<P: Payload> Process<P> {
    pub fn new(program: Program<P>, limits: RuntimeLimits, hooks: Box<dyn ExecutorHooks>) -> Self {
        Self {
            inner: Arc::new(ProcessInner {
                program,
                limits,
                hooks,
                registry: RwLock::new(HashMap::new()),
                next_id: Mutex::new(1),
                free_ids: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn with_defaults(program: Program<P>) -> Self {
        Self::new(program, RuntimeLimits::default(), Box::new(NoopHooks))
    }

    pub fn program(&self) -> &Program<P> {
        &self.inner.program
    }

    pub(crate) fn limits(&self) -> &RuntimeLimits {
        &self.inner.limits
    }

    pub(crate) fn hooks(&self) -> &dyn ExecutorHooks {
        self.inner.hooks.as_ref()
    }

    fn allocate_id(&self) -> MachineId {
        if let Some(id) = self.inner.free_ids.lock().pop() {
            return id;
        }
        let mut next = self.inner.next_id.lock();
        let id = MachineId(*next);
        *next += 1;
        id
    }

    /// Creates a machine from `decl_index`'s declaration, runs its initial
    /// `EntryPhase`, and drives it to quiescence before returning. A
    /// creator observes the new machine already settled.
    pub fn create_machine(
        &self,
        decl_index: MachineDeclIndex,
        constructor_payload: P,
    ) -> RuntimeResult<MachineId> {
        let decl = self.inner.program.machine(decl_index);
        let id = self.allocate_id();
        let exec = MachineContext::new(
            id,
            decl_index,
            decl.num_vars,
            self.inner.program.num_events(),
            decl.init_state,
            constructor_payload,
        );
        let machine = Arc::new(Machine {
            id,
            mailbox: Mutex::new(Mailbox {
                queue: EventQueue::with_capacity(self.inner.limits.initial_queue_capacity()),
                running: true,
                halted: false,
            }),
            exec: Mutex::new(exec),
        });
        self.inner.registry.write().insert(id, Arc::clone(&machine));
        executor::drive(&machine, self)?;
        Ok(id)
    }

    /// Sends `event` to `target`. If `target` was idle, drives it to
    /// quiescence synchronously on this thread; otherwise the event is
    /// enqueued for whichever thread is already driving it.
    pub fn send(&self, target: MachineId, event: EventId, payload: P) -> RuntimeResult<()> {
        if event == EventId::NULL || event.0 >= self.inner.program.num_events() {
            return Err(RuntimeError::InvalidEvent(target, event));
        }
        let machine = {
            let registry = self.inner.registry.read();
            registry
                .get(&target)
                .cloned()
                .ok_or(RuntimeError::MachineNotFound(target))?
        };
        let max_instances = self.inner.program.event(event).max_instances;
        hooks::log_step(self.hooks(), target, DispatchStep::Enqueue);
        let became_driver = match machine.enqueue(event, payload, max_instances) {
            Ok(became_driver) => became_driver,
            Err(error) => {
                hooks::log_error(self.hooks(), &error);
                return Err(error);
            }
        };
        if became_driver {
            executor::drive(&machine, self)?;
        }
        Ok(())
    }

    pub(crate) fn lookup(&self, id: MachineId) -> Option<Arc<Machine<P>>> {
        self.inner.registry.read().get(&id).cloned()
    }

    /// Removes a halted machine from the registry, freeing its queue and
    /// stack and returning `id` to the pool `allocate_id` draws from before
    /// growing the counter. Fails with `MachineNotFound` if `id` is unknown.
    /// A machine that is still running is left in place and this returns
    /// `Ok(false)`.
    pub fn cleanup_machine(&self, id: MachineId) -> RuntimeResult<bool> {
        let machine = self
            .inner
            .registry
            .read()
            .get(&id)
            .cloned()
            .ok_or(RuntimeError::MachineNotFound(id))?;
        if !machine.is_halted() {
            return Ok(false);
        }
        self.inner.registry.write().remove(&id);
        self.inner.free_ids.lock().push(id);
        Ok(true)
    }

    /// Removes every halted machine from the registry, returning each freed
    /// id to the allocation pool. Running machines are left untouched.
    /// Returns the number of machines removed.
    pub fn cleanup_model(&self) -> usize {
        let halted: Vec<MachineId> = self
            .inner
            .registry
            .read()
            .iter()
            .filter(|(_, machine)| machine.is_halted())
            .map(|(id, _)| *id)
            .collect();
        let mut registry = self.inner.registry.write();
        for id in &halted {
            registry.remove(id);
        }
        drop(registry);
        self.inner.free_ids.lock().extend(halted.iter().copied());
        halted.len()
    }

    pub fn machine_count(&self) -> usize {
        self.inner.registry.read().len()
    }

    pub fn is_halted(&self, id: MachineId) -> Option<bool> {
        Some(self.lookup(id)?.is_halted())
    }

    pub fn queue_len(&self, id: MachineId) -> Option<usize> {
        Some(self.lookup(id)?.queue_len())
    }

    /// `None` if the machine is unknown or has already halted. A halted
    /// machine's stack is empty, so it has no current state to report.
    pub fn current_state(&self, id: MachineId) -> Option<StateIndex> {
        let machine = self.lookup(id)?;
        if machine.is_halted() {
            return None;
        }
        let exec = machine.lock_exec();
        Some(exec.current_state())
    }
}
