//! End-to-end dispatch-loop tests, driving real `Program`/`Process` pairs
//! the way an embedder would rather than poking at internals. Handlers are
//! bare `fn`s (the executor's handler type has no closure capture), so they
//! record what happened into a thread-local trace that each test reads back.

use std::cell::RefCell;

use hsm_value::{EventId, MachineId, Value};

use super::*;

thread_local! {
    static TRACE: RefCell<Vec<&'static str>> = const { RefCell::new(Vec::new()) };
}

fn trace(note: &'static str) {
    TRACE.with(|t| t.borrow_mut().push(note));
}

fn take_trace() -> Vec<&'static str> {
    TRACE.with(|t| t.borrow_mut().drain(..).collect())
}

fn as_machine_id(value: &Value) -> MachineId {
    match value {
        Value::MachineId(id) => *id,
        other => panic!("expected a MachineId payload, got {other:?}"),
    }
}

/// Routes the executor's `tracing` spans/events to the test harness's
/// captured output. Safe to call from every test; `try_init` only wins once
/// per process.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn ping_pong_drives_both_machines_on_the_senders_thread() {
    init_tracing();
    take_trace();
    const PING: EventId = EventId(2);
    const PONG: EventId = EventId(3);

    fn pinger_entry(cx: &mut MachineCx<Value>, payload: Value) -> RuntimeResult<()> {
        trace("pinger:entry");
        let ponger = as_machine_id(&payload);
        let me = cx.self_id();
        cx.send(ponger, PING, Value::MachineId(me))
    }
    fn pinger_on_pong(_cx: &mut MachineCx<Value>, _payload: Value) -> RuntimeResult<()> {
        trace("pinger:pong");
        Ok(())
    }
    fn ponger_on_ping(cx: &mut MachineCx<Value>, payload: Value) -> RuntimeResult<()> {
        trace("ponger:ping");
        let pinger = as_machine_id(&payload);
        cx.send(pinger, PONG, Value::Unit)
    }

    let program = Program {
        events: vec![
            EventDecl::unbounded("null"),
            EventDecl::unbounded("halt"),
            EventDecl::unbounded("ping"),
            EventDecl::unbounded("pong"),
        ],
        machines: vec![
            MachineDecl {
                name: "Pinger",
                num_vars: 0,
                init_state: StateIndex(0),
                states: vec![StateDecl::new(
                    "Init",
                    4,
                    [],
                    vec![ActionDecl {
                        event: PONG,
                        handler: pinger_on_pong,
                    }],
                    vec![],
                )
                .with_entry(pinger_entry)],
            },
            MachineDecl {
                name: "Ponger",
                num_vars: 0,
                init_state: StateIndex(0),
                states: vec![StateDecl::new(
                    "Init",
                    4,
                    [],
                    vec![ActionDecl {
                        event: PING,
                        handler: ponger_on_ping,
                    }],
                    vec![],
                )],
            },
        ],
    };

    let process = Process::with_defaults(program);
    let ponger = process
        .create_machine(MachineDeclIndex(1), Value::Unit)
        .expect("ponger creates cleanly");
    process
        .create_machine(MachineDeclIndex(0), Value::MachineId(ponger))
        .expect("pinger creates and settles synchronously");

    assert_eq!(
        take_trace(),
        vec!["pinger:entry", "ponger:ping", "pinger:pong"]
    );
    assert_eq!(process.queue_len(ponger), Some(0));
}

#[test]
fn deferred_event_is_admitted_once_the_state_stops_deferring_it() {
    take_trace();
    const EVENT_A: EventId = EventId(2);
    const EVENT_B: EventId = EventId(3);

    fn on_a(_cx: &mut MachineCx<Value>, _payload: Value) -> RuntimeResult<()> {
        trace("unlocked:a");
        Ok(())
    }

    let locked = StateDecl::new(
        "Locked",
        4,
        [EVENT_A.0],
        vec![],
        vec![TransitionDecl {
            event: EVENT_B,
            target: StateIndex(1),
            kind: TransitionKind::Goto,
            handler: None,
        }],
    );
    let unlocked = StateDecl::new(
        "Unlocked",
        4,
        [],
        vec![ActionDecl {
            event: EVENT_A,
            handler: on_a,
        }],
        vec![],
    );

    let program = Program {
        events: vec![
            EventDecl::unbounded("null"),
            EventDecl::unbounded("halt"),
            EventDecl::unbounded("a"),
            EventDecl::unbounded("b"),
        ],
        machines: vec![MachineDecl {
            name: "Lock",
            num_vars: 0,
            init_state: StateIndex(0),
            states: vec![locked, unlocked],
        }],
    };

    let process = Process::with_defaults(program);
    let id = process
        .create_machine(MachineDeclIndex(0), Value::Unit)
        .unwrap();

    process.send(id, EVENT_A, Value::Unit).unwrap();
    assert_eq!(process.queue_len(id), Some(1), "A is deferred, stays queued");
    assert!(take_trace().is_empty());

    process.send(id, EVENT_B, Value::Unit).unwrap();
    assert_eq!(
        take_trace(),
        vec!["unlocked:a"],
        "admitting B should deliver the deferred A once Unlocked stops deferring it"
    );
    assert_eq!(process.queue_len(id), Some(0));
    assert_eq!(process.current_state(id), Some(StateIndex(1)));
}

#[test]
fn pop_re_delivers_the_triggering_event_to_the_restored_parents_action_phase() {
    take_trace();
    const E: EventId = EventId(2);

    // Var 0 tracks whether this machine has already pushed once, so E's
    // second delivery (after the pop) takes the other branch instead of
    // looping forever.
    fn on_e(cx: &mut MachineCx<Value>, _payload: Value) -> RuntimeResult<()> {
        match cx.var(0) {
            Value::Bool(true) => trace("outer:e:redelivered"),
            _ => {
                trace("outer:e:first");
                cx.set_var(0, Value::Bool(true));
                cx.push(StateIndex(1));
            }
        }
        Ok(())
    }
    fn inner_entry(cx: &mut MachineCx<Value>, _payload: Value) -> RuntimeResult<()> {
        trace("inner:entry");
        cx.pop()
    }

    let outer = StateDecl::new(
        "Outer",
        3,
        [],
        vec![ActionDecl {
            event: E,
            handler: on_e,
        }],
        vec![],
    );
    let inner = StateDecl::new("Inner", 3, [], vec![], vec![]).with_entry(inner_entry);

    let program = Program {
        events: vec![
            EventDecl::unbounded("null"),
            EventDecl::unbounded("halt"),
            EventDecl::unbounded("e"),
        ],
        machines: vec![MachineDecl {
            name: "PushPop",
            num_vars: 1,
            init_state: StateIndex(0),
            states: vec![outer, inner],
        }],
    };

    let process = Process::with_defaults(program);
    let id = process
        .create_machine(MachineDeclIndex(0), Value::Unit)
        .unwrap();

    process.send(id, E, Value::Unit).unwrap();

    assert_eq!(
        take_trace(),
        vec!["outer:e:first", "inner:entry", "outer:e:redelivered"],
        "popping Inner must re-deliver E into Outer's ActionPhase, not leave \
         the machine waiting on a stale or null event"
    );
    assert_eq!(
        process.current_state(id),
        Some(StateIndex(0)),
        "the round trip through Inner must land back in Outer"
    );
}

#[test]
fn pop_recomputes_deferred_and_actions_sets_for_the_restored_parent() {
    take_trace();
    const E: EventId = EventId(2);
    const GUARDED: EventId = EventId(3);
    const POP_EVT: EventId = EventId(4);

    fn on_e(cx: &mut MachineCx<Value>, _payload: Value) -> RuntimeResult<()> {
        match cx.var(0) {
            Value::Bool(true) => trace("outer:e:redelivered"),
            _ => {
                trace("outer:e:first");
                cx.set_var(0, Value::Bool(true));
                cx.push(StateIndex(1));
            }
        }
        Ok(())
    }
    fn on_guarded(_cx: &mut MachineCx<Value>, _payload: Value) -> RuntimeResult<()> {
        trace("outer:guarded");
        Ok(())
    }
    fn on_pop(cx: &mut MachineCx<Value>, _payload: Value) -> RuntimeResult<()> {
        trace("inner:pop");
        cx.pop()
    }

    // Inner defers GUARDED; Outer does not. If pop fails to recompute the
    // restored frame's current sets, GUARDED would stay stuck in the queue
    // forever as a deferred event even after Inner has popped away.
    let outer = StateDecl::new(
        "Outer",
        5,
        [],
        vec![
            ActionDecl {
                event: E,
                handler: on_e,
            },
            ActionDecl {
                event: GUARDED,
                handler: on_guarded,
            },
        ],
        vec![],
    );
    let inner = StateDecl::new(
        "Inner",
        5,
        [GUARDED.0],
        vec![ActionDecl {
            event: POP_EVT,
            handler: on_pop,
        }],
        vec![],
    );

    let program = Program {
        events: vec![
            EventDecl::unbounded("null"),
            EventDecl::unbounded("halt"),
            EventDecl::unbounded("e"),
            EventDecl::unbounded("guarded"),
            EventDecl::unbounded("pop"),
        ],
        machines: vec![MachineDecl {
            name: "PushPopDefer",
            num_vars: 1,
            init_state: StateIndex(0),
            states: vec![outer, inner],
        }],
    };

    let process = Process::with_defaults(program);
    let id = process
        .create_machine(MachineDeclIndex(0), Value::Unit)
        .unwrap();

    process.send(id, E, Value::Unit).unwrap();
    process.send(id, GUARDED, Value::Unit).unwrap();
    assert_eq!(
        process.queue_len(id),
        Some(1),
        "GUARDED is deferred while Inner is on top"
    );

    process.send(id, POP_EVT, Value::Unit).unwrap();

    assert_eq!(
        take_trace(),
        vec!["outer:e:first", "inner:pop", "outer:e:redelivered", "outer:guarded"],
        "once back in Outer, GUARDED must be admitted instead of staying \
         deferred under Inner's now-stale deferred set"
    );
    assert_eq!(process.queue_len(id), Some(0));
    assert_eq!(process.current_state(id), Some(StateIndex(0)));
}

#[test]
fn raise_inside_entry_preempts_the_queue() {
    take_trace();
    const RAISED: EventId = EventId(2);

    fn on_entry(cx: &mut MachineCx<Value>, _payload: Value) -> RuntimeResult<()> {
        trace("entry:ran");
        cx.raise(RAISED, Value::Unit);
        Ok(())
    }
    fn on_raised(_cx: &mut MachineCx<Value>, _payload: Value) -> RuntimeResult<()> {
        trace("action:raised");
        Ok(())
    }

    let program = Program {
        events: vec![
            EventDecl::unbounded("null"),
            EventDecl::unbounded("halt"),
            EventDecl::unbounded("raised"),
        ],
        machines: vec![MachineDecl {
            name: "Raiser",
            num_vars: 0,
            init_state: StateIndex(0),
            states: vec![StateDecl::new(
                "Init",
                3,
                [],
                vec![ActionDecl {
                    event: RAISED,
                    handler: on_raised,
                }],
                vec![],
            )
            .with_entry(on_entry)],
        }],
    };

    let process = Process::with_defaults(program);
    process
        .create_machine(MachineDeclIndex(0), Value::Unit)
        .unwrap();

    assert_eq!(take_trace(), vec!["entry:ran", "action:raised"]);
}

#[test]
fn the_halt_event_clears_state_and_rejects_further_sends() {
    let program = Program {
        events: vec![EventDecl::unbounded("null"), EventDecl::unbounded("halt")],
        machines: vec![MachineDecl {
            name: "Haltable",
            num_vars: 0,
            init_state: StateIndex(0),
            states: vec![StateDecl::new("Init", 2, [], vec![], vec![])],
        }],
    };

    let process = Process::with_defaults(program);
    let id = process
        .create_machine(MachineDeclIndex(0), Value::Unit)
        .unwrap();
    assert_eq!(process.is_halted(id), Some(false));

    process.send(id, EventId::HALT, Value::Unit).unwrap();
    assert_eq!(process.is_halted(id), Some(true));
    assert_eq!(process.queue_len(id), Some(0));

    let err = process.send(id, EventId::HALT, Value::Unit).unwrap_err();
    assert!(matches!(err, RuntimeError::AlreadyHalted(_)));
}

#[test]
fn a_childs_transition_overrides_its_parents_inherited_action() {
    take_trace();
    const PUSH: EventId = EventId(2);
    const E: EventId = EventId(3);

    fn on_push(cx: &mut MachineCx<Value>, _payload: Value) -> RuntimeResult<()> {
        cx.push(StateIndex(1));
        Ok(())
    }
    fn on_outer_action(_cx: &mut MachineCx<Value>, _payload: Value) -> RuntimeResult<()> {
        trace("outer:action");
        Ok(())
    }
    fn on_third_entry(_cx: &mut MachineCx<Value>, _payload: Value) -> RuntimeResult<()> {
        trace("third:entered");
        Ok(())
    }

    let outer = StateDecl::new(
        "Outer",
        4,
        [],
        vec![
            ActionDecl {
                event: PUSH,
                handler: on_push,
            },
            ActionDecl {
                event: E,
                handler: on_outer_action,
            },
        ],
        vec![],
    );
    let inner = StateDecl::new(
        "Inner",
        4,
        [],
        vec![],
        vec![TransitionDecl {
            event: E,
            target: StateIndex(2),
            kind: TransitionKind::Goto,
            handler: None,
        }],
    );
    let third = StateDecl::new("Third", 4, [], vec![], vec![]).with_entry(on_third_entry);

    let program = Program {
        events: vec![
            EventDecl::unbounded("null"),
            EventDecl::unbounded("halt"),
            EventDecl::unbounded("push"),
            EventDecl::unbounded("e"),
        ],
        machines: vec![MachineDecl {
            name: "Override",
            num_vars: 0,
            init_state: StateIndex(0),
            states: vec![outer, inner, third],
        }],
    };

    let process = Process::with_defaults(program);
    let id = process
        .create_machine(MachineDeclIndex(0), Value::Unit)
        .unwrap();
    process.send(id, PUSH, Value::Unit).unwrap();
    process.send(id, E, Value::Unit).unwrap();

    assert_eq!(
        take_trace(),
        vec!["third:entered"],
        "Inner's own transition on E must win over Outer's inherited action, \
         never running outer:action"
    );
    assert_eq!(process.current_state(id), Some(StateIndex(2)));
}

#[test]
fn max_instances_bound_surfaces_as_queue_overflow() {
    const EVENT_A: EventId = EventId(2);

    let deferring = StateDecl::new("Deferring", 3, [EVENT_A.0], vec![], vec![]);
    let program = Program {
        events: vec![
            EventDecl::unbounded("null"),
            EventDecl::unbounded("halt"),
            EventDecl::bounded("a", 1),
        ],
        machines: vec![MachineDecl {
            name: "Bounded",
            num_vars: 0,
            init_state: StateIndex(0),
            states: vec![deferring],
        }],
    };

    let process = Process::with_defaults(program);
    let id = process
        .create_machine(MachineDeclIndex(0), Value::Unit)
        .unwrap();

    process.send(id, EVENT_A, Value::Unit).unwrap();
    let err = process.send(id, EVENT_A, Value::Unit).unwrap_err();
    assert!(matches!(err, RuntimeError::QueueOverflow(_, EVENT_A)));
    assert_eq!(process.queue_len(id), Some(1));
}

#[test]
fn concurrent_sends_from_multiple_threads_all_get_handled() {
    init_tracing();
    use std::sync::atomic::{AtomicUsize, Ordering};
    static HANDLED: AtomicUsize = AtomicUsize::new(0);
    const PING: EventId = EventId(2);
    const THREADS: usize = 8;
    const SENDS_PER_THREAD: usize = 50;

    fn on_ping(_cx: &mut MachineCx<Value>, _payload: Value) -> RuntimeResult<()> {
        HANDLED.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    let program = Program {
        events: vec![
            EventDecl::unbounded("null"),
            EventDecl::unbounded("halt"),
            EventDecl::unbounded("ping"),
        ],
        machines: vec![MachineDecl {
            name: "Counter",
            num_vars: 0,
            init_state: StateIndex(0),
            states: vec![StateDecl::new(
                "Init",
                3,
                [],
                vec![ActionDecl {
                    event: PING,
                    handler: on_ping,
                }],
                vec![],
            )],
        }],
    };

    let process = Process::with_defaults(program);
    let id = process
        .create_machine(MachineDeclIndex(0), Value::Unit)
        .unwrap();

    // Whichever sender finds the machine idle drives it on its own thread;
    // the rest enqueue and return. Every event must still land exactly once.
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let process = process.clone();
            std::thread::spawn(move || {
                for _ in 0..SENDS_PER_THREAD {
                    process.send(id, PING, Value::Unit).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("sender thread must not panic");
    }

    assert_eq!(HANDLED.load(Ordering::SeqCst), THREADS * SENDS_PER_THREAD);
    assert_eq!(process.queue_len(id), Some(0));
}

#[test]
fn pushing_past_the_configured_depth_limit_halts_with_stack_overflow() {
    fn self_pushing_entry(cx: &mut MachineCx<Value>, _payload: Value) -> RuntimeResult<()> {
        cx.push(StateIndex(0));
        Ok(())
    }

    let program = Program {
        events: vec![EventDecl::unbounded("null"), EventDecl::unbounded("halt")],
        machines: vec![MachineDecl {
            name: "Recursive",
            num_vars: 0,
            init_state: StateIndex(0),
            states: vec![StateDecl::new("Init", 2, [], vec![], vec![]).with_entry(self_pushing_entry)],
        }],
    };

    let limits = RuntimeLimits::default().with_max_stack_depth(3);
    let process = Process::new(program, limits, Box::new(NoopHooks));
    let err = process
        .create_machine(MachineDeclIndex(0), Value::Unit)
        .unwrap_err();
    assert!(matches!(err, RuntimeError::StackOverflow(_)));
}
