// Licensed under the Apache License, Version 2.0.

//! `EventGenerator`: the emission/call contract of a single signal source, and the `Event`
//! records it produces. Free-standing state and pure state-machine transitions live here;
//! cross-object orchestration (propagation, relation wiring) lives in `propagation` and `plan`.

use std::cell::Cell;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::RobyError;
use crate::ids::PlanObjectId;
use crate::object::PlanObjectState;

/// A value carried as event context or a resolved task argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
}

/// The payload attached to an emission. Multiple contributing sources in the same propagation
/// step concatenate their contexts in source order.
pub type Context = Vec<Value>;

/// Reference to one specific past emission, stable across the generator's lifetime. Two
/// generators never share a `propagation_id` within the same cycle's step (invariant 8), so the
/// pair uniquely names an `Event` without needing an index into `history`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventRef {
    pub generator: PlanObjectId,
    pub propagation_id: u64,
}

/// A single past emission.
#[derive(Debug, Clone)]
pub struct Event {
    pub generator: PlanObjectId,
    pub propagation_id: u64,
    pub context: Context,
    pub timestamp: SystemTime,
    pub sources: Vec<EventRef>,
}

impl Event {
    pub fn event_ref(&self) -> EventRef {
        EventRef {
            generator: self.generator,
            propagation_id: self.propagation_id,
        }
    }
}

/// Why a generator became unreachable.
#[derive(Debug, Clone)]
pub enum UnreachableReason {
    /// A specific past event is the recorded cause (e.g. an `Or` combinator's last source to go
    /// unreachable, or a `limit` event in `until`).
    Event(EventRef),
    /// A structured error is the recorded cause.
    Error(RobyError),
}

/// What replacing a generator with another does to one of its handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnReplace {
    Drop,
    Copy,
}

/// Whether a generator fires at most once per cycle (`Normal`, the default and invariant 8's
/// baseline) or may be re-entered within the same cycle's step (`AlwaysCall`, §9 open question
/// (a): we resolve this as "re-run the command every time a propagation record targets this
/// generator in the same step, instead of collapsing repeats").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationMode {
    Normal,
    AlwaysCall,
}

/// Cached classification of a task-bound event: does its outgoing Signal/Forwarding closure
/// reach the owning task's `stop`, and if so through `success` or `failed`?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalFlag {
    /// Does not reach `stop`.
    None,
    /// Reaches `stop` directly (this *is* `stop`, or forwards only into it).
    Terminal,
    /// Reaches `stop` through `success`.
    Success,
    /// Reaches `stop` through `failed`.
    Failure,
}

impl TerminalFlag {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TerminalFlag::None)
    }
}

pub type HandlerFn = Arc<dyn Fn(&Event) + Send + Sync>;
pub type UnreachableHandlerFn = Arc<dyn Fn(Option<&UnreachableReason>) + Send + Sync>;
pub type PreconditionFn = Arc<dyn Fn(&Context) -> Result<(), String> + Send + Sync>;

/// What a `calling` hook decided to do with the call it was asked about (§4.3/§4.6
/// "Cancellation"): proceed to the command as normal, abort and re-attempt once `other` emits, or
/// abort outright with an error.
#[derive(Clone)]
pub enum CallingDecision {
    Proceed,
    Postpone { other: PlanObjectId, reason: String },
    Cancel { reason: String },
}

pub type CallingHookFn = Arc<dyn Fn(&Context) -> CallingDecision + Send + Sync>;
/// A task/event command: the user code run when a controllable generator is `call`ed.
///
/// Returning `Ok(Some(context))` emits the event immediately with that context, in the same step
/// (the common synchronous-command case, e.g. `S1`'s controllable `start`/`stop`). Returning
/// `Ok(None)` defers emission to later (typically from a worker thread via `Engine::execute`,
/// once the asynchronous work the command kicked off completes).
pub type CommandFn = Arc<dyn Fn(&Context) -> Result<Option<Context>, String> + Send + Sync>;

/// A registered `on { |event| ... }` handler.
#[derive(Clone)]
pub struct Handler {
    pub f: HandlerFn,
    pub once: bool,
    pub on_replace: OnReplace,
    pub fired: bool,
}

/// A registered `if_unreachable { |reason, ev| ... }` handler.
#[derive(Clone)]
pub struct UnreachableHandler {
    pub f: UnreachableHandlerFn,
    pub cancel_at_emission: bool,
    pub on_replace: OnReplace,
    pub fired: bool,
}

/// A signal source's emission/call contract.
///
/// Free events and task-bound events are the same type: a task-bound one additionally carries
/// `owner_task`/`symbol` so the plan can delegate ownership/executable-ness to the task (see
/// `Plan::event_owners`) and so `TaskEventGenerator`-specific behavior (terminal-flag caching) has
/// somewhere to live.
pub struct EventGenerator {
    pub id: PlanObjectId,
    pub state: PlanObjectState,
    pub owner_task: Option<PlanObjectId>,
    pub symbol: Option<String>,
    pub command: Option<CommandFn>,
    pub pending: bool,
    pub happened: bool,
    pub unreachable: Option<UnreachableReason>,
    pub history: Vec<Event>,
    pub handlers: Vec<Handler>,
    pub unreachable_handlers: Vec<UnreachableHandler>,
    pub preconditions: Vec<PreconditionFn>,
    /// Pre-command hooks consulted by `Plan::dispatch_call`, in registration order, before the
    /// controllable command itself runs (§4.6 "Cancellation").
    pub calling_hooks: Vec<CallingHookFn>,
    pub propagation_mode: PropagationMode,
    terminal_cache: Cell<Option<TerminalFlag>>,
}

impl EventGenerator {
    pub fn new_free(id: PlanObjectId, state: PlanObjectState, command: Option<CommandFn>) -> Self {
        EventGenerator {
            id,
            state,
            owner_task: None,
            symbol: None,
            command,
            pending: false,
            happened: false,
            unreachable: None,
            history: Vec::new(),
            handlers: Vec::new(),
            unreachable_handlers: Vec::new(),
            preconditions: Vec::new(),
            calling_hooks: Vec::new(),
            propagation_mode: PropagationMode::Normal,
            terminal_cache: Cell::new(None),
        }
    }

    pub fn new_bound(
        id: PlanObjectId,
        state: PlanObjectState,
        owner_task: PlanObjectId,
        symbol: impl Into<String>,
        command: Option<CommandFn>,
    ) -> Self {
        let mut g = EventGenerator::new_free(id, state, command);
        g.owner_task = Some(owner_task);
        g.symbol = Some(symbol.into());
        g
    }

    pub fn is_bound(&self) -> bool {
        self.owner_task.is_some()
    }

    pub fn controllable(&self) -> bool {
        self.command.is_some()
    }

    pub fn happened(&self) -> bool {
        self.happened
    }

    pub fn pending(&self) -> bool {
        self.pending
    }

    pub fn unreachable(&self) -> bool {
        self.unreachable.is_some()
    }

    pub fn unreachable_reason(&self) -> Option<&UnreachableReason> {
        self.unreachable.as_ref()
    }

    pub fn last_event(&self) -> Option<&Event> {
        self.history.last()
    }

    pub fn terminal_flag(&self) -> Option<TerminalFlag> {
        self.terminal_cache.get()
    }

    pub fn cache_terminal_flag(&self, flag: TerminalFlag) {
        self.terminal_cache.set(Some(flag));
    }

    /// Invalidates the terminal-flag cache; called whenever a Signal/Forwarding edge touching
    /// this generator's task is added or removed.
    pub fn invalidate_terminal_flag(&self) {
        self.terminal_cache.set(None);
    }

    /// Records a successful emission. Does not run handlers (the propagation step does that after
    /// merging all generators fired in the step, so handler order matches registration order
    /// across the whole step rather than per generator).
    pub fn record_emission(&mut self, event: Event) {
        self.happened = true;
        self.pending = false;
        self.history.push(event);
    }

    /// Marks the generator unreachable. A no-op if already unreachable: the first cause wins
    /// (invariant 7, and S4's "reason = R1, the first cause recorded").
    pub fn mark_unreachable(&mut self, reason: UnreachableReason) -> bool {
        if self.unreachable.is_some() {
            return false;
        }
        self.unreachable = Some(reason);
        true
    }

    pub fn on(&mut self, f: HandlerFn, once: bool, on_replace: OnReplace) {
        self.handlers.push(Handler {
            f,
            once,
            on_replace,
            fired: false,
        });
    }

    pub fn if_unreachable(
        &mut self,
        f: UnreachableHandlerFn,
        cancel_at_emission: bool,
        on_replace: OnReplace,
    ) {
        self.unreachable_handlers.push(UnreachableHandler {
            f,
            cancel_at_emission,
            on_replace,
            fired: false,
        });
    }

    /// Runs every not-yet-fired handler against `event`, dropping `once` handlers afterwards.
    /// Handler panics/errors are the caller's concern (wrapped as `EventHandlerError` by
    /// `propagation`); this only sequences the calls in registration order.
    pub fn fire_handlers(&mut self, event: &Event) {
        for handler in &mut self.handlers {
            if handler.fired && handler.once {
                continue;
            }
            (handler.f)(event);
            if handler.once {
                handler.fired = true;
            }
        }
        self.handlers.retain(|h| !(h.once && h.fired));
    }

    /// Runs every unreachable handler once, honoring `cancel_at_emission`.
    pub fn fire_unreachable_handlers(&mut self) {
        let reason = self.unreachable.clone();
        for handler in &mut self.unreachable_handlers {
            if handler.fired {
                continue;
            }
            if handler.cancel_at_emission && self.happened {
                handler.fired = true;
                continue;
            }
            (handler.f)(reason.as_ref());
            handler.fired = true;
        }
    }

    /// Registers a `calling` hook, consulted in registration order before the command runs.
    pub fn calling(&mut self, f: CallingHookFn) {
        self.calling_hooks.push(f);
    }

    /// Transfers handlers flagged `on_replace: Copy` onto `other`, per "Event handlers as data."
    pub fn copy_replaceable_handlers_to(&self, other: &mut EventGenerator) {
        for handler in &self.handlers {
            if handler.on_replace == OnReplace::Copy {
                other.handlers.push(handler.clone());
            }
        }
        for handler in &self.unreachable_handlers {
            if handler.on_replace == OnReplace::Copy {
                other.unreachable_handlers.push(handler.clone());
            }
        }
    }
}
