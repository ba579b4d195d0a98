// Licensed under the Apache License, Version 2.0.

//! Structured error taxonomy. Every fallible core operation returns one of these concrete
//! variants rather than a boxed `dyn Error` or `anyhow::Error`, so exception provenance can be
//! inspected programmatically (matched on, routed through exception propagation, logged).
//!
//! Modeled on the teacher's `NodeError` trait: plain enums, hand-written `Display`/`Error`, no
//! derive macro.

use std::fmt;

use crate::ids::PlanObjectId;

/// A single error kind from the error-handling design. Each variant names its trigger; policy
/// (report / fatal / routed) is applied by the caller, not baked into the type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RobyError {
    /// `call`/`emit` on a finalized or non-executable generator.
    EventNotExecutable { event: PlanObjectId },
    /// `call` on a generator with no command.
    EventNotControlable { event: PlanObjectId },
    /// `call`/`emit` on a generator already marked unreachable.
    UnreachableEvent {
        event: PlanObjectId,
        reason: Option<Box<RobyError>>,
    },
    /// Called or emitted from a thread other than the engine thread.
    ThreadMismatch,
    /// Mutation attempted by a peer not in the object's owner set.
    OwnershipError { object: PlanObjectId },
    /// A user-supplied command raised during `calling`/command dispatch.
    CommandFailed {
        event: PlanObjectId,
        message: String,
    },
    /// The emit path raised or was refused mid-flight.
    EmissionFailed {
        event: PlanObjectId,
        message: String,
    },
    /// The task/event state machine rejected the emission outright (wrong state, wrong thread).
    EmissionRejected {
        event: PlanObjectId,
        message: String,
    },
    /// A registered event handler raised. Does not by itself fail the owning task.
    EventHandlerError {
        event: PlanObjectId,
        message: String,
    },
    /// Two propagation records disagreed on call-vs-forward for the same target, or another
    /// invariant of the step function was violated. Fatal: aborts the current cycle.
    PropagationError { message: String },
    /// Re-inserting an already-finalized object into a plan.
    ReusingGarbage { object: PlanObjectId },
    /// A `dag?` relation's `add_edge` would have introduced a cycle.
    CycleFoundError {
        parent: PlanObjectId,
        child: PlanObjectId,
    },
    /// A mission task reached `failed`.
    MissionFailedError { mission: PlanObjectId },
    /// A permanent task reached `failed`.
    PermanentTaskError { task: PlanObjectId },
    /// A task would not stop and carries an unrecoverable error; it is about to be quarantined.
    TaskEmergencyTermination { task: PlanObjectId },
    /// A non-weak delayed argument resolver returned "no value yet" at `start.call` (§4.5
    /// "Argument freezing"). Not in the §7 table verbatim, but the same "structured error at
    /// start" it describes.
    ArgumentResolutionFailed { task: PlanObjectId, key: String },
    /// A task's `internal_error` bound event emitted. By convention this is the event user code
    /// uses to signal an in-band code error into exception propagation (see S5).
    InternalError { task: PlanObjectId, message: String },
}

impl fmt::Display for RobyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RobyError::EventNotExecutable { event } => {
                write!(f, "{event} is not executable")
            }
            RobyError::EventNotControlable { event } => {
                write!(f, "{event} has no command and cannot be called")
            }
            RobyError::UnreachableEvent { event, .. } => {
                write!(f, "{event} is unreachable")
            }
            RobyError::ThreadMismatch => {
                write!(f, "call/emit attempted from a non-engine thread")
            }
            RobyError::OwnershipError { object } => {
                write!(f, "local peer does not own {object}")
            }
            RobyError::CommandFailed { event, message } => {
                write!(f, "command of {event} failed: {message}")
            }
            RobyError::EmissionFailed { event, message } => {
                write!(f, "emission of {event} failed: {message}")
            }
            RobyError::EmissionRejected { event, message } => {
                write!(f, "emission of {event} rejected: {message}")
            }
            RobyError::EventHandlerError { event, message } => {
                write!(f, "handler of {event} raised: {message}")
            }
            RobyError::PropagationError { message } => {
                write!(f, "propagation invariant violated: {message}")
            }
            RobyError::ReusingGarbage { object } => {
                write!(f, "{object} is already finalized")
            }
            RobyError::CycleFoundError { parent, child } => {
                write!(f, "edge {parent} -> {child} would introduce a cycle")
            }
            RobyError::MissionFailedError { mission } => {
                write!(f, "mission {mission} failed")
            }
            RobyError::PermanentTaskError { task } => {
                write!(f, "permanent task {task} failed")
            }
            RobyError::TaskEmergencyTermination { task } => {
                write!(f, "task {task} refuses to stop and is being quarantined")
            }
            RobyError::ArgumentResolutionFailed { task, key } => {
                write!(f, "task {task} argument {key:?} had no value at start")
            }
            RobyError::InternalError { task, message } => {
                write!(f, "task {task} signalled an internal error: {message}")
            }
        }
    }
}

impl std::error::Error for RobyError {}

impl RobyError {
    /// True for error kinds that are raised directly from the engine thread and bypass user
    /// handlers entirely (§7: "framework" kinds).
    pub fn is_framework(&self) -> bool {
        matches!(self, RobyError::PropagationError { .. } | RobyError::ThreadMismatch)
    }

    /// The task this error should be lifted from when routed through exception propagation, if
    /// any.
    pub fn origin_task(&self, owner_of: impl Fn(PlanObjectId) -> Option<PlanObjectId>) -> Option<PlanObjectId> {
        match self {
            RobyError::CommandFailed { event, .. }
            | RobyError::EmissionFailed { event, .. }
            | RobyError::EmissionRejected { event, .. }
            | RobyError::EventHandlerError { event, .. } => owner_of(*event).or(Some(*event)),
            RobyError::MissionFailedError { mission } => Some(*mission),
            RobyError::PermanentTaskError { task } => Some(*task),
            RobyError::TaskEmergencyTermination { task } => Some(*task),
            RobyError::ArgumentResolutionFailed { task, .. } => Some(*task),
            RobyError::InternalError { task, .. } => Some(*task),
            _ => None,
        }
    }
}

/// A structured exception in flight through the hierarchy, carrying its point of origin and the
/// chain of tasks it has already been lifted through.
///
/// Merging two exceptions with the same origin and error "identity" (same variant + same
/// payload) at a given level is the caller's job (`propagation::propagate_exceptions`); this type
/// only carries the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionException {
    pub origin: PlanObjectId,
    pub error: RobyError,
    pub trace: Vec<PlanObjectId>,
}

impl ExecutionException {
    pub fn new(origin: PlanObjectId, error: RobyError) -> Self {
        ExecutionException {
            origin,
            error,
            trace: vec![origin],
        }
    }

    /// Forks this exception onto `parent`, extending the trace.
    pub fn lifted_to(&self, parent: PlanObjectId) -> Self {
        let mut trace = self.trace.clone();
        trace.push(parent);
        ExecutionException {
            origin: self.origin,
            error: self.error.clone(),
            trace,
        }
    }

    /// Two exceptions are the same "identity" if they share an origin and an equal error value;
    /// used to de-duplicate forks merged at a common ancestor.
    pub fn same_identity(&self, other: &ExecutionException) -> bool {
        self.origin == other.origin && self.error == other.error
    }
}

/// What a task- or plan-level exception handler decided to do with an `ExecutionException`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// This handler dealt with the exception; stop trying other handlers at this level.
    Handled,
    /// This handler does not apply; try the next one in the chain.
    Passed,
}
