// Licensed under the Apache License, Version 2.0.

//! `Task`: the per-task lifecycle state machine, its arguments, and its bound events.

use std::fmt;
use std::sync::Arc;

use fnv::FnvHashMap as HashMap;

use crate::error::RobyError;
use crate::event::Value;
use crate::ids::PlanObjectId;
use crate::object::PlanObjectState;

/// §4.5 Task state machine. Exactly one of these holds at a time (invariant 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Starting,
    Running,
    Finishing,
    FailedToStart,
    Finished { success: bool },
}

impl TaskState {
    pub fn is_running(self) -> bool {
        matches!(self, TaskState::Running | TaskState::Finishing)
    }

    pub fn is_started(self) -> bool {
        !matches!(self, TaskState::Pending)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, TaskState::Finished { .. } | TaskState::FailedToStart)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Starting => write!(f, "starting"),
            TaskState::Running => write!(f, "running"),
            TaskState::Finishing => write!(f, "finishing"),
            TaskState::FailedToStart => write!(f, "failed_to_start"),
            TaskState::Finished { success: true } => write!(f, "finished(success)"),
            TaskState::Finished { success: false } => write!(f, "finished(failed)"),
        }
    }
}

/// Outcome of resolving one delayed argument at `start.call`.
pub enum DelayedResult {
    Ready(Value),
    NotYet,
}

pub type DelayedResolver = Arc<dyn Fn(&Task) -> DelayedResult + Send + Sync>;

/// A single argument slot: either a ground value (single-assignment once non-delayed) or a
/// resolver invoked at `start.call`.
pub enum ArgumentSlot {
    Ground(Value),
    Delayed { resolver: DelayedResolver, weak: bool },
}

impl Clone for ArgumentSlot {
    fn clone(&self) -> Self {
        match self {
            ArgumentSlot::Ground(v) => ArgumentSlot::Ground(v.clone()),
            ArgumentSlot::Delayed { resolver, weak } => ArgumentSlot::Delayed {
                resolver: resolver.clone(),
                weak: *weak,
            },
        }
    }
}

/// Raised by `TaskArguments::set` when overwriting an already-ground value with a different one.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentAlreadySet {
    pub key: String,
}

impl fmt::Display for ArgumentAlreadySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "argument {:?} is already set to a ground value", self.key)
    }
}

impl std::error::Error for ArgumentAlreadySet {}

/// String-keyed argument mapping with single-assignment semantics for ground values.
#[derive(Default, Clone)]
pub struct TaskArguments {
    slots: HashMap<String, ArgumentSlot>,
}

impl TaskArguments {
    pub fn new() -> Self {
        TaskArguments::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self.slots.get(key)? {
            ArgumentSlot::Ground(v) => Some(v),
            ArgumentSlot::Delayed { .. } => None,
        }
    }

    pub fn is_delayed(&self, key: &str) -> bool {
        matches!(self.slots.get(key), Some(ArgumentSlot::Delayed { .. }))
    }

    /// Sets a ground value. Fails if the key already holds a *different* ground value; setting
    /// the same value again, or overwriting a still-delayed slot, is allowed.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Result<(), ArgumentAlreadySet> {
        let key = key.into();
        if let Some(ArgumentSlot::Ground(existing)) = self.slots.get(&key) {
            if *existing != value {
                return Err(ArgumentAlreadySet { key });
            }
            return Ok(());
        }
        self.slots.insert(key, ArgumentSlot::Ground(value));
        Ok(())
    }

    pub fn set_delayed(&mut self, key: impl Into<String>, resolver: DelayedResolver, weak: bool) {
        self.slots
            .insert(key.into(), ArgumentSlot::Delayed { resolver, weak });
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.slots.keys()
    }

    /// Resolves every delayed slot by invoking its resolver with `task` as context, replacing it
    /// with the ground value it returns. Returns the key of the first non-weak resolver that
    /// reported "no value yet"; the caller transitions the task to `FailedToStart` in that case.
    /// Weak resolvers that report "no value yet" are left delayed.
    pub fn freeze(&mut self, task: &Task) -> Option<String> {
        let pending: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, ArgumentSlot::Delayed { .. }))
            .map(|(k, _)| k.clone())
            .collect();
        for key in pending {
            let (resolver, weak) = match &self.slots[&key] {
                ArgumentSlot::Delayed { resolver, weak } => (resolver.clone(), *weak),
                ArgumentSlot::Ground(_) => continue,
            };
            match resolver(task) {
                DelayedResult::Ready(value) => {
                    self.slots.insert(key, ArgumentSlot::Ground(value));
                }
                DelayedResult::NotYet => {
                    if !weak {
                        return Some(key);
                    }
                }
            }
        }
        None
    }
}

pub type PollFn = Arc<dyn Fn(&Task) + Send + Sync>;

/// A stateful activity with a lifecycle and bound events.
///
/// Bound events themselves live in `Plan`'s flat event table (see `crate::event::EventGenerator`
/// and its `owner_task`/`symbol` fields); `bound_events` only indexes them by symbol.
pub struct Task {
    pub id: PlanObjectId,
    pub state_obj: PlanObjectState,
    pub model: String,
    pub arguments: TaskArguments,
    pub bound_events: HashMap<String, PlanObjectId>,
    pub state: TaskState,
    /// Outcome recorded by the first `success`/`failed`-flagged event to become pending this
    /// cycle (invariant: "first cause wins", mirrored from event unreachability). Consulted when
    /// `stop` actually emits to decide `Finished { success }`.
    pub pending_outcome: Option<bool>,
    /// The bound event whose pending transition set `pending_outcome`, recorded alongside it so a
    /// failure can be attributed to the event that actually caused it.
    pub pending_outcome_event: Option<PlanObjectId>,
    pub failure_reason: Option<RobyError>,
    pub poll_handlers: Vec<PollFn>,
    pub quarantined: bool,
}

/// The bound-event symbols every task carries (invariant: `start`, `stop`, `success`, `failed`,
/// `internal_error` always exist).
pub const START: &str = "start";
pub const STOP: &str = "stop";
pub const SUCCESS: &str = "success";
pub const FAILED: &str = "failed";
pub const INTERNAL_ERROR: &str = "internal_error";

impl Task {
    pub fn new(id: PlanObjectId, state_obj: PlanObjectState, model: impl Into<String>) -> Self {
        Task {
            id,
            state_obj,
            model: model.into(),
            arguments: TaskArguments::new(),
            bound_events: HashMap::default(),
            state: TaskState::Pending,
            pending_outcome: None,
            pending_outcome_event: None,
            failure_reason: None,
            poll_handlers: Vec::new(),
            quarantined: false,
        }
    }

    pub fn event_id(&self, symbol: &str) -> Option<PlanObjectId> {
        self.bound_events.get(symbol).copied()
    }

    pub fn start_event(&self) -> PlanObjectId {
        self.bound_events[START]
    }

    pub fn stop_event(&self) -> PlanObjectId {
        self.bound_events[STOP]
    }

    pub fn pending(&self) -> bool {
        self.state == TaskState::Pending
    }

    pub fn running(&self) -> bool {
        self.state.is_running()
    }

    pub fn finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn success(&self) -> Option<bool> {
        match self.state {
            TaskState::Finished { success } => Some(success),
            _ => None,
        }
    }

    pub fn can_finalize(&self) -> bool {
        !self.state.is_running()
    }

    pub fn poll(&mut self, f: PollFn) {
        self.poll_handlers.push(f);
    }

    pub fn run_poll_handlers(&self) {
        for handler in &self.poll_handlers {
            handler(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{IdAllocator, LOCAL_PEER};

    fn task() -> Task {
        let ids = IdAllocator::new();
        Task::new(ids.next(), PlanObjectState::new(LOCAL_PEER), "demo")
    }

    #[test]
    fn setting_same_ground_value_twice_is_allowed() {
        let mut args = TaskArguments::new();
        args.set("count", Value::Int(3)).unwrap();
        args.set("count", Value::Int(3)).unwrap();
        assert_eq!(args.get("count"), Some(&Value::Int(3)));
    }

    #[test]
    fn overwriting_a_ground_value_with_a_different_one_fails() {
        let mut args = TaskArguments::new();
        args.set("count", Value::Int(3)).unwrap();
        let err = args.set("count", Value::Int(4)).unwrap_err();
        assert_eq!(err.key, "count");
    }

    #[test]
    fn freeze_resolves_delayed_slots_in_place() {
        let mut args = TaskArguments::new();
        args.set_delayed(
            "path",
            Arc::new(|_task| DelayedResult::Ready(Value::Text("/tmp".to_string()))),
            false,
        );
        assert!(args.is_delayed("path"));

        let t = task();
        let stuck = args.freeze(&t);
        assert!(stuck.is_none());
        assert!(!args.is_delayed("path"));
        assert_eq!(args.get("path"), Some(&Value::Text("/tmp".to_string())));
    }

    #[test]
    fn freeze_reports_first_non_weak_unresolved_slot() {
        let mut args = TaskArguments::new();
        args.set_delayed("required", Arc::new(|_task| DelayedResult::NotYet), false);

        let t = task();
        let stuck = args.freeze(&t);
        assert_eq!(stuck.as_deref(), Some("required"));
        assert!(args.is_delayed("required"), "a non-weak slot that isn't ready stays delayed");
    }

    #[test]
    fn freeze_leaves_weak_unresolved_slots_delayed_without_failing() {
        let mut args = TaskArguments::new();
        args.set_delayed("optional", Arc::new(|_task| DelayedResult::NotYet), true);

        let t = task();
        let stuck = args.freeze(&t);
        assert!(stuck.is_none());
        assert!(args.is_delayed("optional"));
    }

    #[test]
    fn task_state_predicates_are_mutually_exclusive_by_construction() {
        let mut t = task();
        assert!(t.pending());
        assert!(!t.running());
        assert!(!t.finished());

        t.state = TaskState::Running;
        assert!(t.running());
        assert!(!t.pending());
        assert!(!t.can_finalize());

        t.state = TaskState::Finished { success: true };
        assert!(t.finished());
        assert_eq!(t.success(), Some(true));
        assert!(t.can_finalize());
    }
}
