// Licensed under the Apache License, Version 2.0.

//! §4.6: the propagation fixed-point engine. Owns the gather set, the delayed-event timeline,
//! source tracking, and the per-cycle exception buffer. Does not own the plan's objects or
//! relations; it is handed mutable access to them for the duration of a cycle by `Plan::cycle`.

use std::time::Instant;

use fnv::FnvHashMap as HashMap;

use crate::clock::Clock;
use crate::combinators::CombinatorState;
use crate::error::RobyError;
use crate::event::{Context, Event, EventRef};
use crate::ids::PlanObjectId;
use crate::relations::DelaySpec;

/// Whether a propagation record asks the target to run its command (`Call`, produced by
/// `signals`/direct `call`) or simply emit (`Forward`, produced by `forward_to`/direct `emit`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Call,
    Forward,
}

/// One contribution towards a future emission of `target`.
#[derive(Debug, Clone)]
pub struct PropagationRecord {
    pub kind: RecordKind,
    pub source: Option<EventRef>,
    pub target: PlanObjectId,
    pub context: Context,
}

/// A record whose delivery is scheduled for a future instant.
struct DelayedRecord {
    fire_at: Instant,
    record: PropagationRecord,
}

/// Accumulates contributions to each target generator during one propagation step, preserving
/// first-insertion order for the "prefer non-terminal targets, ties by insertion order" rule.
#[derive(Default)]
struct GatherSet {
    order: Vec<PlanObjectId>,
    by_target: HashMap<PlanObjectId, Vec<PropagationRecord>>,
}

impl GatherSet {
    fn push(&mut self, record: PropagationRecord) {
        let target = record.target;
        if !self.by_target.contains_key(&target) {
            self.order.push(target);
        }
        self.by_target.entry(target).or_default().push(record);
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Removes and returns all records for one target, preferring the first non-terminal target
    /// in insertion order, falling back to the first terminal one.
    fn pop_next(&mut self, is_terminal: impl Fn(PlanObjectId) -> bool) -> Option<(PlanObjectId, Vec<PropagationRecord>)> {
        if self.order.is_empty() {
            return None;
        }
        let pos = self
            .order
            .iter()
            .position(|id| !is_terminal(*id))
            .unwrap_or(0);
        let target = self.order.remove(pos);
        let records = self.by_target.remove(&target).unwrap_or_default();
        Some((target, records))
    }
}

/// Outcome of merging one target's contributions: the per-source-deduplicated records, folded
/// into a single call-or-forward decision.
pub(crate) struct MergedStep {
    pub(crate) kind: RecordKind,
    pub(crate) sources: Vec<EventRef>,
    pub(crate) context: Context,
}

pub(crate) fn merge_records(records: Vec<PropagationRecord>) -> Result<Option<MergedStep>, RobyError> {
    if records.is_empty() {
        return Ok(None);
    }
    // Collapse duplicates from the same source generator, keeping the latest contribution.
    let mut by_source: Vec<(Option<PlanObjectId>, PropagationRecord)> = Vec::new();
    for record in records {
        let source_gen = record.source.map(|s| s.generator);
        if let Some(slot) = by_source.iter_mut().find(|(g, _)| *g == source_gen) {
            slot.1 = record;
        } else {
            by_source.push((source_gen, record));
        }
    }

    let kind = by_source[0].1.kind;
    if by_source.iter().any(|(_, r)| r.kind != kind) {
        return Err(RobyError::PropagationError {
            message: "conflicting call/forward records for the same target in one step".into(),
        });
    }

    let mut sources = Vec::new();
    let mut context = Context::new();
    for (_, record) in by_source {
        if let Some(s) = record.source {
            sources.push(s);
        }
        context.extend(record.context);
    }

    Ok(Some(MergedStep {
        kind,
        sources,
        context,
    }))
}

/// The fixed-point propagation engine. One instance per `Plan`.
pub struct PropagationEngine {
    propagation_id: u64,
    gather: GatherSet,
    delayed: Vec<DelayedRecord>,
    active: bool,
    exceptions: Vec<RobyError>,
}

impl PropagationEngine {
    pub fn new() -> Self {
        PropagationEngine {
            propagation_id: 0,
            gather: GatherSet::default(),
            delayed: Vec::new(),
            active: false,
            exceptions: Vec::new(),
        }
    }

    pub fn propagation_id(&self) -> u64 {
        self.propagation_id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// True while a `call`/`emit` should enqueue into the gather set rather than run inline.
    pub fn is_gathering(&self) -> bool {
        self.active
    }

    pub fn enqueue(&mut self, record: PropagationRecord) {
        self.gather.push(record);
    }

    pub fn enqueue_delayed(&mut self, record: PropagationRecord, fire_at: Instant) {
        self.delayed.push(DelayedRecord { fire_at, record });
    }

    /// Resolves a record's optional delay against `now`. `None` means "deliver immediately";
    /// `Some` means "hold until that instant, as a delayed event".
    pub fn resolve_delay(spec: DelaySpec, now: Instant, wall_now: std::time::SystemTime) -> Instant {
        match spec {
            DelaySpec::After(d) => now + d,
            DelaySpec::At(t) => {
                let delta = t.duration_since(wall_now).unwrap_or_default();
                now + delta
            }
        }
    }

    /// Moves every past-due delayed record into the gather set. Called at the start of every
    /// cycle (§4.6 "Delayed events").
    pub fn drain_delayed(&mut self, clock: &dyn Clock) {
        let now = clock.now();
        let (due, still_pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|d| d.fire_at <= now);
        self.delayed = still_pending;
        for d in due {
            self.gather.push(d.record);
        }
    }

    pub fn push_exception(&mut self, error: RobyError) {
        self.exceptions.push(error);
    }

    pub fn take_exceptions(&mut self) -> Vec<RobyError> {
        std::mem::take(&mut self.exceptions)
    }

    /// Marks the start of a propagation-to-fixed-point run and bumps the propagation id. The
    /// caller (`Plan::run_propagation`) drives the actual step loop, since dispatching a step
    /// needs mutable access to the plan's tasks/events/relations alongside this engine, which a
    /// closure-based API here would fight the borrow checker over for no benefit.
    pub fn begin(&mut self) {
        self.active = true;
        self.propagation_id += 1;
    }

    pub fn end(&mut self) {
        self.active = false;
    }

    pub fn is_empty(&self) -> bool {
        self.gather.is_empty()
    }

    /// Pops the next target to dispatch, per the "prefer non-terminal, ties by insertion order"
    /// rule.
    pub fn pop_next(
        &mut self,
        is_terminal: impl Fn(PlanObjectId) -> bool,
    ) -> Option<(PlanObjectId, Vec<PropagationRecord>)> {
        self.gather.pop_next(is_terminal)
    }
}

impl Default for PropagationEngine {
    fn default() -> Self {
        PropagationEngine::new()
    }
}

/// Builds the `Event` record for one successful emission.
pub fn build_event(
    generator: PlanObjectId,
    propagation_id: u64,
    context: Context,
    sources: Vec<EventRef>,
    wall_time: std::time::SystemTime,
) -> Event {
    Event {
        generator,
        propagation_id,
        context,
        timestamp: wall_time,
        sources,
    }
}

/// Evaluates an `And` combinator's emission rule against its current sources, returning the
/// sources to attribute the emission to if satisfied.
pub fn and_check(
    state: &crate::combinators::AndState,
    current_sources: &[PlanObjectId],
    history_len: impl Fn(PlanObjectId) -> usize,
    last_event: impl Fn(PlanObjectId) -> Option<EventRef>,
) -> Option<Vec<EventRef>> {
    state.should_emit(current_sources, history_len, last_event)
}

/// Recursive ancestor query over an event's `sources` chain: every task whose bound event appears
/// anywhere in the transitive source closure (§4.6 "Source tracking": `task_sources`,
/// `all_task_sources`, `root_task_sources`).
pub fn all_task_sources(
    start: &[EventRef],
    event_by_ref: impl Fn(EventRef) -> Option<Event>,
    owner_of: impl Fn(PlanObjectId) -> Option<PlanObjectId>,
) -> Vec<PlanObjectId> {
    let mut seen_events = std::collections::HashSet::new();
    let mut seen_tasks = Vec::new();
    let mut stack: Vec<EventRef> = start.to_vec();
    while let Some(r) = stack.pop() {
        if !seen_events.insert(r) {
            continue;
        }
        if let Some(task) = owner_of(r.generator) {
            if !seen_tasks.contains(&task) {
                seen_tasks.push(task);
            }
        }
        if let Some(event) = event_by_ref(r) {
            stack.extend(event.sources);
        }
    }
    seen_tasks
}

/// Marker type used by `Plan` to remember which generators are combinators, so the cycle loop
/// knows to re-evaluate them after every step.
pub type CombinatorTable = HashMap<PlanObjectId, CombinatorState>;
