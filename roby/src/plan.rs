// Licensed under the Apache License, Version 2.0.

//! `Plan`: owns the tasks, events, and relations, and mediates every mutation through the hooks
//! and invariants of §4.2.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};

use relation_graph::{RelationGraphSet, RelationKind as RelationKindTrait};

use crate::clock::Clock;
use crate::combinators::{AndState, CombinatorState, FilterFn, FilterState, OrState, UntilState};
use crate::error::{ExecutionException, HandlerOutcome, RobyError};
use crate::event::{
    CallingDecision, CallingHookFn, CommandFn, Context, Event, EventGenerator, EventRef, HandlerFn,
    OnReplace, PreconditionFn, PropagationMode, TerminalFlag, UnreachableHandlerFn, UnreachableReason,
    Value,
};
use crate::ids::{IdAllocator, PeerId, PlanObjectId, LOCAL_PEER};
use crate::logging::{LogEvent, LogSink};
use crate::object::PlanObjectState;
use crate::propagation::{self, PropagationEngine, PropagationRecord, RecordKind};
use crate::relations::{DelaySpec, EdgeInfo, RelationKind};
use crate::task::{
    ArgumentAlreadySet, DelayedResolver, PollFn, Task, TaskState, FAILED, INTERNAL_ERROR, START,
    STOP, SUCCESS,
};

type ExceptionHandlerFn = Arc<dyn Fn(&ExecutionException) -> HandlerOutcome + Send + Sync>;

/// A handler chain entry registered at task or plan level: most-specific (last registered) first.
#[derive(Clone)]
struct ExceptionHandler {
    matcher: Arc<dyn Fn(&RobyError) -> bool + Send + Sync>,
    handle: ExceptionHandlerFn,
}

/// The executable plan: tasks, free events, relations, and the propagation engine that drives
/// them. One `Plan` belongs to exactly one `ExecutionEngine`.
pub struct Plan {
    ids: IdAllocator,
    local_peer: PeerId,
    executable: bool,
    tasks: HashMap<PlanObjectId, Task>,
    events: HashMap<PlanObjectId, EventGenerator>,
    relations: RelationGraphSet<RelationKind, PlanObjectId, EdgeInfo>,
    combinators: HashMap<PlanObjectId, CombinatorState>,
    missions: HashSet<PlanObjectId>,
    permanent: HashSet<PlanObjectId>,
    force_gc: HashSet<PlanObjectId>,
    quarantined: HashSet<PlanObjectId>,
    /// Mission/permanent tasks already reported to the plan-level exception pipeline via
    /// `mission_failure_checks`, so a failure that stays unhandled (not added to the kill set)
    /// is not re-raised on every subsequent cycle.
    reported_failures: HashSet<PlanObjectId>,
    /// `achieve_with` links: source -> the events that fail with `EmissionFailed` once the source
    /// becomes unreachable (§4.3). Checked once per propagation step; an entry is removed as soon
    /// as its source resolves, so it is consulted at most once.
    achieve_links: HashMap<PlanObjectId, Vec<PlanObjectId>>,
    task_handlers: HashMap<PlanObjectId, Vec<ExceptionHandler>>,
    plan_handlers: Vec<ExceptionHandler>,
    propagation: PropagationEngine,
    log: Box<dyn LogSink>,
    clock: Arc<dyn Clock>,
}

impl Plan {
    pub fn new(log: Box<dyn LogSink>, clock: Arc<dyn Clock>) -> Self {
        Plan {
            ids: IdAllocator::new(),
            local_peer: LOCAL_PEER,
            executable: true,
            tasks: HashMap::default(),
            events: HashMap::default(),
            relations: RelationGraphSet::new(RelationKind::all()),
            combinators: HashMap::default(),
            missions: HashSet::default(),
            permanent: HashSet::default(),
            force_gc: HashSet::default(),
            quarantined: HashSet::default(),
            reported_failures: HashSet::default(),
            achieve_links: HashMap::default(),
            task_handlers: HashMap::default(),
            plan_handlers: Vec::new(),
            propagation: PropagationEngine::new(),
            log,
            clock,
        }
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn executable(&self) -> bool {
        self.executable
    }

    pub fn set_executable(&mut self, value: bool) {
        self.executable = value;
    }

    // ---- registration -----------------------------------------------------------------------

    /// Registers a new task of the given model, wiring its five mandatory bound events
    /// (`start`, `stop`, `success`, `failed`, `internal_error`) and the default
    /// `success -> stop`, `failed -> stop`, `internal_error -> failed` forwardings.
    ///
    /// `start_command` and `stop_command`, if given, make those events controllable.
    pub fn register_task(
        &mut self,
        model: impl Into<String>,
        start_command: Option<CommandFn>,
        stop_command: Option<CommandFn>,
    ) -> PlanObjectId {
        let id = self.ids.next();
        let mut task = Task::new(id, PlanObjectState::new(self.local_peer), model);

        for (symbol, command) in [
            (START, start_command),
            (STOP, stop_command),
            (SUCCESS, None),
            (FAILED, None),
            (INTERNAL_ERROR, None),
        ] {
            let event_id = self.ids.next();
            let generator =
                EventGenerator::new_bound(event_id, PlanObjectState::new(self.local_peer), id, symbol, command);
            self.events.insert(event_id, generator);
            task.bound_events.insert(symbol.to_string(), event_id);
        }

        let success = task.bound_events[SUCCESS];
        let failed = task.bound_events[FAILED];
        let stop = task.bound_events[STOP];
        let internal_error = task.bound_events[INTERNAL_ERROR];

        self.tasks.insert(id, task);
        self.log.log(LogEvent::TaskAdded(id));

        // Default wiring: success/failed always forward to stop; internal_error forwards to
        // failed, so a task never needs a user-registered handler just to recover the default
        // S5 control flow.
        let _ = self.add_relation(RelationKind::Forwarding, success, stop, EdgeInfo::Plain);
        let _ = self.add_relation(RelationKind::Forwarding, failed, stop, EdgeInfo::Plain);
        let _ = self.add_relation(RelationKind::Forwarding, internal_error, failed, EdgeInfo::Plain);

        id
    }

    /// Registers a new free-standing event (not bound to any task).
    pub fn register_event(&mut self, controllable_command: Option<CommandFn>) -> PlanObjectId {
        let id = self.ids.next();
        let generator =
            EventGenerator::new_free(id, PlanObjectState::new(self.local_peer), controllable_command);
        self.events.insert(id, generator);
        self.log.log(LogEvent::EventAdded(id));
        id
    }

    /// Re-inserting a finalized id is rejected with `ReusingGarbage`; used by callers that keep
    /// their own id around across a plan's lifetime (e.g. test fixtures).
    pub fn check_not_garbage(&self, id: PlanObjectId) -> Result<(), RobyError> {
        let finalized = self
            .tasks
            .get(&id)
            .map(|t| t.state_obj.finalized)
            .or_else(|| self.events.get(&id).map(|e| e.state.finalized))
            .unwrap_or(false);
        if finalized {
            Err(RobyError::ReusingGarbage { object: id })
        } else {
            Ok(())
        }
    }

    pub fn task(&self, id: PlanObjectId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn task_mut(&mut self, id: PlanObjectId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn event(&self, id: PlanObjectId) -> Option<&EventGenerator> {
        self.events.get(&id)
    }

    pub fn event_mut(&mut self, id: PlanObjectId) -> Option<&mut EventGenerator> {
        self.events.get_mut(&id)
    }

    pub fn owner_task_of(&self, event: PlanObjectId) -> Option<PlanObjectId> {
        self.events.get(&event).and_then(|e| e.owner_task)
    }

    // ---- usefulness roots ---------------------------------------------------------------------

    pub fn add_mission(&mut self, task: PlanObjectId) {
        self.missions.insert(task);
    }

    pub fn unmark_mission(&mut self, task: PlanObjectId) {
        self.missions.remove(&task);
    }

    pub fn add_permanent(&mut self, object: PlanObjectId) {
        self.permanent.insert(object);
    }

    pub fn unmark_permanent(&mut self, object: PlanObjectId) {
        self.permanent.remove(&object);
    }

    pub fn add_force_gc(&mut self, task: PlanObjectId) {
        self.force_gc.insert(task);
    }

    pub fn is_mission(&self, id: PlanObjectId) -> bool {
        self.missions.contains(&id)
    }

    // ---- relations ------------------------------------------------------------------------

    /// Adds a relation edge, refusing edges that would cycle a DAG relation, and firing the
    /// adding/added hooks. This is the single path every higher-level wiring call
    /// (`signals`, `forward_to`, `Task` hierarchy attachment) goes through.
    pub fn add_relation(
        &mut self,
        kind: RelationKind,
        parent: PlanObjectId,
        child: PlanObjectId,
        info: EdgeInfo,
    ) -> Result<(), RobyError> {
        if self.is_garbage(parent) || self.is_garbage(child) {
            return Err(RobyError::ReusingGarbage {
                object: if self.is_garbage(parent) { parent } else { child },
            });
        }
        self.log.log(LogEvent::AddingEdge(kind, parent, child));
        self.relations
            .add_edge(kind, parent, child, info)
            .map_err(|_| RobyError::CycleFoundError { parent, child })?;
        self.log.log(LogEvent::AddedEdge(kind, parent, child));
        self.invalidate_terminal_flags_for(kind, parent, child);
        Ok(())
    }

    pub fn remove_relation(&mut self, kind: RelationKind, parent: PlanObjectId, child: PlanObjectId) {
        self.log.log(LogEvent::RemovingEdge(kind, parent, child));
        self.relations.remove_edge(kind, parent, child);
        self.log.log(LogEvent::RemovedEdge(kind, parent, child));
        self.invalidate_terminal_flags_for(kind, parent, child);
    }

    fn invalidate_terminal_flags_for(&self, kind: RelationKind, parent: PlanObjectId, child: PlanObjectId) {
        if matches!(kind, RelationKind::Signal | RelationKind::Forwarding) {
            if let Some(g) = self.events.get(&parent) {
                g.invalidate_terminal_flag();
            }
            if let Some(g) = self.events.get(&child) {
                g.invalidate_terminal_flag();
            }
        }
    }

    fn is_garbage(&self, id: PlanObjectId) -> bool {
        self.tasks
            .get(&id)
            .map(|t| t.state_obj.garbage)
            .or_else(|| self.events.get(&id).map(|e| e.state.garbage))
            .unwrap_or(false)
    }

    /// `a.signals(b)`: requires `b` to be controllable.
    pub fn signals(
        &mut self,
        source: PlanObjectId,
        target: PlanObjectId,
        delay: Option<DelaySpec>,
    ) -> Result<(), RobyError> {
        if !self.events.get(&target).map(|e| e.controllable()).unwrap_or(false) {
            return Err(RobyError::EventNotControlable { event: target });
        }
        let info = delay.map(EdgeInfo::Delayed).unwrap_or(EdgeInfo::Plain);
        self.add_relation(RelationKind::Signal, source, target, info)
    }

    /// `a.forward_to(b)`: no controllability requirement.
    pub fn forward_to(
        &mut self,
        source: PlanObjectId,
        target: PlanObjectId,
        delay: Option<DelaySpec>,
    ) -> Result<(), RobyError> {
        let info = delay.map(EdgeInfo::Delayed).unwrap_or(EdgeInfo::Plain);
        self.add_relation(RelationKind::Forwarding, source, target, info)
    }

    pub fn add_hierarchy(&mut self, parent: PlanObjectId, child: PlanObjectId) -> Result<(), RobyError> {
        self.add_relation(RelationKind::Hierarchy, parent, child, EdgeInfo::Plain)
    }

    /// `target.achieve_with(source)` (§4.3): a one-shot forwarding from `source` to `target`, plus
    /// a standing link checked every propagation step so that if `source` becomes unreachable
    /// before ever emitting, `target` fails with `EmissionFailed` instead of hanging forever.
    pub fn achieve_with(&mut self, target: PlanObjectId, source: PlanObjectId) -> Result<(), RobyError> {
        self.forward_to(source, target, None)?;
        self.achieve_links.entry(source).or_default().push(target);
        Ok(())
    }

    /// Checked once per propagation step (see `run_propagation`): resolves every `achieve_with`
    /// link whose source has gone unreachable, failing any not-yet-settled target with
    /// `EmissionFailed`. A source is consulted at most once, since `unreachable` never clears.
    fn step_achieve_links(&mut self) {
        let unreachable_sources: Vec<PlanObjectId> = self
            .achieve_links
            .keys()
            .copied()
            .filter(|source| self.events.get(source).map(|g| g.unreachable()).unwrap_or(false))
            .collect();
        let ready: Vec<(PlanObjectId, Vec<PlanObjectId>)> = unreachable_sources
            .into_iter()
            .filter_map(|source| self.achieve_links.remove(&source).map(|targets| (source, targets)))
            .collect();
        for (source, targets) in ready {
            for target in targets {
                let settled = self
                    .events
                    .get(&target)
                    .map(|g| g.happened() || g.unreachable())
                    .unwrap_or(true);
                if settled {
                    continue;
                }
                let error = RobyError::EmissionFailed {
                    event: target,
                    message: format!("achieve_with source {source} became unreachable"),
                };
                self.propagation.push_exception(error.clone());
                self.mark_unreachable(target, UnreachableReason::Error(error));
            }
        }
    }

    // ---- replacement (§4.5) -----------------------------------------------------------------

    fn check_live_task(&self, id: PlanObjectId) -> Result<(), RobyError> {
        if self.tasks.contains_key(&id) && !self.is_garbage(id) {
            Ok(())
        } else {
            Err(RobyError::ReusingGarbage { object: id })
        }
    }

    /// Replaces `original` with `replacement`: every relation edge incident on `original` moves to
    /// `replacement` (copy-on-replace kinds keep the original edge too, per
    /// `RelationKind::is_copy_on_replace`), each of `original`'s bound events transfers its own
    /// incident edges onto `replacement`'s same-symbol event the same way, and handlers flagged
    /// `on_replace: Copy` are duplicated onto the replacement event. `replace_by(other);
    /// replace_by(self)` restores every non-copy-on-replace edge, since the second call moves them
    /// straight back.
    pub fn replace_task_by(&mut self, original: PlanObjectId, replacement: PlanObjectId) -> Result<(), RobyError> {
        self.check_live_task(original)?;
        self.check_live_task(replacement)?;
        self.transfer_incident_edges(original, replacement, None);
        self.replace_bound_events(original, replacement, None);
        self.log.log(LogEvent::Replaced(original, replacement));
        Ok(())
    }

    /// As `replace_task_by`, but restricted to edges crossing the boundary of `original`'s own
    /// Hierarchy subtree: an edge whose other endpoint is also inside that subtree stays on
    /// `original` (it is internal wiring of the subplan being replaced, not a connection to the
    /// rest of the plan that needs to follow the replacement).
    pub fn replace_subplan_by(&mut self, original: PlanObjectId, replacement: PlanObjectId) -> Result<(), RobyError> {
        self.check_live_task(original)?;
        self.check_live_task(replacement)?;
        let subtree = self.relations.graph(RelationKind::Hierarchy).generated_subgraph(vec![original]);
        self.transfer_incident_edges(original, replacement, Some(&subtree));
        let subtree_events: HashSet<PlanObjectId> = subtree
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .flat_map(|t| t.bound_events.values().copied())
            .collect();
        self.replace_bound_events(original, replacement, Some(&subtree_events));
        self.log.log(LogEvent::Replaced(original, replacement));
        Ok(())
    }

    /// Moves every bound event of `original` onto its same-symbol counterpart on `replacement`:
    /// transfers the event's incident edges (see `transfer_incident_edges`) and copies its
    /// `on_replace: Copy`-flagged handlers. An event with no same-symbol counterpart on
    /// `replacement` is left untouched.
    fn replace_bound_events(
        &mut self,
        original: PlanObjectId,
        replacement: PlanObjectId,
        keep_inside: Option<&HashSet<PlanObjectId>>,
    ) {
        let Some(orig_task) = self.tasks.get(&original) else { return };
        let Some(repl_task) = self.tasks.get(&replacement) else { return };
        let pairs: Vec<(PlanObjectId, PlanObjectId)> = orig_task
            .bound_events
            .iter()
            .filter_map(|(symbol, &from_id)| repl_task.event_id(symbol).map(|to_id| (from_id, to_id)))
            .collect();
        for (from_id, to_id) in pairs {
            self.transfer_incident_edges(from_id, to_id, keep_inside);
            self.copy_replaceable_handlers(from_id, to_id);
        }
    }

    /// Transfers every relation edge touching `from` onto `to`, across every registered relation
    /// kind. `keep_inside`, if given, names a vertex set whose members keep their edge to `from`
    /// unmoved (used by `replace_subplan_by` to spare edges internal to the subtree). Kinds
    /// flagged `is_copy_on_replace` keep the original edge in addition to installing it on `to`.
    fn transfer_incident_edges(
        &mut self,
        from: PlanObjectId,
        to: PlanObjectId,
        keep_inside: Option<&HashSet<PlanObjectId>>,
    ) {
        for kind in RelationKind::all() {
            let copy_on_replace = RelationKindTrait::is_copy_on_replace(kind);
            let incoming: Vec<(PlanObjectId, EdgeInfo)> = self
                .relations
                .graph(kind)
                .parents(from)
                .filter(|(p, _)| *p != to && !keep_inside.is_some_and(|s| s.contains(p)))
                .map(|(p, i)| (p, i.clone()))
                .collect();
            let outgoing: Vec<(PlanObjectId, EdgeInfo)> = self
                .relations
                .graph(kind)
                .children(from)
                .filter(|(c, _)| *c != to && !keep_inside.is_some_and(|s| s.contains(c)))
                .map(|(c, i)| (c, i.clone()))
                .collect();
            for (p, info) in incoming {
                let _ = self.add_relation(kind, p, to, info);
                if !copy_on_replace {
                    self.remove_relation(kind, p, from);
                }
            }
            for (c, info) in outgoing {
                let _ = self.add_relation(kind, to, c, info);
                if !copy_on_replace {
                    self.remove_relation(kind, from, c);
                }
            }
        }
    }

    /// Transfers `on_replace: Copy`-flagged handlers from `from_id`'s event to `to_id`'s, via
    /// remove/mutate/reinsert so the borrow checker never sees two live borrows of `self.events`.
    fn copy_replaceable_handlers(&mut self, from_id: PlanObjectId, to_id: PlanObjectId) {
        let Some(from_gen) = self.events.remove(&from_id) else { return };
        if let Some(to_gen) = self.events.get_mut(&to_id) {
            from_gen.copy_replaceable_handlers_to(to_gen);
        }
        self.events.insert(from_id, from_gen);
    }

    // ---- terminal flag ----------------------------------------------------------------------

    /// Recomputes (if not cached) and returns whether `event`'s Signal/Forwarding closure reaches
    /// its owning task's `stop`, and through which branch.
    pub fn terminal_flag(&self, event: PlanObjectId) -> TerminalFlag {
        let Some(g) = self.events.get(&event) else {
            return TerminalFlag::None;
        };
        if let Some(cached) = g.terminal_flag() {
            return cached;
        }
        let Some(task) = g.owner_task.and_then(|t| self.tasks.get(&t)) else {
            g.cache_terminal_flag(TerminalFlag::None);
            return TerminalFlag::None;
        };
        let stop = task.stop_event();
        let success = task.event_id(SUCCESS);
        let failed = task.event_id(FAILED);

        let flag = if event == stop {
            TerminalFlag::Terminal
        } else {
            let mut reachable = self.relations.graph(RelationKind::Forwarding).generated_subgraph(vec![event]);
            reachable.extend(self.relations.graph(RelationKind::Signal).generated_subgraph(vec![event]));
            if !reachable.contains(&stop) {
                TerminalFlag::None
            } else if success.is_some_and(|s| s == event || reachable.contains(&s)) {
                TerminalFlag::Success
            } else if failed.is_some_and(|f| f == event || reachable.contains(&f)) {
                TerminalFlag::Failure
            } else {
                TerminalFlag::Terminal
            }
        };
        g.cache_terminal_flag(flag);
        flag
    }

    // ---- call / emit (assumes caller already checked engine-thread identity) -----------------

    fn validate_target(&self, event: PlanObjectId) -> Result<(), RobyError> {
        let g = self.events.get(&event).ok_or(RobyError::EventNotExecutable { event })?;
        if !g.state.executable(self.executable) {
            return Err(RobyError::EventNotExecutable { event });
        }
        if g.unreachable() {
            return Err(RobyError::UnreachableEvent {
                event,
                reason: None,
            });
        }
        self.validate_task_state(event)?;
        Ok(())
    }

    /// §4.5 state-machine emission rejections: `start` is only accepted while the task is
    /// `Pending`; any other bound event that does not itself reach `stop` (a "non-terminal" bound
    /// event, by `terminal_flag`) is only accepted while the task is `Running`/`Finishing`.
    /// Terminal events (`success`/`failed`/`stop` and anything forwarding into them) and
    /// free-standing events carry no such restriction.
    fn validate_task_state(&self, event: PlanObjectId) -> Result<(), RobyError> {
        let Some(owner) = self.owner_task_of(event) else {
            return Ok(());
        };
        let Some(task) = self.tasks.get(&owner) else {
            return Ok(());
        };
        if event == task.start_event() {
            if task.state != TaskState::Pending {
                return Err(RobyError::EmissionRejected {
                    event,
                    message: format!("start rejected: task {owner} is {}", task.state),
                });
            }
            return Ok(());
        }
        if !self.terminal_flag(event).is_terminal() && !task.state.is_running() {
            return Err(RobyError::EmissionRejected {
                event,
                message: format!("non-terminal event rejected: task {owner} is {}", task.state),
            });
        }
        Ok(())
    }

    pub fn call(&mut self, event: PlanObjectId, context: Context) -> Result<(), RobyError> {
        self.validate_target(event)?;
        if !self.events[&event].controllable() {
            return Err(RobyError::EventNotControlable { event });
        }
        self.root_propagate(event, RecordKind::Call, None, context)
    }

    pub fn emit(&mut self, event: PlanObjectId, context: Context) -> Result<(), RobyError> {
        self.validate_target(event)?;
        self.root_propagate(event, RecordKind::Forward, None, context)
    }

    fn root_propagate(
        &mut self,
        target: PlanObjectId,
        kind: RecordKind,
        source: Option<EventRef>,
        context: Context,
    ) -> Result<(), RobyError> {
        self.gather(target, kind, source, context);
        if !self.propagation.is_gathering() {
            self.run_propagation();
            if let Some(UnreachableReason::Error(e)) =
                self.events.get(&target).and_then(|g| g.unreachable_reason())
            {
                return Err(e.clone());
            }
        }
        Ok(())
    }

    /// Enqueues one contribution, applying the `pending` flag flip and the Running->Finishing
    /// task transition a newly-pending terminal event triggers. Applies uniformly to `Call` and
    /// `Forward` records: a task's `success`/`failed` are ordinarily driven by `emit` (forward),
    /// not `call`, since they carry no command of their own.
    fn gather(&mut self, target: PlanObjectId, kind: RecordKind, source: Option<EventRef>, context: Context) {
        if let Some(g) = self.events.get_mut(&target) {
            if !g.pending {
                g.pending = true;
                self.on_newly_pending(target);
            }
        }
        self.propagation.enqueue(PropagationRecord {
            kind,
            source,
            target,
            context,
        });
    }

    fn on_newly_pending(&mut self, event: PlanObjectId) {
        let Some(owner) = self.events.get(&event).and_then(|g| g.owner_task) else {
            return;
        };
        if event == self.tasks[&owner].start_event() {
            if self.tasks[&owner].state == TaskState::Pending {
                self.tasks.get_mut(&owner).unwrap().state = TaskState::Starting;
            }
            return;
        }
        let flag = self.terminal_flag(event);
        if flag.is_terminal() {
            let task = self.tasks.get_mut(&owner).unwrap();
            if task.state == TaskState::Running {
                task.state = TaskState::Finishing;
            }
            if task.pending_outcome.is_none() {
                match flag {
                    TerminalFlag::Success => {
                        task.pending_outcome = Some(true);
                        task.pending_outcome_event = Some(event);
                    }
                    TerminalFlag::Failure => {
                        task.pending_outcome = Some(false);
                        task.pending_outcome_event = Some(event);
                    }
                    _ => {}
                }
            }
        }
    }

    fn is_terminal_target(&self, id: PlanObjectId) -> bool {
        self.terminal_flag(id).is_terminal()
    }

    /// Runs the gather set to a fixed point (§4.6 "Step function").
    pub fn run_propagation(&mut self) {
        self.propagation.begin();
        loop {
            let next = self
                .propagation
                .pop_next(|id| self.is_terminal_target(id));
            let Some((target, records)) = next else {
                break;
            };
            match propagation::merge_records(records) {
                Ok(Some(merged)) => self.dispatch_step(target, merged.kind, merged.sources, merged.context),
                Ok(None) => {}
                Err(e) => self.propagation.push_exception(e),
            }
            self.step_combinators();
            self.step_achieve_links();
        }
        self.propagation.end();
    }

    fn dispatch_step(&mut self, target: PlanObjectId, kind: RecordKind, sources: Vec<EventRef>, context: Context) {
        match kind {
            RecordKind::Call => self.dispatch_call(target, sources, context),
            RecordKind::Forward => self.dispatch_emit(target, sources, context),
        }
    }

    fn dispatch_call(&mut self, target: PlanObjectId, sources: Vec<EventRef>, context: Context) {
        let (command, hooks) = match self.events.get(&target) {
            Some(g) => (g.command.clone(), g.calling_hooks.clone()),
            None => return,
        };
        for hook in &hooks {
            match hook(&context) {
                CallingDecision::Proceed => {}
                CallingDecision::Postpone { other, reason } => {
                    self.postpone_call(target, other, reason);
                    return;
                }
                CallingDecision::Cancel { reason } => {
                    self.cancel_call(target, reason);
                    return;
                }
            }
        }
        let Some(command) = command else {
            self.propagation
                .push_exception(RobyError::EventNotControlable { event: target });
            return;
        };
        let result = catch_unwind(AssertUnwindSafe(|| command(&context)));
        match result {
            Ok(Ok(Some(emitted_context))) => self.dispatch_emit(target, sources, emitted_context),
            Ok(Ok(None)) => {}
            Ok(Err(message)) => self.fail_command(target, sources, message),
            Err(_) => self.fail_command(target, sources, "command panicked".to_string()),
        }
    }

    /// A `calling` hook postponed `target`'s call until `other` emits (§4.6 "Cancellation"): drop
    /// the pending flag so `target` is inert until re-triggered, and wire a Signal edge so the
    /// call is re-attempted the moment `other` emits.
    fn postpone_call(&mut self, target: PlanObjectId, other: PlanObjectId, reason: String) {
        if let Some(g) = self.events.get_mut(&target) {
            g.pending = false;
        }
        log::debug!("call of {target} postponed until {other}: {reason}");
        let _ = self.add_relation(RelationKind::Signal, other, target, EdgeInfo::Plain);
    }

    /// A `calling` hook cancelled `target`'s call outright: the call never reaches its command,
    /// and `target` fails with `EmissionFailed` instead of emitting.
    fn cancel_call(&mut self, target: PlanObjectId, reason: String) {
        if let Some(g) = self.events.get_mut(&target) {
            g.pending = false;
        }
        let error = RobyError::EmissionFailed {
            event: target,
            message: reason,
        };
        self.propagation.push_exception(error.clone());
        self.mark_unreachable(target, UnreachableReason::Error(error));
    }

    fn fail_command(&mut self, target: PlanObjectId, _sources: Vec<EventRef>, message: String) {
        let error = RobyError::CommandFailed {
            event: target,
            message,
        };
        if let Some(owner) = self.events.get(&target).and_then(|g| g.owner_task) {
            if self.tasks[&owner].start_event() == target {
                if let Some(task) = self.tasks.get_mut(&owner) {
                    task.state = TaskState::FailedToStart;
                    task.failure_reason = Some(error.clone());
                }
            }
        }
        self.propagation.push_exception(error);
    }

    fn dispatch_emit(&mut self, target: PlanObjectId, sources: Vec<EventRef>, context: Context) {
        let Some(g) = self.events.get_mut(&target) else {
            return;
        };
        let propagation_id = self.propagation.propagation_id();
        let event = propagation::build_event(target, propagation_id, context, sources, self.clock.wall_time());
        g.record_emission(event.clone());
        self.log.log(LogEvent::Emitted(target, propagation_id));

        let handler_result = catch_unwind(AssertUnwindSafe(|| {
            if let Some(g) = self.events.get_mut(&target) {
                g.fire_handlers(&event);
            }
        }));
        if handler_result.is_err() {
            self.propagation.push_exception(RobyError::EventHandlerError {
                event: target,
                message: "handler panicked".to_string(),
            });
        }

        self.apply_task_transition(target, &event);
        self.enqueue_outgoing(target, &event);
        self.reset_combinators_on_emit(target);
    }

    fn apply_task_transition(&mut self, target: PlanObjectId, _event: &Event) {
        let Some(owner) = self.events.get(&target).and_then(|g| g.owner_task) else {
            return;
        };
        let task = match self.tasks.get_mut(&owner) {
            Some(t) => t,
            None => return,
        };
        if target == task.start_event() && task.state == TaskState::Starting {
            task.state = TaskState::Running;
            return;
        }
        if target == task.stop_event() {
            // `pending_outcome` was recorded by `on_newly_pending` when the first success/failed
            // became pending; a task with neither is assumed to have succeeded (invariant: a task
            // that never fails defaults to success).
            let success = task.pending_outcome.unwrap_or(true);
            if !success && task.failure_reason.is_none() {
                // Neutral, task-local cause: which bound event actually drove the failure. Whether
                // this also constitutes a mission/permanent-task failure for exception routing
                // purposes is decided separately, in `mission_failure_checks` (§4.7), not here —
                // a plain child failing is not itself a mission failure.
                task.failure_reason = Some(RobyError::InternalError {
                    task: owner,
                    message: format!(
                        "task stopped via its failure branch ({})",
                        task.pending_outcome_event.map(|e| e.to_string()).unwrap_or_else(|| target.to_string())
                    ),
                });
            }
            task.state = TaskState::Finished { success };
        }
        if Some(target) == task.event_id(INTERNAL_ERROR) {
            self.propagation.push_exception(RobyError::InternalError {
                task: owner,
                message: "internal_error emitted".to_string(),
            });
        }
    }

    fn enqueue_outgoing(&mut self, target: PlanObjectId, event: &Event) {
        let event_ref = event.event_ref();
        let now = self.clock.now();
        let wall_now = self.clock.wall_time();

        let signal_edges: Vec<(PlanObjectId, EdgeInfo)> = self
            .relations
            .graph(RelationKind::Signal)
            .children(target)
            .map(|(c, i)| (c, i.clone()))
            .collect();
        for (dest, info) in signal_edges {
            self.dispatch_outgoing(RecordKind::Call, dest, event_ref, event.context.clone(), info, now, wall_now);
        }

        let forward_edges: Vec<(PlanObjectId, EdgeInfo)> = self
            .relations
            .graph(RelationKind::Forwarding)
            .children(target)
            .map(|(c, i)| (c, i.clone()))
            .collect();
        for (dest, info) in forward_edges {
            if !self.until_allows(dest) {
                continue;
            }
            self.dispatch_outgoing(RecordKind::Forward, dest, event_ref, event.context.clone(), info, now, wall_now);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_outgoing(
        &mut self,
        kind: RecordKind,
        dest: PlanObjectId,
        source: EventRef,
        context: Context,
        info: EdgeInfo,
        now: std::time::Instant,
        wall_now: std::time::SystemTime,
    ) {
        match info.delay() {
            None => self.gather(dest, kind, Some(source), context),
            Some(spec) => {
                let fire_at = PropagationEngine::resolve_delay(spec, now, wall_now);
                if fire_at <= now {
                    self.gather(dest, kind, Some(source), context);
                } else {
                    let record = PropagationRecord {
                        kind,
                        source: Some(source),
                        target: dest,
                        context,
                    };
                    self.propagation.enqueue_delayed(record, fire_at);
                }
            }
        }
    }

    fn until_allows(&self, dest: PlanObjectId) -> bool {
        match self.combinators.get(&dest) {
            Some(CombinatorState::Until(state)) => state.active,
            _ => true,
        }
    }

    // ---- combinators --------------------------------------------------------------------------

    // And/Or sources are tracked as plain data on the combinator's state rather than as Signal
    // edges: a Signal edge is dispatched by `enqueue_outgoing` as a `Call` record, which would
    // have every source emission try to invoke the combinator's (nonexistent) command. The
    // combinator step loop below reads each source's history directly instead.
    pub fn new_and(&mut self, sources: &[PlanObjectId]) -> PlanObjectId {
        let id = self.register_event(None);
        self.combinators
            .insert(id, CombinatorState::And(AndState::new(sources.iter().copied())));
        id
    }

    pub fn new_or(&mut self, sources: &[PlanObjectId]) -> PlanObjectId {
        let id = self.register_event(None);
        self.combinators
            .insert(id, CombinatorState::Or(OrState::new(sources.iter().copied())));
        id
    }

    pub fn new_until(&mut self, source: PlanObjectId, limit: PlanObjectId) -> PlanObjectId {
        let id = self.register_event(None);
        let _ = self.add_relation(RelationKind::Forwarding, source, id, EdgeInfo::Plain);
        self.combinators
            .insert(id, CombinatorState::Until(UntilState::new(source, limit)));
        id
    }

    /// `source.filter(transform)` (§4.3): a new generator that re-emits every new emission of
    /// `source` with `transform` applied to its context.
    pub fn filter(&mut self, source: PlanObjectId, transform: FilterFn) -> PlanObjectId {
        let id = self.register_event(None);
        let baseline = self.events.get(&source).map(|g| g.history.len()).unwrap_or(0);
        self.combinators
            .insert(id, CombinatorState::Filter(FilterState::new(source, transform, baseline)));
        id
    }

    pub fn reset_combinator(&mut self, id: PlanObjectId) {
        match self.combinators.get_mut(&id) {
            Some(CombinatorState::And(state)) => {
                let history_len =
                    |s: PlanObjectId| self.events.get(&s).map(|g| g.history.len()).unwrap_or(0);
                state.reset(history_len);
            }
            Some(CombinatorState::Or(state)) => state.reset(),
            Some(CombinatorState::Until(state)) => state.reactivate(),
            Some(CombinatorState::Filter(_)) | None => {}
        }
    }

    /// `target` just emitted: if it is the `limit` of some registered `until`, deactivate that
    /// combinator and sever its forwarding edge so it never refires.
    fn reset_combinators_on_emit(&mut self, target: PlanObjectId) {
        let matching: Vec<PlanObjectId> = self
            .combinators
            .iter()
            .filter_map(|(id, state)| match state {
                CombinatorState::Until(u) if u.limit == target => Some(*id),
                _ => None,
            })
            .collect();
        for until_id in matching {
            let source = match self.combinators.get_mut(&until_id) {
                Some(CombinatorState::Until(u)) => {
                    u.deactivate();
                    u.source
                }
                _ => continue,
            };
            self.remove_relation(RelationKind::Forwarding, source, until_id);
        }
    }

    /// Evaluates every registered combinator after a step, enqueuing emissions/unreachability as
    /// needed. This is what turns a combinator's tracked source list into And/Or semantics.
    fn step_combinators(&mut self) {
        let ids: Vec<PlanObjectId> = self.combinators.keys().copied().collect();
        for id in ids {
            self.step_one_combinator(id);
        }
    }

    fn step_one_combinator(&mut self, id: PlanObjectId) {
        let current_sources: Vec<PlanObjectId> = match self.combinators.get(&id) {
            Some(CombinatorState::And(state)) => state.sources().collect(),
            Some(CombinatorState::Or(state)) => state.sources.clone(),
            Some(CombinatorState::Until(_)) | Some(CombinatorState::Filter(_)) | None => Vec::new(),
        };

        match self.combinators.get(&id) {
            Some(CombinatorState::And(state)) => {
                if self.events.get(&id).map(|g| g.happened).unwrap_or(true) {
                    return;
                }
                let history_len =
                    |s: PlanObjectId| self.events.get(&s).map(|g| g.history.len()).unwrap_or(0);
                let last_event = |s: PlanObjectId| {
                    self.events
                        .get(&s)
                        .and_then(|g| g.last_event())
                        .map(|e| e.event_ref())
                };
                if let Some(sources) = propagation::and_check(state, &current_sources, history_len, last_event) {
                    let context = sources
                        .iter()
                        .filter_map(|r| {
                            self.events
                                .get(&r.generator)
                                .and_then(|g| g.last_event())
                                .map(|e| e.context.clone())
                        })
                        .flatten()
                        .collect::<Vec<Value>>();
                    for source in sources {
                        self.gather(id, RecordKind::Forward, Some(source), context.clone());
                    }
                    return;
                }
                for &source in &current_sources {
                    let len = self.events.get(&source).map(|g| g.history.len()).unwrap_or(0);
                    let unreachable = self.events.get(&source).map(|g| g.unreachable()).unwrap_or(false);
                    if unreachable {
                        if let Some(CombinatorState::And(state)) = self.combinators.get(&id) {
                            if state.dooms_on_unreachable(source, len) {
                                self.mark_unreachable(id, UnreachableReason::Event(EventRef {
                                    generator: source,
                                    propagation_id: self.propagation.propagation_id(),
                                }));
                                break;
                            }
                        }
                    }
                }
            }
            Some(CombinatorState::Or(state)) => {
                if state.fired || self.events.get(&id).map(|g| g.happened).unwrap_or(true) {
                    return;
                }
                let mut emit_from = None;
                for &source in &current_sources {
                    if let Some(e) = self.events.get(&source).and_then(|g| g.last_event()) {
                        emit_from = Some(e.event_ref());
                        break;
                    }
                }
                if let Some(source_ref) = emit_from {
                    if let Some(CombinatorState::Or(state)) = self.combinators.get_mut(&id) {
                        state.fired = true;
                    }
                    let context = self
                        .events
                        .get(&source_ref.generator)
                        .and_then(|g| g.last_event())
                        .map(|e| e.context.clone())
                        .unwrap_or_default();
                    self.gather(id, RecordKind::Forward, Some(source_ref), context);
                    return;
                }
                let all_unreachable = !current_sources.is_empty()
                    && current_sources
                        .iter()
                        .all(|s| self.events.get(s).map(|g| g.unreachable()).unwrap_or(false));
                if all_unreachable {
                    let first_cause = current_sources
                        .iter()
                        .find_map(|s| self.events.get(s).and_then(|g| g.unreachable_reason().cloned()));
                    if let Some(reason) = first_cause {
                        self.mark_unreachable(id, reason);
                    }
                }
            }
            Some(CombinatorState::Filter(state)) => {
                let source = state.source;
                let transform = state.transform.clone();
                let baseline = state.baseline;
                let history_len = self.events.get(&source).map(|g| g.history.len()).unwrap_or(0);
                if history_len <= baseline {
                    return;
                }
                let Some(event) = self.events.get(&source).and_then(|g| g.last_event()).cloned() else {
                    return;
                };
                let transformed = transform(&event.context);
                if let Some(CombinatorState::Filter(s)) = self.combinators.get_mut(&id) {
                    s.baseline = history_len;
                }
                self.gather(id, RecordKind::Forward, Some(event.event_ref()), transformed);
            }
            Some(CombinatorState::Until(_)) | None => {}
        }
    }

    fn mark_unreachable(&mut self, id: PlanObjectId, reason: UnreachableReason) {
        if let Some(g) = self.events.get_mut(&id) {
            if g.mark_unreachable(reason) {
                g.fire_unreachable_handlers();
            }
        }
    }

    // ---- handlers -----------------------------------------------------------------------------

    pub fn on(&mut self, event: PlanObjectId, f: HandlerFn, once: bool, on_replace: OnReplace) {
        if let Some(g) = self.events.get_mut(&event) {
            g.on(f, once, on_replace);
        }
    }

    pub fn if_unreachable(
        &mut self,
        event: PlanObjectId,
        f: UnreachableHandlerFn,
        cancel_at_emission: bool,
        on_replace: OnReplace,
    ) {
        if let Some(g) = self.events.get_mut(&event) {
            g.if_unreachable(f, cancel_at_emission, on_replace);
        }
    }

    pub fn add_precondition(&mut self, event: PlanObjectId, f: PreconditionFn) {
        if let Some(g) = self.events.get_mut(&event) {
            g.preconditions.push(f);
        }
    }

    /// Registers a `calling` hook (§4.3/§4.6 "Cancellation"): consulted in registration order
    /// before a controllable command runs, with the power to `postpone` or `cancel` the call.
    pub fn calling(&mut self, event: PlanObjectId, f: CallingHookFn) {
        if let Some(g) = self.events.get_mut(&event) {
            g.calling(f);
        }
    }

    pub fn poll(&mut self, task: PlanObjectId, f: PollFn) {
        if let Some(t) = self.tasks.get_mut(&task) {
            t.poll(f);
        }
    }

    pub fn set_argument(&mut self, task: PlanObjectId, key: impl Into<String>, value: Value) -> Result<(), ArgumentAlreadySet> {
        self.tasks
            .get_mut(&task)
            .map(|t| t.arguments.set(key, value))
            .unwrap_or(Ok(()))
    }

    pub fn set_delayed_argument(
        &mut self,
        task: PlanObjectId,
        key: impl Into<String>,
        resolver: DelayedResolver,
        weak: bool,
    ) {
        if let Some(t) = self.tasks.get_mut(&task) {
            t.arguments.set_delayed(key, resolver, weak);
        }
    }

    pub fn on_task_exception(
        &mut self,
        task: PlanObjectId,
        matcher: Arc<dyn Fn(&RobyError) -> bool + Send + Sync>,
        handle: ExceptionHandlerFn,
    ) {
        self.task_handlers
            .entry(task)
            .or_default()
            .push(ExceptionHandler { matcher, handle });
    }

    pub fn on_plan_exception(
        &mut self,
        matcher: Arc<dyn Fn(&RobyError) -> bool + Send + Sync>,
        handle: ExceptionHandlerFn,
    ) {
        self.plan_handlers.push(ExceptionHandler { matcher, handle });
    }

    // ---- exception propagation (§4.7) ---------------------------------------------------------

    /// Structure check run once per cycle, after propagation: mints `MissionFailedError`/
    /// `PermanentTaskError` for every mission/permanent task that just reached `Finished {
    /// success: false }`, so S6 ("M.failed emits -> MissionFailedError injected into the
    /// plan-level pipeline in the same cycle") actually happens. Each task is reported at most
    /// once until it is finalized (or re-started), so an error a handler chooses not to kill the
    /// task for is not re-raised on every subsequent cycle.
    pub fn mission_failure_checks(&mut self) -> Vec<RobyError> {
        let mut errors = Vec::new();
        for (&id, task) in self.tasks.iter() {
            if !matches!(task.state, TaskState::Finished { success: false }) {
                continue;
            }
            if self.reported_failures.contains(&id) {
                continue;
            }
            if self.missions.contains(&id) {
                errors.push(RobyError::MissionFailedError { mission: id });
            } else if self.permanent.contains(&id) {
                errors.push(RobyError::PermanentTaskError { task: id });
            } else {
                continue;
            }
            self.reported_failures.insert(id);
        }
        errors
    }

    /// Routes a batch of structural/fatal errors up the Hierarchy, returning those still
    /// unhandled after plan-level handlers run (the "true fatal" set).
    pub fn propagate_exceptions(&mut self, errors: Vec<RobyError>) -> Vec<ExecutionException> {
        let owner_of = |id: PlanObjectId| self.owner_task_of(id);
        let mut forest: Vec<ExecutionException> = errors
            .into_iter()
            .filter_map(|e| e.origin_task(owner_of).map(|origin| ExecutionException::new(origin, e)))
            .collect();

        let mut fatal: Vec<ExecutionException> = Vec::new();
        let mut index = 0;
        while index < forest.len() {
            let exc = forest[index].clone();
            index += 1;
            self.log.log(LogEvent::Exception(exc.clone()));

            let handled = self.run_handler_chain(exc.trace.last().copied().unwrap_or(exc.origin), &exc);
            if handled {
                continue;
            }

            let parents: Vec<PlanObjectId> = self
                .relations
                .graph(RelationKind::Hierarchy)
                .parents(*exc.trace.last().unwrap_or(&exc.origin))
                .map(|(p, _)| p)
                .filter(|p| !self.tasks.get(p).map(|t| t.finished()).unwrap_or(true))
                .collect();

            if parents.is_empty() {
                fatal.push(exc);
            } else {
                for parent in parents {
                    let forked = exc.lifted_to(parent);
                    if !forest[..index].iter().any(|e| e.same_identity(&forked) && e.trace == forked.trace) {
                        forest.push(forked);
                    }
                }
            }
        }

        let mut true_fatal = Vec::new();
        for exc in fatal {
            let handled = self.plan_handlers.iter().any(|h| {
                if (h.matcher)(&exc.error) {
                    matches!((h.handle)(&exc), HandlerOutcome::Handled)
                } else {
                    false
                }
            });
            if !handled {
                true_fatal.push(exc);
            }
        }
        true_fatal
    }

    fn run_handler_chain(&self, task: PlanObjectId, exc: &ExecutionException) -> bool {
        let Some(handlers) = self.task_handlers.get(&task) else {
            return false;
        };
        for handler in handlers.iter().rev() {
            if (handler.matcher)(&exc.error) {
                if matches!((handler.handle)(exc), HandlerOutcome::Handled) {
                    return true;
                }
            }
        }
        false
    }

    // ---- garbage collection (§4.7) -------------------------------------------------------------

    fn is_useful(&self, id: PlanObjectId) -> bool {
        if self.missions.contains(&id) || self.permanent.contains(&id) {
            return true;
        }
        let Some(task) = self.tasks.get(&id) else {
            return self.permanent.contains(&id);
        };
        if matches!(task.state, TaskState::Starting | TaskState::Finishing) {
            return true;
        }
        if task.running() && self.reachable_from_root(id) {
            return true;
        }
        if self.force_gc.contains(&id) && !task.can_finalize() {
            return true;
        }
        false
    }

    /// The Hierarchy ancestors of `origin` (`origin` included): the set a fatal, unhandled
    /// exception rooted at `origin` should drag down with it into the next `garbage_collect`'s
    /// kill set (§4.7 cycle pseudocode: "kill_set = union over unhandled errors of
    /// reverse-reachable-subgraph-in-Hierarchy").
    pub fn kill_set_for(&self, origin: PlanObjectId) -> HashSet<PlanObjectId> {
        self.relations.graph(RelationKind::Hierarchy).reverse_generated_subgraph(vec![origin])
    }

    fn reachable_from_root(&self, id: PlanObjectId) -> bool {
        let roots: Vec<PlanObjectId> = self
            .missions
            .iter()
            .chain(self.permanent.iter())
            .copied()
            .collect();
        if roots.is_empty() {
            return false;
        }
        self.relations
            .graph(RelationKind::Hierarchy)
            .generated_subgraph(roots)
            .contains(&id)
    }

    /// Computes non-useful tasks, requests `stop` on the ones still running, and finalizes the
    /// ones that can finalize immediately. Children are finalized before parents (Hierarchy
    /// order).
    pub fn garbage_collect(&mut self, force_kill_set: &HashSet<PlanObjectId>) {
        for &id in force_kill_set {
            self.force_gc.insert(id);
        }
        self.log.log(LogEvent::GarbageCollectStart);

        let mut candidates: Vec<PlanObjectId> = self
            .tasks
            .keys()
            .copied()
            .filter(|id| !self.quarantined.contains(id) && !self.is_useful(*id))
            .collect();
        // Children before parents: a task with more Hierarchy ancestors among the candidate set
        // sorts first.
        candidates.sort_by_key(|id| std::cmp::Reverse(self.hierarchy_depth(*id)));

        let mut finalized = 0;
        let mut quarantined = 0;
        for id in candidates {
            let Some(task) = self.tasks.get(&id) else { continue };
            if task.can_finalize() {
                self.finalize_task(id);
                finalized += 1;
            } else if task.running() {
                let stop = task.stop_event();
                if !self.events.get(&stop).map(|e| e.pending).unwrap_or(false) {
                    let _ = self.emit(stop, Context::new());
                }
            }
        }

        // Tasks that have been in the force-GC set across a prior cycle and still refuse to stop
        // get quarantined rather than retried forever.
        let stuck: Vec<PlanObjectId> = self
            .force_gc
            .iter()
            .copied()
            .filter(|id| {
                !self.quarantined.contains(id)
                    && self.tasks.get(id).map(|t| !t.can_finalize()).unwrap_or(false)
            })
            .collect();
        for id in stuck {
            self.quarantine(id);
            quarantined += 1;
        }

        self.log.log(LogEvent::GarbageCollectEnd {
            finalized,
            quarantined,
        });
    }

    fn hierarchy_depth(&self, id: PlanObjectId) -> usize {
        self.relations
            .graph(RelationKind::Hierarchy)
            .reverse_generated_subgraph(vec![id])
            .len()
    }

    fn finalize_task(&mut self, id: PlanObjectId) {
        let Some(task) = self.tasks.remove(&id) else { return };
        let vertices: HashSet<PlanObjectId> = std::iter::once(id).chain(task.bound_events.values().copied()).collect();
        for kind in RelationKind::all() {
            let edges: Vec<(PlanObjectId, PlanObjectId)> = self
                .relations
                .graph(kind)
                .edges()
                .filter(|(p, c, _)| vertices.contains(p) || vertices.contains(c))
                .map(|(p, c, _)| (p, c))
                .collect();
            for (p, c) in edges {
                self.relations.remove_edge(kind, p, c);
            }
        }
        for event_id in task.bound_events.values() {
            self.events.remove(event_id);
            self.combinators.remove(event_id);
        }
        self.missions.remove(&id);
        self.permanent.remove(&id);
        self.force_gc.remove(&id);
        self.quarantined.remove(&id);
        self.reported_failures.remove(&id);
        self.task_handlers.remove(&id);
        self.log.log(LogEvent::Finalized(id));
    }

    /// Isolates a task that refuses to stop: clears every relation touching it except edges
    /// between its own bound events, and excludes it from further GC attempts.
    pub fn quarantine(&mut self, id: PlanObjectId) {
        let Some(task) = self.tasks.get_mut(&id) else { return };
        task.quarantined = true;
        let internal: HashSet<PlanObjectId> =
            std::iter::once(id).chain(task.bound_events.values().copied()).collect();
        self.quarantined.insert(id);

        for kind in RelationKind::all() {
            let edges: Vec<(PlanObjectId, PlanObjectId)> = self
                .relations
                .graph(kind)
                .edges()
                .filter(|(p, c, _)| internal.contains(p) != internal.contains(c))
                .map(|(p, c, _)| (p, c))
                .collect();
            for (p, c) in edges {
                self.relations.remove_edge(kind, p, c);
            }
        }
        self.log.log(LogEvent::Quarantined(id));
    }

    pub fn is_quarantined(&self, id: PlanObjectId) -> bool {
        self.quarantined.contains(&id)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn contains_task(&self, id: PlanObjectId) -> bool {
        self.tasks.contains_key(&id)
    }

    // ---- engine integration --------------------------------------------------------------------

    pub fn log_cycle_start(&mut self, index: u64) {
        self.log.log(LogEvent::CycleStart { index });
    }

    pub fn log_cycle_end(&mut self, index: u64) {
        self.log.log(LogEvent::CycleEnd { index });
    }

    /// Moves every past-due delayed Signal/Forwarding record into the gather set; called once at
    /// the start of every cycle, before `run_propagation`.
    pub fn drain_delayed_signals(&mut self) {
        self.propagation.drain_delayed(self.clock.as_ref());
    }

    pub fn take_propagation_exceptions(&mut self) -> Vec<RobyError> {
        self.propagation.take_exceptions()
    }

    pub fn run_poll_handlers(&mut self) {
        for task in self.tasks.values() {
            task.run_poll_handlers();
        }
    }

    pub fn running_task_ids(&self) -> HashSet<PlanObjectId> {
        self.tasks
            .iter()
            .filter(|(_, t)| t.running())
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests;
