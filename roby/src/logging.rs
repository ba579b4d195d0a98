// Licensed under the Apache License, Version 2.0.

//! §6 "Logging sink": a narrow structured channel the engine calls into for every structural
//! mutation, emission, exception, GC pass, and cycle boundary, fronting the plain `log` crate
//! macros the same way the teacher's `logging` crate layers `PantsLogger` on top of the stock
//! `log` facade. Out-of-scope serialization formats (DRoby) are consumers of this trait, not part
//! of it.

use crate::error::ExecutionException;
use crate::ids::PlanObjectId;
use crate::relations::RelationKind;

/// One structural event the engine reports to a [`LogSink`].
#[derive(Debug, Clone)]
pub enum LogEvent {
    TaskAdded(PlanObjectId),
    EventAdded(PlanObjectId),
    Finalized(PlanObjectId),
    Quarantined(PlanObjectId),
    Replaced(PlanObjectId, PlanObjectId),
    AddingEdge(RelationKind, PlanObjectId, PlanObjectId),
    AddedEdge(RelationKind, PlanObjectId, PlanObjectId),
    RemovingEdge(RelationKind, PlanObjectId, PlanObjectId),
    RemovedEdge(RelationKind, PlanObjectId, PlanObjectId),
    Emitted(PlanObjectId, u64),
    Exception(ExecutionException),
    GarbageCollectStart,
    GarbageCollectEnd { finalized: usize, quarantined: usize },
    CycleStart { index: u64 },
    CycleEnd { index: u64 },
}

/// The logging sink interface itself. The default implementation forwards to the `log` crate at
/// an appropriate level per event kind; tests typically swap in
/// [`crate::testutil::RecordingLogSink`] instead.
pub trait LogSink: Send {
    fn log(&mut self, event: LogEvent);
}

/// Forwards every [`LogEvent`] to `log::trace!`/`log::debug!`/`log::info!`/`log::warn!`, matching
/// the density the teacher's `graph` crate uses for its own structural mutations.
#[derive(Debug, Default)]
pub struct DefaultLogSink;

impl LogSink for DefaultLogSink {
    fn log(&mut self, event: LogEvent) {
        match event {
            LogEvent::TaskAdded(id) => log::debug!("task {id} added"),
            LogEvent::EventAdded(id) => log::debug!("event {id} added"),
            LogEvent::Finalized(id) => log::debug!("{id} finalized"),
            LogEvent::Quarantined(id) => log::warn!("{id} quarantined"),
            LogEvent::Replaced(original, replacement) => {
                log::debug!("{original} replaced by {replacement}")
            }
            LogEvent::AddingEdge(kind, p, c) => log::trace!("adding {kind:?} edge {p} -> {c}"),
            LogEvent::AddedEdge(kind, p, c) => log::trace!("added {kind:?} edge {p} -> {c}"),
            LogEvent::RemovingEdge(kind, p, c) => log::trace!("removing {kind:?} edge {p} -> {c}"),
            LogEvent::RemovedEdge(kind, p, c) => log::trace!("removed {kind:?} edge {p} -> {c}"),
            LogEvent::Emitted(id, propagation_id) => {
                log::trace!("{id} emitted in propagation #{propagation_id}")
            }
            LogEvent::Exception(exc) => log::warn!(
                "exception from {}: {} (trace: {:?})",
                exc.origin,
                exc.error,
                exc.trace
            ),
            LogEvent::GarbageCollectStart => log::debug!("garbage collection start"),
            LogEvent::GarbageCollectEnd {
                finalized,
                quarantined,
            } => log::debug!("garbage collection end: {finalized} finalized, {quarantined} quarantined"),
            LogEvent::CycleStart { index } => log::trace!("cycle {index} start"),
            LogEvent::CycleEnd { index } => log::trace!("cycle {index} end"),
        }
    }
}
