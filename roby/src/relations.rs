// Licensed under the Apache License, Version 2.0.

//! The concrete relation kinds and edge payloads `roby` registers with `relation_graph`.

use std::time::{Duration, SystemTime};

use relation_graph::{RelationKind as RelationKindTrait, SupersetPayload};

/// A typed relation between plan objects (tasks, for `Hierarchy`; event generators, for
/// everything else).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    /// Parent-child task dependency. Used for exception lifting and GC reachability.
    Hierarchy,
    /// "Emission of source triggers command of target."
    Signal,
    /// "Emission of source triggers emission of target without invoking its command."
    Forwarding,
    /// Superset of `Signal` and `Forwarding`: causal ordering without delivery semantics of its
    /// own.
    CausalLink,
    /// Superset of `CausalLink`: the widest causal-ordering relation, consulted by scheduling
    /// constraints that only need "happens no later than" without caring how.
    Precedence,
}

impl RelationKind {
    pub fn all() -> [RelationKind; 5] {
        [
            RelationKind::Hierarchy,
            RelationKind::Signal,
            RelationKind::Forwarding,
            RelationKind::CausalLink,
            RelationKind::Precedence,
        ]
    }
}

impl RelationKindTrait for RelationKind {
    fn is_dag(self) -> bool {
        // Only the task tree is required to stay acyclic; event relations may legitimately form
        // cycles (a retry pattern forwards failure back into the event that caused it).
        matches!(self, RelationKind::Hierarchy)
    }

    fn is_copy_on_replace(self) -> bool {
        matches!(self, RelationKind::Precedence)
    }

    fn immediate_supersets(self) -> &'static [Self] {
        match self {
            RelationKind::Signal => &[RelationKind::CausalLink],
            RelationKind::Forwarding => &[RelationKind::CausalLink],
            RelationKind::CausalLink => &[RelationKind::Precedence],
            RelationKind::Precedence => &[],
            RelationKind::Hierarchy => &[],
        }
    }
}

/// When a `Signal` edge's delivery should happen relative to the triggering emission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DelaySpec {
    /// Deliver `Duration` after the triggering emission's timestamp.
    After(Duration),
    /// Deliver no earlier than the given wall-clock instant.
    At(SystemTime),
}

/// The payload carried by every relation edge.
///
/// `Signal` and `Forwarding` edges may carry a delay; `Hierarchy`, `CausalLink` and `Precedence`
/// edges are undecorated (`Plain`). Supersets always receive a `Plain` copy even when the subset
/// edge that induced them carries a delay: the delay is a delivery detail of the narrower
/// relation, not a causal-ordering fact.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeInfo {
    Plain,
    Delayed(DelaySpec),
}

impl EdgeInfo {
    pub fn delay(&self) -> Option<DelaySpec> {
        match self {
            EdgeInfo::Plain => None,
            EdgeInfo::Delayed(spec) => Some(*spec),
        }
    }
}

impl SupersetPayload for EdgeInfo {
    fn superset_copy(&self) -> EdgeInfo {
        EdgeInfo::Plain
    }
}
