// Licensed under the Apache License, Version 2.0.

//! §4.8: `AndGenerator`, `OrGenerator`, `UntilGenerator`. These are regular `EventGenerator`s (so
//! `on`, `if_unreachable`, `call`/`emit` all work uniformly on them); this module only holds the
//! extra per-instance bookkeeping their emission rule needs, and the pure decision functions the
//! propagation engine consults once per step.

use std::sync::Arc;

use fnv::FnvHashMap as HashMap;
use fnv::FnvHashSet as HashSet;

use crate::event::{Context, EventRef};
use crate::ids::PlanObjectId;

/// Extra state for a combinator generator, keyed by the combinator's own `PlanObjectId` in
/// `Plan::combinators`.
pub enum CombinatorState {
    And(AndState),
    Or(OrState),
    Until(UntilState),
    Filter(FilterState),
}

/// How many emissions of each source had already been counted as of the last reset. A source is
/// "emitted since reset" once its generator's history is longer than its recorded baseline.
pub struct AndState {
    pub baseline: HashMap<PlanObjectId, usize>,
}

impl AndState {
    pub fn new(sources: impl IntoIterator<Item = PlanObjectId>) -> Self {
        AndState {
            baseline: sources.into_iter().map(|s| (s, 0)).collect(),
        }
    }

    /// Resnapshots every current source's baseline to its present history length.
    pub fn reset(&mut self, history_len: impl Fn(PlanObjectId) -> usize) {
        for (source, count) in self.baseline.iter_mut() {
            *count = history_len(*source);
        }
    }

    pub fn track_source(&mut self, source: PlanObjectId, history_len: usize) {
        self.baseline.entry(source).or_insert(history_len);
    }

    pub fn sources(&self) -> impl Iterator<Item = PlanObjectId> + '_ {
        self.baseline.keys().copied()
    }

    /// Given the current source set and each source's history length and last event, returns the
    /// set of sources, with the events that satisfy them, once every current source has emitted
    /// since the last reset. Returns `None` if not yet satisfied.
    pub fn should_emit(
        &self,
        current_sources: &[PlanObjectId],
        history_len: impl Fn(PlanObjectId) -> usize,
        last_event: impl Fn(PlanObjectId) -> Option<EventRef>,
    ) -> Option<Vec<EventRef>> {
        let mut satisfying = Vec::with_capacity(current_sources.len());
        for &source in current_sources {
            let baseline = self.baseline.get(&source).copied().unwrap_or(0);
            if history_len(source) <= baseline {
                return None;
            }
            satisfying.push(last_event(source)?);
        }
        Some(satisfying)
    }

    /// Whether `source` becoming unreachable dooms this And (it has not yet satisfied its
    /// baseline and can therefore never contribute the emission it owes).
    pub fn dooms_on_unreachable(&self, source: PlanObjectId, history_len: usize) -> bool {
        let baseline = self.baseline.get(&source).copied().unwrap_or(0);
        history_len <= baseline
    }
}

/// Whether this Or has already fired since its last reset, and the fixed source list it listens
/// to (tracked here rather than read off a relation graph, since an Or's sources are never
/// signalled through the normal call/forward machinery: the combinator step loop evaluates them
/// directly against each source's own history).
pub struct OrState {
    pub sources: Vec<PlanObjectId>,
    pub fired: bool,
}

impl OrState {
    pub fn new(sources: impl IntoIterator<Item = PlanObjectId>) -> Self {
        OrState {
            sources: sources.into_iter().collect(),
            fired: false,
        }
    }

    pub fn reset(&mut self) {
        self.fired = false;
    }
}

/// An Until's pass-through state: active while `limit` has not yet fired since creation/reset.
pub struct UntilState {
    pub source: PlanObjectId,
    pub limit: PlanObjectId,
    pub active: bool,
}

impl UntilState {
    pub fn new(source: PlanObjectId, limit: PlanObjectId) -> Self {
        UntilState {
            source,
            limit,
            active: true,
        }
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn reactivate(&mut self) {
        self.active = true;
    }
}

/// A context transform applied by `filter` (§4.3): `new_context = transform(old_context)`.
pub type FilterFn = Arc<dyn Fn(&Context) -> Context + Send + Sync>;

/// `filter`'s pass-through state: re-emits every new emission of `source` with `transform`
/// applied to its context. `baseline` is the source's history length already consumed, the same
/// "already emitted since reset" bookkeeping `AndState` uses.
pub struct FilterState {
    pub source: PlanObjectId,
    pub transform: FilterFn,
    pub baseline: usize,
}

impl FilterState {
    pub fn new(source: PlanObjectId, transform: FilterFn, baseline: usize) -> Self {
        FilterState {
            source,
            transform,
            baseline,
        }
    }
}

/// Deduplicates a combinator's source id list while preserving first-occurrence order.
pub fn unique(ids: impl IntoIterator<Item = PlanObjectId>) -> Vec<PlanObjectId> {
    let mut seen = HashSet::default();
    let mut out = Vec::new();
    for id in ids {
        if seen.insert(id) {
            out.push(id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdAllocator;

    fn ids(n: usize) -> Vec<PlanObjectId> {
        let alloc = IdAllocator::new();
        (0..n).map(|_| alloc.next()).collect()
    }

    #[test]
    fn and_does_not_emit_until_every_source_clears_its_baseline() {
        let src = ids(2);
        let state = AndState::new(src.iter().copied());
        let history_len = |s: PlanObjectId| if s == src[0] { 1 } else { 0 };
        let last_event = |_s: PlanObjectId| None;
        assert!(state.should_emit(&src, history_len, last_event).is_none());
    }

    #[test]
    fn and_emits_once_every_source_has_advanced_past_baseline() {
        let src = ids(2);
        let state = AndState::new(src.iter().copied());
        let history_len = |_s: PlanObjectId| 1;
        let last_event = |s: PlanObjectId| {
            Some(EventRef {
                generator: s,
                propagation_id: 0,
            })
        };
        let satisfied = state.should_emit(&src, history_len, last_event).unwrap();
        assert_eq!(satisfied.len(), 2);
    }

    #[test]
    fn and_reset_resnapshots_baseline_to_current_history() {
        let src = ids(1);
        let mut state = AndState::new(src.iter().copied());
        state.reset(|_s| 5);
        assert!(!state.dooms_on_unreachable(src[0], 5));
        assert!(state.dooms_on_unreachable(src[0], 4));
    }

    #[test]
    fn and_source_not_yet_emitted_dooms_the_and_if_it_becomes_unreachable() {
        let src = ids(1);
        let state = AndState::new(src.iter().copied());
        assert!(state.dooms_on_unreachable(src[0], 0));
    }

    #[test]
    fn and_source_that_already_emitted_does_not_doom_the_and() {
        let src = ids(1);
        let state = AndState::new(src.iter().copied());
        assert!(!state.dooms_on_unreachable(src[0], 1));
    }

    #[test]
    fn or_state_tracks_the_fixed_source_list_it_was_built_with() {
        let src = ids(3);
        let state = OrState::new(src.iter().copied());
        assert_eq!(state.sources, src);
        assert!(!state.fired);
    }

    #[test]
    fn or_state_reset_clears_fired_without_touching_sources() {
        let src = ids(1);
        let mut state = OrState::new(src.iter().copied());
        state.fired = true;
        state.reset();
        assert!(!state.fired);
        assert_eq!(state.sources, src);
    }

    #[test]
    fn until_state_starts_active_and_can_be_deactivated_and_reactivated() {
        let src = ids(2);
        let mut state = UntilState::new(src[0], src[1]);
        assert!(state.active);
        state.deactivate();
        assert!(!state.active);
        state.reactivate();
        assert!(state.active);
    }

    #[test]
    fn unique_drops_duplicates_but_preserves_first_occurrence_order() {
        let src = ids(3);
        let deduped = unique([src[0], src[1], src[0], src[2], src[1]]);
        assert_eq!(deduped, vec![src[0], src[1], src[2]]);
    }
}
