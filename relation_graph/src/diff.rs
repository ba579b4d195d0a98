// Licensed under the Apache License, Version 2.0.

use std::fmt;
use std::hash::Hash;

use fnv::FnvHashSet as HashSet;

use crate::RelationGraph;

/// The edge-level difference between two relation graphs, restricted to a subset of vertices.
///
/// Used when merging a transaction's proxy-side relations back into the plan they were opened
/// against: `added` and `removed` are expressed in terms of the *other* graph's vertex ids, so
/// the caller can replay them directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Difference<V, E> {
    /// Edges present in `self` (mapped into `other`'s vertex space) but absent from `other`.
    pub added: Vec<(V, V, E)>,
    /// Edges present in `other`, among the mapped vertex set, but absent from `self`.
    pub removed: Vec<(V, V, E)>,
    /// Edges present in both but carrying different payloads: `(parent, child, other_info)`.
    pub updated: Vec<(V, V, E)>,
}

impl<V, E> Default for Difference<V, E> {
    fn default() -> Self {
        Difference {
            added: Vec::new(),
            removed: Vec::new(),
            updated: Vec::new(),
        }
    }
}

pub(crate) fn difference<V, E>(
    this: &RelationGraph<V, E>,
    other: &RelationGraph<V, E>,
    self_vertices: &HashSet<V>,
    mapping: impl Fn(V) -> Option<V>,
) -> Difference<V, E>
where
    V: Copy + Eq + Hash + fmt::Debug,
    E: Clone + PartialEq,
{
    let mut result = Difference::default();

    for (p, c, info) in this.for_each_edge() {
        if !self_vertices.contains(&p) && !self_vertices.contains(&c) {
            continue;
        }
        let (Some(mp), Some(mc)) = (mapping(p), mapping(c)) else {
            result.added.push((p, c, info));
            continue;
        };
        match other.edge_info(mp, mc) {
            None => result.added.push((mp, mc, info)),
            Some(other_info) if *other_info != info => {
                result.updated.push((mp, mc, other_info.clone()))
            }
            Some(_) => {}
        }
    }

    let mapped_vertices: HashSet<V> = self_vertices.iter().filter_map(|v| mapping(*v)).collect();
    for (p, c, info) in other.for_each_edge() {
        if !mapped_vertices.contains(&p) && !mapped_vertices.contains(&c) {
            continue;
        }
        if this.edge_info(p, c).is_none() {
            result.removed.push((p, c, info));
        }
    }

    result
}
