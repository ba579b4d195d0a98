// Licensed under the Apache License, Version 2.0.

//! A typed multi-relation graph substrate.
//!
//! `relation_graph` is deliberately ignorant of tasks, events, or plans: it only knows that
//! vertices are some `Copy + Eq + Hash` id type, and that a fixed set of named relation *kinds*
//! forms a DAG-shaped subset hierarchy (e.g. `Signal ⊆ CausalLink ⊆ Precedence`). `roby` is the
//! only consumer and supplies the vertex id type and the concrete `RelationKind` enum.

mod diff;
mod walk;

pub use diff::Difference;
pub use walk::Walk;

use std::collections::hash_map::Entry as MapEntry;
use std::fmt;
use std::hash::Hash;

use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

/// Static properties of a relation type, declared once per kind at registration time.
///
/// Implemented on whatever small `Copy + Eq + Hash` enum the embedder uses to tag its relation
/// kinds (`Hierarchy`, `Signal`, `Forwarding`, ...).
pub trait RelationKind: Copy + Eq + Hash + fmt::Debug + 'static {
    /// Cycles are forbidden at insertion time.
    fn is_dag(self) -> bool;

    /// Edges of this kind survive `RelationGraphSet::clear_relations`.
    fn is_strong(self) -> bool {
        false
    }

    /// `replace_vertex` preserves edges to the original vertex instead of moving them.
    fn is_copy_on_replace(self) -> bool {
        false
    }

    /// Edges of this kind are visible to peers (distributed plans).
    fn is_distribute(self) -> bool {
        true
    }

    /// Kinds that this kind is an immediate subset of. Adding an edge of `self` also adds it to
    /// every kind reachable from this list; removing an edge of `self` (or of any kind in this
    /// list, transitively) removes it everywhere in the connected hierarchy component.
    fn immediate_supersets(self) -> &'static [Self];
}

/// Edge payloads that may need reshaping when `RelationGraphSet::add_edge` carries them up from
/// the kind the caller named to a superset reached through `RelationKind::immediate_supersets`
/// (e.g. a delay annotation that is meaningful on `Signal` but not on the `CausalLink`/
/// `Precedence` edges installed alongside it). Identity by default, so payload types that don't
/// care can ignore this trait entirely.
pub trait SupersetPayload: Sized {
    /// The payload to install on a superset kind, derived from the payload given for the subset
    /// edge that induced it.
    fn superset_copy(&self) -> Self;
}

/// Error produced by a substrate operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationError<E> {
    /// `add_edge` would introduce a cycle in a DAG-flagged relation.
    CycleFound,
    /// The pair is already linked with a different, conflicting edge info value.
    EdgeInfoConflict { existing: E, requested: E },
}

impl<E: fmt::Debug> fmt::Display for RelationError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationError::CycleFound => write!(f, "edge would introduce a cycle"),
            RelationError::EdgeInfoConflict { existing, requested } => write!(
                f,
                "edge already exists with conflicting info: existing={existing:?} requested={requested:?}"
            ),
        }
    }
}

impl<E: fmt::Debug> std::error::Error for RelationError<E> {}

type PGraph<V, E> = DiGraph<V, E, u32>;

/// A single typed relation: a DAG-checked (if so flagged) multigraph between vertices of type
/// `V`, carrying edge payloads of type `E`.
///
/// At most one edge exists between any ordered pair (this is a "multigraph" only across distinct
/// kinds of `RelationGraph`, never within one).
pub struct RelationGraph<V, E> {
    dag: bool,
    index: HashMap<V, NodeIndex<u32>>,
    pg: PGraph<V, E>,
}

impl<V, E> RelationGraph<V, E>
where
    V: Copy + Eq + Hash + fmt::Debug,
    E: Clone + PartialEq,
{
    pub fn new(dag: bool) -> Self {
        RelationGraph {
            dag,
            index: HashMap::default(),
            pg: DiGraph::default(),
        }
    }

    pub fn is_dag(&self) -> bool {
        self.dag
    }

    pub fn len(&self) -> usize {
        self.pg.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.pg.edge_count() == 0
    }

    fn node_of(&mut self, v: V) -> NodeIndex<u32> {
        match self.index.entry(v) {
            MapEntry::Occupied(e) => *e.get(),
            MapEntry::Vacant(e) => {
                let idx = self.pg.add_node(v);
                *e.insert(idx)
            }
        }
    }

    fn existing_node_of(&self, v: V) -> Option<NodeIndex<u32>> {
        self.index.get(&v).copied()
    }

    fn edge_between(&self, p: NodeIndex<u32>, c: NodeIndex<u32>) -> Option<EdgeIndex<u32>> {
        self.pg.find_edge(p, c)
    }

    /// True if `child` can already reach `parent`, meaning that `parent -> child` would close a
    /// cycle.
    fn would_cycle(&self, parent: NodeIndex<u32>, child: NodeIndex<u32>) -> bool {
        if parent == child {
            return true;
        }
        petgraph::algo::has_path_connecting(&self.pg, child, parent, None)
    }

    /// Inserts a single edge local to this relation (no hierarchy propagation). Returns `true` if
    /// a new edge was created, `false` if an identical one already existed.
    ///
    /// Exposed publicly for embedders whose hierarchy propagation needs a different edge payload
    /// at each level (`RelationGraphSet::add_edge` always copies the same payload up the chain).
    pub fn add_edge(&mut self, parent: V, child: V, info: E) -> Result<bool, RelationError<E>> {
        self.add_edge_local(parent, child, info)
    }

    fn add_edge_local(&mut self, parent: V, child: V, info: E) -> Result<bool, RelationError<E>> {
        if self.dag && parent == child {
            return Err(RelationError::CycleFound);
        }
        let p = self.node_of(parent);
        let c = self.node_of(child);
        if let Some(existing_edge) = self.edge_between(p, c) {
            let existing = self.pg[existing_edge].clone();
            return if existing == info {
                Ok(false)
            } else {
                Err(RelationError::EdgeInfoConflict {
                    existing,
                    requested: info,
                })
            };
        }
        if self.dag && self.would_cycle(p, c) {
            return Err(RelationError::CycleFound);
        }
        self.pg.add_edge(p, c, info);
        Ok(true)
    }

    /// Removes a single edge local to this relation. Returns `true` if an edge was removed.
    fn remove_edge_local(&mut self, parent: V, child: V) -> bool {
        let (Some(p), Some(c)) = (self.existing_node_of(parent), self.existing_node_of(child))
        else {
            return false;
        };
        if let Some(e) = self.edge_between(p, c) {
            self.pg.remove_edge(e);
            true
        } else {
            false
        }
    }

    pub fn has_edge(&self, parent: V, child: V) -> bool {
        let (Some(p), Some(c)) = (self.existing_node_of(parent), self.existing_node_of(child))
        else {
            return false;
        };
        self.edge_between(p, c).is_some()
    }

    pub fn edge_info(&self, parent: V, child: V) -> Option<&E> {
        let p = self.existing_node_of(parent)?;
        let c = self.existing_node_of(child)?;
        let e = self.edge_between(p, c)?;
        Some(&self.pg[e])
    }

    /// Updates the payload of an existing edge in place. Returns `false` if no such edge exists.
    pub fn update_info(&mut self, parent: V, child: V, new_info: E) -> bool {
        let (Some(p), Some(c)) = (self.existing_node_of(parent), self.existing_node_of(child))
        else {
            return false;
        };
        if let Some(e) = self.edge_between(p, c) {
            self.pg[e] = new_info;
            true
        } else {
            false
        }
    }

    pub fn children(&self, parent: V) -> impl Iterator<Item = (V, &E)> + '_ {
        let node = self.existing_node_of(parent);
        node.into_iter().flat_map(move |p| {
            self.pg
                .edges_directed(p, Direction::Outgoing)
                .map(|e| (self.pg[e.target()], e.weight()))
        })
    }

    pub fn parents(&self, child: V) -> impl Iterator<Item = (V, &E)> + '_ {
        let node = self.existing_node_of(child);
        node.into_iter().flat_map(move |c| {
            self.pg
                .edges_directed(c, Direction::Incoming)
                .map(|e| (self.pg[e.source()], e.weight()))
        })
    }

    pub fn vertices(&self) -> impl Iterator<Item = V> + '_ {
        self.pg.node_weights().copied()
    }

    pub fn edges(&self) -> impl Iterator<Item = (V, V, &E)> + '_ {
        self.pg
            .edge_references()
            .map(|e| (self.pg[e.source()], self.pg[e.target()], e.weight()))
    }

    /// BFS on the undirected projection of the graph up to depth `depth`, returning edges in
    /// their original orientation (i.e. `(parent, child)` as stored, never flipped).
    pub fn neighborhood(&self, root: V, depth: usize) -> Vec<(V, V, &E)> {
        let Some(start) = self.existing_node_of(root) else {
            return Vec::new();
        };
        let mut visited: HashSet<NodeIndex<u32>> = HashSet::default();
        visited.insert(start);
        let mut frontier = vec![start];
        let mut result = Vec::new();
        let mut seen_edges: HashSet<EdgeIndex<u32>> = HashSet::default();
        for _ in 0..depth {
            if frontier.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for node in frontier {
                for e in self.pg.edges_directed(node, Direction::Outgoing) {
                    if seen_edges.insert(e.id()) {
                        result.push((self.pg[e.source()], self.pg[e.target()], e.weight()));
                    }
                    if visited.insert(e.target()) {
                        next.push(e.target());
                    }
                }
                for e in self.pg.edges_directed(node, Direction::Incoming) {
                    if seen_edges.insert(e.id()) {
                        result.push((self.pg[e.source()], self.pg[e.target()], e.weight()));
                    }
                    if visited.insert(e.source()) {
                        next.push(e.source());
                    }
                }
            }
            frontier = next;
        }
        result
    }

    /// Begins a directed walk from `roots`, visiting each reachable vertex at most once.
    pub fn walk(&self, roots: Vec<V>, direction: Direction) -> Walk<'_, V, E> {
        Walk::new(self, roots, direction)
    }

    /// All vertices reachable from `roots` following outgoing edges (`roots` included).
    pub fn generated_subgraph(&self, roots: Vec<V>) -> HashSet<V> {
        self.walk(roots, Direction::Outgoing).collect()
    }

    /// All vertices that can reach `roots` following incoming edges (`roots` included).
    pub fn reverse_generated_subgraph(&self, roots: Vec<V>) -> HashSet<V> {
        self.walk(roots, Direction::Incoming).collect()
    }

    /// Weakly-connected components, as sets of vertices.
    pub fn components(&self) -> Vec<HashSet<V>> {
        // Union-find over the undirected projection: a relation graph's "components" are the
        // islands of mutually-relevant vertices, not its strongly connected subsets.
        let mut parent: HashMap<NodeIndex<u32>, NodeIndex<u32>> = HashMap::default();
        for n in self.pg.node_indices() {
            parent.insert(n, n);
        }
        fn find(
            parent: &mut HashMap<NodeIndex<u32>, NodeIndex<u32>>,
            x: NodeIndex<u32>,
        ) -> NodeIndex<u32> {
            let p = parent[&x];
            if p == x {
                x
            } else {
                let root = find(parent, p);
                parent.insert(x, root);
                root
            }
        }
        for e in self.pg.edge_references() {
            let a = find(&mut parent, e.source());
            let b = find(&mut parent, e.target());
            if a != b {
                parent.insert(a, b);
            }
        }
        let mut groups: HashMap<NodeIndex<u32>, HashSet<V>> = HashMap::default();
        for n in self.pg.node_indices() {
            let root = find(&mut parent, n);
            groups.entry(root).or_default().insert(self.pg[n]);
        }
        groups.into_values().collect()
    }

    /// Computes the edge-set difference between `self` and `other`, restricted to the vertices
    /// named by `self_vertices` (mapped through `mapping` to find their counterpart in `other`).
    ///
    /// `mapping(v)` should return the vertex in `other` that corresponds to `v` in `self`; the
    /// identity mapping is appropriate when `other` shares `self`'s vertex ids (including when
    /// `other` *is* `self`, which is used to detect renames performed through `mapping`).
    pub fn difference(
        &self,
        other: &RelationGraph<V, E>,
        self_vertices: &HashSet<V>,
        mapping: impl Fn(V) -> Option<V>,
    ) -> Difference<V, E> {
        diff::difference(self, other, self_vertices, mapping)
    }

    fn for_each_edge(&self) -> impl Iterator<Item = (V, V, E)> + '_ {
        self.edges().map(|(p, c, i)| (p, c, i.clone()))
    }

    /// Replaces `from` with `to`: for every `(p, from, i)` edge with `p != to` where `(p, to)` is
    /// not already linked, adds `(p, to, i)`; symmetrically for `(from, c)` edges. If
    /// `copy_on_replace` is true the edges touching `from` are preserved in addition to being
    /// recreated on `to`; otherwise they are removed from `from`. Does not remove `from` itself
    /// from the index, matching the substrate's never-delete-vertices posture.
    pub fn replace_vertex(&mut self, from: V, to: V, copy_on_replace: bool) {
        let incoming: Vec<(V, E)> = self
            .parents(from)
            .map(|(p, i)| (p, i.clone()))
            .filter(|(p, _)| *p != to)
            .collect();
        let outgoing: Vec<(V, E)> = self
            .children(from)
            .map(|(c, i)| (c, i.clone()))
            .filter(|(c, _)| *c != to)
            .collect();

        for (p, info) in incoming {
            if !self.has_edge(p, to) {
                let _ = self.add_edge_local(p, to, info.clone());
            }
            if !copy_on_replace {
                self.remove_edge_local(p, from);
            }
        }
        for (c, info) in outgoing {
            if !self.has_edge(to, c) {
                let _ = self.add_edge_local(to, c, info.clone());
            }
            if !copy_on_replace {
                self.remove_edge_local(from, c);
            }
        }
    }
}

/// A named collection of [`RelationGraph`]s sharing one vertex type, with a subset hierarchy
/// declared through `K: RelationKind`.
pub struct RelationGraphSet<K, V, E> {
    graphs: HashMap<K, RelationGraph<V, E>>,
}

impl<K, V, E> RelationGraphSet<K, V, E>
where
    K: RelationKind,
    V: Copy + Eq + Hash + fmt::Debug,
    E: Clone + PartialEq + SupersetPayload,
{
    pub fn new(kinds: impl IntoIterator<Item = K>) -> Self {
        let mut graphs = HashMap::default();
        for kind in kinds {
            graphs.insert(kind, RelationGraph::new(kind.is_dag()));
        }
        RelationGraphSet { graphs }
    }

    pub fn graph(&self, kind: K) -> &RelationGraph<V, E> {
        self.graphs
            .get(&kind)
            .unwrap_or_else(|| panic!("relation kind {kind:?} was not registered"))
    }

    pub fn graph_mut(&mut self, kind: K) -> &mut RelationGraph<V, E> {
        self.graphs
            .get_mut(&kind)
            .unwrap_or_else(|| panic!("relation kind {kind:?} was not registered"))
    }

    /// Adds `(parent, child, info)` to `kind`, then to every kind reachable through
    /// `immediate_supersets` (transitively). `kind` itself receives `info` verbatim; every
    /// superset in the chain receives `info.superset_copy()` instead, since a superset edge is a
    /// structural consequence of the subset edge, not a copy of its payload. Fails without
    /// mutating anything if any graph along the way would reject the edge it would receive.
    pub fn add_edge(
        &mut self,
        kind: K,
        parent: V,
        child: V,
        info: E,
    ) -> Result<(), RelationError<E>> {
        // Validate the whole chain before mutating, so a rejection at a superset doesn't leave
        // the subset half-linked.
        let mut chain = vec![kind];
        let mut frontier = vec![kind];
        while let Some(k) = frontier.pop() {
            for &sup in k.immediate_supersets() {
                if !chain.contains(&sup) {
                    chain.push(sup);
                    frontier.push(sup);
                }
            }
        }
        let infos: Vec<E> = chain
            .iter()
            .enumerate()
            .map(|(i, _)| if i == 0 { info.clone() } else { info.superset_copy() })
            .collect();
        for (&k, level_info) in chain.iter().zip(&infos) {
            let g = self.graph(k);
            if g.dag && parent == child {
                return Err(RelationError::CycleFound);
            }
            if let Some(existing) = g.edge_info(parent, child) {
                if existing != level_info {
                    return Err(RelationError::EdgeInfoConflict {
                        existing: existing.clone(),
                        requested: level_info.clone(),
                    });
                }
            } else if g.dag {
                let p = g.existing_node_of(parent);
                let c = g.existing_node_of(child);
                if let (Some(p), Some(c)) = (p, c) {
                    if g.would_cycle(p, c) {
                        return Err(RelationError::CycleFound);
                    }
                }
            }
        }
        for (k, level_info) in chain.into_iter().zip(infos) {
            self.graph_mut(k).add_edge_local(parent, child, level_info)?;
        }
        Ok(())
    }

    /// Removes `(parent, child)` from `kind`, and transitively from every kind connected to it
    /// through the subset hierarchy in either direction (supersets and subsets), since those
    /// copies exist only as a consequence of `kind`'s edge.
    pub fn remove_edge(&mut self, kind: K, parent: V, child: V) {
        let component = self.hierarchy_component(kind);
        for k in component {
            self.graph_mut(k).remove_edge_local(parent, child);
        }
    }

    /// All kinds reachable from `kind` by following `immediate_supersets` in either direction.
    fn hierarchy_component(&self, kind: K) -> Vec<K> {
        let all_kinds: Vec<K> = self.graphs.keys().copied().collect();
        let mut component = vec![kind];
        let mut frontier = vec![kind];
        while let Some(k) = frontier.pop() {
            for &sup in k.immediate_supersets() {
                if !component.contains(&sup) {
                    component.push(sup);
                    frontier.push(sup);
                }
            }
            for &other in &all_kinds {
                if other.immediate_supersets().contains(&k) && !component.contains(&other) {
                    component.push(other);
                    frontier.push(other);
                }
            }
        }
        component
    }

    /// Replaces `from` with `to` across every relation kind, honoring each kind's
    /// `copy_on_replace` flag.
    pub fn replace_vertex(&mut self, from: V, to: V) {
        let kinds: Vec<K> = self.graphs.keys().copied().collect();
        for kind in kinds {
            let copy_on_replace = kind.is_copy_on_replace();
            self.graph_mut(kind).replace_vertex(from, to, copy_on_replace);
        }
    }

    /// Removes every edge of non-strong kinds touching `vertices`; used for quarantine and for
    /// "clear_relations".
    pub fn clear_relations(&mut self, vertices: &HashSet<V>) {
        let kinds: Vec<K> = self.graphs.keys().copied().collect();
        for kind in kinds {
            if kind.is_strong() {
                continue;
            }
            let g = self.graph_mut(kind);
            let edges: Vec<(V, V)> = g
                .for_each_edge()
                .filter(|(p, c, _)| vertices.contains(p) || vertices.contains(c))
                .map(|(p, c, _)| (p, c))
                .collect();
            for (p, c) in edges {
                g.remove_edge_local(p, c);
            }
        }
    }

    pub fn kinds(&self) -> impl Iterator<Item = K> + '_ {
        self.graphs.keys().copied()
    }
}

#[cfg(test)]
mod tests;
