// Licensed under the Apache License, Version 2.0.

use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;

use fnv::FnvHashSet as HashSet;
use petgraph::graph::NodeIndex;
use petgraph::Direction;

use crate::RelationGraph;

/// A directed reachability walk over a [`RelationGraph`], visiting each vertex once.
///
/// `Direction::Outgoing` walks from roots towards their descendants; `Direction::Incoming` walks
/// towards their ancestors.
pub struct Walk<'a, V, E> {
    graph: &'a RelationGraph<V, E>,
    direction: Direction,
    queue: VecDeque<NodeIndex<u32>>,
    visited: HashSet<NodeIndex<u32>>,
}

impl<'a, V, E> Walk<'a, V, E>
where
    V: Copy + Eq + Hash + fmt::Debug,
    E: Clone + PartialEq,
{
    pub(crate) fn new(graph: &'a RelationGraph<V, E>, roots: Vec<V>, direction: Direction) -> Self {
        let mut queue = VecDeque::new();
        let mut visited = HashSet::default();
        for root in roots {
            if let Some(idx) = graph.existing_node_of(root) {
                if visited.insert(idx) {
                    queue.push_back(idx);
                }
            }
        }
        Walk {
            graph,
            direction,
            queue,
            visited,
        }
    }
}

impl<'a, V, E> Iterator for Walk<'a, V, E>
where
    V: Copy + Eq + Hash + fmt::Debug,
    E: Clone + PartialEq,
{
    type Item = V;

    fn next(&mut self) -> Option<V> {
        let idx = self.queue.pop_front()?;
        for neighbor in self.graph.pg.neighbors_directed(idx, self.direction) {
            if self.visited.insert(neighbor) {
                self.queue.push_back(neighbor);
            }
        }
        Some(self.graph.pg[idx])
    }
}
