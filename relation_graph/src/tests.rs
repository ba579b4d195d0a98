// Licensed under the Apache License, Version 2.0.

use super::*;

impl SupersetPayload for () {
    fn superset_copy(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    Signal,
    CausalLink,
    Precedence,
    Hierarchy,
}

impl RelationKind for Kind {
    fn is_dag(self) -> bool {
        !matches!(self, Kind::Hierarchy)
    }

    fn is_copy_on_replace(self) -> bool {
        matches!(self, Kind::Hierarchy)
    }

    fn immediate_supersets(self) -> &'static [Self] {
        match self {
            Kind::Signal => &[Kind::CausalLink],
            Kind::CausalLink => &[Kind::Precedence],
            Kind::Precedence => &[],
            Kind::Hierarchy => &[],
        }
    }
}

fn all_kinds() -> Vec<Kind> {
    vec![Kind::Signal, Kind::CausalLink, Kind::Precedence, Kind::Hierarchy]
}

#[test]
fn add_edge_rejects_self_loop_in_dag() {
    let mut g: RelationGraph<u32, ()> = RelationGraph::new(true);
    assert_eq!(g.add_edge_local(1, 1, ()), Err(RelationError::CycleFound));
}

#[test]
fn add_edge_rejects_cycle() {
    let mut g: RelationGraph<u32, ()> = RelationGraph::new(true);
    g.add_edge_local(1, 2, ()).unwrap();
    g.add_edge_local(2, 3, ()).unwrap();
    assert_eq!(g.add_edge_local(3, 1, ()), Err(RelationError::CycleFound));
}

#[test]
fn duplicate_edge_with_same_info_is_a_no_op() {
    let mut g: RelationGraph<u32, &'static str> = RelationGraph::new(true);
    assert!(g.add_edge_local(1, 2, "a").unwrap());
    assert!(!g.add_edge_local(1, 2, "a").unwrap());
}

#[test]
fn duplicate_edge_with_conflicting_info_is_rejected() {
    let mut g: RelationGraph<u32, &'static str> = RelationGraph::new(true);
    g.add_edge_local(1, 2, "a").unwrap();
    assert_eq!(
        g.add_edge_local(1, 2, "b"),
        Err(RelationError::EdgeInfoConflict {
            existing: "a",
            requested: "b",
        })
    );
}

#[test]
fn add_edge_propagates_to_supersets() {
    let mut set: RelationGraphSet<Kind, u32, ()> = RelationGraphSet::new(all_kinds());
    set.add_edge(Kind::Signal, 1, 2, ()).unwrap();
    assert!(set.graph(Kind::Signal).has_edge(1, 2));
    assert!(set.graph(Kind::CausalLink).has_edge(1, 2));
    assert!(set.graph(Kind::Precedence).has_edge(1, 2));
}

#[test]
fn add_edge_does_not_leak_across_unrelated_kinds() {
    let mut set: RelationGraphSet<Kind, u32, ()> = RelationGraphSet::new(all_kinds());
    set.add_edge(Kind::Precedence, 1, 2, ()).unwrap();
    assert!(!set.graph(Kind::Signal).has_edge(1, 2));
    assert!(!set.graph(Kind::CausalLink).has_edge(1, 2));
}

#[test]
fn remove_edge_propagates_through_whole_hierarchy_component() {
    let mut set: RelationGraphSet<Kind, u32, ()> = RelationGraphSet::new(all_kinds());
    set.add_edge(Kind::Signal, 1, 2, ()).unwrap();
    set.remove_edge(Kind::Precedence, 1, 2);
    assert!(!set.graph(Kind::Signal).has_edge(1, 2));
    assert!(!set.graph(Kind::CausalLink).has_edge(1, 2));
    assert!(!set.graph(Kind::Precedence).has_edge(1, 2));
}

#[test]
fn remove_edge_from_subset_also_clears_superset() {
    let mut set: RelationGraphSet<Kind, u32, ()> = RelationGraphSet::new(all_kinds());
    set.add_edge(Kind::Signal, 1, 2, ()).unwrap();
    set.remove_edge(Kind::Signal, 1, 2);
    assert!(!set.graph(Kind::CausalLink).has_edge(1, 2));
    assert!(!set.graph(Kind::Precedence).has_edge(1, 2));
}

#[test]
fn neighborhood_returns_edges_in_original_orientation() {
    let mut g: RelationGraph<u32, ()> = RelationGraph::new(true);
    g.add_edge_local(1, 2, ()).unwrap();
    g.add_edge_local(3, 1, ()).unwrap();
    let n = g.neighborhood(1, 1);
    assert_eq!(n.len(), 2);
    assert!(n.iter().any(|&(p, c, _)| p == 1 && c == 2));
    assert!(n.iter().any(|&(p, c, _)| p == 3 && c == 1));
}

#[test]
fn generated_subgraph_follows_outgoing_edges_transitively() {
    let mut g: RelationGraph<u32, ()> = RelationGraph::new(true);
    g.add_edge_local(1, 2, ()).unwrap();
    g.add_edge_local(2, 3, ()).unwrap();
    g.add_edge_local(3, 4, ()).unwrap();
    let reachable = g.generated_subgraph(vec![1]);
    assert_eq!(reachable, [1u32, 2, 3, 4].into_iter().collect());
}

#[test]
fn components_splits_disjoint_edge_sets() {
    let mut g: RelationGraph<u32, ()> = RelationGraph::new(true);
    g.add_edge_local(1, 2, ()).unwrap();
    g.add_edge_local(3, 4, ()).unwrap();
    let components = g.components();
    assert_eq!(components.len(), 2);
}

#[test]
fn replace_vertex_without_copy_on_replace_moves_edges() {
    let mut g: RelationGraph<u32, ()> = RelationGraph::new(true);
    g.add_edge_local(1, 2, ()).unwrap();
    g.add_edge_local(3, 1, ()).unwrap();
    g.replace_vertex(1, 10, false);
    assert!(g.has_edge(10, 2));
    assert!(g.has_edge(3, 10));
    assert!(!g.has_edge(1, 2));
    assert!(!g.has_edge(3, 1));
}

#[test]
fn replace_vertex_with_copy_on_replace_preserves_original_edges() {
    let mut g: RelationGraph<u32, ()> = RelationGraph::new(true);
    g.add_edge_local(1, 2, ()).unwrap();
    g.replace_vertex(1, 10, true);
    assert!(g.has_edge(10, 2));
    assert!(g.has_edge(1, 2));
}

#[test]
fn clear_relations_spares_strong_kinds() {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum K {
        Weak,
        Strong,
    }
    impl RelationKind for K {
        fn is_dag(self) -> bool {
            true
        }
        fn is_strong(self) -> bool {
            matches!(self, K::Strong)
        }
        fn immediate_supersets(self) -> &'static [Self] {
            &[]
        }
    }
    let mut set: RelationGraphSet<K, u32, ()> = RelationGraphSet::new([K::Weak, K::Strong]);
    set.add_edge(K::Weak, 1, 2, ()).unwrap();
    set.add_edge(K::Strong, 1, 2, ()).unwrap();
    set.clear_relations(&[1].into_iter().collect());
    assert!(!set.graph(K::Weak).has_edge(1, 2));
    assert!(set.graph(K::Strong).has_edge(1, 2));
}

#[test]
fn difference_detects_added_removed_and_updated_edges() {
    let mut a: RelationGraph<u32, i32> = RelationGraph::new(true);
    a.add_edge_local(1, 2, 1).unwrap();
    a.add_edge_local(1, 3, 1).unwrap();

    let mut b: RelationGraph<u32, i32> = RelationGraph::new(true);
    b.add_edge_local(1, 2, 2).unwrap();
    b.add_edge_local(1, 4, 1).unwrap();

    let vertices = [1u32, 2, 3].into_iter().collect();
    let diff = a.difference(&b, &vertices, Some);

    assert!(diff.added.iter().any(|&(p, c, i)| p == 1 && c == 3 && i == 1));
    assert!(diff.updated.iter().any(|&(p, c, i)| p == 1 && c == 2 && i == 2));
    assert!(diff.removed.iter().any(|&(p, c, i)| p == 1 && c == 4 && i == 1));
}
