// Licensed under the Apache License, Version 2.0.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A stable identifier for a vertex in the plan: a task or an event generator.
///
/// Relations are always id-to-id, never object-to-object (see `relation_graph`): this is what
/// lets the plan hold logical cycles (a task signalling one of its own descendants, a task
/// forwarding to itself) without any cycle in Rust's ownership graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanObjectId(u64);

impl fmt::Display for PlanObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic id allocator, one per `Plan`.
#[derive(Debug, Default)]
pub struct IdAllocator(AtomicU64);

impl IdAllocator {
    pub fn new() -> Self {
        IdAllocator(AtomicU64::new(1))
    }

    pub fn next(&self) -> PlanObjectId {
        PlanObjectId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identity of a peer process that may co-own plan objects in a distributed setting.
///
/// Conflict resolution across peers is out of scope (see Non-goals); this type only tracks who
/// is allowed to mutate an object locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub u32);

/// The peer id used by the local process in a single-peer (non-distributed) setup.
pub const LOCAL_PEER: PeerId = PeerId(0);
