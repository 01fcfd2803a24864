//! Intersections, their signal phase plans, and per-step traffic light state

use std::collections::BTreeSet;
use std::time::Duration;

use super::types::{ConnectionId, EdgeId, IntersectionId, Position};

/// A junction in the road network
#[derive(Debug, Clone)]
pub struct Intersection {
    pub id: IntersectionId,
    /// Backend id
    pub name: String,
    pub position: Position,
    pub incoming: Vec<EdgeId>,
    pub outgoing: Vec<EdgeId>,
    /// Connections that cross this intersection
    pub connections: Vec<ConnectionId>,
}

impl Intersection {
    pub fn new(id: IntersectionId, name: String, position: Position) -> Self {
        Self {
            id,
            name,
            position,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            connections: Vec::new(),
        }
    }
}

/// One phase of a signal plan
#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    pub index: usize,
    pub duration: Duration,
    /// Connections with a green light in this phase, sorted
    pub permitted: Vec<ConnectionId>,
}

impl Phase {
    pub fn permits(&self, connection: ConnectionId) -> bool {
        self.permitted.binary_search(&connection).is_ok()
    }
}

/// Ordered phase list of one signalized intersection
#[derive(Debug, Clone, PartialEq)]
pub struct SignalPlan {
    pub intersection: IntersectionId,
    pub phases: Vec<Phase>,
}

impl SignalPlan {
    pub fn phase(&self, index: usize) -> Option<&Phase> {
        self.phases.get(index)
    }

    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    /// Every connection that is green in at least one phase
    pub fn controlled_connections(&self) -> Vec<ConnectionId> {
        self.phases
            .iter()
            .flat_map(|phase| phase.permitted.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Connections that are green in every phase (the signal never stops them)
    pub fn uncontrolled_connections(&self) -> Vec<ConnectionId> {
        let Some((first, rest)) = self.phases.split_first() else {
            return Vec::new();
        };
        first
            .permitted
            .iter()
            .copied()
            .filter(|c| rest.iter().all(|phase| phase.permits(*c)))
            .collect()
    }
}

/// Live signal state of a signalized intersection
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficLight {
    pub intersection: IntersectionId,
    pub phase_index: usize,
    pub time_in_phase: Duration,
}

impl TrafficLight {
    /// Plan default: first phase, just entered
    pub fn new(intersection: IntersectionId) -> Self {
        Self {
            intersection,
            phase_index: 0,
            time_in_phase: Duration::ZERO,
        }
    }

    pub fn current_phase<'a>(&self, plan: &'a SignalPlan) -> Option<&'a Phase> {
        plan.phase(self.phase_index)
    }
}
