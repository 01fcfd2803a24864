//! Immutable road network shared by the engine, the synchronizer and the
//! movement model
//!
//! Built once by [`RoadNetwork::build`] (see `network_builder`) and never
//! mutated afterwards. Entities are stored in dense vectors indexed by their
//! id newtypes; the name maps translate backend ids.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::intersection::{Intersection, Phase, SignalPlan};
use super::types::{
    ConnectionId, EdgeId, IntersectionId, LaneId, LaneKind, MovementId, TurnDirection,
};

/// A directed road between two intersections
#[derive(Debug, Clone)]
pub struct Edge {
    pub id: EdgeId,
    pub name: String,
    pub from: IntersectionId,
    pub to: IntersectionId,
    /// Lanes ordered by lane index
    pub lanes: Vec<LaneId>,
}

#[derive(Debug, Clone)]
pub struct Lane {
    pub id: LaneId,
    pub name: String,
    /// `None` for junction-internal lanes
    pub edge: Option<EdgeId>,
    pub index: usize,
    pub length: f64,
    pub width: f64,
    pub speed_limit: f64,
    pub kind: LaneKind,
    /// Connections leaving this lane
    pub outgoing: Vec<ConnectionId>,
}

/// A permitted lane-to-lane link through one intersection
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub id: ConnectionId,
    pub intersection: IntersectionId,
    pub from_lane: LaneId,
    pub to_lane: LaneId,
    pub via: Option<LaneId>,
    /// Internal lanes after `via` on a split crossing
    pub via_chain: Vec<LaneId>,
    pub direction: TurnDirection,
}

/// All connections from one edge into another
#[derive(Debug, Clone)]
pub struct Movement {
    pub id: MovementId,
    /// `"{from_edge}_{to_edge}"` using backend edge ids
    pub name: String,
    pub intersection: IntersectionId,
    pub from_edge: EdgeId,
    pub to_edge: EdgeId,
    pub from_lanes: Vec<LaneId>,
    pub connections: Vec<ConnectionId>,
    pub direction: TurnDirection,
}

/// The frozen network model
pub struct RoadNetwork {
    pub(super) intersections: Vec<Intersection>,
    pub(super) edges: Vec<Edge>,
    pub(super) lanes: Vec<Lane>,
    pub(super) connections: Vec<Connection>,
    pub(super) movements: Vec<Movement>,
    pub(super) signal_plans: BTreeMap<IntersectionId, SignalPlan>,

    /// Conflicting connections, indexed by connection
    pub(super) conflicts: Vec<Vec<ConnectionId>>,

    /// Intersections as nodes, edges as directed graph edges
    pub(super) graph: DiGraph<IntersectionId, EdgeId>,
    pub(super) intersection_nodes: Vec<NodeIndex>,

    pub(super) intersection_by_name: HashMap<String, IntersectionId>,
    pub(super) edge_by_name: HashMap<String, EdgeId>,
    pub(super) lane_by_name: HashMap<String, LaneId>,
    pub(super) connection_by_lanes: HashMap<(LaneId, LaneId), ConnectionId>,
    pub(super) connection_by_via: HashMap<LaneId, ConnectionId>,
    pub(super) movement_by_edges: HashMap<(EdgeId, EdgeId), MovementId>,
    pub(super) movements_by_lane: HashMap<LaneId, Vec<MovementId>>,
    pub(super) movements_by_edge: HashMap<EdgeId, Vec<MovementId>>,
}

impl RoadNetwork {
    pub fn intersections(&self) -> &[Intersection] {
        &self.intersections
    }

    pub fn intersection(&self, id: IntersectionId) -> Option<&Intersection> {
        self.intersections.get(id.0)
    }

    pub fn intersection_by_name(&self, name: &str) -> Option<IntersectionId> {
        self.intersection_by_name.get(name).copied()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id.0)
    }

    pub fn edge_by_name(&self, name: &str) -> Option<EdgeId> {
        self.edge_by_name.get(name).copied()
    }

    pub fn lanes(&self) -> &[Lane] {
        &self.lanes
    }

    pub fn lane(&self, id: LaneId) -> Option<&Lane> {
        self.lanes.get(id.0)
    }

    pub fn lane_by_name(&self, name: &str) -> Option<LaneId> {
        self.lane_by_name.get(name).copied()
    }

    /// Edge owning a lane, `None` for internal lanes
    pub fn lane_edge(&self, id: LaneId) -> Option<EdgeId> {
        self.lane(id).and_then(|lane| lane.edge)
    }

    /// Whether two lanes belong to the same edge
    pub fn same_edge(&self, a: LaneId, b: LaneId) -> bool {
        match (self.lane_edge(a), self.lane_edge(b)) {
            (Some(ea), Some(eb)) => ea == eb,
            _ => false,
        }
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id.0)
    }

    /// The connection linking `from_lane` directly to `to_lane`
    pub fn connection_between(&self, from_lane: LaneId, to_lane: LaneId) -> Option<&Connection> {
        self.connection_by_lanes
            .get(&(from_lane, to_lane))
            .and_then(|id| self.connection(*id))
    }

    /// The connection crossing the junction over internal lane `lane`
    pub fn connection_via(&self, lane: LaneId) -> Option<&Connection> {
        self.connection_by_via
            .get(&lane)
            .and_then(|id| self.connection(*id))
    }

    pub fn conflicts_with(&self, id: ConnectionId) -> &[ConnectionId] {
        self.conflicts.get(id.0).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn are_conflicting(&self, a: ConnectionId, b: ConnectionId) -> bool {
        self.conflicts_with(a).binary_search(&b).is_ok()
    }

    pub fn signal_plans(&self) -> impl Iterator<Item = &SignalPlan> {
        self.signal_plans.values()
    }

    pub fn signal_plan(&self, intersection: IntersectionId) -> Option<&SignalPlan> {
        self.signal_plans.get(&intersection)
    }

    pub fn movements(&self) -> &[Movement] {
        &self.movements
    }

    pub fn movement(&self, id: MovementId) -> Option<&Movement> {
        self.movements.get(id.0)
    }

    pub fn movement_between(&self, from_edge: EdgeId, to_edge: EdgeId) -> Option<&Movement> {
        self.movement_by_edges
            .get(&(from_edge, to_edge))
            .and_then(|id| self.movement(*id))
    }

    pub fn movement_by_name(&self, name: &str) -> Option<&Movement> {
        self.movements.iter().find(|m| m.name == name)
    }

    /// Movements that can be entered from a lane
    pub fn movements_from_lane(&self, lane: LaneId) -> &[MovementId] {
        self.movements_by_lane
            .get(&lane)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Movements that start on an edge
    pub fn movements_from_edge(&self, edge: EdgeId) -> &[MovementId] {
        self.movements_by_edge
            .get(&edge)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Movements a vehicle can take after completing `movement`
    pub fn downstream_movements(&self, movement: MovementId) -> Vec<MovementId> {
        self.movement(movement)
            .map(|m| self.movements_from_edge(m.to_edge).to_vec())
            .unwrap_or_default()
    }

    /// Movements feeding the edge `movement` starts on
    pub fn upstream_movements(&self, movement: MovementId) -> Vec<MovementId> {
        let Some(m) = self.movement(movement) else {
            return Vec::new();
        };
        let Some(start) = self.edge(m.from_edge).map(|e| e.from) else {
            return Vec::new();
        };
        let node = self.intersection_nodes[start.0];

        self.graph
            .edges_directed(node, Direction::Incoming)
            .flat_map(|edge_ref| self.movements_from_edge(*edge_ref.weight()).iter().copied())
            .filter(|id| {
                self.movement(*id)
                    .is_some_and(|upstream| upstream.to_edge == m.from_edge)
            })
            .collect()
    }

    /// Intersections reachable over a single edge
    pub fn neighbors(&self, intersection: IntersectionId) -> Vec<IntersectionId> {
        let Some(node) = self.intersection_nodes.get(intersection.0) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(*node, Direction::Outgoing)
            .map(|n| self.graph[n])
            .collect()
    }

    /// Movements with at least one connection green in `phase`
    pub fn permitted_movements(&self, phase: &Phase) -> Vec<MovementId> {
        let mut out: Vec<MovementId> = phase
            .permitted
            .iter()
            .filter_map(|c| self.connection(*c))
            .filter_map(|c| {
                let from = self.lane_edge(c.from_lane)?;
                let to = self.lane_edge(c.to_lane)?;
                self.movement_by_edges.get(&(from, to)).copied()
            })
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn intersection_count(&self) -> usize {
        self.intersections.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl fmt::Debug for RoadNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for RoadNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RoadNetwork({} intersections, {} edges, {} lanes, {} connections, {} signal plans)",
            self.intersections.len(),
            self.edges.len(),
            self.lanes.len(),
            self.connections.len(),
            self.signal_plans.len()
        )
    }
}
