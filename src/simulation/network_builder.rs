//! Network builder: validates a [`NetworkDescription`] and freezes it into a
//! [`RoadNetwork`]
//!
//! The build is a pure transformation. Every reference in the description is
//! resolved up front, so the resulting network never needs to fail a lookup
//! by construction.

use log::debug;
use petgraph::graph::DiGraph;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::f64::consts::{PI, TAU};
use std::time::Duration;

use super::error::NetworkError;
use super::intersection::{Intersection, Phase, SignalPlan};
use super::road_network::{Connection, Edge, Lane, Movement, RoadNetwork};
use super::types::{
    normalize_angle, ConnectionId, EdgeId, IntersectionId, LaneId, LaneKind, MovementId, Position,
    TurnDirection, THROUGH_TOLERANCE_DEG, UTURN_TOLERANCE_DEG,
};
use crate::backend::{ConnectionDesc, NetworkDescription, SignalPlanDesc};

/// Angular offset separating the incoming and outgoing side of one arm
/// when computing crossing chords (right-hand traffic)
const ARM_SIDE_OFFSET: f64 = 5.0 * PI / 180.0;

/// Angles closer than this are treated as the same chord endpoint
const ANGLE_EPSILON: f64 = 1e-9;

impl RoadNetwork {
    /// Build and validate a road network from a backend description
    pub fn build(desc: &NetworkDescription) -> Result<RoadNetwork, NetworkError> {
        let mut net = RoadNetwork {
            intersections: Vec::with_capacity(desc.junctions.len()),
            edges: Vec::with_capacity(desc.edges.len()),
            lanes: Vec::with_capacity(desc.lanes.len()),
            connections: Vec::with_capacity(desc.connections.len()),
            movements: Vec::new(),
            signal_plans: BTreeMap::new(),
            conflicts: Vec::new(),
            graph: DiGraph::new(),
            intersection_nodes: Vec::with_capacity(desc.junctions.len()),
            intersection_by_name: HashMap::new(),
            edge_by_name: HashMap::new(),
            lane_by_name: HashMap::new(),
            connection_by_lanes: HashMap::new(),
            connection_by_via: HashMap::new(),
            movement_by_edges: HashMap::new(),
            movements_by_lane: HashMap::new(),
            movements_by_edge: HashMap::new(),
        };

        net.add_junctions(desc)?;
        net.add_edges(desc)?;
        net.add_lanes(desc)?;
        for (index, conn) in desc.connections.iter().enumerate() {
            net.add_connection(index, conn)?;
        }
        for plan in &desc.signals {
            net.add_signal_plan(plan)?;
        }
        net.group_movements();
        net.compute_conflicts();

        debug!("Built {net}");
        Ok(net)
    }

    fn add_junctions(&mut self, desc: &NetworkDescription) -> Result<(), NetworkError> {
        for junction in &desc.junctions {
            if self.intersection_by_name.contains_key(&junction.id) {
                return Err(NetworkError::DuplicateId {
                    kind: "junction",
                    id: junction.id.clone(),
                });
            }
            let id = IntersectionId(self.intersections.len());
            self.intersections
                .push(Intersection::new(id, junction.id.clone(), junction.position));
            self.intersection_nodes.push(self.graph.add_node(id));
            self.intersection_by_name.insert(junction.id.clone(), id);
        }
        Ok(())
    }

    fn add_edges(&mut self, desc: &NetworkDescription) -> Result<(), NetworkError> {
        for edge in &desc.edges {
            if self.edge_by_name.contains_key(&edge.id) {
                return Err(NetworkError::DuplicateId {
                    kind: "edge",
                    id: edge.id.clone(),
                });
            }
            let resolve = |junction: &str| {
                self.intersection_by_name
                    .get(junction)
                    .copied()
                    .ok_or_else(|| NetworkError::UnknownJunction {
                        edge: edge.id.clone(),
                        junction: junction.to_string(),
                    })
            };
            let from = resolve(&edge.from)?;
            let to = resolve(&edge.to)?;

            let id = EdgeId(self.edges.len());
            self.edges.push(Edge {
                id,
                name: edge.id.clone(),
                from,
                to,
                lanes: Vec::new(),
            });
            self.intersections[from.0].outgoing.push(id);
            self.intersections[to.0].incoming.push(id);
            self.graph.add_edge(
                self.intersection_nodes[from.0],
                self.intersection_nodes[to.0],
                id,
            );
            self.edge_by_name.insert(edge.id.clone(), id);
        }
        Ok(())
    }

    fn add_lanes(&mut self, desc: &NetworkDescription) -> Result<(), NetworkError> {
        for lane in &desc.lanes {
            if self.lane_by_name.contains_key(&lane.id) {
                return Err(NetworkError::DuplicateId {
                    kind: "lane",
                    id: lane.id.clone(),
                });
            }
            let edge = match &lane.edge {
                Some(name) => Some(self.edge_by_name.get(name).copied().ok_or_else(|| {
                    NetworkError::UnknownEdge {
                        lane: lane.id.clone(),
                        edge: name.clone(),
                    }
                })?),
                None => None,
            };

            let id = LaneId(self.lanes.len());
            self.lanes.push(Lane {
                id,
                name: lane.id.clone(),
                edge,
                index: lane.index,
                length: lane.length,
                width: lane.width,
                speed_limit: lane.speed_limit,
                kind: if edge.is_some() {
                    LaneKind::Normal
                } else {
                    LaneKind::Internal
                },
                outgoing: Vec::new(),
            });
            if let Some(edge) = edge {
                self.edges[edge.0].lanes.push(id);
            }
            self.lane_by_name.insert(lane.id.clone(), id);
        }

        // Keep each edge's lanes in lane-index order
        let lanes = &self.lanes;
        for edge in &mut self.edges {
            edge.lanes.sort_by_key(|lane| lanes[lane.0].index);
        }
        Ok(())
    }

    fn add_connection(&mut self, index: usize, desc: &ConnectionDesc) -> Result<(), NetworkError> {
        let resolve = |name: &str| {
            self.lane_by_name
                .get(name)
                .copied()
                .ok_or_else(|| NetworkError::UnknownLane {
                    index,
                    lane: name.to_string(),
                })
        };
        let from_lane = resolve(&desc.from_lane)?;
        let to_lane = resolve(&desc.to_lane)?;
        let via = desc.via.as_deref().map(resolve).transpose()?;
        let via_chain = desc
            .via_chain
            .iter()
            .map(|name| resolve(name))
            .collect::<Result<Vec<_>, _>>()?;

        let endpoint_edge = |lane: LaneId, name: &str| {
            self.lanes[lane.0]
                .edge
                .ok_or_else(|| NetworkError::InternalEndpoint {
                    index,
                    lane: name.to_string(),
                })
        };
        let from_edge = endpoint_edge(from_lane, &desc.from_lane)?;
        let to_edge = endpoint_edge(to_lane, &desc.to_lane)?;

        let junction = self.edges[from_edge.0].to;
        if self.edges[to_edge.0].from != junction {
            return Err(NetworkError::DisjointConnection {
                index,
                from_lane: desc.from_lane.clone(),
                to_lane: desc.to_lane.clone(),
            });
        }

        let direction = desc
            .direction
            .unwrap_or_else(|| self.infer_direction(from_edge, to_edge));

        let id = ConnectionId(self.connections.len());
        self.connections.push(Connection {
            id,
            intersection: junction,
            from_lane,
            to_lane,
            via,
            via_chain: via_chain.clone(),
            direction,
        });
        self.lanes[from_lane.0].outgoing.push(id);
        self.intersections[junction.0].connections.push(id);
        // First description wins for duplicated lane pairs
        self.connection_by_lanes
            .entry((from_lane, to_lane))
            .or_insert(id);
        for lane in via.into_iter().chain(via_chain) {
            self.connection_by_via.entry(lane).or_insert(id);
        }
        Ok(())
    }

    /// Classify a turn from the approach and exit headings at the junction
    fn infer_direction(&self, from_edge: EdgeId, to_edge: EdgeId) -> TurnDirection {
        let upstream = &self.edges[from_edge.0];
        let downstream = &self.edges[to_edge.0];
        if downstream.to == upstream.from {
            return TurnDirection::UTurn;
        }

        let origin = self.intersections[upstream.from.0].position;
        let junction = self.intersections[upstream.to.0].position;
        let target = self.intersections[downstream.to.0].position;

        let delta = normalize_angle(junction.angle_to(&target) - origin.angle_to(&junction));
        classify_heading_change(delta.to_degrees())
    }

    fn add_signal_plan(&mut self, desc: &SignalPlanDesc) -> Result<(), NetworkError> {
        let intersection = self
            .intersection_by_name
            .get(&desc.intersection)
            .copied()
            .ok_or_else(|| NetworkError::UnknownIntersection(desc.intersection.clone()))?;
        if self.signal_plans.contains_key(&intersection) {
            return Err(NetworkError::DuplicatePlan(desc.intersection.clone()));
        }

        let mut phases = Vec::with_capacity(desc.phases.len());
        for (index, phase) in desc.phases.iter().enumerate() {
            // Rejects negative, NaN and infinite durations
            let duration = Duration::try_from_secs_f64(phase.duration).map_err(|_| {
                NetworkError::InvalidPhaseDuration {
                    intersection: desc.intersection.clone(),
                    phase: index,
                    duration: phase.duration,
                }
            })?;

            let mut permitted = Vec::with_capacity(phase.permitted.len());
            for &connection in &phase.permitted {
                let conn = self.connections.get(connection).ok_or_else(|| {
                    NetworkError::PhaseConnectionOutOfRange {
                        intersection: desc.intersection.clone(),
                        phase: index,
                        connection,
                    }
                })?;
                if conn.intersection != intersection {
                    return Err(NetworkError::ForeignPhaseConnection {
                        intersection: desc.intersection.clone(),
                        phase: index,
                        connection,
                        owner: self.intersections[conn.intersection.0].name.clone(),
                    });
                }
                permitted.push(conn.id);
            }
            permitted.sort();
            permitted.dedup();

            phases.push(Phase {
                index,
                duration,
                permitted,
            });
        }

        self.signal_plans.insert(
            intersection,
            SignalPlan {
                intersection,
                phases,
            },
        );
        Ok(())
    }

    /// Group connections by (from edge, to edge) into movements
    fn group_movements(&mut self) {
        for conn in &self.connections {
            let (Some(from_edge), Some(to_edge)) = (
                self.lanes[conn.from_lane.0].edge,
                self.lanes[conn.to_lane.0].edge,
            ) else {
                continue;
            };

            let id = match self.movement_by_edges.get(&(from_edge, to_edge)) {
                Some(id) => *id,
                None => {
                    let id = MovementId(self.movements.len());
                    self.movements.push(Movement {
                        id,
                        name: format!(
                            "{}_{}",
                            self.edges[from_edge.0].name, self.edges[to_edge.0].name
                        ),
                        intersection: conn.intersection,
                        from_edge,
                        to_edge,
                        from_lanes: Vec::new(),
                        connections: Vec::new(),
                        direction: conn.direction,
                    });
                    self.movement_by_edges.insert((from_edge, to_edge), id);
                    self.movements_by_edge.entry(from_edge).or_default().push(id);
                    id
                }
            };

            let movement = &mut self.movements[id.0];
            movement.connections.push(conn.id);
            if !movement.from_lanes.contains(&conn.from_lane) {
                movement.from_lanes.push(conn.from_lane);
                self.movements_by_lane
                    .entry(conn.from_lane)
                    .or_default()
                    .push(id);
            }
        }
    }

    /// Pairwise conflicts between connections of different upstream edges
    fn compute_conflicts(&mut self) {
        let mut conflicts: Vec<HashSet<ConnectionId>> =
            vec![HashSet::new(); self.connections.len()];

        for intersection in &self.intersections {
            let chords: Vec<(ConnectionId, EdgeId, LaneId, f64, f64)> = intersection
                .connections
                .iter()
                .filter_map(|id| {
                    let conn = &self.connections[id.0];
                    let from_edge = self.lanes[conn.from_lane.0].edge?;
                    let to_edge = self.lanes[conn.to_lane.0].edge?;
                    let center = intersection.position;
                    let origin = self.intersections[self.edges[from_edge.0].from.0].position;
                    let target = self.intersections[self.edges[to_edge.0].to.0].position;
                    let approach = arm_angle(&center, &origin) + ARM_SIDE_OFFSET;
                    let exit = arm_angle(&center, &target) - ARM_SIDE_OFFSET;
                    Some((conn.id, from_edge, conn.to_lane, approach, exit))
                })
                .collect();

            for (i, a) in chords.iter().enumerate() {
                for b in &chords[i + 1..] {
                    if a.1 == b.1 {
                        continue;
                    }
                    if a.2 == b.2 || chords_cross(a.3, a.4, b.3, b.4) {
                        conflicts[a.0 .0].insert(b.0);
                        conflicts[b.0 .0].insert(a.0);
                    }
                }
            }
        }

        self.conflicts = conflicts
            .into_iter()
            .map(|set| {
                let mut list: Vec<ConnectionId> = set.into_iter().collect();
                list.sort();
                list
            })
            .collect();
    }
}

/// Map a signed heading change in degrees to a turn direction
pub fn classify_heading_change(delta_deg: f64) -> TurnDirection {
    if delta_deg.abs() <= THROUGH_TOLERANCE_DEG {
        TurnDirection::Through
    } else if delta_deg.abs() >= 180.0 - UTURN_TOLERANCE_DEG {
        TurnDirection::UTurn
    } else if delta_deg > 0.0 {
        TurnDirection::Left
    } else {
        TurnDirection::Right
    }
}

/// Direction from the junction center toward an arm, in [0, TAU)
fn arm_angle(center: &Position, toward: &Position) -> f64 {
    center.angle_to(toward).rem_euclid(TAU)
}

/// Whether `x` lies strictly inside the counter-clockwise arc `start -> end`
fn strictly_between(x: f64, start: f64, end: f64) -> bool {
    let span = (end - start).rem_euclid(TAU);
    let offset = (x - start).rem_euclid(TAU);
    offset > ANGLE_EPSILON && offset < span - ANGLE_EPSILON
}

fn same_angle(a: f64, b: f64) -> bool {
    let d = (a - b).rem_euclid(TAU);
    d < ANGLE_EPSILON || d > TAU - ANGLE_EPSILON
}

/// Two chords of a circle cross iff their endpoints strictly interleave
fn chords_cross(a1: f64, b1: f64, a2: f64, b2: f64) -> bool {
    if same_angle(a1, a2) || same_angle(a1, b2) || same_angle(b1, a2) || same_angle(b1, b2) {
        return false;
    }
    strictly_between(a2, a1, b1) != strictly_between(b2, a1, b1)
}
