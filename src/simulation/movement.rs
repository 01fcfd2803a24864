//! Movement model: facts derived from the snapshot history
//!
//! Everything here is a pure function of a history window and the road
//! network. Lookups that fail degrade to `Unknown`/`Unclassified` instead of
//! erroring, because backends routinely put vehicles on lanes or links the
//! static description only partly covers.

use std::collections::BTreeMap;
use std::time::Duration;

use super::road_network::RoadNetwork;
use super::sync::StateSnapshot;
use super::types::{ConnectionId, IntersectionId, LaneId, MovementId, TurnDirection, VehicleId};
use super::vehicle::LaneTransition;

/// How a vehicle's most recent lane transition is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MovementClass {
    /// No lane transition observed yet
    Unknown,
    /// A transition was observed but matches no connection
    Unclassified,
    Through,
    Left,
    Right,
    UTurn,
    /// Moved between lanes of the same edge
    LaneChange,
}

impl From<TurnDirection> for MovementClass {
    fn from(direction: TurnDirection) -> Self {
        match direction {
            TurnDirection::Through => MovementClass::Through,
            TurnDirection::Left => MovementClass::Left,
            TurnDirection::Right => MovementClass::Right,
            TurnDirection::UTurn => MovementClass::UTurn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryPoint {
    pub step: u64,
    pub time: Duration,
    pub lane: LaneId,
    pub position: f64,
    pub speed: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VehicleMovement {
    pub vehicle: VehicleId,
    pub classification: MovementClass,
    /// Transition the classification was derived from
    pub transition: Option<LaneTransition>,
    /// Connection matched for the transition
    pub connection: Option<ConnectionId>,
    /// Observations within the history window, oldest first
    pub trajectory: Vec<TrajectoryPoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalMovement {
    pub intersection: IntersectionId,
    pub phase_index: usize,
    pub time_in_phase: Duration,
    pub permitted: Vec<ConnectionId>,
    pub permitted_movements: Vec<MovementId>,
}

/// Connections in use at one intersection, and the conflicting pairs among them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictOccupancy {
    pub occupied: Vec<ConnectionId>,
    pub contested: Vec<(ConnectionId, ConnectionId)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MovementFacts {
    /// Step of the snapshot these facts describe
    pub step: u64,
    pub time: Duration,
    pub vehicles: BTreeMap<VehicleId, VehicleMovement>,
    pub signals: BTreeMap<IntersectionId, SignalMovement>,
    /// Only intersections with at least one occupied connection
    pub conflicts: BTreeMap<IntersectionId, ConflictOccupancy>,
}

impl MovementFacts {
    pub fn vehicle(&self, id: &str) -> Option<&VehicleMovement> {
        self.vehicles.get(id)
    }

    pub fn signal(&self, intersection: IntersectionId) -> Option<&SignalMovement> {
        self.signals.get(&intersection)
    }

    pub fn conflict(&self, intersection: IntersectionId) -> Option<&ConflictOccupancy> {
        self.conflicts.get(&intersection)
    }

    pub fn count(&self, class: MovementClass) -> usize {
        self.vehicles
            .values()
            .filter(|v| v.classification == class)
            .count()
    }
}

/// Derive movement facts for the last snapshot of `history` (oldest first)
pub fn derive(history: &[&StateSnapshot], network: &RoadNetwork) -> MovementFacts {
    let Some((latest, earlier)) = history.split_last() else {
        return MovementFacts::default();
    };
    let previous = earlier.last();

    let mut vehicles = BTreeMap::new();
    let mut occupied: BTreeMap<IntersectionId, Vec<ConnectionId>> = BTreeMap::new();

    for vehicle in latest.vehicles.values() {
        let observed = previous
            .and_then(|p| p.vehicles.get(&vehicle.id))
            .filter(|before| before.lane != vehicle.lane)
            .map(|before| LaneTransition {
                from: before.lane,
                to: vehicle.lane,
                at: latest.step,
            });
        let transition = observed.or(vehicle.last_transition);

        let (classification, connection) = match transition {
            Some(t) => classify_transition(network, t.from, t.to),
            None => (MovementClass::Unknown, None),
        };

        // On the junction-internal lane, or crossed it during the last tick
        let crossing = network.connection_via(vehicle.lane).map(|c| c.id).or_else(|| {
            transition
                .filter(|t| t.at == latest.step)
                .and(connection)
        });
        if let Some(conn) = crossing.and_then(|id| network.connection(id)) {
            occupied.entry(conn.intersection).or_default().push(conn.id);
        }

        let trajectory = history
            .iter()
            .filter_map(|snapshot| {
                snapshot.vehicles.get(&vehicle.id).map(|v| TrajectoryPoint {
                    step: snapshot.step,
                    time: snapshot.time,
                    lane: v.lane,
                    position: v.position,
                    speed: v.speed,
                })
            })
            .collect();

        vehicles.insert(
            vehicle.id.clone(),
            VehicleMovement {
                vehicle: vehicle.id.clone(),
                classification,
                transition,
                connection,
                trajectory,
            },
        );
    }

    let signals = latest
        .traffic_lights
        .iter()
        .filter_map(|(id, light)| {
            let plan = network.signal_plan(*id)?;
            let phase = light.current_phase(plan)?;
            Some((
                *id,
                SignalMovement {
                    intersection: *id,
                    phase_index: light.phase_index,
                    time_in_phase: light.time_in_phase,
                    permitted: phase.permitted.clone(),
                    permitted_movements: network.permitted_movements(phase),
                },
            ))
        })
        .collect();

    let conflicts = occupied
        .into_iter()
        .map(|(intersection, mut connections)| {
            connections.sort();
            connections.dedup();
            let mut contested = Vec::new();
            for (i, a) in connections.iter().enumerate() {
                for b in &connections[i + 1..] {
                    if network.are_conflicting(*a, *b) {
                        contested.push((*a, *b));
                    }
                }
            }
            (
                intersection,
                ConflictOccupancy {
                    occupied: connections,
                    contested,
                },
            )
        })
        .collect();

    MovementFacts {
        step: latest.step,
        time: latest.time,
        vehicles,
        signals,
        conflicts,
    }
}

/// Classify a lane transition and find the connection it used
pub fn classify_transition(
    network: &RoadNetwork,
    from: LaneId,
    to: LaneId,
) -> (MovementClass, Option<ConnectionId>) {
    let connection = network
        .connection_between(from, to)
        .or_else(|| network.connection_via(from).filter(|c| c.to_lane == to))
        .or_else(|| network.connection_via(to).filter(|c| c.from_lane == from))
        .or_else(|| {
            // Between two internal lanes of the same crossing
            let inner = network.connection_via(from)?;
            network
                .connection_via(to)
                .filter(|c| c.id == inner.id)
        });

    match connection {
        Some(c) => (c.direction.into(), Some(c.id)),
        None if network.same_edge(from, to) => (MovementClass::LaneChange, None),
        None => (MovementClass::Unclassified, None),
    }
}

/// Halted vehicles waiting to take `movement`.
///
/// Lanes that serve only this movement count every halted vehicle; shared
/// lanes only count vehicles whose next route edge is the movement's exit.
pub fn movement_queue_length(
    network: &RoadNetwork,
    snapshot: &StateSnapshot,
    movement: MovementId,
    threshold: f64,
) -> usize {
    let Some(m) = network.movement(movement) else {
        return 0;
    };

    m.from_lanes
        .iter()
        .map(|lane| {
            let shared = network.movements_from_lane(*lane).len() > 1;
            snapshot
                .vehicles
                .values()
                .filter(|v| v.lane == *lane && v.is_halted(threshold))
                .filter(|v| !shared || v.next_edge(network) == Some(m.to_edge))
                .count()
        })
        .sum()
}
