//! Entity state synchronization
//!
//! Turns one step of raw backend reports into a [`StateSnapshot`], diffing
//! vehicles by id against the previous snapshot so that surviving vehicles
//! keep their identity and accumulated history.

use log::{debug, warn};
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use super::error::SyncDiagnostic;
use super::intersection::TrafficLight;
use super::road_network::RoadNetwork;
use super::types::{IntersectionId, LaneId, VehicleId};
use super::vehicle::{RouteStep, Vehicle};
use crate::backend::{RawSignal, RawVehicle};

/// Complete entity state at one step
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub step: u64,
    pub time: Duration,
    pub vehicles: BTreeMap<VehicleId, Vehicle>,
    pub traffic_lights: BTreeMap<IntersectionId, TrafficLight>,
    /// Vehicles that entered the snapshot this step, sorted
    pub departed: Vec<VehicleId>,
    /// Vehicles the backend stopped reporting this step, sorted
    pub exited: Vec<VehicleId>,
}

impl StateSnapshot {
    /// State right after a reset: no vehicles, every signal at phase 0
    pub fn initial(network: &RoadNetwork) -> Self {
        Self {
            step: 0,
            time: Duration::ZERO,
            vehicles: BTreeMap::new(),
            traffic_lights: network
                .signal_plans()
                .map(|plan| (plan.intersection, TrafficLight::new(plan.intersection)))
                .collect(),
            departed: Vec::new(),
            exited: Vec::new(),
        }
    }

    pub fn time_secs(&self) -> f64 {
        self.time.as_secs_f64()
    }

    pub fn vehicle(&self, id: &str) -> Option<&Vehicle> {
        self.vehicles.get(id)
    }

    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    pub fn traffic_light(&self, intersection: IntersectionId) -> Option<&TrafficLight> {
        self.traffic_lights.get(&intersection)
    }

    /// Vehicles on a lane, front of the queue first
    pub fn vehicles_on_lane(&self, lane: LaneId) -> Vec<&Vehicle> {
        let mut on_lane: Vec<&Vehicle> = self.vehicles.values().filter(|v| v.lane == lane).collect();
        on_lane.sort_by_key(|v| Reverse(OrderedFloat(v.position)));
        on_lane
    }

    /// Number of vehicles on a lane slower than `threshold` m/s
    pub fn lane_queue_length(&self, lane: LaneId, threshold: f64) -> usize {
        self.vehicles
            .values()
            .filter(|v| v.lane == lane && v.is_halted(threshold))
            .count()
    }
}

/// Result of one synchronization pass
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub snapshot: StateSnapshot,
    pub diagnostics: Vec<SyncDiagnostic>,
}

/// Per-episode bookkeeping that survives between snapshots
#[derive(Debug, Default)]
pub struct EntitySynchronizer {
    /// Ids the backend reported on the previous step
    last_reported: HashSet<VehicleId>,
    /// Ids that stopped being reported; they may not come back this episode
    exited: HashSet<VehicleId>,
    /// Vehicles currently on lanes the network does not know
    suspended: HashMap<VehicleId, Vehicle>,
}

impl EntitySynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything; called on reset
    pub fn clear(&mut self) {
        self.last_reported.clear();
        self.exited.clear();
        self.suspended.clear();
    }

    pub fn exited_count(&self) -> usize {
        self.exited.len()
    }

    pub fn is_suspended(&self, id: &str) -> bool {
        self.suspended.contains_key(id)
    }

    /// Build the snapshot for `step` from the raw reports
    pub fn sync(
        &mut self,
        previous: &StateSnapshot,
        raw_vehicles: &[RawVehicle],
        raw_signals: &[RawSignal],
        network: &RoadNetwork,
        step: u64,
        time: Duration,
    ) -> SyncOutcome {
        let mut diagnostics = Vec::new();
        let VehicleChanges {
            vehicles,
            departed,
            exited,
        } = self.sync_vehicles(previous, raw_vehicles, network, step, &mut diagnostics);
        let traffic_lights = sync_signals(previous, raw_signals, network, &mut diagnostics);

        SyncOutcome {
            snapshot: StateSnapshot {
                step,
                time,
                vehicles,
                traffic_lights,
                departed,
                exited,
            },
            diagnostics,
        }
    }

    fn sync_vehicles(
        &mut self,
        previous: &StateSnapshot,
        raw_vehicles: &[RawVehicle],
        network: &RoadNetwork,
        step: u64,
        diagnostics: &mut Vec<SyncDiagnostic>,
    ) -> VehicleChanges {
        let mut vehicles = BTreeMap::new();
        let mut departed = Vec::new();
        let mut reported = HashSet::with_capacity(raw_vehicles.len());

        for raw in raw_vehicles {
            let id = VehicleId::from(raw.id.as_str());
            if !reported.insert(id.clone()) {
                debug!("Vehicle {id} reported twice in step {step}, keeping the first report");
                continue;
            }

            if self.exited.contains(&id) {
                let diagnostic = SyncDiagnostic::ReappearedVehicle(raw.id.clone());
                warn!("{diagnostic}");
                diagnostics.push(diagnostic);
                continue;
            }

            let Some(lane) = network.lane_by_name(&raw.lane) else {
                let diagnostic = SyncDiagnostic::UnknownLaneReference {
                    vehicle: raw.id.clone(),
                    lane: raw.lane.clone(),
                };
                warn!("{diagnostic}");
                diagnostics.push(diagnostic);
                // Keep the record so the vehicle resumes with its history
                if let Some(known) = previous.vehicles.get(&id) {
                    self.suspended.insert(id, known.clone());
                }
                continue;
            };

            let route = resolve_route(&raw.route, network, &id, lane);
            let vehicle = match previous
                .vehicles
                .get(&id)
                .cloned()
                .or_else(|| self.suspended.remove(&id))
            {
                Some(mut vehicle) => {
                    vehicle.update(lane, raw.position, raw.speed, step);
                    if !route.is_empty() {
                        vehicle.route = route;
                    }
                    vehicle
                }
                None => {
                    departed.push(id.clone());
                    Vehicle::new(id.clone(), lane, raw.position, raw.speed, route, step)
                }
            };
            vehicles.insert(id, vehicle);
        }

        let mut exited: Vec<VehicleId> = self.last_reported.difference(&reported).cloned().collect();
        exited.sort();
        for id in &exited {
            debug!("Vehicle {id} left the network at step {step}");
            self.suspended.remove(id);
            self.exited.insert(id.clone());
        }
        self.last_reported = reported;
        departed.sort();

        VehicleChanges {
            vehicles,
            departed,
            exited,
        }
    }
}

struct VehicleChanges {
    vehicles: BTreeMap<VehicleId, Vehicle>,
    departed: Vec<VehicleId>,
    exited: Vec<VehicleId>,
}

fn sync_signals(
    previous: &StateSnapshot,
    raw_signals: &[RawSignal],
    network: &RoadNetwork,
    diagnostics: &mut Vec<SyncDiagnostic>,
) -> BTreeMap<IntersectionId, TrafficLight> {
    let mut lights = previous.traffic_lights.clone();

    for raw in raw_signals {
        let plan = network
            .intersection_by_name(&raw.intersection)
            .and_then(|id| network.signal_plan(id));
        let Some(plan) = plan else {
            let diagnostic = SyncDiagnostic::UnknownSignal(raw.intersection.clone());
            warn!("{diagnostic}");
            diagnostics.push(diagnostic);
            continue;
        };

        if raw.phase_index >= plan.phase_count() {
            let diagnostic = SyncDiagnostic::PhaseOutOfRange {
                intersection: raw.intersection.clone(),
                phase: raw.phase_index,
                phases: plan.phase_count(),
            };
            warn!("{diagnostic}");
            diagnostics.push(diagnostic);
            continue;
        }

        lights.insert(
            plan.intersection,
            TrafficLight {
                intersection: plan.intersection,
                phase_index: raw.phase_index,
                time_in_phase: Duration::try_from_secs_f64(raw.time_in_phase).unwrap_or_default(),
            },
        );
    }

    lights
}

/// Map route edge ids onto the network, skipping edges it does not contain.
///
/// Only the lane of the edge the vehicle is on right now is known.
fn resolve_route(
    route: &[String],
    network: &RoadNetwork,
    vehicle: &VehicleId,
    current: LaneId,
) -> Vec<RouteStep> {
    let current_edge = network.lane_edge(current);
    route
        .iter()
        .filter_map(|name| match network.edge_by_name(name) {
            Some(edge) => Some(RouteStep {
                edge,
                lane: (Some(edge) == current_edge).then_some(current),
            }),
            None => {
                debug!("Vehicle {vehicle} route edge {name:?} is not in the network, skipping");
                None
            }
        })
        .collect()
}
