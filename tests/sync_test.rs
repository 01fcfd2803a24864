//! Entity state synchronization across steps

mod common;

use std::time::Duration;

use common::{four_arm_network, raw_signal, raw_vehicle, via_lane};
use silicon_traffic::backend::{RawSignal, RawVehicle};
use silicon_traffic::simulation::{
    EntitySynchronizer, RoadNetwork, StateSnapshot, SyncDiagnostic, SyncOutcome, VehicleId,
};

struct Harness {
    network: RoadNetwork,
    sync: EntitySynchronizer,
    snapshot: StateSnapshot,
}

impl Harness {
    fn new() -> Self {
        let network = four_arm_network();
        let snapshot = StateSnapshot::initial(&network);
        Self {
            network,
            sync: EntitySynchronizer::new(),
            snapshot,
        }
    }

    fn step(&mut self, vehicles: Vec<RawVehicle>, signals: Vec<RawSignal>) -> SyncOutcome {
        let step = self.snapshot.step + 1;
        let outcome = self.sync.sync(
            &self.snapshot,
            &vehicles,
            &signals,
            &self.network,
            step,
            Duration::from_secs(step),
        );
        self.snapshot = outcome.snapshot.clone();
        outcome
    }
}

#[test]
fn test_initial_snapshot_has_lights_and_no_vehicles() {
    let h = Harness::new();
    let c = h.network.intersection_by_name("C").unwrap();
    assert_eq!(h.snapshot.step, 0);
    assert_eq!(h.snapshot.time, Duration::ZERO);
    assert_eq!(h.snapshot.vehicle_count(), 0);
    let light = h.snapshot.traffic_light(c).unwrap();
    assert_eq!(light.phase_index, 0);
    assert_eq!(light.time_in_phase, Duration::ZERO);
}

#[test]
fn test_new_vehicle_is_created() {
    let mut h = Harness::new();
    let outcome = h.step(vec![raw_vehicle("v1", "W_C_0", 10.0, 8.0, &["W_C", "C_E"])], vec![]);
    assert!(outcome.diagnostics.is_empty());

    let v = outcome.snapshot.vehicle("v1").unwrap();
    assert_eq!(v.lane, h.network.lane_by_name("W_C_0").unwrap());
    assert_eq!(v.first_seen, 1);
    assert_eq!(v.observed_steps, 1);
    assert_eq!(v.last_transition, None);
    assert_eq!(v.route.len(), 2);
    assert_eq!(v.route[0].lane, Some(v.lane));
    assert_eq!(v.route[1].lane, None);
}

#[test]
fn test_surviving_vehicle_keeps_identity() {
    let mut h = Harness::new();
    h.step(vec![raw_vehicle("v1", "W_C_0", 10.0, 8.0, &["W_C", "C_E"])], vec![]);
    h.step(vec![raw_vehicle("v1", "W_C_0", 18.0, 8.0, &["W_C", "C_E"])], vec![]);
    let outcome = h.step(vec![raw_vehicle("v1", "W_C_1", 26.0, 8.0, &["W_C", "C_N"])], vec![]);

    let v = outcome.snapshot.vehicle("v1").unwrap();
    assert_eq!(v.first_seen, 1);
    assert_eq!(v.observed_steps, 3);
    assert_eq!(v.position, 26.0);
    let transition = v.last_transition.unwrap();
    assert_eq!(transition.from, h.network.lane_by_name("W_C_0").unwrap());
    assert_eq!(transition.to, h.network.lane_by_name("W_C_1").unwrap());
    assert_eq!(transition.at, 3);
    // Route follows the latest report
    assert_eq!(v.route[1].edge, h.network.edge_by_name("C_N").unwrap());
}

#[test]
fn test_absent_vehicle_is_dropped_and_may_not_return() {
    let mut h = Harness::new();
    h.step(
        vec![
            raw_vehicle("v1", "W_C_0", 10.0, 8.0, &[]),
            raw_vehicle("v2", "N_C_0", 10.0, 8.0, &[]),
        ],
        vec![],
    );
    let outcome = h.step(vec![raw_vehicle("v2", "N_C_0", 18.0, 8.0, &[])], vec![]);
    assert!(outcome.snapshot.vehicle("v1").is_none());
    assert_eq!(h.sync.exited_count(), 1);

    let outcome = h.step(
        vec![
            raw_vehicle("v1", "W_C_0", 10.0, 8.0, &[]),
            raw_vehicle("v2", "N_C_0", 26.0, 8.0, &[]),
        ],
        vec![],
    );
    assert!(outcome.snapshot.vehicle("v1").is_none());
    assert_eq!(
        outcome.diagnostics,
        vec![SyncDiagnostic::ReappearedVehicle("v1".to_string())]
    );
    assert_eq!(outcome.snapshot.vehicle("v2").unwrap().observed_steps, 3);
}

#[test]
fn test_unknown_lane_suspends_and_restores_vehicle() {
    let mut h = Harness::new();
    h.step(vec![raw_vehicle("v1", "W_C_1", 90.0, 5.0, &["W_C", "C_N"])], vec![]);

    // CityFlow-style lane link id the network does not describe
    let outcome = h.step(vec![raw_vehicle("v1", "W_C_1_C_N_0", 2.0, 5.0, &["C_N"])], vec![]);
    assert!(outcome.snapshot.vehicle("v1").is_none());
    assert_eq!(
        outcome.diagnostics,
        vec![SyncDiagnostic::UnknownLaneReference {
            vehicle: "v1".to_string(),
            lane: "W_C_1_C_N_0".to_string(),
        }]
    );
    assert!(h.sync.is_suspended("v1"));
    assert_eq!(h.sync.exited_count(), 0);

    let outcome = h.step(vec![raw_vehicle("v1", "C_N_0", 4.0, 6.0, &["C_N"])], vec![]);
    assert!(outcome.diagnostics.is_empty());
    assert!(!h.sync.is_suspended("v1"));
    let v = outcome.snapshot.vehicle("v1").unwrap();
    assert_eq!(v.first_seen, 1);
    assert_eq!(v.observed_steps, 2);
    let transition = v.last_transition.unwrap();
    assert_eq!(transition.from, h.network.lane_by_name("W_C_1").unwrap());
    assert_eq!(transition.to, h.network.lane_by_name("C_N_0").unwrap());
}

#[test]
fn test_suspended_vehicle_that_vanishes_exits() {
    let mut h = Harness::new();
    h.step(vec![raw_vehicle("v1", "W_C_1", 90.0, 5.0, &[])], vec![]);
    h.step(vec![raw_vehicle("v1", "nowhere", 1.0, 5.0, &[])], vec![]);
    assert!(h.sync.is_suspended("v1"));
    h.step(vec![], vec![]);
    assert!(!h.sync.is_suspended("v1"));
    assert_eq!(h.sync.exited_count(), 1);
}

#[test]
fn test_internal_lane_is_a_known_lane() {
    let mut h = Harness::new();
    let via = via_lane("W", "E");
    let outcome = h.step(vec![raw_vehicle("v1", &via, 3.0, 9.0, &["W_C", "C_E"])], vec![]);
    assert!(outcome.diagnostics.is_empty());
    assert_eq!(
        outcome.snapshot.vehicle("v1").unwrap().lane,
        h.network.lane_by_name(&via).unwrap()
    );
}

#[test]
fn test_unknown_route_edges_are_skipped() {
    let mut h = Harness::new();
    let outcome = h.step(
        vec![raw_vehicle("v1", "W_C_0", 10.0, 8.0, &["far_away", "W_C", "C_E", "beyond"])],
        vec![],
    );
    let route: Vec<_> = outcome
        .snapshot
        .vehicle("v1")
        .unwrap()
        .route
        .iter()
        .map(|s| s.edge)
        .collect();
    assert_eq!(
        route,
        vec![
            h.network.edge_by_name("W_C").unwrap(),
            h.network.edge_by_name("C_E").unwrap()
        ]
    );
    assert!(outcome.diagnostics.is_empty());
}

#[test]
fn test_signal_reports_overwrite_and_persist() {
    let mut h = Harness::new();
    let c = h.network.intersection_by_name("C").unwrap();

    h.step(vec![], vec![raw_signal("C", 1, 4.5)]);
    let light = h.snapshot.traffic_light(c).unwrap();
    assert_eq!(light.phase_index, 1);
    assert_eq!(light.time_in_phase, Duration::from_secs_f64(4.5));

    // Unreported: previous entry stays
    h.step(vec![], vec![]);
    assert_eq!(h.snapshot.traffic_light(c).unwrap().phase_index, 1);
}

#[test]
fn test_invalid_signal_reports_are_diagnosed() {
    let mut h = Harness::new();
    let c = h.network.intersection_by_name("C").unwrap();
    h.step(vec![], vec![raw_signal("C", 2, 1.0)]);

    let outcome = h.step(vec![], vec![raw_signal("C", 7, 0.0), raw_signal("N", 0, 0.0)]);
    assert_eq!(
        outcome.diagnostics,
        vec![
            SyncDiagnostic::PhaseOutOfRange {
                intersection: "C".to_string(),
                phase: 7,
                phases: 3,
            },
            SyncDiagnostic::UnknownSignal("N".to_string()),
        ]
    );
    assert_eq!(outcome.snapshot.traffic_light(c).unwrap().phase_index, 2);
    assert_eq!(outcome.snapshot.traffic_lights.len(), 1);
}

#[test]
fn test_lane_ordering_and_queue() {
    let mut h = Harness::new();
    let outcome = h.step(
        vec![
            raw_vehicle("back", "W_C_0", 60.0, 0.0, &[]),
            raw_vehicle("front", "W_C_0", 95.0, 0.05, &[]),
            raw_vehicle("moving", "W_C_0", 30.0, 7.0, &[]),
            raw_vehicle("other", "N_C_0", 95.0, 0.0, &[]),
        ],
        vec![],
    );
    let lane = h.network.lane_by_name("W_C_0").unwrap();
    let order: Vec<&str> = outcome
        .snapshot
        .vehicles_on_lane(lane)
        .iter()
        .map(|v| v.id.as_str())
        .collect();
    assert_eq!(order, vec!["front", "back", "moving"]);
    assert_eq!(outcome.snapshot.lane_queue_length(lane, 0.1), 2);
}

#[test]
fn test_clear_forgets_exited_vehicles() {
    let mut h = Harness::new();
    h.step(vec![raw_vehicle("v1", "W_C_0", 10.0, 8.0, &[])], vec![]);
    h.step(vec![], vec![]);
    assert_eq!(h.sync.exited_count(), 1);

    h.sync.clear();
    h.snapshot = StateSnapshot::initial(&h.network);
    let outcome = h.step(vec![raw_vehicle("v1", "W_C_0", 10.0, 8.0, &[])], vec![]);
    assert!(outcome.diagnostics.is_empty());
    assert!(outcome.snapshot.vehicle("v1").is_some());
}

fn ids(names: &[&str]) -> Vec<VehicleId> {
    names.iter().map(|n| VehicleId::from(*n)).collect()
}

#[test]
fn test_departures_and_exits_per_step() {
    let mut h = Harness::new();
    assert!(h.snapshot.departed.is_empty());
    assert!(h.snapshot.exited.is_empty());

    let outcome = h.step(
        vec![
            raw_vehicle("b", "W_C_0", 10.0, 8.0, &[]),
            raw_vehicle("a", "N_C_0", 10.0, 8.0, &[]),
        ],
        vec![],
    );
    assert_eq!(outcome.snapshot.departed, ids(&["a", "b"]));
    assert!(outcome.snapshot.exited.is_empty());

    // `b` drives on, `a` leaves, `c` departs
    let outcome = h.step(
        vec![
            raw_vehicle("b", "W_C_0", 18.0, 8.0, &[]),
            raw_vehicle("c", "E_C_0", 5.0, 8.0, &[]),
        ],
        vec![],
    );
    assert_eq!(outcome.snapshot.departed, ids(&["c"]));
    assert_eq!(outcome.snapshot.exited, ids(&["a"]));

    // A vehicle restored from an unknown lane did not depart again
    h.step(
        vec![
            raw_vehicle("b", "nowhere_0", 1.0, 8.0, &[]),
            raw_vehicle("c", "E_C_0", 13.0, 8.0, &[]),
        ],
        vec![],
    );
    let outcome = h.step(
        vec![
            raw_vehicle("b", "W_C_0", 30.0, 8.0, &[]),
            raw_vehicle("c", "E_C_0", 21.0, 8.0, &[]),
        ],
        vec![],
    );
    assert!(outcome.snapshot.departed.is_empty());
    assert!(outcome.snapshot.exited.is_empty());

    let outcome = h.step(vec![], vec![]);
    assert_eq!(outcome.snapshot.exited, ids(&["b", "c"]));
    assert!(outcome.snapshot.vehicles.is_empty());
}
