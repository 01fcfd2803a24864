//! Engine lifecycle over a scripted backend

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{four_arm_description, raw_signal, raw_vehicle, via_lane, Frame, ScriptedBackend};
use silicon_traffic::backend::{Backend, BackendError, LaneDesc};
use silicon_traffic::simulation::{
    Engine, EngineError, EngineOptions, EngineState, MovementClass, NetworkError, RoadNetwork,
    StateSnapshot, StepObserver, SyncDiagnostic, VehicleId,
};

const CONFIG: &str = "scenario.sumocfg";

fn engine(script: Vec<Frame>) -> Engine<ScriptedBackend> {
    Engine::new(ScriptedBackend::four_arm(script), CONFIG, EngineOptions::default())
}

/// A westbound vehicle approaching and crossing the junction
fn crossing_script() -> Vec<Frame> {
    vec![
        Frame::new(
            vec![raw_vehicle("v1", "W_C_0", 80.0, 8.0, &["W_C", "C_E"])],
            vec![raw_signal("C", 1, 0.5)],
        ),
        Frame::new(
            vec![raw_vehicle("v1", "W_C_0", 96.0, 8.0, &["W_C", "C_E"])],
            vec![raw_signal("C", 1, 1.0)],
        ),
        Frame::new(
            vec![raw_vehicle("v1", &via_lane("W", "E"), 4.0, 8.0, &["W_C", "C_E"])],
            vec![raw_signal("C", 1, 1.5)],
        ),
        Frame::new(
            vec![raw_vehicle("v1", "C_E_0", 2.0, 8.0, &["W_C", "C_E"])],
            vec![raw_signal("C", 1, 2.0)],
        ),
    ]
}

#[test]
fn test_step_before_reset_fails() {
    let mut engine = engine(Vec::new());
    assert_eq!(engine.state(), EngineState::Uninitialized);
    assert!(matches!(engine.step(), Err(EngineError::NotInitialized)));
    assert!(matches!(engine.latest_state(), Err(EngineError::NotInitialized)));
    assert!(matches!(engine.network(), Err(EngineError::NotInitialized)));
    assert!(matches!(engine.movement_facts(), Err(EngineError::NotInitialized)));
    assert!(engine.backend().calls.is_empty());
}

#[test]
fn test_reset_publishes_initial_snapshot() {
    let mut engine = engine(crossing_script());
    let initial = engine.reset().unwrap();

    assert_eq!(engine.state(), EngineState::Ready);
    assert_eq!(initial.step, 0);
    assert_eq!(initial.time, Duration::ZERO);
    assert_eq!(initial.vehicle_count(), 0);
    assert_eq!(initial.traffic_lights.len(), 1);
    assert_eq!(engine.history_len(), 1);
    assert_eq!(engine.tick_duration(), Duration::from_millis(500));
    assert!(matches!(
        engine.movement_facts(),
        Err(EngineError::InsufficientHistory)
    ));

    let config = engine.backend().last_config.clone().unwrap();
    assert_eq!(config.config_path.to_str(), Some(CONFIG));
    assert!(!config.use_gui);
}

#[test]
fn test_options_reach_the_backend() {
    let options = EngineOptions::default()
        .with_gui(true)
        .with_seed(42)
        .with_tick_duration(Duration::from_millis(200));
    let mut engine = Engine::new(ScriptedBackend::four_arm(Vec::new()), CONFIG, options);
    engine.reset().unwrap();

    let config = engine.backend().last_config.clone().unwrap();
    assert!(config.use_gui);
    assert_eq!(config.seed, Some(42));
    assert_eq!(config.tick_duration, Some(Duration::from_millis(200)));
}

#[test]
fn test_time_is_step_count_times_tick() {
    let mut engine = engine(crossing_script());
    engine.reset().unwrap();

    let snapshot = engine.step_n(4).unwrap();
    assert_eq!(snapshot.step, 4);
    assert_eq!(snapshot.time, Duration::from_secs(2));
    assert_eq!(engine.step_count(), 4);

    // Past the end of the script the backend reports nothing
    let snapshot = engine.step_n(3).unwrap();
    assert_eq!(snapshot.time, Duration::from_millis(3500));
    assert_eq!(snapshot.vehicle_count(), 0);
}

#[test]
fn test_step_n_zero_returns_latest() {
    let mut engine = engine(crossing_script());
    assert!(matches!(engine.step_n(0), Err(EngineError::NotInitialized)));
    engine.reset().unwrap();
    engine.step().unwrap();
    let latest = engine.step_n(0).unwrap();
    assert_eq!(latest.step, 1);
}

#[test]
fn test_connect_failure_faults_engine() {
    let mut backend = ScriptedBackend::four_arm(Vec::new());
    backend.fail_connect = true;
    let mut engine = Engine::new(backend, CONFIG, EngineOptions::default());

    let err = engine.reset().unwrap_err();
    assert!(matches!(
        err,
        EngineError::BackendUnavailable(BackendError::Unavailable(_))
    ));
    assert_eq!(engine.state(), EngineState::Faulted);
    assert!(matches!(engine.step(), Err(EngineError::NotInitialized)));
    assert_eq!(engine.backend().count("network"), 0);
}

#[test]
fn test_runtime_failure_faults_until_reset() {
    let mut backend = ScriptedBackend::four_arm(crossing_script());
    backend.fail_at_tick = Some(2);
    let mut engine = Engine::new(backend, CONFIG, EngineOptions::default());
    engine.reset().unwrap();

    engine.step().unwrap();
    let err = engine.step().unwrap_err();
    assert!(matches!(
        err,
        EngineError::BackendRuntime(BackendError::Runtime(_))
    ));
    assert_eq!(engine.state(), EngineState::Faulted);
    assert!(matches!(engine.step(), Err(EngineError::NotInitialized)));
    // The last good snapshot is still there
    assert_eq!(engine.latest_state().unwrap().step, 1);

    let snapshot = engine.reset().unwrap();
    assert_eq!(engine.state(), EngineState::Ready);
    assert_eq!(snapshot.step, 0);
    assert_eq!(engine.step_count(), 0);
    assert_eq!(engine.backend().count("connect"), 2);
    assert_eq!(engine.step().unwrap().vehicle("v1").unwrap().position, 80.0);
}

#[test]
fn test_inconsistent_network_faults_reset() {
    let mut description = four_arm_description();
    description.lanes.push(LaneDesc {
        id: "ghost_0".to_string(),
        edge: Some("ghost".to_string()),
        index: 0,
        length: 10.0,
        width: 3.2,
        speed_limit: 13.9,
    });
    let mut engine = Engine::new(
        ScriptedBackend::new(description, Vec::new()),
        CONFIG,
        EngineOptions::default(),
    );

    let err = engine.reset().unwrap_err();
    match err {
        EngineError::NetworkInconsistency(NetworkError::UnknownEdge { lane, edge }) => {
            assert_eq!(lane, "ghost_0");
            assert_eq!(edge, "ghost");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(engine.state(), EngineState::Faulted);
    assert!(!engine.backend().is_connected());
}

#[test]
fn test_history_is_bounded() {
    let options = EngineOptions::default().with_history_len(3);
    let mut engine = Engine::new(ScriptedBackend::four_arm(crossing_script()), CONFIG, options);
    engine.reset().unwrap();
    engine.step_n(5).unwrap();

    assert_eq!(engine.history_len(), 3);
    let steps: Vec<u64> = engine.history().map(|s| s.step).collect();
    assert_eq!(steps, vec![3, 4, 5]);
}

#[test]
fn test_history_keeps_at_least_two_snapshots() {
    let options = EngineOptions::default().with_history_len(0);
    let mut engine = Engine::new(ScriptedBackend::four_arm(crossing_script()), CONFIG, options);
    engine.reset().unwrap();
    engine.step_n(3).unwrap();

    assert_eq!(engine.history_len(), 2);
    assert!(engine.movement_facts().is_ok());
}

#[test]
fn test_terminate_is_idempotent() {
    let mut engine = engine(crossing_script());
    engine.reset().unwrap();
    engine.step_n(2).unwrap();

    engine.terminate();
    engine.terminate();
    assert_eq!(engine.state(), EngineState::Terminated);
    assert_eq!(engine.backend().count("disconnect"), 1);
    assert_eq!(engine.latest_state().unwrap().step, 2);
    assert!(matches!(engine.step(), Err(EngineError::NotInitialized)));
    assert!(matches!(
        engine.set_signal_phase("C", 0),
        Err(EngineError::NotInitialized)
    ));
}

#[test]
fn test_reset_after_terminate_starts_new_episode() {
    let mut engine = engine(crossing_script());
    engine.reset().unwrap();
    engine.step_n(2).unwrap();
    engine.terminate();

    engine.reset().unwrap();
    assert_eq!(engine.state(), EngineState::Ready);
    // Exited-vehicle bookkeeping does not leak across episodes
    let snapshot = engine.step().unwrap();
    assert!(snapshot.vehicle("v1").is_some());
    assert!(engine.last_diagnostics().is_empty());
}

#[test]
fn test_network_is_built_once() {
    let mut engine = engine(Vec::new());
    engine.reset().unwrap();
    let first = engine.network().unwrap();
    engine.reset().unwrap();
    let second = engine.network().unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(engine.backend().count("network"), 1);
    assert_eq!(engine.backend().count("connect"), 2);
    assert_eq!(engine.backend().count("disconnect"), 1);
}

#[test]
fn test_network_rebuilt_when_requested() {
    let options = EngineOptions::default().with_rebuild_network_on_reset(true);
    let mut engine = Engine::new(ScriptedBackend::four_arm(Vec::new()), CONFIG, options);
    engine.reset().unwrap();
    let first = engine.network().unwrap();
    engine.reset().unwrap();
    let second = engine.network().unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(engine.backend().count("network"), 2);
}

#[test]
fn test_on_step_callback() {
    let seen = Arc::new(AtomicUsize::new(0));
    let mut engine = engine(crossing_script());
    let counter = seen.clone();
    engine.on_step(move |snapshot| {
        counter.fetch_add(snapshot.vehicle_count(), Ordering::SeqCst);
    });

    engine.reset().unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 0);
    engine.step_n(4).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 4);
}

struct Recorder(Arc<Mutex<Vec<String>>>);

impl StepObserver for Recorder {
    fn on_reset(&mut self, network: &RoadNetwork, snapshot: &StateSnapshot) {
        self.0.lock().unwrap().push(format!(
            "reset {} {}",
            network.intersection_count(),
            snapshot.step
        ));
    }

    fn on_step(&mut self, snapshot: &StateSnapshot, diagnostics: &[SyncDiagnostic]) {
        self.0
            .lock()
            .unwrap()
            .push(format!("step {} {}", snapshot.step, diagnostics.len()));
    }

    fn on_terminate(&mut self, last: Option<&StateSnapshot>) {
        self.0
            .lock()
            .unwrap()
            .push(format!("terminate {:?}", last.map(|s| s.step)));
    }
}

#[test]
fn test_observer_sees_lifecycle() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let script = vec![
        Frame::default(),
        Frame::new(vec![raw_vehicle("lost", "nowhere_0", 1.0, 1.0, &[])], vec![]),
    ];
    let mut engine = engine(script);
    engine.subscribe(Box::new(Recorder(events.clone())));

    engine.reset().unwrap();
    engine.step_n(2).unwrap();
    engine.terminate();
    engine.terminate();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "reset 5 0".to_string(),
            "step 1 0".to_string(),
            "step 2 1".to_string(),
            "terminate Some(2)".to_string(),
        ]
    );
}

#[test]
fn test_failed_step_is_not_observed() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut backend = ScriptedBackend::four_arm(Vec::new());
    backend.fail_at_tick = Some(1);
    let mut engine = Engine::new(backend, CONFIG, EngineOptions::default());
    engine.subscribe(Box::new(Recorder(events.clone())));

    engine.reset().unwrap();
    assert!(engine.step().is_err());
    assert_eq!(*events.lock().unwrap(), vec!["reset 5 0".to_string()]);
}

#[test]
fn test_diagnostics_do_not_abort_step() {
    let script = vec![Frame::new(
        vec![
            raw_vehicle("ok", "W_C_0", 10.0, 5.0, &[]),
            raw_vehicle("lost", "nowhere_0", 1.0, 1.0, &[]),
        ],
        vec![raw_signal("C", 9, 0.0)],
    )];
    let mut engine = engine(script);
    engine.reset().unwrap();

    let snapshot = engine.step().unwrap();
    assert_eq!(engine.state(), EngineState::Ready);
    assert_eq!(snapshot.vehicle_count(), 1);
    assert_eq!(engine.last_diagnostics().len(), 2);
    assert!(engine
        .last_diagnostics()
        .iter()
        .any(|d| matches!(d, SyncDiagnostic::PhaseOutOfRange { phase: 9, .. })));
}

#[test]
fn test_set_signal_phase_validation() {
    let mut engine = engine(Vec::new());
    assert!(matches!(
        engine.set_signal_phase("C", 1),
        Err(EngineError::NotInitialized)
    ));
    engine.reset().unwrap();

    assert!(matches!(
        engine.set_signal_phase("Z", 0),
        Err(EngineError::UnknownIntersection(name)) if name == "Z"
    ));
    // Junction without a plan
    assert!(matches!(
        engine.set_signal_phase("N", 0),
        Err(EngineError::UnknownIntersection(_))
    ));
    assert!(matches!(
        engine.set_signal_phase("C", 3),
        Err(EngineError::PhaseOutOfRange { phase: 3, phases: 3, .. })
    ));
    assert_eq!(engine.backend().count("set C 3"), 0);

    engine.set_signal_phase("C", 1).unwrap();
    assert_eq!(engine.backend().count("set C 1"), 1);
    assert_eq!(engine.state(), EngineState::Ready);
}

#[test]
fn test_movement_facts_are_cached_per_snapshot() {
    let mut engine = engine(crossing_script());
    engine.reset().unwrap();
    engine.step().unwrap();

    let first = engine.movement_facts().unwrap();
    let again = engine.movement_facts().unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    engine.step().unwrap();
    let next = engine.movement_facts().unwrap();
    assert!(!Arc::ptr_eq(&first, &next));
    assert_eq!(next.step, 2);
}

#[test]
fn test_movement_facts_follow_crossing() {
    let mut engine = engine(crossing_script());
    engine.reset().unwrap();
    engine.step_n(3).unwrap();

    let facts = engine.movement_facts().unwrap();
    let network = engine.network().unwrap();
    let v1 = facts.vehicle("v1").unwrap();
    assert_eq!(v1.classification, MovementClass::Through);
    assert_eq!(v1.trajectory.len(), 3);

    let c = network.intersection_by_name("C").unwrap();
    assert_eq!(facts.conflict(c).unwrap().occupied.len(), 1);
    let signal = facts.signal(c).unwrap();
    assert_eq!(signal.phase_index, 1);
    assert_eq!(signal.time_in_phase, Duration::from_millis(1500));

    engine.step().unwrap();
    let facts = engine.movement_facts().unwrap();
    assert_eq!(facts.vehicle("v1").unwrap().classification, MovementClass::Through);
}

#[test]
fn test_lane_queries() {
    let script = vec![Frame::new(
        vec![
            raw_vehicle("a", "W_C_0", 95.0, 0.0, &["W_C", "C_E"]),
            raw_vehicle("b", "W_C_0", 85.0, 0.0, &["W_C", "C_S"]),
            raw_vehicle("c", "W_C_0", 40.0, 10.0, &["W_C", "C_E"]),
        ],
        vec![],
    )];
    let mut engine = engine(script);
    assert!(matches!(
        engine.lane_queue_length(silicon_traffic::simulation::LaneId(0), 0.1),
        Err(EngineError::NotInitialized)
    ));
    engine.reset().unwrap();
    engine.step().unwrap();

    let network = engine.network().unwrap();
    let lane = network.lane_by_name("W_C_0").unwrap();
    let ids: Vec<&str> = engine
        .lane_vehicles(lane)
        .unwrap()
        .iter()
        .map(|v| v.id.as_str())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(engine.lane_queue_length(lane, 0.1).unwrap(), 2);

    let through = network.movement_by_name("W_C_C_E").unwrap().id;
    assert_eq!(engine.movement_queue_length(through, 0.1).unwrap(), 1);
}

#[test]
fn test_boxed_engine() {
    let mut engine = Engine::boxed(
        ScriptedBackend::four_arm(crossing_script()),
        CONFIG,
        EngineOptions::default(),
    );
    engine.reset().unwrap();
    assert_eq!(engine.backend().name(), "scripted");
    assert_eq!(engine.step_n(2).unwrap().vehicle("v1").unwrap().position, 96.0);
}

#[test]
fn test_engine_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<Engine<ScriptedBackend>>();
    assert_send::<Engine>();
}

#[test]
fn test_failed_reset_drops_previous_episode() {
    let mut backend = ScriptedBackend::four_arm(crossing_script());
    backend.fail_at_connect = Some(2);
    let mut engine = Engine::new(backend, CONFIG, EngineOptions::default());
    engine.reset().unwrap();
    engine.step_n(2).unwrap();

    assert!(engine.reset().is_err());
    assert_eq!(engine.state(), EngineState::Faulted);
    assert!(matches!(engine.latest_state(), Err(EngineError::NotInitialized)));
    assert!(matches!(engine.movement_facts(), Err(EngineError::NotInitialized)));
    assert_eq!(engine.history_len(), 0);
    assert_eq!(engine.step_count(), 0);
    // The topology is kept for the next reset
    assert!(engine.network().is_ok());

    assert_eq!(engine.reset().unwrap().step, 0);
    assert_eq!(engine.backend().count("network"), 1);
}

#[test]
fn test_signal_facts_report_the_current_phase() {
    let script = vec![Frame::new(vec![], vec![raw_signal("C", 0, 5.0)])];
    let mut engine = engine(script);
    engine.reset().unwrap();
    engine.step().unwrap();

    let network = engine.network().unwrap();
    let c = network.intersection_by_name("C").unwrap();
    let facts = engine.movement_facts().unwrap();
    let signal = facts.signal(c).unwrap();
    assert_eq!(signal.phase_index, 0);
    assert_eq!(signal.time_in_phase, Duration::from_secs(5));

    let plan = network.signal_plan(c).unwrap();
    assert_eq!(signal.permitted, plan.phase(0).unwrap().permitted);
    let mut north_south: Vec<_> = network
        .connections()
        .iter()
        .filter(|conn| {
            let name = &network.lane(conn.from_lane).unwrap().name;
            name.starts_with("N_C_") || name.starts_with("S_C_")
        })
        .map(|conn| conn.id)
        .collect();
    north_south.sort();
    assert_eq!(signal.permitted, north_south);

    let mut names: Vec<&str> = signal
        .permitted_movements
        .iter()
        .map(|id| network.movement(*id).unwrap().name.as_str())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec!["N_C_C_E", "N_C_C_S", "N_C_C_W", "S_C_C_E", "S_C_C_N", "S_C_C_W"]
    );
}

#[test]
fn test_snapshots_list_departures_and_exits() {
    let mut script = crossing_script();
    script.push(Frame::default());
    let mut engine = engine(script);
    engine.reset().unwrap();

    let first = engine.step().unwrap();
    assert_eq!(first.departed, vec![VehicleId::from("v1")]);
    assert!(first.exited.is_empty());

    let second = engine.step().unwrap();
    assert!(second.departed.is_empty());

    engine.step_n(3).unwrap();
    let last = engine.latest_state().unwrap();
    assert_eq!(last.exited, vec![VehicleId::from("v1")]);
    assert!(last.vehicles.is_empty());
}
