//! The simulation engine: one lifecycle over any backend
//!
//! The engine owns the backend, the frozen road network and a bounded history
//! of snapshots. Each `step` advances the backend by exactly one tick and
//! publishes a new immutable snapshot; everything else is a read over that
//! state.

use log::{debug, info, warn};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::error::{EngineError, EngineResult, SyncDiagnostic};
use super::movement::{self, MovementFacts};
use super::observer::{StepFn, StepObserver};
use super::road_network::RoadNetwork;
use super::sync::{EntitySynchronizer, StateSnapshot};
use super::types::{LaneId, MovementId};
use super::vehicle::Vehicle;
use crate::backend::{Backend, BackendConfig};

/// Snapshots kept by default, including the reset snapshot
pub const DEFAULT_HISTORY_LEN: usize = 16;

/// The movement model needs a snapshot and its predecessor
const MIN_HISTORY_LEN: usize = 2;

/// Lifecycle state of an [`Engine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, never reset
    Uninitialized,
    /// Reset succeeded; stepping allowed
    Ready,
    Terminated,
    /// A reset or step failed; only `reset` can recover
    Faulted,
}

/// Construction-time engine settings
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub use_gui: bool,
    /// Requested tick length; `None` keeps the scenario's own
    pub tick_duration: Option<Duration>,
    pub history_len: usize,
    /// Re-read and rebuild the road network on every reset, not just the first
    pub rebuild_network_on_reset: bool,
    pub seed: Option<u64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            use_gui: false,
            tick_duration: None,
            history_len: DEFAULT_HISTORY_LEN,
            rebuild_network_on_reset: false,
            seed: None,
        }
    }
}

impl EngineOptions {
    pub fn with_gui(mut self, use_gui: bool) -> Self {
        self.use_gui = use_gui;
        self
    }

    pub fn with_tick_duration(mut self, tick: Duration) -> Self {
        self.tick_duration = Some(tick);
        self
    }

    pub fn with_history_len(mut self, history_len: usize) -> Self {
        self.history_len = history_len;
        self
    }

    pub fn with_rebuild_network_on_reset(mut self, rebuild: bool) -> Self {
        self.rebuild_network_on_reset = rebuild;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Backend-agnostic simulation engine
pub struct Engine<B: Backend = Box<dyn Backend + Send>> {
    backend: B,
    config_path: PathBuf,
    options: EngineOptions,
    state: EngineState,

    network: Option<Arc<RoadNetwork>>,
    tick: Duration,
    step_count: u64,

    /// Oldest first; the back is the latest snapshot while ready
    history: VecDeque<Arc<StateSnapshot>>,
    /// Survives `terminate`, unlike the history
    latest: Option<Arc<StateSnapshot>>,

    synchronizer: EntitySynchronizer,
    diagnostics: Vec<SyncDiagnostic>,

    /// Facts derived for the snapshot the weak pointer refers to
    facts_cache: RefCell<Option<(Weak<StateSnapshot>, Arc<MovementFacts>)>>,

    observers: Vec<Box<dyn StepObserver + Send>>,
}

impl Engine {
    /// Engine over a type-erased backend, for picking the simulator at runtime
    pub fn boxed(
        backend: impl Backend + Send + 'static,
        config_path: impl Into<PathBuf>,
        options: EngineOptions,
    ) -> Self {
        Engine::new(Box::new(backend), config_path, options)
    }
}

impl<B: Backend> Engine<B> {
    pub fn new(backend: B, config_path: impl Into<PathBuf>, options: EngineOptions) -> Self {
        Self {
            backend,
            config_path: config_path.into(),
            options,
            state: EngineState::Uninitialized,
            network: None,
            tick: Duration::ZERO,
            step_count: 0,
            history: VecDeque::new(),
            latest: None,
            synchronizer: EntitySynchronizer::new(),
            diagnostics: Vec::new(),
            facts_cache: RefCell::new(None),
            observers: Vec::new(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Tick length read from the backend at the last reset
    pub fn tick_duration(&self) -> Duration {
        self.tick
    }

    /// Steps taken since the last reset
    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Register an observer notified on reset, step and terminate
    pub fn subscribe(&mut self, observer: Box<dyn StepObserver + Send>) {
        self.observers.push(observer);
    }

    /// Register a closure called with every new snapshot
    pub fn on_step<F>(&mut self, callback: F)
    where
        F: FnMut(&StateSnapshot) + Send + 'static,
    {
        self.observers.push(Box::new(StepFn(callback)));
    }

    /// Start (or restart) an episode.
    ///
    /// Reconnects the backend, builds the road network if needed and publishes
    /// the initial snapshot. Any failure leaves the engine faulted with no
    /// snapshot; a network built by an earlier reset stays cached.
    pub fn reset(&mut self) -> EngineResult<Arc<StateSnapshot>> {
        match self.try_reset() {
            Ok(snapshot) => {
                self.state = EngineState::Ready;
                if let Some(network) = self.network.clone() {
                    for observer in &mut self.observers {
                        observer.on_reset(&network, &snapshot);
                    }
                }
                Ok(snapshot)
            }
            Err(err) => {
                warn!("Reset of {} backend failed: {err}", self.backend.name());
                self.backend.disconnect();
                self.state = EngineState::Faulted;
                self.step_count = 0;
                self.latest = None;
                self.history.clear();
                self.diagnostics.clear();
                self.facts_cache.replace(None);
                Err(err)
            }
        }
    }

    fn try_reset(&mut self) -> EngineResult<Arc<StateSnapshot>> {
        if self.backend.is_connected() {
            debug!("Disconnecting {} backend before reset", self.backend.name());
            self.backend.disconnect();
        }

        let config = BackendConfig {
            config_path: self.config_path.clone(),
            use_gui: self.options.use_gui,
            tick_duration: self.options.tick_duration,
            seed: self.options.seed,
        };
        self.backend
            .connect(&config)
            .map_err(EngineError::BackendUnavailable)?;
        info!(
            "Connected {} backend ({})",
            self.backend.name(),
            self.config_path.display()
        );

        if self.network.is_none() || self.options.rebuild_network_on_reset {
            let description = self
                .backend
                .read_static_network()
                .map_err(EngineError::BackendUnavailable)?;
            let network = RoadNetwork::build(&description)?;
            info!("Built {network}");
            self.network = Some(Arc::new(network));
        }
        let network = self.network.clone().ok_or(EngineError::NotInitialized)?;

        self.tick = self
            .backend
            .tick_duration()
            .map_err(EngineError::BackendUnavailable)?;
        self.step_count = 0;
        self.synchronizer.clear();
        self.diagnostics.clear();
        self.history.clear();
        self.facts_cache.replace(None);

        let snapshot = Arc::new(StateSnapshot::initial(&network));
        self.push_snapshot(snapshot.clone());
        Ok(snapshot)
    }

    /// Advance the backend by exactly one tick and publish the new snapshot
    pub fn step(&mut self) -> EngineResult<Arc<StateSnapshot>> {
        if self.state != EngineState::Ready {
            return Err(EngineError::NotInitialized);
        }
        let (Some(network), Some(previous)) = (self.network.clone(), self.latest.clone()) else {
            return Err(EngineError::NotInitialized);
        };

        let raw = self.backend.advance_one_tick().and_then(|_| {
            let vehicles = self.backend.read_raw_vehicles()?;
            let signals = self.backend.read_raw_signals()?;
            Ok((vehicles, signals))
        });
        let (raw_vehicles, raw_signals) = match raw {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    "{} backend failed at step {}: {err}",
                    self.backend.name(),
                    self.step_count + 1
                );
                self.state = EngineState::Faulted;
                return Err(EngineError::BackendRuntime(err));
            }
        };

        self.step_count += 1;
        let time = sim_time(self.tick, self.step_count);
        let outcome = self.synchronizer.sync(
            &previous,
            &raw_vehicles,
            &raw_signals,
            &network,
            self.step_count,
            time,
        );
        debug!(
            "Step {} at {:.2}s: {} vehicles, {} diagnostics",
            self.step_count,
            time.as_secs_f64(),
            outcome.snapshot.vehicle_count(),
            outcome.diagnostics.len()
        );

        let snapshot = Arc::new(outcome.snapshot);
        self.diagnostics = outcome.diagnostics;
        self.push_snapshot(snapshot.clone());
        for observer in &mut self.observers {
            observer.on_step(&snapshot, &self.diagnostics);
        }
        Ok(snapshot)
    }

    /// Step `n` times, returning the last snapshot
    pub fn step_n(&mut self, n: usize) -> EngineResult<Arc<StateSnapshot>> {
        if n == 0 {
            if self.state != EngineState::Ready {
                return Err(EngineError::NotInitialized);
            }
            return self.latest_state();
        }
        let mut last = self.step()?;
        for _ in 1..n {
            last = self.step()?;
        }
        Ok(last)
    }

    /// Release the backend. The latest snapshot stays readable.
    pub fn terminate(&mut self) {
        if self.state == EngineState::Terminated {
            return;
        }
        self.backend.disconnect();
        self.history.clear();
        self.facts_cache.replace(None);
        self.state = EngineState::Terminated;
        for observer in &mut self.observers {
            observer.on_terminate(self.latest.as_deref());
        }
        info!(
            "Terminated {} backend after {} steps",
            self.backend.name(),
            self.step_count
        );
    }

    pub fn network(&self) -> EngineResult<Arc<RoadNetwork>> {
        self.network.clone().ok_or(EngineError::NotInitialized)
    }

    pub fn latest_state(&self) -> EngineResult<Arc<StateSnapshot>> {
        self.latest.clone().ok_or(EngineError::NotInitialized)
    }

    /// Snapshots in the history window, oldest first
    pub fn history(&self) -> impl Iterator<Item = &StateSnapshot> {
        self.history.iter().map(|s| s.as_ref())
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Diagnostics produced by the most recent step
    pub fn last_diagnostics(&self) -> &[SyncDiagnostic] {
        &self.diagnostics
    }

    /// Movement facts for the latest snapshot, derived once and cached
    pub fn movement_facts(&self) -> EngineResult<Arc<MovementFacts>> {
        let network = self.network.as_ref().ok_or(EngineError::NotInitialized)?;
        if self.latest.is_none() {
            return Err(EngineError::NotInitialized);
        }
        let latest = self.history.back().ok_or(EngineError::InsufficientHistory)?;
        if self.history.len() < MIN_HISTORY_LEN {
            return Err(EngineError::InsufficientHistory);
        }

        if let Some((snapshot, facts)) = self.facts_cache.borrow().as_ref() {
            if snapshot.upgrade().is_some_and(|s| Arc::ptr_eq(&s, latest)) {
                return Ok(facts.clone());
            }
        }

        let window: Vec<&StateSnapshot> = self.history.iter().map(|s| s.as_ref()).collect();
        let facts = Arc::new(movement::derive(&window, network));
        self.facts_cache
            .replace(Some((Arc::downgrade(latest), facts.clone())));
        Ok(facts)
    }

    /// Force a signal phase at an intersection, by backend id
    pub fn set_signal_phase(&mut self, intersection: &str, phase: usize) -> EngineResult<()> {
        if self.state != EngineState::Ready {
            return Err(EngineError::NotInitialized);
        }
        let network = self.network()?;
        let plan = network
            .intersection_by_name(intersection)
            .and_then(|id| network.signal_plan(id))
            .ok_or_else(|| EngineError::UnknownIntersection(intersection.to_string()))?;
        if phase >= plan.phase_count() {
            return Err(EngineError::PhaseOutOfRange {
                intersection: intersection.to_string(),
                phase,
                phases: plan.phase_count(),
            });
        }

        // A rejected command does not fault the engine
        self.backend
            .set_signal_phase(intersection, phase)
            .map_err(EngineError::BackendRuntime)
    }

    /// Vehicles on a lane in the latest snapshot, front first
    pub fn lane_vehicles(&self, lane: LaneId) -> EngineResult<Vec<&Vehicle>> {
        let latest = self.latest.as_ref().ok_or(EngineError::NotInitialized)?;
        Ok(latest.vehicles_on_lane(lane))
    }

    /// Halted vehicles on a lane in the latest snapshot
    pub fn lane_queue_length(&self, lane: LaneId, threshold: f64) -> EngineResult<usize> {
        let latest = self.latest.as_ref().ok_or(EngineError::NotInitialized)?;
        Ok(latest.lane_queue_length(lane, threshold))
    }

    /// Halted vehicles waiting for a movement in the latest snapshot
    pub fn movement_queue_length(&self, movement: MovementId, threshold: f64) -> EngineResult<usize> {
        let network = self.network.as_ref().ok_or(EngineError::NotInitialized)?;
        let latest = self.latest.as_ref().ok_or(EngineError::NotInitialized)?;
        Ok(movement::movement_queue_length(
            network, latest, movement, threshold,
        ))
    }

    fn push_snapshot(&mut self, snapshot: Arc<StateSnapshot>) {
        let bound = self.options.history_len.max(MIN_HISTORY_LEN);
        self.history.push_back(snapshot.clone());
        while self.history.len() > bound {
            self.history.pop_front();
        }
        self.latest = Some(snapshot);
    }
}

impl<B: Backend> Drop for Engine<B> {
    fn drop(&mut self) {
        if self.backend.is_connected() {
            self.backend.disconnect();
        }
    }
}

/// Simulation time after `steps` ticks, computed without accumulating error
fn sim_time(tick: Duration, steps: u64) -> Duration {
    let nanos = tick.as_nanos().saturating_mul(u128::from(steps));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}
