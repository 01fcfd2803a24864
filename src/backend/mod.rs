//! Backend adapters
//!
//! A [`Backend`] is the capability set every simulator adapter provides: it
//! launches or attaches to the simulator, advances it one tick at a time, and
//! reports raw per-step state plus a one-off static network description.
//! Everything it returns is keyed by the simulator's own string ids; the
//! engine maps those into the unified model.

pub mod cityflow;
mod description;
mod error;
mod phase_clock;
pub mod sumo;

pub use description::{
    ConnectionDesc, EdgeDesc, JunctionDesc, LaneDesc, NetworkDescription, PhaseDesc,
    SignalPlanDesc,
};
pub use error::{BackendError, BackendResult};
pub use phase_clock::PhaseClock;

use std::path::PathBuf;
use std::time::Duration;

/// A vehicle as reported by the simulator for one step
#[derive(Debug, Clone, PartialEq)]
pub struct RawVehicle {
    pub id: String,
    pub lane: String,
    /// Distance from the lane start in meters
    pub position: f64,
    pub speed: f64,
    /// Edge ids of the route, possibly only the remaining part
    pub route: Vec<String>,
}

/// Signal state of one signalized intersection for one step
#[derive(Debug, Clone, PartialEq)]
pub struct RawSignal {
    /// Junction id (not the simulator's signal program id)
    pub intersection: String,
    pub phase_index: usize,
    /// Seconds since the current phase started
    pub time_in_phase: f64,
}

/// Settings passed to [`Backend::connect`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendConfig {
    pub config_path: PathBuf,
    pub use_gui: bool,
    /// Requested tick length; backends that cannot honor it log and ignore it
    pub tick_duration: Option<Duration>,
    pub seed: Option<u64>,
}

/// Capability set of a simulator adapter
pub trait Backend {
    /// Short human-readable backend name, used in logs
    fn name(&self) -> &str;

    /// Launch or attach to the simulator and load the scenario
    fn connect(&mut self, config: &BackendConfig) -> BackendResult<()>;

    /// Release the simulator. Safe to call when not connected.
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Length of one simulation tick as configured in the simulator
    fn tick_duration(&self) -> BackendResult<Duration>;

    fn advance_one_tick(&mut self) -> BackendResult<()>;

    fn read_raw_vehicles(&mut self) -> BackendResult<Vec<RawVehicle>>;

    fn read_raw_signals(&mut self) -> BackendResult<Vec<RawSignal>>;

    fn read_static_network(&mut self) -> BackendResult<NetworkDescription>;

    /// Force an intersection's signal into `phase`
    fn set_signal_phase(&mut self, intersection: &str, phase: usize) -> BackendResult<()>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn connect(&mut self, config: &BackendConfig) -> BackendResult<()> {
        (**self).connect(config)
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn tick_duration(&self) -> BackendResult<Duration> {
        (**self).tick_duration()
    }

    fn advance_one_tick(&mut self) -> BackendResult<()> {
        (**self).advance_one_tick()
    }

    fn read_raw_vehicles(&mut self) -> BackendResult<Vec<RawVehicle>> {
        (**self).read_raw_vehicles()
    }

    fn read_raw_signals(&mut self) -> BackendResult<Vec<RawSignal>> {
        (**self).read_raw_signals()
    }

    fn read_static_network(&mut self) -> BackendResult<NetworkDescription> {
        (**self).read_static_network()
    }

    fn set_signal_phase(&mut self, intersection: &str, phase: usize) -> BackendResult<()> {
        (**self).set_signal_phase(intersection, phase)
    }
}
