//! CityFlow backend
//!
//! CityFlow runs in-process through its native engine. The adapter talks to it
//! through [`CityFlowHandle`], which mirrors the native engine API, and gets a
//! handle from a [`CityFlowLauncher`] so the binding stays outside this crate.

pub mod roadnet;

use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use self::roadnet::{CityFlowConfig, Roadnet};
use super::{
    Backend, BackendConfig, BackendError, BackendResult, NetworkDescription, PhaseClock,
    RawSignal, RawVehicle,
};

/// Native CityFlow engine operations used by the adapter
pub trait CityFlowHandle {
    fn next_step(&mut self) -> BackendResult<()>;

    /// Ids of running vehicles
    fn get_vehicles(&self) -> BackendResult<Vec<String>>;

    /// String map with at least `running`, `distance`, `speed`, `drivable`
    /// and `route` (space-separated remaining roads)
    fn get_vehicle_info(&self, id: &str) -> BackendResult<HashMap<String, String>>;

    fn set_tl_phase(&mut self, intersection: &str, phase: usize) -> BackendResult<()>;
}

/// Opens native engine handles for a config file
pub trait CityFlowLauncher {
    fn launch(
        &mut self,
        config_file: &Path,
        threads: usize,
    ) -> BackendResult<Box<dyn CityFlowHandle + Send>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CityFlowOptions {
    pub threads: usize,
}

impl Default for CityFlowOptions {
    fn default() -> Self {
        Self { threads: 1 }
    }
}

pub struct CityFlowBackend<L: CityFlowLauncher> {
    launcher: L,
    options: CityFlowOptions,
    handle: Option<Box<dyn CityFlowHandle + Send>>,
    config: Option<CityFlowConfig>,
    description: Option<NetworkDescription>,
    clock: PhaseClock,
}

impl<L: CityFlowLauncher> CityFlowBackend<L> {
    pub fn new(launcher: L, options: CityFlowOptions) -> Self {
        Self {
            launcher,
            options,
            handle: None,
            config: None,
            description: None,
            clock: PhaseClock::new(),
        }
    }

    fn handle(&mut self) -> BackendResult<&mut (dyn CityFlowHandle + Send + 'static)> {
        self.handle.as_deref_mut().ok_or(BackendError::NotConnected)
    }

    fn interval(&self) -> BackendResult<f64> {
        self.config
            .as_ref()
            .map(|c| c.interval)
            .ok_or(BackendError::NotConnected)
    }
}

fn info_field<'a>(info: &'a HashMap<String, String>, id: &str, key: &str) -> BackendResult<&'a str> {
    info.get(key).map(String::as_str).ok_or_else(|| {
        BackendError::Runtime(format!("vehicle {id} info has no {key:?} field"))
    })
}

fn info_number(info: &HashMap<String, String>, id: &str, key: &str) -> BackendResult<f64> {
    let raw = info_field(info, id, key)?;
    raw.trim().parse().map_err(|_| {
        BackendError::Runtime(format!("vehicle {id} field {key:?} is not a number: {raw:?}"))
    })
}

impl<L: CityFlowLauncher> Backend for CityFlowBackend<L> {
    fn name(&self) -> &str {
        "CityFlow"
    }

    fn connect(&mut self, config: &BackendConfig) -> BackendResult<()> {
        self.disconnect();

        let cf_config = CityFlowConfig::load(&config.config_path)?;
        if let Some(tick) = config.tick_duration {
            if (tick.as_secs_f64() - cf_config.interval).abs() > f64::EPSILON {
                warn!(
                    "CityFlow cannot override its interval; requested {:.3}s, keeping {:.3}s",
                    tick.as_secs_f64(),
                    cf_config.interval
                );
            }
        }
        if config.use_gui {
            warn!("CityFlow has no GUI; running headless");
        }
        if config.seed.is_some() {
            debug!("CityFlow takes its seed from the config file; ignoring the engine seed");
        }

        let roadnet_path = cf_config.roadnet_path(&config.config_path);
        let description = Roadnet::load(&roadnet_path)?.describe();

        let handle = self
            .launcher
            .launch(&config.config_path, self.options.threads)?;
        info!(
            "Opened CityFlow engine for {} ({} intersections)",
            config.config_path.display(),
            description.junctions.len()
        );

        for plan in &description.signals {
            self.clock.register(
                plan.intersection.clone(),
                plan.phases.iter().map(|p| p.duration).collect(),
            );
        }
        self.handle = Some(handle);
        self.config = Some(cf_config);
        self.description = Some(description);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.handle.take().is_some() {
            debug!("Released CityFlow engine");
        }
        self.config = None;
        self.description = None;
        self.clock.clear();
    }

    fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    fn tick_duration(&self) -> BackendResult<Duration> {
        let interval = self.interval()?;
        Duration::try_from_secs_f64(interval)
            .map_err(|e| BackendError::Config(format!("bad interval {interval}: {e}")))
    }

    fn advance_one_tick(&mut self) -> BackendResult<()> {
        let interval = self.interval()?;
        let rl = self.config.as_ref().is_some_and(|c| c.rl_traffic_light);
        self.handle()?.next_step()?;
        if rl {
            self.clock.advance_held(interval);
        } else {
            self.clock.advance_fixed(interval);
        }
        Ok(())
    }

    fn read_raw_vehicles(&mut self) -> BackendResult<Vec<RawVehicle>> {
        let handle = self.handle()?;
        let ids = handle.get_vehicles()?;

        let mut vehicles = Vec::with_capacity(ids.len());
        for id in ids {
            let info = handle.get_vehicle_info(&id)?;
            if info.get("running").is_some_and(|r| r.trim() != "1") {
                continue;
            }
            vehicles.push(RawVehicle {
                lane: info_field(&info, &id, "drivable")?.to_string(),
                position: info_number(&info, &id, "distance")?,
                speed: info_number(&info, &id, "speed")?,
                route: info
                    .get("route")
                    .map(|r| r.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
                id,
            });
        }
        Ok(vehicles)
    }

    fn read_raw_signals(&mut self) -> BackendResult<Vec<RawSignal>> {
        if !self.is_connected() {
            return Err(BackendError::NotConnected);
        }
        Ok(self.clock.signals())
    }

    fn read_static_network(&mut self) -> BackendResult<NetworkDescription> {
        self.description.clone().ok_or(BackendError::NotConnected)
    }

    fn set_signal_phase(&mut self, intersection: &str, phase: usize) -> BackendResult<()> {
        if self.config.as_ref().is_some_and(|c| !c.rl_traffic_light) {
            warn!("rlTrafficLight is off; CityFlow may ignore the phase set at {intersection}");
        }
        self.handle()?.set_tl_phase(intersection, phase)?;
        if !self.clock.set_phase(intersection, phase) {
            return Err(BackendError::Runtime(format!(
                "no signal plan for phase {phase} at {intersection:?}"
            )));
        }
        Ok(())
    }
}
