//! SUMO backend: launches `sumo`/`sumo-gui` and drives it over TraCI

pub mod network;
pub mod traci;

use log::{debug, info, warn};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use self::traci::{
    GetRequest, TraciConnection, TraciValue, CMD_GET_SIM_VARIABLE, CMD_GET_TL_VARIABLE,
    CMD_GET_VEHICLE_VARIABLE, CMD_SET_TL_VARIABLE, ID_LIST, TL_CURRENT_PHASE, TL_PHASE_INDEX,
    VAR_DELTA_T, VAR_EDGES, VAR_LANEPOSITION, VAR_LANE_ID, VAR_SPEED,
};
use super::{
    Backend, BackendConfig, BackendError, BackendResult, NetworkDescription, PhaseClock,
    RawSignal, RawVehicle,
};

/// SUMO-specific launch settings
#[derive(Debug, Clone, PartialEq)]
pub struct SumoOptions {
    /// Explicit binary; otherwise `$SUMO_HOME/bin/sumo[-gui]`, then `PATH`
    pub binary: Option<PathBuf>,
    /// TraCI port; otherwise a free local port
    pub port: Option<u16>,
    /// Seconds a vehicle may be stuck before SUMO teleports it (`-1` disables)
    pub time_to_teleport: i32,
    /// Directory for `--tripinfo-output`
    pub tripinfo_dir: Option<PathBuf>,
    /// TCP connect attempts while SUMO starts up
    pub connect_attempts: u32,
    pub connect_interval: Duration,
}

impl Default for SumoOptions {
    fn default() -> Self {
        Self {
            binary: None,
            port: None,
            time_to_teleport: 600,
            tripinfo_dir: None,
            connect_attempts: 60,
            connect_interval: Duration::from_millis(250),
        }
    }
}

pub struct SumoBackend {
    options: SumoOptions,
    process: Option<Child>,
    conn: Option<TraciConnection<TcpStream>>,
    tick: Duration,
    /// Traffic light id -> junction its plan is attached to
    tls_junctions: BTreeMap<String, String>,
    /// Route per vehicle id, read once while the vehicle is around
    routes: HashMap<String, Vec<String>>,
    clock: PhaseClock,
}

impl Default for SumoBackend {
    fn default() -> Self {
        Self::new(SumoOptions::default())
    }
}

impl SumoBackend {
    pub fn new(options: SumoOptions) -> Self {
        Self {
            options,
            process: None,
            conn: None,
            tick: Duration::ZERO,
            tls_junctions: BTreeMap::new(),
            routes: HashMap::new(),
            clock: PhaseClock::new(),
        }
    }

    fn conn(&mut self) -> BackendResult<&mut TraciConnection<TcpStream>> {
        self.conn.as_mut().ok_or(BackendError::NotConnected)
    }

    fn launch(&mut self, config: &BackendConfig) -> BackendResult<()> {
        if !config.config_path.is_file() {
            return Err(BackendError::Config(format!(
                "SUMO config {} does not exist",
                config.config_path.display()
            )));
        }

        let binary = resolve_binary(self.options.binary.as_deref(), config.use_gui);
        let port = match self.options.port {
            Some(port) => port,
            None => free_port()?,
        };
        let seed = config
            .seed
            .unwrap_or_else(|| rand::rng().random_range(0..i32::MAX as u64));
        let args = launch_args(config, &self.options, port, seed);
        info!("Launching {} on port {port} with seed {seed}", binary.display());
        debug!("SUMO arguments: {args:?}");

        let child = Command::new(&binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                BackendError::Unavailable(format!("failed to start {}: {e}", binary.display()))
            })?;
        self.process = Some(child);

        let stream = self.connect_with_retries(port)?;
        stream.set_nodelay(true)?;
        let mut conn = TraciConnection::new(stream);
        let (api, version) = conn.get_version()?;
        info!("Connected to {version} (TraCI API {api})");
        self.conn = Some(conn);
        Ok(())
    }

    fn connect_with_retries(&mut self, port: u16) -> BackendResult<TcpStream> {
        let mut last_error = None;
        for attempt in 1..=self.options.connect_attempts.max(1) {
            if let Some(status) = self.process.as_mut().and_then(|p| p.try_wait().ok().flatten()) {
                return Err(BackendError::Unavailable(format!(
                    "SUMO exited during startup ({status})"
                )));
            }
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("TraCI connect attempt {attempt} failed: {e}");
                    last_error = Some(e);
                    thread::sleep(self.options.connect_interval);
                }
            }
        }
        Err(BackendError::Unavailable(format!(
            "could not reach TraCI on port {port}: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn kill_process(&mut self) {
        if let Some(mut child) = self.process.take() {
            if let Err(e) = child.kill() {
                debug!("SUMO process already gone: {e}");
            }
            if let Err(e) = child.wait() {
                warn!("Failed to reap SUMO process: {e}");
            }
        }
    }
}

/// Binary to launch: override, then `$SUMO_HOME/bin`, then `PATH`
pub fn resolve_binary(explicit: Option<&Path>, use_gui: bool) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    let name = if use_gui { "sumo-gui" } else { "sumo" };
    if let Some(home) = std::env::var_os("SUMO_HOME") {
        let candidate = Path::new(&home).join("bin").join(name);
        if candidate.is_file() {
            return candidate;
        }
    }
    PathBuf::from(name)
}

/// Command line for a headless or GUI run
pub fn launch_args(config: &BackendConfig, options: &SumoOptions, port: u16, seed: u64) -> Vec<String> {
    let mut args = vec![
        "-c".to_string(),
        config.config_path.display().to_string(),
        "--seed".to_string(),
        seed.to_string(),
        "--remote-port".to_string(),
        port.to_string(),
        "--no-step-log".to_string(),
        "true".to_string(),
        "--no-warnings".to_string(),
        "true".to_string(),
        "--duration-log.disable".to_string(),
        "true".to_string(),
        "--time-to-teleport".to_string(),
        options.time_to_teleport.to_string(),
    ];
    if let Some(tick) = config.tick_duration {
        args.push("--step-length".to_string());
        args.push(tick.as_secs_f64().to_string());
    }
    if let Some(dir) = &options.tripinfo_dir {
        args.push("--tripinfo-output".to_string());
        args.push(dir.join(format!("tripinfo_{seed}.xml")).display().to_string());
    }
    if config.use_gui {
        args.push("--start".to_string());
    }
    args
}

fn free_port() -> BackendResult<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

impl Backend for SumoBackend {
    fn name(&self) -> &str {
        "SUMO"
    }

    fn connect(&mut self, config: &BackendConfig) -> BackendResult<()> {
        if self.is_connected() {
            self.disconnect();
        }
        if let Err(e) = self.launch(config) {
            self.disconnect();
            return Err(e);
        }

        let conn = self.conn()?;
        // Seconds since SUMO 1.0
        let delta = conn.get(CMD_GET_SIM_VARIABLE, VAR_DELTA_T, "")?.as_double()?;
        self.tick = Duration::try_from_secs_f64(delta)
            .map_err(|e| BackendError::Protocol(format!("bad step length {delta}s: {e}")))?;

        let tls_junctions = network::read_tls_junctions(self.conn()?)?;
        self.clock.clear();
        for junction in tls_junctions.values() {
            self.clock.register(junction.clone(), Vec::new());
        }
        self.tls_junctions = tls_junctions;
        self.routes.clear();
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.close() {
                debug!("TraCI close failed: {e}");
            }
        }
        self.kill_process();
        self.tls_junctions.clear();
        self.routes.clear();
        self.clock.clear();
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn tick_duration(&self) -> BackendResult<Duration> {
        if !self.is_connected() {
            return Err(BackendError::NotConnected);
        }
        Ok(self.tick)
    }

    fn advance_one_tick(&mut self) -> BackendResult<()> {
        self.conn()?.simulation_step()
    }

    fn read_raw_vehicles(&mut self) -> BackendResult<Vec<RawVehicle>> {
        let conn = self.conn.as_mut().ok_or(BackendError::NotConnected)?;
        let ids = conn
            .get(CMD_GET_VEHICLE_VARIABLE, ID_LIST, "")?
            .into_string_list()?;

        let mut requests = Vec::with_capacity(ids.len() * 4);
        for id in &ids {
            requests.push(GetRequest::new(CMD_GET_VEHICLE_VARIABLE, VAR_LANE_ID, id.as_str()));
            requests.push(GetRequest::new(CMD_GET_VEHICLE_VARIABLE, VAR_LANEPOSITION, id.as_str()));
            requests.push(GetRequest::new(CMD_GET_VEHICLE_VARIABLE, VAR_SPEED, id.as_str()));
            if !self.routes.contains_key(id) {
                requests.push(GetRequest::new(CMD_GET_VEHICLE_VARIABLE, VAR_EDGES, id.as_str()));
            }
        }
        let mut values = conn.get_batch(&requests)?.into_iter();
        let mut next = || {
            values
                .next()
                .ok_or_else(|| BackendError::Protocol("vehicle batch ended early".to_string()))
        };

        let mut vehicles = Vec::with_capacity(ids.len());
        for id in &ids {
            let lane = next()?.into_string()?;
            let position = next()?.as_double()?;
            let speed = next()?.as_double()?;
            if !self.routes.contains_key(id) {
                let route = next()?.into_string_list()?;
                self.routes.insert(id.clone(), route);
            }
            vehicles.push(RawVehicle {
                id: id.clone(),
                lane,
                position,
                speed,
                route: self.routes.get(id).cloned().unwrap_or_default(),
            });
        }

        let present: HashSet<&String> = ids.iter().collect();
        self.routes.retain(|id, _| present.contains(id));
        Ok(vehicles)
    }

    fn read_raw_signals(&mut self) -> BackendResult<Vec<RawSignal>> {
        let conn = self.conn.as_mut().ok_or(BackendError::NotConnected)?;
        let requests: Vec<GetRequest> = self
            .tls_junctions
            .keys()
            .map(|tls| GetRequest::new(CMD_GET_TL_VARIABLE, TL_CURRENT_PHASE, tls.as_str()))
            .collect();
        let values = conn.get_batch(&requests)?;

        let tick = self.tick.as_secs_f64();
        let mut signals = Vec::with_capacity(values.len());
        for (junction, value) in self.tls_junctions.values().zip(values) {
            let phase = value.as_int()?;
            let phase_index = usize::try_from(phase)
                .map_err(|_| BackendError::Protocol(format!("negative phase {phase}")))?;
            let time_in_phase = self.clock.observe(junction, phase_index, tick);
            signals.push(RawSignal {
                intersection: junction.clone(),
                phase_index,
                time_in_phase,
            });
        }
        Ok(signals)
    }

    fn read_static_network(&mut self) -> BackendResult<NetworkDescription> {
        let reads = network::read(self.conn()?)?;
        Ok(reads.into_description())
    }

    fn set_signal_phase(&mut self, intersection: &str, phase: usize) -> BackendResult<()> {
        let tls = self
            .tls_junctions
            .iter()
            .find(|(_, junction)| junction.as_str() == intersection)
            .map(|(tls, _)| tls.clone())
            .ok_or_else(|| BackendError::Runtime(format!("no traffic light at {intersection:?}")))?;
        let index = i32::try_from(phase)
            .map_err(|_| BackendError::Runtime(format!("phase {phase} out of range")))?;
        self.conn()?
            .set(CMD_SET_TL_VARIABLE, TL_PHASE_INDEX, &tls, &TraciValue::Int(index))?;
        self.clock.set_phase(intersection, phase);
        Ok(())
    }
}

impl Drop for SumoBackend {
    fn drop(&mut self) {
        self.disconnect();
    }
}
