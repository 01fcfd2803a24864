//! Shared fixtures: a four-arm signalized intersection and a scripted backend
#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::Duration;

use silicon_traffic::backend::{
    Backend, BackendConfig, BackendError, BackendResult, ConnectionDesc, EdgeDesc, JunctionDesc,
    LaneDesc, NetworkDescription, PhaseDesc, RawSignal, RawVehicle, SignalPlanDesc,
};
use silicon_traffic::simulation::{Position, RoadNetwork};

/// Arm name and the position of its outer junction
pub const ARMS: [(&str, f64, f64); 4] = [
    ("N", 0.0, 100.0),
    ("E", 100.0, 0.0),
    ("S", 0.0, -100.0),
    ("W", -100.0, 0.0),
];

pub fn opposite(arm: &str) -> &'static str {
    match arm {
        "N" => "S",
        "S" => "N",
        "E" => "W",
        _ => "E",
    }
}

/// Exit arm of a right turn for a vehicle arriving from `arm`
pub fn right_of(arm: &str) -> &'static str {
    match arm {
        "N" => "W",
        "E" => "N",
        "S" => "E",
        _ => "S",
    }
}

/// Exit arm of a left turn for a vehicle arriving from `arm`
pub fn left_of(arm: &str) -> &'static str {
    match arm {
        "N" => "E",
        "E" => "S",
        "S" => "W",
        _ => "N",
    }
}

pub fn via_lane(from: &str, to: &str) -> String {
    format!(":C_{from}_{to}_0")
}

/// Junction `C` at the origin with four arms.
///
/// Incoming edges `X_C` have two lanes: lane 0 goes through or right, lane 1
/// turns left. Outgoing edges `C_X` have one lane. Every connection has an
/// internal via lane and no direction tag, so turns come from geometry.
/// The plan has three phases: north-south green, east-west green, all red.
pub fn four_arm_description() -> NetworkDescription {
    let mut desc = NetworkDescription::default();
    desc.junctions.push(JunctionDesc {
        id: "C".to_string(),
        position: Position::new(0.0, 0.0),
    });

    for (arm, x, y) in ARMS {
        desc.junctions.push(JunctionDesc {
            id: arm.to_string(),
            position: Position::new(x, y),
        });
        let incoming = format!("{arm}_C");
        let outgoing = format!("C_{arm}");
        desc.edges.push(EdgeDesc {
            id: incoming.clone(),
            from: arm.to_string(),
            to: "C".to_string(),
        });
        desc.edges.push(EdgeDesc {
            id: outgoing.clone(),
            from: "C".to_string(),
            to: arm.to_string(),
        });
        for index in 0..2 {
            desc.lanes.push(normal_lane(&incoming, index));
        }
        desc.lanes.push(normal_lane(&outgoing, 0));
    }

    for (arm, _, _) in ARMS {
        for (lane, exit) in [(0, opposite(arm)), (0, right_of(arm)), (1, left_of(arm))] {
            let via = via_lane(arm, exit);
            desc.lanes.push(LaneDesc {
                id: via.clone(),
                edge: None,
                index: 0,
                length: 12.0,
                width: 3.2,
                speed_limit: 13.9,
            });
            desc.connections.push(ConnectionDesc {
                from_lane: format!("{arm}_C_{lane}"),
                to_lane: format!("C_{exit}_0"),
                via: Some(via),
                via_chain: Vec::new(),
                direction: None,
            });
        }
    }

    let arm_connections = |arms: &[&str], desc: &NetworkDescription| -> Vec<usize> {
        desc.connections
            .iter()
            .enumerate()
            .filter(|(_, c)| arms.iter().any(|a| c.from_lane.starts_with(&format!("{a}_C_"))))
            .map(|(i, _)| i)
            .collect()
    };
    let north_south = arm_connections(&["N", "S"], &desc);
    let east_west = arm_connections(&["E", "W"], &desc);
    desc.signals.push(SignalPlanDesc {
        intersection: "C".to_string(),
        phases: vec![
            PhaseDesc {
                duration: 30.0,
                permitted: north_south,
            },
            PhaseDesc {
                duration: 30.0,
                permitted: east_west,
            },
            PhaseDesc {
                duration: 3.0,
                permitted: Vec::new(),
            },
        ],
    });
    desc
}

fn normal_lane(edge: &str, index: usize) -> LaneDesc {
    LaneDesc {
        id: format!("{edge}_{index}"),
        edge: Some(edge.to_string()),
        index,
        length: 100.0,
        width: 3.2,
        speed_limit: 13.9,
    }
}

pub fn four_arm_network() -> RoadNetwork {
    RoadNetwork::build(&four_arm_description()).expect("fixture network builds")
}

pub fn raw_vehicle(id: &str, lane: &str, position: f64, speed: f64, route: &[&str]) -> RawVehicle {
    RawVehicle {
        id: id.to_string(),
        lane: lane.to_string(),
        position,
        speed,
        route: route.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn raw_signal(intersection: &str, phase_index: usize, time_in_phase: f64) -> RawSignal {
    RawSignal {
        intersection: intersection.to_string(),
        phase_index,
        time_in_phase,
    }
}

/// Reports for one tick
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub vehicles: Vec<RawVehicle>,
    pub signals: Vec<RawSignal>,
}

impl Frame {
    pub fn new(vehicles: Vec<RawVehicle>, signals: Vec<RawSignal>) -> Self {
        Self { vehicles, signals }
    }
}

/// Backend that replays frames, one per tick, from the start on every connect
pub struct ScriptedBackend {
    pub description: NetworkDescription,
    pub script: Vec<Frame>,
    pub tick: Duration,
    pub fail_connect: bool,
    /// Fail this (1-based) call to `connect`
    pub fail_at_connect: Option<usize>,
    /// Fail `advance_one_tick` on this (1-based) tick
    pub fail_at_tick: Option<usize>,
    /// Calls in order: "connect", "disconnect", "network", "set C 1"
    pub calls: Vec<String>,
    pub last_config: Option<BackendConfig>,
    connected: bool,
    pending: VecDeque<Frame>,
    current: Frame,
    ticks: usize,
}

impl ScriptedBackend {
    pub fn new(description: NetworkDescription, script: Vec<Frame>) -> Self {
        Self {
            description,
            script,
            tick: Duration::from_millis(500),
            fail_connect: false,
            fail_at_connect: None,
            fail_at_tick: None,
            calls: Vec::new(),
            last_config: None,
            connected: false,
            pending: VecDeque::new(),
            current: Frame::default(),
            ticks: 0,
        }
    }

    pub fn four_arm(script: Vec<Frame>) -> Self {
        Self::new(four_arm_description(), script)
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.iter().filter(|c| c.as_str() == call).count()
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn connect(&mut self, config: &BackendConfig) -> BackendResult<()> {
        self.calls.push("connect".to_string());
        self.last_config = Some(config.clone());
        if self.fail_connect || self.fail_at_connect == Some(self.count("connect")) {
            return Err(BackendError::Unavailable("scripted connect failure".to_string()));
        }
        self.connected = true;
        self.pending = self.script.iter().cloned().collect();
        self.current = Frame::default();
        self.ticks = 0;
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.calls.push("disconnect".to_string());
        }
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn tick_duration(&self) -> BackendResult<Duration> {
        Ok(self.tick)
    }

    fn advance_one_tick(&mut self) -> BackendResult<()> {
        if !self.connected {
            return Err(BackendError::NotConnected);
        }
        self.ticks += 1;
        if self.fail_at_tick == Some(self.ticks) {
            return Err(BackendError::Runtime("scripted runtime failure".to_string()));
        }
        self.current = self.pending.pop_front().unwrap_or_default();
        Ok(())
    }

    fn read_raw_vehicles(&mut self) -> BackendResult<Vec<RawVehicle>> {
        Ok(self.current.vehicles.clone())
    }

    fn read_raw_signals(&mut self) -> BackendResult<Vec<RawSignal>> {
        Ok(self.current.signals.clone())
    }

    fn read_static_network(&mut self) -> BackendResult<NetworkDescription> {
        self.calls.push("network".to_string());
        Ok(self.description.clone())
    }

    fn set_signal_phase(&mut self, intersection: &str, phase: usize) -> BackendResult<()> {
        self.calls.push(format!("set {intersection} {phase}"));
        Ok(())
    }
}
