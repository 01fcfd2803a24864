//! Backend-neutral static network description
//!
//! Adapters translate their simulator's native network (TraCI reads for SUMO,
//! roadnet JSON for CityFlow) into this shape. The network builder validates
//! it and freezes it into a [`RoadNetwork`](crate::simulation::RoadNetwork).
//! Everything is referenced by the backend's string ids, except phases, which
//! point into `connections` by index.

use serde::{Deserialize, Serialize};

use crate::simulation::{Position, TurnDirection};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkDescription {
    pub junctions: Vec<JunctionDesc>,
    pub edges: Vec<EdgeDesc>,
    pub lanes: Vec<LaneDesc>,
    pub connections: Vec<ConnectionDesc>,
    #[serde(default)]
    pub signals: Vec<SignalPlanDesc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JunctionDesc {
    pub id: String,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDesc {
    pub id: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneDesc {
    pub id: String,
    /// Owning edge; `None` marks a junction-internal lane
    pub edge: Option<String>,
    pub index: usize,
    pub length: f64,
    pub width: f64,
    pub speed_limit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDesc {
    pub from_lane: String,
    pub to_lane: String,
    /// Internal lane a vehicle occupies while crossing, if the backend models one
    #[serde(default)]
    pub via: Option<String>,
    /// Internal lanes after `via`, in driving order, when the crossing is split
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub via_chain: Vec<String>,
    /// Direction tag reported by the backend; inferred from geometry when absent
    #[serde(default)]
    pub direction: Option<TurnDirection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPlanDesc {
    pub intersection: String,
    pub phases: Vec<PhaseDesc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDesc {
    /// Nominal phase duration in seconds
    pub duration: f64,
    /// Indices into [`NetworkDescription::connections`]
    pub permitted: Vec<usize>,
}

impl NetworkDescription {
    /// Index of the connection `from_lane -> to_lane`, if described
    pub fn connection_index(&self, from_lane: &str, to_lane: &str) -> Option<usize> {
        self.connections
            .iter()
            .position(|c| c.from_lane == from_lane && c.to_lane == to_lane)
    }
}
