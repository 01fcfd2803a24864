//! CityFlow config and roadnet files, and their translation into a
//! [`NetworkDescription`]

use log::warn;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::backend::{
    BackendError, BackendResult, ConnectionDesc, EdgeDesc, JunctionDesc, LaneDesc,
    NetworkDescription, PhaseDesc, SignalPlanDesc,
};
use crate::simulation::{Position, TurnDirection};

/// The engine config file CityFlow is started with
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CityFlowConfig {
    /// Seconds per step
    pub interval: f64,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub dir: String,
    pub roadnet_file: String,
    #[serde(default)]
    pub flow_file: Option<String>,
    /// When set, signals only change through `set_tl_phase`
    #[serde(default)]
    pub rl_traffic_light: bool,
}

impl CityFlowConfig {
    pub fn load(path: &Path) -> BackendResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            BackendError::Config(format!("cannot read CityFlow config {}: {e}", path.display()))
        })?;
        let config: CityFlowConfig = serde_json::from_str(&text)?;
        if !config.interval.is_finite() || config.interval <= 0.0 {
            return Err(BackendError::Config(format!(
                "CityFlow interval must be positive, got {}",
                config.interval
            )));
        }
        Ok(config)
    }

    /// Roadnet location: `<config dir>/<dir>/<roadnetFile>`
    pub fn roadnet_path(&self, config_path: &Path) -> PathBuf {
        config_path
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(&self.dir)
            .join(&self.roadnet_file)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl From<Point> for Position {
    fn from(p: Point) -> Self {
        Position::new(p.x, p.y)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Roadnet {
    pub intersections: Vec<RoadnetIntersection>,
    pub roads: Vec<RoadnetRoad>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadnetIntersection {
    pub id: String,
    pub point: Point,
    #[serde(default)]
    pub roads: Vec<String>,
    #[serde(default)]
    pub road_links: Vec<RoadLink>,
    #[serde(default)]
    pub traffic_light: Option<TrafficLightDef>,
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadLink {
    #[serde(rename = "type")]
    pub kind: String,
    pub start_road: String,
    pub end_road: String,
    #[serde(default)]
    pub lane_links: Vec<LaneLink>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneLink {
    pub start_lane_index: usize,
    pub end_lane_index: usize,
    #[serde(default)]
    pub points: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficLightDef {
    #[serde(default)]
    pub road_link_indices: Vec<usize>,
    #[serde(default)]
    pub lightphases: Vec<LightPhase>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightPhase {
    pub time: f64,
    #[serde(default)]
    pub available_road_links: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadnetRoad {
    pub id: String,
    pub points: Vec<Point>,
    pub lanes: Vec<RoadnetLane>,
    pub start_intersection: String,
    pub end_intersection: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadnetLane {
    pub width: f64,
    pub max_speed: f64,
}

/// Lane id CityFlow reports as a vehicle's drivable
pub fn lane_id(road: &str, index: usize) -> String {
    format!("{road}_{index}")
}

/// Drivable id CityFlow reports while a vehicle crosses a lane link
pub fn lane_link_id(start_lane: &str, end_lane: &str) -> String {
    format!("{start_lane}_TO_{end_lane}")
}

/// Direction of a road link from its `type`
pub fn road_link_direction(kind: &str) -> Option<TurnDirection> {
    match kind {
        "go_straight" => Some(TurnDirection::Through),
        "turn_left" => Some(TurnDirection::Left),
        "turn_right" => Some(TurnDirection::Right),
        _ => None,
    }
}

fn polyline_length(points: &[Point]) -> f64 {
    points
        .windows(2)
        .map(|w| Position::from(w[0]).distance(&Position::from(w[1])))
        .sum()
}

impl Roadnet {
    pub fn load(path: &Path) -> BackendResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            BackendError::Config(format!("cannot read roadnet {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Translate into a backend-neutral description
    pub fn describe(&self) -> NetworkDescription {
        let junctions = self
            .intersections
            .iter()
            .map(|i| JunctionDesc {
                id: i.id.clone(),
                position: i.point.into(),
            })
            .collect();

        let mut edges = Vec::with_capacity(self.roads.len());
        let mut lanes = Vec::new();
        for road in &self.roads {
            edges.push(EdgeDesc {
                id: road.id.clone(),
                from: road.start_intersection.clone(),
                to: road.end_intersection.clone(),
            });
            let length = polyline_length(&road.points);
            for (index, lane) in road.lanes.iter().enumerate() {
                lanes.push(LaneDesc {
                    id: lane_id(&road.id, index),
                    edge: Some(road.id.clone()),
                    index,
                    length,
                    width: lane.width,
                    speed_limit: lane.max_speed,
                });
            }
        }

        let roads: HashMap<&str, &RoadnetRoad> =
            self.roads.iter().map(|r| (r.id.as_str(), r)).collect();
        let mut internal = HashSet::new();
        let mut connections = Vec::new();
        let mut signals = Vec::new();
        for intersection in &self.intersections {
            // Description indices of the connections each road link expands to
            let mut link_connections: Vec<Vec<usize>> =
                Vec::with_capacity(intersection.road_links.len());
            for link in &intersection.road_links {
                let direction = road_link_direction(&link.kind);
                let mut indices = Vec::with_capacity(link.lane_links.len());
                for lane_link in &link.lane_links {
                    let from_lane = lane_id(&link.start_road, lane_link.start_lane_index);
                    let to_lane = lane_id(&link.end_road, lane_link.end_lane_index);
                    let via = lane_link_id(&from_lane, &to_lane);
                    if internal.insert(via.clone()) {
                        // Lane links inherit width and speed from the lane they leave
                        let source = roads
                            .get(link.start_road.as_str())
                            .and_then(|road| road.lanes.get(lane_link.start_lane_index).copied());
                        lanes.push(LaneDesc {
                            id: via.clone(),
                            edge: None,
                            index: 0,
                            length: polyline_length(&lane_link.points),
                            width: source.map_or(0.0, |l| l.width),
                            speed_limit: source.map_or(0.0, |l| l.max_speed),
                        });
                    }
                    indices.push(connections.len());
                    connections.push(ConnectionDesc {
                        from_lane,
                        to_lane,
                        via: Some(via),
                        via_chain: Vec::new(),
                        direction,
                    });
                }
                link_connections.push(indices);
            }

            if let Some(plan) = signal_plan(intersection, &link_connections) {
                signals.push(plan);
            }
        }

        NetworkDescription {
            junctions,
            edges,
            lanes,
            connections,
            signals,
        }
    }
}

fn signal_plan(
    intersection: &RoadnetIntersection,
    link_connections: &[Vec<usize>],
) -> Option<SignalPlanDesc> {
    if intersection.is_virtual {
        return None;
    }
    let light = intersection.traffic_light.as_ref()?;
    if light.road_link_indices.is_empty() || light.lightphases.is_empty() {
        return None;
    }

    let phases = light
        .lightphases
        .iter()
        .map(|phase| {
            let mut permitted = Vec::new();
            for &link in &phase.available_road_links {
                match link_connections.get(link) {
                    Some(indices) => permitted.extend_from_slice(indices),
                    None => warn!(
                        "Intersection {} phase references road link {link}, which does not exist",
                        intersection.id
                    ),
                }
            }
            permitted.sort_unstable();
            permitted.dedup();
            PhaseDesc {
                duration: phase.time,
                permitted,
            }
        })
        .collect();

    Some(SignalPlanDesc {
        intersection: intersection.id.clone(),
        phases,
    })
}
