//! Vehicle entity as seen through the unified model
//!
//! A vehicle is created the first time a backend reports it, updated in place
//! while it stays reported, and dropped once the backend stops reporting it.

use super::road_network::RoadNetwork;
use super::types::{EdgeId, LaneId, VehicleId};

/// One entry of a vehicle's route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteStep {
    pub edge: EdgeId,
    /// Lane on that edge, when the backend knows it
    pub lane: Option<LaneId>,
}

/// An observed lane change between two consecutive snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneTransition {
    pub from: LaneId,
    pub to: LaneId,
    /// Step at which the vehicle was first seen on `to`
    pub at: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vehicle {
    pub id: VehicleId,
    pub lane: LaneId,
    /// Distance from the start of the lane in meters
    pub position: f64,
    /// Speed in m/s
    pub speed: f64,
    pub route: Vec<RouteStep>,
    /// Step of the first report
    pub first_seen: u64,
    /// Number of snapshots this vehicle has appeared in
    pub observed_steps: u64,
    pub last_transition: Option<LaneTransition>,
}

impl Vehicle {
    pub fn new(
        id: VehicleId,
        lane: LaneId,
        position: f64,
        speed: f64,
        route: Vec<RouteStep>,
        step: u64,
    ) -> Self {
        Self {
            id,
            lane,
            position,
            speed,
            route,
            first_seen: step,
            observed_steps: 1,
            last_transition: None,
        }
    }

    /// Apply a fresh report, recording a transition if the lane changed
    pub fn update(&mut self, lane: LaneId, position: f64, speed: f64, step: u64) {
        if lane != self.lane {
            self.last_transition = Some(LaneTransition {
                from: self.lane,
                to: lane,
                at: step,
            });
        }
        self.lane = lane;
        self.position = position;
        self.speed = speed;
        self.observed_steps += 1;
    }

    pub fn is_halted(&self, threshold: f64) -> bool {
        self.speed < threshold
    }

    /// The edge after the one the vehicle is currently on, if the route says
    pub fn next_edge(&self, network: &RoadNetwork) -> Option<EdgeId> {
        // Inside a junction the vehicle is already committed to its exit edge
        if network.lane_edge(self.lane).is_none() {
            return network
                .connection_via(self.lane)
                .and_then(|c| network.lane_edge(c.to_lane));
        }

        let current = network.lane_edge(self.lane)?;
        let index = self.route.iter().position(|step| step.edge == current)?;
        self.route.get(index + 1).map(|step| step.edge)
    }
}
