//! Core types for the unified traffic model
//!
//! Dense index ids for network entities, string ids for vehicles (backends
//! hand those out), and the small geometric helpers the network builder needs.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// A wrapper type for intersection IDs (index into the network's intersections)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntersectionId(pub usize);

/// A wrapper type for edge IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub usize);

/// A wrapper type for lane IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaneId(pub usize);

/// A wrapper type for connection IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub usize);

/// A wrapper type for edge-level movement IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MovementId(pub usize);

/// Stable vehicle identity as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VehicleId(pub String);

impl VehicleId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for VehicleId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VehicleId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for VehicleId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Geometric classification of a connection through an intersection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDirection {
    Through,
    Left,
    Right,
    UTurn,
}

/// Whether a lane belongs to a regular edge or lives inside a junction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneKind {
    Normal,
    /// Junction-internal lane (SUMO "via" lanes, ids starting with ':')
    Internal,
}

/// A 2D position in network coordinates (x east, y north)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Heading from this position to another, counter-clockwise from +x, in radians
    pub fn angle_to(&self, other: &Position) -> f64 {
        (other.y - self.y).atan2(other.x - self.x)
    }
}

/// Headings within this many degrees of straight ahead count as through movements
pub const THROUGH_TOLERANCE_DEG: f64 = 30.0;

/// Headings within this many degrees of a full reversal count as U-turns
pub const UTURN_TOLERANCE_DEG: f64 = 30.0;

/// Default speed (m/s) below which a vehicle counts as queued
pub const DEFAULT_HALTING_SPEED: f64 = 0.1;

/// Wrap an angle into (-PI, PI]
pub fn normalize_angle(angle: f64) -> f64 {
    use std::f64::consts::{PI, TAU};
    let mut a = angle % TAU;
    if a <= -PI {
        a += TAU;
    } else if a > PI {
        a -= TAU;
    }
    a
}
