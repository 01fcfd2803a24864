//! Backend-agnostic traffic model
//!
//! This module contains the unified entity model, the network builder, the
//! per-step synchronizer, the movement model and the engine that drives them.
//! Nothing in here knows which simulator produced the data.

mod engine;
mod error;
mod intersection;
pub mod movement;
mod network_builder;
mod observer;
mod road_network;
mod sync;
mod types;
mod vehicle;

pub use engine::{Engine, EngineOptions, EngineState, DEFAULT_HISTORY_LEN};
pub use error::{EngineError, EngineResult, NetworkError, SyncDiagnostic};
pub use intersection::{Intersection, Phase, SignalPlan, TrafficLight};
pub use movement::{
    ConflictOccupancy, MovementClass, MovementFacts, SignalMovement, TrajectoryPoint,
    VehicleMovement,
};
pub use network_builder::classify_heading_change;
pub use observer::StepObserver;
pub use road_network::{Connection, Edge, Lane, Movement, RoadNetwork};
pub use sync::{EntitySynchronizer, StateSnapshot, SyncOutcome};
pub use types::{
    normalize_angle, ConnectionId, EdgeId, IntersectionId, LaneId, LaneKind, MovementId, Position,
    TurnDirection, VehicleId, DEFAULT_HALTING_SPEED, THROUGH_TOLERANCE_DEG, UTURN_TOLERANCE_DEG,
};
pub use vehicle::{LaneTransition, RouteStep, Vehicle};
