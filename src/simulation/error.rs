//! Error taxonomy for the engine and its builders
//!
//! Fatal conditions are `Err` values; per-entity anomalies found while
//! synchronizing are [`SyncDiagnostic`]s that get logged and collected but
//! never abort a step.

use thiserror::Error;

use crate::backend::BackendError;

/// Static network description failed validation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NetworkError {
    #[error("duplicate {kind} id {id:?}")]
    DuplicateId { kind: &'static str, id: String },

    #[error("edge {edge:?} references unknown junction {junction:?}")]
    UnknownJunction { edge: String, junction: String },

    #[error("lane {lane:?} references unknown edge {edge:?}")]
    UnknownEdge { lane: String, edge: String },

    #[error("connection #{index} references unknown lane {lane:?}")]
    UnknownLane { index: usize, lane: String },

    #[error("connection #{index} uses internal lane {lane:?} as an endpoint")]
    InternalEndpoint { index: usize, lane: String },

    #[error("connection #{index} does not pass through a single junction ({from_lane:?} -> {to_lane:?})")]
    DisjointConnection {
        index: usize,
        from_lane: String,
        to_lane: String,
    },

    #[error("signal plan references unknown intersection {0:?}")]
    UnknownIntersection(String),

    #[error("intersection {0:?} has more than one signal plan")]
    DuplicatePlan(String),

    #[error("phase {phase} of {intersection:?} references connection #{connection}, which does not exist")]
    PhaseConnectionOutOfRange {
        intersection: String,
        phase: usize,
        connection: usize,
    },

    #[error("phase {phase} of {intersection:?} references connection #{connection} owned by {owner:?}")]
    ForeignPhaseConnection {
        intersection: String,
        phase: usize,
        connection: usize,
        owner: String,
    },

    #[error("phase {phase} of {intersection:?} has invalid duration {duration}")]
    InvalidPhaseDuration {
        intersection: String,
        phase: usize,
        duration: f64,
    },
}

/// Errors surfaced by [`Engine`](crate::simulation::Engine) operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[source] BackendError),

    #[error("engine is not initialized; call reset() first")]
    NotInitialized,

    #[error("network inconsistency: {0}")]
    NetworkInconsistency(#[from] NetworkError),

    #[error("backend runtime error: {0}")]
    BackendRuntime(#[source] BackendError),

    #[error("movement facts need a snapshot with a predecessor; call step() first")]
    InsufficientHistory,

    #[error("unknown intersection {0:?}")]
    UnknownIntersection(String),

    #[error("phase {phase} is out of range for intersection {intersection:?} ({phases} phases)")]
    PhaseOutOfRange {
        intersection: String,
        phase: usize,
        phases: usize,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Non-fatal anomaly found while materializing a snapshot.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncDiagnostic {
    #[error("vehicle {vehicle} reports lane {lane:?}, which is not in the road network")]
    UnknownLaneReference { vehicle: String, lane: String },

    #[error("vehicle {0} already left the network this episode and was reported again")]
    ReappearedVehicle(String),

    #[error("signal reported for {0:?}, which has no signal plan")]
    UnknownSignal(String),

    #[error("intersection {intersection:?} reports phase {phase}, plan has {phases}")]
    PhaseOutOfRange {
        intersection: String,
        phase: usize,
        phases: usize,
    },
}
