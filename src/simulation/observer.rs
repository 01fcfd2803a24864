//! Push hooks for consumers that want to see every step as it happens.
//!
//! Polling [`Engine::latest_state`](super::Engine::latest_state) works just as
//! well; observers exist so a monitor does not have to wrap the step loop.

use super::error::SyncDiagnostic;
use super::road_network::RoadNetwork;
use super::sync::StateSnapshot;

/// Callbacks invoked by the engine at lifecycle points.
///
/// All methods have default no-op implementations so implementors only need
/// to override what they care about.
pub trait StepObserver {
    /// Called after a successful reset with the initial snapshot.
    fn on_reset(&mut self, _network: &RoadNetwork, _snapshot: &StateSnapshot) {}

    /// Called after every successful step.
    fn on_step(&mut self, _snapshot: &StateSnapshot, _diagnostics: &[SyncDiagnostic]) {}

    /// Called once when the engine terminates, with the last snapshot if any.
    fn on_terminate(&mut self, _last: Option<&StateSnapshot>) {}
}

/// Adapts a closure into an observer that only sees steps
pub(crate) struct StepFn<F>(pub F);

impl<F> StepObserver for StepFn<F>
where
    F: FnMut(&StateSnapshot),
{
    fn on_step(&mut self, snapshot: &StateSnapshot, _diagnostics: &[SyncDiagnostic]) {
        (self.0)(snapshot)
    }
}
