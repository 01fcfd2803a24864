//! Adapter-side bookkeeping of signal phases and time spent in them
//!
//! Neither simulator hands out time-in-phase in a form both can share, so
//! adapters keep one of these per connection. SUMO feeds it the observed phase
//! each tick; CityFlow has no phase getter at all and lets the clock run the
//! fixed-time plan itself.

use std::collections::BTreeMap;

use super::RawSignal;

#[derive(Debug, Clone)]
struct ClockEntry {
    phase: usize,
    elapsed: f64,
    /// Nominal phase durations in seconds
    durations: Vec<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct PhaseClock {
    entries: BTreeMap<String, ClockEntry>,
}

impl PhaseClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an intersection at phase 0
    pub fn register(&mut self, intersection: impl Into<String>, durations: Vec<f64>) {
        self.entries.insert(
            intersection.into(),
            ClockEntry {
                phase: 0,
                elapsed: 0.0,
                durations,
            },
        );
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn phase_count(&self, intersection: &str) -> Option<usize> {
        self.entries.get(intersection).map(|e| e.durations.len())
    }

    pub fn phase(&self, intersection: &str) -> Option<usize> {
        self.entries.get(intersection).map(|e| e.phase)
    }

    /// Record the phase reported after a tick of `tick` seconds.
    ///
    /// Returns the time spent in that phase so far.
    pub fn observe(&mut self, intersection: &str, phase: usize, tick: f64) -> f64 {
        let entry = self
            .entries
            .entry(intersection.to_string())
            .or_insert_with(|| ClockEntry {
                phase,
                elapsed: 0.0,
                durations: Vec::new(),
            });
        if entry.phase == phase {
            entry.elapsed += tick;
        } else {
            entry.phase = phase;
            entry.elapsed = 0.0;
        }
        entry.elapsed
    }

    /// Run every fixed-time plan forward by one tick
    pub fn advance_fixed(&mut self, tick: f64) {
        for entry in self.entries.values_mut() {
            entry.elapsed += tick;
            if entry.durations.is_empty() {
                continue;
            }
            // Zero-length phases are skipped in the same tick
            let mut guard = entry.durations.len();
            while entry.elapsed >= entry.durations[entry.phase] && guard > 0 {
                entry.elapsed -= entry.durations[entry.phase];
                entry.phase = (entry.phase + 1) % entry.durations.len();
                guard -= 1;
            }
        }
    }

    /// Let time pass without changing any phase
    pub fn advance_held(&mut self, tick: f64) {
        for entry in self.entries.values_mut() {
            entry.elapsed += tick;
        }
    }

    /// Jump to `phase`, restarting its timer.
    ///
    /// Returns false for unknown intersections and phases outside the plan.
    pub fn set_phase(&mut self, intersection: &str, phase: usize) -> bool {
        match self.entries.get_mut(intersection) {
            Some(entry) if entry.durations.is_empty() || phase < entry.durations.len() => {
                entry.phase = phase;
                entry.elapsed = 0.0;
                true
            }
            _ => false,
        }
    }

    pub fn signals(&self) -> Vec<RawSignal> {
        self.entries
            .iter()
            .map(|(intersection, entry)| RawSignal {
                intersection: intersection.clone(),
                phase_index: entry.phase,
                time_in_phase: entry.elapsed,
            })
            .collect()
    }
}
