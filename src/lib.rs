//! Silicon Traffic
//!
//! A single engine interface over microscopic traffic simulators (SUMO and
//! CityFlow), with a backend-neutral road network, per-step entity state and
//! derived movement facts.

pub mod backend;
pub mod simulation;
