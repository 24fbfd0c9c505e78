//! # cascade-runner
//!
//! Drives the rule language over aggregated sequence state.
//!
//! The runner consumes whole-sequence bundles from the bus, evaluates the
//! loaded rules against each bundle, and fans the matched calls out as
//! concurrent request publishes. Failures are collected, never
//! short-circuited: one bad call does not block its siblings, and one bad
//! `on` block does not block the others.

mod error;
mod runner;

pub use error::RunnerError;
pub use runner::{Runner, RunnerBus};
