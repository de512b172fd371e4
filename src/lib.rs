//! mergeq library crate.
//!
//! The primary interface is the `mergeq` binary. This lib.rs exposes the
//! queue engine so integration tests can exercise the store, lock,
//! detector, executor, and processor directly without going through the
//! CLI.

pub mod config;
pub mod conflict_log;
pub mod detect;
pub mod executor;
pub mod lock;
pub mod model;
pub mod processor;
pub mod report;
pub mod store;
pub mod vcs;

// Private modules only used by the binary: commands, telemetry.
