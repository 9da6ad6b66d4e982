//! Squareoff: automated trade-exit engine.
//!
//! This is the root crate that ties the workspace together for integration
//! tests and benchmarks. For actual functionality, use the individual
//! crates directly:
//!
//! - `broker-core`: shared types, broker API clients, streaming ticker,
//!   credential handling, database repositories, event bus
//! - `exit-engine`: exit rules, position monitoring, trigger evaluation,
//!   order execution, per-user engine and supervisor

// Re-export for integration tests and benchmarks
pub use broker_core as broker;
pub use exit_engine as engine;
