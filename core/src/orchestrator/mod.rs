//! Orchestrator for test suite execution
//!
//! The Orchestrator drives a test suite across the cluster:
//! - Preparing agents (`InitTestSuite`) and workers (`CreateTest`)
//! - Running each test case through its eight phases
//! - Synchronizing parallel test cases with phase barriers
//! - Applying the fail-fast policy
//! - Terminating workers and waiting for their shutdown
//!
//! # Example
//!
//! ```ignore
//! use simbench_core::orchestrator::OrchestratorBuilder;
//!
//! let orchestrator = OrchestratorBuilder::new()
//!     .parallel(true)
//!     .suite(suite)
//!     .coordinator(node)
//!     .registry(registry)
//!     .failures(failures)
//!     .build()?;
//!
//! let report = orchestrator.run_with_signal_handling().await?;
//! ```

mod aggregator;
mod barrier;
mod builder;
mod executor;
mod runner;

pub use aggregator::{aggregate_outcomes, PhaseOutcome, SuiteReport, TestOutcome, TestStatus};
pub use barrier::{CountdownGate, PhaseBarriers};
pub use builder::OrchestratorBuilder;
pub use executor::Orchestrator;

#[cfg(test)]
mod tests;
