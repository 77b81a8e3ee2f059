//! Worker component: hosts tests and runs their phases
//!
//! A worker is a [`DispatchNode`](crate::dispatch::DispatchNode) at worker
//! level. Its handler table covers:
//!
//! 1. `CreateTest`: builds a test node below the worker
//! 2. `TerminateWorkers`: drops the tests and reports "worker finished"
//! 3. `Log` and `IntegrationTest`
//!
//! Each test node runs `StartTestPhase` and `StopTest` against a
//! [`TestInstance`]. A test that fails reports to the coordinator by routing
//! a `Failure` operation up the tree.
//!
//! # Example
//!
//! ```ignore
//! use simbench_core::worker::WorkerBuilder;
//!
//! let worker = WorkerBuilder::new(1, 1)
//!     .upstream(agent_link)
//!     .build()?;
//! agent.add_child(ChannelConnector::connect(worker, &channel))?;
//! ```

mod builder;
mod executor;
mod stats;
mod test_instance;

pub use builder::WorkerBuilder;
pub use executor::{report_to_coordinator, CreateTestHandler, TerminateWorkerHandler, TestPhaseHandler};
pub use stats::TestStats;
pub use test_instance::{TestBehavior, TestInstance};

#[cfg(test)]
mod tests;
