//! simbench-core: Coordinator core for distributed load-testing clusters
//!
//! This crate provides the pieces a coordinator needs to drive a cluster of
//! agents and workers through a test suite, including:
//!
//! - Hierarchical addressing and the message protocol
//! - Dispatch nodes that route, fan out and aggregate operations
//! - Component registry and failure container
//! - Test suite orchestration with phase barriers and fail-fast
//! - An in-process cluster for local runs and tests
//! - Error handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod channel;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod failure;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod suite;
pub mod worker;

pub use agent::{Agent, AgentBuilder};
pub use channel::ChannelConfig;
pub use cluster::LocalCluster;
pub use config::{ConfigError, CoordinatorConfig, ParallelFailFast};
pub use coordinator::{ClusterLauncher, Coordinator, CoordinatorBuilder};
pub use dispatch::{ChannelConnector, Connector, DispatchNode, LinkDirection, ParentLink};
pub use error::*;
pub use failure::{FailureContainer, FailureEntry, FailureType};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, SuiteReport, TestOutcome, TestStatus};
pub use protocol::*;
pub use registry::ComponentRegistry;
pub use suite::{TestCase, TestPhase, TestSuite};
pub use worker::WorkerBuilder;
