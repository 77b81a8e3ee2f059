//! Builder pattern for worker construction

use std::sync::Arc;

use crate::dispatch::{AcknowledgeHandler, Connector, DispatchNode, LogHandler};
use crate::error::{SimError, SimResult};
use crate::protocol::{OperationType, SimulatorAddress};

use super::executor::{CreateTestHandler, TerminateWorkerHandler};

/// Builder for worker nodes
///
/// # Example
/// ```ignore
/// let worker = WorkerBuilder::new(1, 2)
///     .upstream(agent_link)
///     .build()?;
/// ```
pub struct WorkerBuilder {
    agent_index: u32,
    worker_index: u32,
    upstream: Option<Arc<dyn Connector>>,
}

impl WorkerBuilder {
    /// Create a new builder for worker `worker_index` on agent `agent_index`
    pub fn new(agent_index: u32, worker_index: u32) -> Self {
        Self {
            agent_index,
            worker_index,
            upstream: None,
        }
    }

    /// Set the link to the supervising agent
    pub fn upstream(mut self, upstream: Arc<dyn Connector>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Build the worker node
    ///
    /// # Errors
    /// Returns an error if an index is the wildcard or the upstream link is missing.
    pub fn build(self) -> SimResult<Arc<DispatchNode>> {
        if self.agent_index == 0 || self.worker_index == 0 {
            return Err(SimError::config(format!(
                "worker indices must be positive, got agent {} worker {}",
                self.agent_index, self.worker_index
            )));
        }
        let upstream = self.upstream.ok_or(SimError::missing_config("upstream"))?;

        DispatchNode::builder(SimulatorAddress::worker(self.agent_index, self.worker_index))
            .handler(OperationType::IntegrationTest, Arc::new(AcknowledgeHandler))
            .handler(OperationType::Log, Arc::new(LogHandler))
            .handler(OperationType::CreateTest, Arc::new(CreateTestHandler))
            .handler(OperationType::TerminateWorkers, Arc::new(TerminateWorkerHandler))
            .upstream(upstream)
            .build()
    }
}
