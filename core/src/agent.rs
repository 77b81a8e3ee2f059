//! Agent component: supervises the workers on one machine
//!
//! An agent is a [`DispatchNode`] at agent level. It relays coordinator
//! requests to its workers and worker reports to the coordinator, and handles
//! `InitTestSuite`, `Log` and `IntegrationTest` itself.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::dispatch::{
    AcknowledgeHandler, Connector, DispatchNode, LogHandler, OperationContext, OperationHandler,
};
use crate::error::{SimError, SimResult};
use crate::protocol::{OperationType, ResponseType, SimulatorAddress, SimulatorOperation};

/// Records the suite an agent was prepared for
#[derive(Debug, Default)]
pub struct InitTestSuiteHandler {
    suite_id: RwLock<Option<String>>,
}

impl InitTestSuiteHandler {
    /// Suite id received by the last `InitTestSuite`
    pub fn suite_id(&self) -> Option<String> {
        self.suite_id.read().clone()
    }
}

#[async_trait]
impl OperationHandler for InitTestSuiteHandler {
    async fn handle(
        &self,
        context: OperationContext<'_>,
        operation: SimulatorOperation,
    ) -> SimResult<ResponseType> {
        let SimulatorOperation::InitTestSuite { suite_id } = operation else {
            return Ok(ResponseType::UnsupportedOperation);
        };

        let previous = self.suite_id.write().replace(suite_id.clone());
        if let Some(previous) = previous.filter(|p| *p != suite_id) {
            tracing::warn!(agent = %context.address(), %previous, "Replacing test suite");
        }
        tracing::info!(agent = %context.address(), %suite_id, "Test suite initialized");
        Ok(ResponseType::Success)
    }
}

/// An agent node together with its local state
#[derive(Debug, Clone)]
pub struct Agent {
    node: Arc<DispatchNode>,
    suite: Arc<InitTestSuiteHandler>,
}

impl Agent {
    /// Start building agent `agent_index`
    pub fn builder(agent_index: u32) -> AgentBuilder {
        AgentBuilder::new(agent_index)
    }

    /// Dispatch node of the agent
    pub fn node(&self) -> &Arc<DispatchNode> {
        &self.node
    }

    /// Address of the agent
    pub fn address(&self) -> SimulatorAddress {
        self.node.address()
    }

    /// Suite the agent was initialized for
    pub fn suite_id(&self) -> Option<String> {
        self.suite.suite_id()
    }
}

/// Builder for [`Agent`]
pub struct AgentBuilder {
    agent_index: u32,
    upstream: Option<Arc<dyn Connector>>,
}

impl AgentBuilder {
    /// Create a new builder for agent `agent_index`
    pub fn new(agent_index: u32) -> Self {
        Self {
            agent_index,
            upstream: None,
        }
    }

    /// Set the link to the coordinator
    pub fn upstream(mut self, upstream: Arc<dyn Connector>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Build the agent
    ///
    /// The upstream link may also be attached later with
    /// [`DispatchNode::set_upstream`].
    ///
    /// # Errors
    /// Returns an error if the index is the wildcard.
    pub fn build(self) -> SimResult<Agent> {
        if self.agent_index == 0 {
            return Err(SimError::config("agent index must be positive"));
        }

        let suite = Arc::new(InitTestSuiteHandler::default());
        let mut builder = DispatchNode::builder(SimulatorAddress::agent(self.agent_index))
            .handler(OperationType::IntegrationTest, Arc::new(AcknowledgeHandler))
            .handler(OperationType::Log, Arc::new(LogHandler))
            .handler(OperationType::InitTestSuite, suite.clone());
        if let Some(upstream) = self.upstream {
            builder = builder.upstream(upstream);
        }

        Ok(Agent {
            node: builder.build()?,
            suite,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_rejects_wildcard_index() {
        assert!(AgentBuilder::new(0).build().is_err());
    }

    #[test]
    fn test_builder_handlers() {
        let agent = AgentBuilder::new(2).build().unwrap();
        assert_eq!(agent.address(), SimulatorAddress::agent(2));
        assert!(!agent.node().has_upstream());
        assert_eq!(
            agent.node().operation_types(),
            vec![
                OperationType::IntegrationTest,
                OperationType::Log,
                OperationType::InitTestSuite,
            ]
        );
    }

    #[tokio::test]
    async fn test_init_test_suite_recorded() {
        let agent = Agent::builder(1).build().unwrap();
        assert_eq!(agent.suite_id(), None);

        let response = agent
            .node()
            .send_operation(
                SimulatorAddress::agent(1),
                &SimulatorOperation::InitTestSuite {
                    suite_id: "nightly".into(),
                },
            )
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(agent.suite_id().as_deref(), Some("nightly"));
    }

    #[tokio::test]
    async fn test_agent_relays_to_workers() {
        let agent = Agent::builder(1).build().unwrap();
        let worker = crate::worker::WorkerBuilder::new(1, 1)
            .upstream(crate::dispatch::ParentLink::new(agent.node()))
            .build()
            .unwrap();
        agent.node().add_child(worker).unwrap();

        let response = agent
            .node()
            .send_operation(
                SimulatorAddress::all_workers(),
                &SimulatorOperation::Log {
                    message: "hello".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(response.size(), 1);
        assert_eq!(
            response.get(&SimulatorAddress::worker(1, 1)),
            Some(ResponseType::Success)
        );
    }
}
