//! Builder pattern for Orchestrator construction

use std::sync::Arc;

use crate::config::CoordinatorConfig;
use crate::coordinator::ClusterLauncher;
use crate::dispatch::DispatchNode;
use crate::error::{SimError, SimResult};
use crate::failure::FailureContainer;
use crate::registry::ComponentRegistry;
use crate::suite::TestSuite;

use super::executor::Orchestrator;

/// Builder for creating an Orchestrator with proper configuration
///
/// # Example
///
/// ```ignore
/// let orchestrator = OrchestratorBuilder::new()
///     .parallel(true)
///     .suite(suite)
///     .coordinator(node)
///     .registry(registry)
///     .failures(failures)
///     .build()?;
/// ```
pub struct OrchestratorBuilder {
    config: CoordinatorConfig,
    suite: Option<TestSuite>,
    node: Option<Arc<DispatchNode>>,
    registry: Option<Arc<ComponentRegistry>>,
    failures: Option<Arc<FailureContainer>>,
    launcher: Option<Arc<dyn ClusterLauncher>>,
}

impl OrchestratorBuilder {
    /// Create a new orchestrator builder with default configuration
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
            suite: None,
            node: None,
            registry: None,
            failures: None,
            launcher: None,
        }
    }

    /// Set the full coordinator configuration
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Run test cases in parallel
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.config.parallel = parallel;
        self
    }

    /// Enable or disable fail-fast
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.config.fail_fast = fail_fast;
        self
    }

    /// Set the test suite
    pub fn suite(mut self, suite: TestSuite) -> Self {
        self.suite = Some(suite);
        self
    }

    /// Set the coordinator dispatch node
    pub fn coordinator(mut self, node: Arc<DispatchNode>) -> Self {
        self.node = Some(node);
        self
    }

    /// Set the component registry
    pub fn registry(mut self, registry: Arc<ComponentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the failure container
    pub fn failures(mut self, failures: Arc<FailureContainer>) -> Self {
        self.failures = Some(failures);
        self
    }

    /// Set the launcher used to restart workers after a failed test
    pub fn launcher(mut self, launcher: Arc<dyn ClusterLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Build the orchestrator
    ///
    /// # Errors
    ///
    /// Returns an error if a component is not set, or if configuration or
    /// suite validation fails.
    pub fn build(self) -> SimResult<Orchestrator> {
        let suite = self.suite.ok_or_else(|| SimError::missing_config("suite"))?;
        let node = self.node.ok_or_else(|| SimError::missing_config("coordinator"))?;
        let registry = self
            .registry
            .ok_or_else(|| SimError::missing_config("registry"))?;
        let failures = self
            .failures
            .ok_or_else(|| SimError::missing_config("failures"))?;

        self.config.validate()?;
        suite.validate()?;

        let mut orchestrator = Orchestrator::new(self.config, suite, node, registry, failures);
        orchestrator.launcher = self.launcher;
        Ok(orchestrator)
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
