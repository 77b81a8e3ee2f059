//! Coordinator: root of the cluster tree and owner of a suite run
//!
//! The coordinator starts the agents through a [`ClusterLauncher`], runs the
//! suite with an [`Orchestrator`](crate::orchestrator::Orchestrator), and
//! always asks the launcher to stop the agents afterwards.

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::config::CoordinatorConfig;
use crate::dispatch::{
    AcknowledgeHandler, DispatchNode, LogHandler, OperationContext, OperationHandler,
};
use crate::error::{SimError, SimResult};
use crate::failure::{FailureContainer, FailureEntry, FailureListener, FailureType};
use crate::orchestrator::{OrchestratorBuilder, SuiteReport};
use crate::protocol::{OperationType, ResponseType, SimulatorAddress, SimulatorOperation};
use crate::registry::ComponentRegistry;
use crate::suite::TestSuite;

/// Starts and stops the agent processes of a cluster
#[async_trait]
pub trait ClusterLauncher: Send + Sync {
    /// Start one agent per registered agent, attached below `coordinator`
    ///
    /// Workers are registered in `registry` as they come up.
    async fn start_agents(
        &self,
        registry: &ComponentRegistry,
        coordinator: Arc<DispatchNode>,
    ) -> SimResult<()>;

    /// Stop every agent started by this launcher
    async fn stop_agents(&self) -> SimResult<()>;

    /// Replace every worker with a fresh one, keeping the agents
    ///
    /// Called between sequential tests after a failure, so a worker that died
    /// does not carry over into the next test. Launchers that cannot restart
    /// workers keep the default, which leaves them as they are.
    async fn restart_workers(&self, _registry: &ComponentRegistry) -> SimResult<()> {
        Ok(())
    }
}

/// Writes `Failure` operations into the run's failure container
pub struct FailureOperationHandler {
    failures: Arc<FailureContainer>,
}

impl FailureOperationHandler {
    /// Handler recording into `failures`
    pub fn new(failures: Arc<FailureContainer>) -> Self {
        Self { failures }
    }
}

#[async_trait]
impl OperationHandler for FailureOperationHandler {
    async fn handle(
        &self,
        context: OperationContext<'_>,
        operation: SimulatorOperation,
    ) -> SimResult<ResponseType> {
        let SimulatorOperation::Failure(report) = operation else {
            return Ok(ResponseType::UnsupportedOperation);
        };
        if report.reporter != context.source {
            tracing::debug!(reporter = %report.reporter, source = %context.source, "Failure relayed");
        }
        self.failures.report_failure(report);
        Ok(ResponseType::Success)
    }
}

/// Releases requests waiting on a worker that died
///
/// Holds the coordinator node weakly: the node owns the handler that owns the
/// container that owns this listener.
pub struct UnblockOnWorkerExit {
    node: Weak<DispatchNode>,
}

impl UnblockOnWorkerExit {
    /// Listener unblocking requests sent from `node`
    pub fn new(node: &Arc<DispatchNode>) -> Self {
        Self {
            node: Arc::downgrade(node),
        }
    }
}

impl FailureListener for UnblockOnWorkerExit {
    fn on_failure(&self, entry: &FailureEntry) {
        if !matches!(entry.failure_type, FailureType::WorkerOom | FailureType::WorkerExit) {
            return;
        }
        let Some(node) = self.node.upgrade() else {
            return;
        };
        let released = node.unblock(&entry.reporter);
        tracing::info!(worker = %entry.reporter, released, "Unblocked requests of dead worker");
    }
}

/// Build the coordinator's dispatch node, recording failures into `failures`
pub fn coordinator_node(failures: Arc<FailureContainer>) -> SimResult<Arc<DispatchNode>> {
    let node = DispatchNode::builder(SimulatorAddress::COORDINATOR)
        .handler(OperationType::IntegrationTest, Arc::new(AcknowledgeHandler))
        .handler(OperationType::Log, Arc::new(LogHandler))
        .handler(
            OperationType::Failure,
            Arc::new(FailureOperationHandler::new(Arc::clone(&failures))),
        )
        .build()?;
    failures.add_listener(Arc::new(UnblockOnWorkerExit::new(&node)));
    Ok(node)
}

/// Runs test suites against a cluster
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<ComponentRegistry>,
    launcher: Arc<dyn ClusterLauncher>,
    handle_signals: bool,
}

impl Coordinator {
    /// Start building a coordinator
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    /// Coordinator configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Component registry
    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// Run `suite` and fail if any failure was reported
    ///
    /// # Errors
    ///
    /// Returns a [`TestFailures`](crate::error::SimErrorKind::TestFailures)
    /// error when the suite ran but failures were recorded.
    pub async fn run(&self, suite: TestSuite) -> SimResult<SuiteReport> {
        let report = self.run_suite(suite).await?;
        report.check()?;
        Ok(report)
    }

    /// Start the cluster, run `suite`, stop the cluster
    ///
    /// Returns the report whatever the failure count; only a cluster that
    /// cannot be started or prepared is an error.
    pub async fn run_suite(&self, suite: TestSuite) -> SimResult<SuiteReport> {
        suite.validate()?;
        let failures = Arc::new(FailureContainer::new(suite.id.clone()));
        let node = coordinator_node(Arc::clone(&failures))?;

        if let Err(e) = self
            .launcher
            .start_agents(&self.registry, Arc::clone(&node))
            .await
        {
            tracing::error!(error = %e, "Failed to start agents");
            self.stop_agents().await;
            return Err(SimError::orchestration(format!("could not start cluster: {}", e)));
        }
        tracing::info!(
            agents = self.registry.agent_count(),
            workers = self.registry.worker_count(),
            "Cluster started"
        );

        let result = async {
            let orchestrator = OrchestratorBuilder::new()
                .config(self.config.clone())
                .suite(suite)
                .coordinator(Arc::clone(&node))
                .registry(Arc::clone(&self.registry))
                .failures(Arc::clone(&failures))
                .launcher(Arc::clone(&self.launcher))
                .build()?;
            if self.handle_signals {
                orchestrator.run_with_signal_handling().await
            } else {
                orchestrator.run().await
            }
        }
        .await;

        self.stop_agents().await;

        let report = result?;
        log_failure_info(&report);
        Ok(report)
    }

    async fn stop_agents(&self) {
        match self.launcher.stop_agents().await {
            Ok(()) => tracing::info!("Agents stopped"),
            Err(e) => tracing::warn!(error = %e, "Failed to stop agents"),
        }
    }
}

fn log_failure_info(report: &SuiteReport) {
    if report.is_success() {
        tracing::info!(suite_id = %report.suite_id, "No failures have been detected");
        return;
    }
    for failure in &report.failures {
        tracing::error!(suite_id = %report.suite_id, "{}", failure);
    }
    tracing::error!(
        suite_id = %report.suite_id,
        failures = report.failure_count(),
        "Failures have been detected"
    );
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("launcher", &"<ClusterLauncher>")
            .field("handle_signals", &self.handle_signals)
            .finish()
    }
}

/// Builder for [`Coordinator`]
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    registry: Option<Arc<ComponentRegistry>>,
    launcher: Option<Arc<dyn ClusterLauncher>>,
    handle_signals: bool,
}

impl CoordinatorBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
            registry: None,
            launcher: None,
            handle_signals: false,
        }
    }

    /// Set the coordinator configuration
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the component registry; defaults to an empty one
    pub fn registry(mut self, registry: Arc<ComponentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the cluster launcher
    pub fn launcher(mut self, launcher: Arc<dyn ClusterLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Abort the suite on Ctrl+C
    pub fn handle_signals(mut self, handle_signals: bool) -> Self {
        self.handle_signals = handle_signals;
        self
    }

    /// Build the coordinator
    ///
    /// # Errors
    ///
    /// Returns an error if the launcher is missing or the configuration is invalid.
    pub fn build(self) -> SimResult<Coordinator> {
        let launcher = self
            .launcher
            .ok_or_else(|| SimError::missing_config("launcher"))?;
        self.config.validate()?;

        Ok(Coordinator {
            config: self.config,
            registry: self.registry.unwrap_or_default(),
            launcher,
            handle_signals: self.handle_signals,
        })
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FailureReport;

    fn report(failure_type: FailureType) -> SimulatorOperation {
        SimulatorOperation::Failure(FailureReport {
            failure_type,
            reporter: SimulatorAddress::worker(1, 1),
            test_id: Some("map".into()),
            message: "boom".into(),
        })
    }

    #[tokio::test]
    async fn test_failure_operation_recorded() {
        let failures = Arc::new(FailureContainer::new("suite"));
        let node = coordinator_node(failures.clone()).unwrap();

        let response = node
            .send_operation(SimulatorAddress::COORDINATOR, &report(FailureType::WorkerException))
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(failures.count(), 1);
        assert_eq!(failures.failures_for_test("map"), 1);
    }

    #[tokio::test]
    async fn test_worker_exit_marks_finished() {
        let failures = Arc::new(FailureContainer::new("suite"));
        let node = coordinator_node(failures.clone()).unwrap();

        node.send_operation(SimulatorAddress::COORDINATOR, &report(FailureType::WorkerExit))
            .await
            .unwrap();

        assert_eq!(failures.count(), 1);
        assert!(failures.finished_workers().contains(&SimulatorAddress::worker(1, 1)));
    }

    #[test]
    fn test_builder_missing_launcher() {
        let err = Coordinator::builder().build().unwrap_err();
        assert!(err.message.contains("launcher"));
    }
}
