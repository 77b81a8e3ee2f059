//! Orchestrator execution logic

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::CoordinatorConfig;
use crate::coordinator::ClusterLauncher;
use crate::dispatch::DispatchNode;
use crate::error::{SimError, SimResult};
use crate::failure::FailureContainer;
use crate::protocol::{Response, SimulatorAddress, SimulatorOperation};
use crate::registry::{ComponentRegistry, TestData};
use crate::suite::TestSuite;

use super::aggregator::{aggregate_outcomes, SuiteReport, TestOutcome, TestStatus};
use super::barrier::PhaseBarriers;
use super::runner::{send_within, RunContext, TestCaseRunner};

/// Orchestrator runs one test suite against a started cluster
///
/// Responsible for preparing the agents and workers, running every test case
/// through its phases, and shutting the workers down afterwards.
pub struct Orchestrator {
    /// Coordinator configuration
    pub(crate) config: CoordinatorConfig,

    /// Suite to run
    pub(crate) suite: TestSuite,

    /// Coordinator dispatch node, root of the cluster tree
    pub(crate) node: Arc<DispatchNode>,

    /// Directory of agents, workers and tests
    pub(crate) registry: Arc<ComponentRegistry>,

    /// Failure ledger of this run
    pub(crate) failures: Arc<FailureContainer>,

    /// Abort signal shared with the runners
    pub(crate) abort_tx: watch::Sender<bool>,

    /// Restarts workers between sequential tests after a failure
    pub(crate) launcher: Option<Arc<dyn ClusterLauncher>>,
}

impl Orchestrator {
    /// Create a new orchestrator
    ///
    /// Use `OrchestratorBuilder` for a more ergonomic construction.
    pub fn new(
        config: CoordinatorConfig,
        suite: TestSuite,
        node: Arc<DispatchNode>,
        registry: Arc<ComponentRegistry>,
        failures: Arc<FailureContainer>,
    ) -> Self {
        let (abort_tx, _) = watch::channel(false);
        Self {
            config,
            suite,
            node,
            registry,
            failures,
            abort_tx,
            launcher: None,
        }
    }

    /// Get the coordinator configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Get the failure ledger
    pub fn failures(&self) -> &Arc<FailureContainer> {
        &self.failures
    }

    /// Stop every running test after its current phase
    pub fn abort(&self) {
        if !self.abort_tx.send_replace(true) {
            tracing::warn!(suite_id = %self.suite.id, "Aborting test suite");
        }
    }

    /// Whether the run was aborted
    pub fn is_aborted(&self) -> bool {
        *self.abort_tx.borrow()
    }

    /// Run the test suite
    ///
    /// Phase failures are recorded in the failure container and the report;
    /// only a cluster that cannot be prepared makes this return an error.
    pub async fn run(&self) -> SimResult<SuiteReport> {
        let start = Instant::now();
        let tests = self.registry.add_tests(&self.suite);

        tracing::info!(
            suite_id = %self.suite.id,
            tests = tests.len(),
            agents = self.registry.agent_count(),
            workers = self.registry.worker_count(),
            parallel = self.config.parallel,
            fail_fast = self.config.fail_fast,
            "Starting test suite"
        );
        self.echo(format!("Starting test suite {}", self.suite.id)).await;

        self.prepare(&tests).await?;

        let outcomes = if self.config.parallel {
            self.run_parallel(tests).await?
        } else {
            self.run_sequential(tests).await
        };

        self.terminate_workers().await;
        let missing_workers = self.wait_for_worker_shutdown().await;

        let elapsed = start.elapsed();
        let report = aggregate_outcomes(&self.suite.id, outcomes, &self.failures, missing_workers, elapsed);
        tracing::info!(
            suite_id = %self.suite.id,
            elapsed_secs = elapsed.as_secs_f64(),
            completed = report.count(TestStatus::Completed),
            failed = report.count(TestStatus::Failed),
            aborted = report.count(TestStatus::Aborted),
            skipped = report.count(TestStatus::Skipped),
            failures = report.failure_count(),
            "Test suite completed"
        );
        Ok(report)
    }

    /// Run with Ctrl+C signal handling
    ///
    /// Ctrl+C aborts the suite: running tests stop after their current phase
    /// and the workers are still shut down.
    pub async fn run_with_signal_handling(&self) -> SimResult<SuiteReport> {
        let abort_tx = self.abort_tx.clone();

        let signal_handle = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Received Ctrl+C, aborting test suite...");
                    abort_tx.send_replace(true);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
            }
        });

        let result = self.run().await;

        signal_handle.abort();

        result
    }

    /// Send `InitTestSuite` to the agents and create the tests on the workers
    async fn prepare(&self, tests: &[TestData]) -> SimResult<()> {
        let response = self
            .send(
                SimulatorAddress::all_agents(),
                &SimulatorOperation::InitTestSuite {
                    suite_id: self.suite.id.clone(),
                },
            )
            .await?;
        if !response.is_success() {
            return Err(SimError::orchestration(format!(
                "agents could not initialize suite {}: {:?}",
                self.suite.id,
                response.failures()
            )));
        }

        self.create_tests(tests).await
    }

    /// Create `tests` on every worker
    async fn create_tests(&self, tests: &[TestData]) -> SimResult<()> {
        for test in tests {
            let response = self
                .send(
                    SimulatorAddress::all_workers(),
                    &SimulatorOperation::CreateTest {
                        test_index: test.test_index(),
                        test_case: test.test_case().clone(),
                    },
                )
                .await?;
            if !response.is_success() {
                return Err(SimError::orchestration(format!(
                    "test {} could not be created: {:?}",
                    test.test_id(),
                    response.failures()
                )));
            }
            tracing::debug!(test_id = %test.test_id(), workers = response.size(), "Test created");
        }
        Ok(())
    }

    fn context(&self) -> Arc<RunContext> {
        Arc::new(RunContext {
            node: Arc::clone(&self.node),
            failures: Arc::clone(&self.failures),
            config: self.config.clone(),
            run_duration: self.config.run_duration.or(self.suite.duration),
            abort: self.abort_tx.clone(),
        })
    }

    async fn run_sequential(&self, tests: Vec<TestData>) -> Vec<TestOutcome> {
        let context = self.context();
        let padding = self.suite.max_test_case_id_length();
        let mut outcomes = Vec::with_capacity(tests.len());
        let mut stopped = false;

        for (idx, test) in tests.iter().enumerate() {
            if stopped || self.is_aborted() {
                outcomes.push(TestOutcome::skipped(test.test_id(), test.test_index()));
                continue;
            }
            let outcome = TestCaseRunner::new(test.clone(), Arc::clone(&context), None, padding)
                .run()
                .await;
            let failed = outcome.status == TestStatus::Failed;
            if failed && self.config.fail_fast {
                tracing::warn!(test_id = %outcome.test_id, "Aborting test suite due to failure");
                stopped = true;
            }
            outcomes.push(outcome);

            let remaining = &tests[idx + 1..];
            if failed && !stopped && !remaining.is_empty() && !self.is_aborted() {
                if let Err(e) = self.restart_workers(remaining).await {
                    tracing::error!(error = %e, "Workers could not be restarted, skipping remaining tests");
                    stopped = true;
                }
            }
        }
        outcomes
    }

    /// Give the `remaining` tests fresh workers after a failed test
    async fn restart_workers(&self, remaining: &[TestData]) -> SimResult<()> {
        let Some(launcher) = &self.launcher else {
            tracing::debug!("No launcher, continuing on the current workers");
            return Ok(());
        };
        tracing::warn!(tests = remaining.len(), "Restarting workers after a failed test");
        launcher.restart_workers(&self.registry).await?;
        self.create_tests(remaining).await
    }

    async fn run_parallel(&self, tests: Vec<TestData>) -> SimResult<Vec<TestOutcome>> {
        let context = self.context();
        let padding = self.suite.max_test_case_id_length();
        let barriers = Arc::new(PhaseBarriers::new(&self.config, tests.len()));
        let mut handles = Vec::with_capacity(tests.len());

        for test in tests {
            let runner = TestCaseRunner::new(test, Arc::clone(&context), Some(Arc::clone(&barriers)), padding);
            handles.push(tokio::spawn(runner.run()));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        let mut runner_failures = 0;
        for (idx, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    runner_failures += 1;
                    tracing::error!(runner = idx, error = %e, "Test runner panicked");
                }
            }
        }

        if runner_failures > 0 {
            return Err(SimError::orchestration(format!(
                "{} test runners crashed",
                runner_failures
            )));
        }
        Ok(outcomes)
    }

    async fn terminate_workers(&self) {
        match self
            .send(SimulatorAddress::all_workers(), &SimulatorOperation::TerminateWorkers)
            .await
        {
            Ok(response) if response.is_success() => {
                tracing::info!(workers = response.size(), "Terminating workers");
            }
            Ok(response) => {
                tracing::warn!(failures = ?response.failures(), "Not every worker accepted termination");
            }
            Err(e) => tracing::warn!(error = %e, "Terminating workers failed"),
        }
    }

    /// Poll until every registered worker reported it finished, or time out
    async fn wait_for_worker_shutdown(&self) -> BTreeSet<SimulatorAddress> {
        let expected = self.registry.workers();
        let deadline = Instant::now() + self.config.worker_shutdown_timeout;
        tracing::info!(workers = expected.len(), "Waiting for workers to shut down");

        loop {
            let missing = self.failures.missing_workers(&expected);
            if missing.is_empty() {
                tracing::info!("All workers have shut down");
                return missing;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    missing = ?missing,
                    timeout_secs = self.config.worker_shutdown_timeout.as_secs_f64(),
                    "Workers did not shut down in time"
                );
                return missing;
            }
            tokio::time::sleep(self.config.shutdown_poll_interval).await;
        }
    }

    async fn echo(&self, message: String) {
        if let Err(e) = self
            .send(SimulatorAddress::all_agents(), &SimulatorOperation::Log { message })
            .await
        {
            tracing::debug!(error = %e, "Echo to agents failed");
        }
    }

    async fn send(&self, destination: SimulatorAddress, operation: &SimulatorOperation) -> SimResult<Response> {
        send_within(&self.node, self.config.send_timeout, destination, operation).await
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("suite_id", &self.suite.id)
            .field("tests", &self.suite.size())
            .field("config", &self.config)
            .field("launcher", &self.launcher.as_ref().map(|_| "<ClusterLauncher>"))
            .field("aborted", &self.is_aborted())
            .finish()
    }
}
