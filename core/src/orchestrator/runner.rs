//! Drives one test case through its phases

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::{CoordinatorConfig, ParallelFailFast};
use crate::dispatch::DispatchNode;
use crate::error::{SimError, SimResult};
use crate::failure::{FailureContainer, FailureType};
use crate::protocol::{FailureReport, Response, SimulatorAddress, SimulatorOperation};
use crate::registry::TestData;
use crate::suite::TestPhase;

use super::aggregator::{PhaseOutcome, TestOutcome, TestStatus};
use super::barrier::PhaseBarriers;

/// State shared by every runner of one suite run
pub(crate) struct RunContext {
    pub(crate) node: Arc<DispatchNode>,
    pub(crate) failures: Arc<FailureContainer>,
    pub(crate) config: CoordinatorConfig,
    pub(crate) run_duration: Option<Duration>,
    pub(crate) abort: watch::Sender<bool>,
}

impl RunContext {
    fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }

    /// Whether a failure of one test stops the others
    fn aborts_siblings(&self) -> bool {
        self.config.fail_fast
            && self.config.parallel
            && self.config.parallel_fail_fast == ParallelFailFast::AbortAll
    }

    /// Failures that count for `test_id`
    ///
    /// In parallel mode other tests fail concurrently, so only the test's own
    /// failures count.
    fn failure_count(&self, test_id: &str) -> usize {
        if self.config.parallel {
            self.failures.failures_for_test(test_id)
        } else {
            self.failures.count()
        }
    }
}

/// Runs the phases of one test case
pub(crate) struct TestCaseRunner {
    test: TestData,
    context: Arc<RunContext>,
    barriers: Option<Arc<PhaseBarriers>>,
    padding: usize,
}

impl TestCaseRunner {
    pub(crate) fn new(
        test: TestData,
        context: Arc<RunContext>,
        barriers: Option<Arc<PhaseBarriers>>,
        padding: usize,
    ) -> Self {
        Self {
            test,
            context,
            barriers,
            padding,
        }
    }

    /// Run every phase in order until the test completes, fails or is aborted
    pub(crate) async fn run(self) -> TestOutcome {
        let mut outcome = TestOutcome {
            test_id: self.test.test_id().to_string(),
            test_index: self.test.test_index(),
            status: TestStatus::Completed,
            phases: Vec::with_capacity(TestPhase::ALL.len()),
            error: None,
        };
        let mut passed_gate = None;

        tracing::info!(test_id = %self.label(), "Starting test");
        for phase in TestPhase::ALL {
            if self.context.is_aborted() {
                tracing::warn!(test_id = %self.label(), %phase, "Test aborted before phase");
                outcome.status = TestStatus::Aborted;
                break;
            }

            if let Some(barriers) = &self.barriers {
                if barriers.syncs(phase) {
                    barriers.arrive_and_wait(phase).await;
                    passed_gate = Some(phase);
                }
            }

            let (phase_outcome, error) = self.run_phase(phase).await;
            let failed = !phase_outcome.is_success() || error.is_some();
            outcome.phases.push(phase_outcome);

            if failed {
                outcome.status = TestStatus::Failed;
                outcome.error = error.map(|e| e.to_string());
                if self.context.aborts_siblings() {
                    tracing::warn!(test_id = %self.label(), %phase, "Aborting all tests");
                    self.context.abort.send_replace(true);
                }
                break;
            }
        }

        if let Some(barriers) = &self.barriers {
            barriers.leave(passed_gate);
        }
        tracing::info!(test_id = %self.label(), status = %outcome.status, "Test finished");
        outcome
    }

    async fn run_phase(&self, phase: TestPhase) -> (PhaseOutcome, Option<SimError>) {
        let test_id = self.test.test_id();
        let failures_before = self.context.failure_count(test_id);
        let started_at = Utc::now();
        let started = Instant::now();
        tracing::info!(test_id = %self.label(), %phase, "Starting phase");

        let result = if phase == TestPhase::Run {
            match self.context.run_duration {
                Some(duration) => self.run_timed(duration).await,
                None => self.start_phase(phase).await,
            }
        } else {
            self.start_phase(phase).await
        };

        let mut outcome = PhaseOutcome {
            phase,
            entries: 0,
            failures: Vec::new(),
            started_at,
            elapsed: started.elapsed(),
        };
        let mut error = None;
        match result {
            Ok(response) => {
                outcome.entries = response.size();
                outcome.failures = response.failures();
            }
            Err(e) => {
                let failure_type = if e.is_timeout() {
                    FailureType::WorkerTimeout
                } else {
                    FailureType::OperationFailure
                };
                self.record(SimulatorAddress::COORDINATOR, failure_type, format!("{} failed: {}", phase, e));
                error = Some(e);
            }
        }

        // failures the workers did not report themselves are recorded here
        if !outcome.failures.is_empty() && self.context.failure_count(test_id) == failures_before {
            for (address, response_type) in &outcome.failures {
                self.record(
                    *address,
                    FailureType::OperationFailure,
                    format!("{} returned {}", phase, response_type),
                );
            }
        }

        if self.context.failure_count(test_id) > failures_before && outcome.is_success() && error.is_none() {
            error = Some(SimError::orchestration(format!("failure reported during {}", phase)));
        }

        if outcome.is_success() && error.is_none() {
            tracing::info!(
                test_id = %self.label(),
                %phase,
                entries = outcome.entries,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "Completed phase"
            );
        } else {
            tracing::error!(
                test_id = %self.label(),
                %phase,
                failures = ?outcome.failures,
                error = ?error.as_ref().map(|e| e.to_string()),
                "Phase failed"
            );
        }
        (outcome, error)
    }

    /// Start `phase` and wait for it; only an untimed RUN may outlast the send timeout
    async fn start_phase(&self, phase: TestPhase) -> SimResult<Response> {
        let operation = SimulatorOperation::StartTestPhase {
            test_id: self.test.test_id().to_string(),
            phase,
        };
        if phase == TestPhase::Run {
            return self.context.node.send_operation(self.test.address(), &operation).await;
        }
        send_within(
            &self.context.node,
            self.context.config.send_timeout,
            self.test.address(),
            &operation,
        )
        .await
    }

    /// Start RUN, let it go on for `duration`, then send `StopTest`
    async fn run_timed(&self, duration: Duration) -> SimResult<Response> {
        let test_id = self.test.test_id();
        let failures_before = self.context.failure_count(test_id);
        let node = Arc::clone(&self.context.node);
        let destination = self.test.address();
        let operation = SimulatorOperation::StartTestPhase {
            test_id: test_id.to_string(),
            phase: TestPhase::Run,
        };
        let mut run = tokio::spawn(async move { node.send_operation(destination, &operation).await });

        let deadline = Instant::now() + duration;
        let mut check = tokio::time::interval(self.context.config.failure_check_interval);
        check.tick().await;
        loop {
            tokio::select! {
                result = &mut run => {
                    tracing::info!(test_id = %self.label(), "Test ended before the run duration");
                    return join_result(result);
                }
                _ = tokio::time::sleep_until(deadline) => break,
                _ = check.tick() => {
                    if self.context.is_aborted() {
                        tracing::warn!(test_id = %self.label(), "Stopping run early, suite aborted");
                        break;
                    }
                    if self.context.config.fail_fast
                        && self.context.failure_count(test_id) > failures_before
                    {
                        tracing::warn!(test_id = %self.label(), "Stopping run early, failure reported");
                        break;
                    }
                }
            }
        }

        let stop = send_within(
            &self.context.node,
            self.context.config.send_timeout,
            self.test.address(),
            &SimulatorOperation::StopTest {
                test_id: test_id.to_string(),
            },
        )
        .await;
        match stop {
            Ok(response) if !response.is_success() => {
                tracing::warn!(test_id = %self.label(), failures = ?response.failures(), "Stop not acknowledged everywhere");
            }
            Err(e) => tracing::warn!(test_id = %self.label(), error = %e, "Stop failed"),
            Ok(_) => tracing::debug!(test_id = %self.label(), "Test stopped"),
        }
        join_result(run.await)
    }

    fn record(&self, reporter: SimulatorAddress, failure_type: FailureType, message: String) {
        self.context.failures.report_failure(FailureReport {
            failure_type,
            reporter,
            test_id: Some(self.test.test_id().to_string()),
            message,
        });
    }

    fn label(&self) -> String {
        format!("{:width$}", self.test.test_id(), width = self.padding)
    }
}

/// Send `operation` and give up after `timeout`
pub(crate) async fn send_within(
    node: &DispatchNode,
    timeout: Duration,
    destination: SimulatorAddress,
    operation: &SimulatorOperation,
) -> SimResult<Response> {
    match tokio::time::timeout(timeout, node.send_operation(destination, operation)).await {
        Ok(result) => result,
        Err(_) => Err(SimError::timeout(
            &format!("{:?} to {}", operation.operation_type(), destination),
            timeout,
        )),
    }
}

fn join_result(result: Result<SimResult<Response>, tokio::task::JoinError>) -> SimResult<Response> {
    result.map_err(|e| SimError::orchestration(format!("run phase task failed: {}", e)))?
}
