//! Outcome aggregation for a finished test suite

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{SimError, SimResult};
use crate::failure::{FailureContainer, FailureEntry};
use crate::protocol::{ResponseType, SimulatorAddress};
use crate::suite::TestPhase;

/// Terminal state of a test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestStatus {
    /// Every phase ran without failure
    Completed,
    /// A phase failed
    Failed,
    /// Stopped because another test failed or the run was interrupted
    Aborted,
    /// Never started
    Skipped,
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TestStatus::Completed => "completed",
            TestStatus::Failed => "failed",
            TestStatus::Aborted => "aborted",
            TestStatus::Skipped => "skipped",
        };
        write!(f, "{}", name)
    }
}

/// Result of one phase of one test case
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    /// Phase that ran
    pub phase: TestPhase,

    /// Number of addresses that answered
    pub entries: usize,

    /// Addresses that answered with a failure
    pub failures: Vec<(SimulatorAddress, ResponseType)>,

    /// When the phase request was sent
    pub started_at: DateTime<Utc>,

    /// Wall-clock time of the phase
    pub elapsed: Duration,
}

impl PhaseOutcome {
    /// Whether every address succeeded
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of one test case
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    /// Test id
    pub test_id: String,

    /// Test index used in addresses
    pub test_index: u32,

    /// Terminal state
    pub status: TestStatus,

    /// Phases in execution order
    pub phases: Vec<PhaseOutcome>,

    /// Error that stopped the test, if any
    pub error: Option<String>,
}

impl TestOutcome {
    /// A test case that never started
    pub fn skipped(test_id: impl Into<String>, test_index: u32) -> Self {
        Self {
            test_id: test_id.into(),
            test_index,
            status: TestStatus::Skipped,
            phases: Vec::new(),
            error: None,
        }
    }

    /// Phases that ran
    pub fn completed_phases(&self) -> Vec<TestPhase> {
        self.phases.iter().map(|p| p.phase).collect()
    }

    /// Outcome of `phase`, if it ran
    pub fn phase(&self, phase: TestPhase) -> Option<&PhaseOutcome> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    /// Total time spent in phases
    pub fn elapsed(&self) -> Duration {
        self.phases.iter().map(|p| p.elapsed).sum()
    }
}

/// Summary of a whole test suite run
#[derive(Debug, Clone)]
pub struct SuiteReport {
    /// Suite id
    pub suite_id: String,

    /// Outcome per test case, in suite order
    pub outcomes: Vec<TestOutcome>,

    /// Failures recorded during the run
    pub failures: Vec<FailureEntry>,

    /// Workers that did not confirm shutdown in time
    pub missing_workers: BTreeSet<SimulatorAddress>,

    /// Wall-clock time of the run
    pub elapsed: Duration,
}

impl SuiteReport {
    /// Number of recorded failures
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// Whether no failure was recorded
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of test cases in `status`
    pub fn count(&self, status: TestStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Outcome of `test_id`
    pub fn outcome(&self, test_id: &str) -> Option<&TestOutcome> {
        self.outcomes.iter().find(|o| o.test_id == test_id)
    }

    /// Turn a run with failures into an error
    ///
    /// Workers missing at shutdown are only a warning and do not fail the run.
    pub fn check(&self) -> SimResult<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(SimError::test_failures(self.failure_count()))
        }
    }
}

/// Build the suite report from the runners' outcomes and the failure ledger
pub fn aggregate_outcomes(
    suite_id: &str,
    outcomes: Vec<TestOutcome>,
    failures: &FailureContainer,
    missing_workers: BTreeSet<SimulatorAddress>,
    elapsed: Duration,
) -> SuiteReport {
    SuiteReport {
        suite_id: suite_id.to_string(),
        outcomes,
        failures: failures.failures(),
        missing_workers,
        elapsed,
    }
}
