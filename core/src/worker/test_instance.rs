//! Simulated test executed by a worker
//!
//! The test's behavior is configured through test case properties:
//!
//! | property             | meaning                                          |
//! |----------------------|--------------------------------------------------|
//! | `fail_phase`         | phase in which the test reports a failure        |
//! | `failure_type`       | `exception` (default), `timeout`, `oom`, `exit`  |
//! | `fail_worker`        | only this worker fails (e.g. `A1_W2`)            |
//! | `phase_delay_ms`     | time spent in every phase except RUN             |
//! | `iterations`         | RUN iterations before the test ends on its own   |
//! | `iteration_delay_ms` | time spent in one RUN iteration                  |

use std::str::FromStr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{SimError, SimResult};
use crate::failure::FailureType;
use crate::protocol::SimulatorAddress;
use crate::suite::{TestCase, TestPhase};

use super::stats::TestStats;

/// How a simulated test behaves, parsed from its properties
#[derive(Debug, Clone, PartialEq)]
pub struct TestBehavior {
    /// Phase in which the test fails
    pub fail_phase: Option<TestPhase>,
    /// Kind of failure reported
    pub failure_type: FailureType,
    /// Restrict the failure to one worker
    pub fail_worker: Option<SimulatorAddress>,
    /// Time spent in each non-RUN phase
    pub phase_delay: Duration,
    /// RUN iterations
    pub iterations: u64,
    /// Time spent per RUN iteration
    pub iteration_delay: Duration,
}

impl Default for TestBehavior {
    fn default() -> Self {
        Self {
            fail_phase: None,
            failure_type: FailureType::WorkerException,
            fail_worker: None,
            phase_delay: Duration::ZERO,
            iterations: 1,
            iteration_delay: Duration::from_millis(1),
        }
    }
}

impl TestBehavior {
    /// Parse the behavior from `test_case` properties
    ///
    /// # Errors
    ///
    /// Returns a config error for a property value that does not parse.
    pub fn from_test_case(test_case: &TestCase) -> SimResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            fail_phase: property(test_case, "fail_phase")?,
            failure_type: property(test_case, "failure_type")?.unwrap_or(defaults.failure_type),
            fail_worker: property(test_case, "fail_worker")?,
            phase_delay: property(test_case, "phase_delay_ms")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.phase_delay),
            iterations: property(test_case, "iterations")?.unwrap_or(defaults.iterations),
            iteration_delay: property(test_case, "iteration_delay_ms")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.iteration_delay),
        })
    }

    /// Whether the test on `worker` fails in `phase`
    pub fn fails_at(&self, phase: TestPhase, worker: &SimulatorAddress) -> bool {
        self.fail_phase == Some(phase) && self.fail_worker.map_or(true, |w| w == *worker)
    }
}

fn property<T>(test_case: &TestCase, key: &str) -> SimResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    test_case
        .property(key)
        .map(|value| {
            value.parse::<T>().map_err(|e| {
                SimError::config(format!(
                    "test {}: invalid {} '{}': {}",
                    test_case.id, key, value, e
                ))
            })
        })
        .transpose()
}

/// One test living on a worker
pub struct TestInstance {
    address: SimulatorAddress,
    test_case: TestCase,
    behavior: TestBehavior,
    stats: Mutex<TestStats>,
    stop: watch::Sender<bool>,
}

impl TestInstance {
    /// Create the test at `address` (a test-level address)
    pub fn new(address: SimulatorAddress, test_case: TestCase) -> SimResult<Self> {
        let behavior = TestBehavior::from_test_case(&test_case)?;
        let (stop, _) = watch::channel(false);
        Ok(Self {
            address,
            test_case,
            behavior,
            stats: Mutex::new(TestStats::new()),
            stop,
        })
    }

    /// Address of the test
    pub fn address(&self) -> SimulatorAddress {
        self.address
    }

    /// Worker hosting the test
    pub fn worker(&self) -> SimulatorAddress {
        self.address.parent().unwrap_or(self.address)
    }

    /// Test id
    pub fn test_id(&self) -> &str {
        &self.test_case.id
    }

    /// Test configuration
    pub fn test_case(&self) -> &TestCase {
        &self.test_case
    }

    /// Parsed behavior
    pub fn behavior(&self) -> &TestBehavior {
        &self.behavior
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> TestStats {
        self.stats.lock().clone()
    }

    /// Whether this test fails in `phase`
    pub fn should_fail(&self, phase: TestPhase) -> bool {
        self.behavior.fails_at(phase, &self.worker())
    }

    /// Execute `phase`
    pub async fn run_phase(&self, phase: TestPhase) {
        tracing::debug!(test_id = %self.test_id(), address = %self.address, %phase, "Phase started");
        if phase == TestPhase::Run {
            self.run().await;
        } else if !self.behavior.phase_delay.is_zero() {
            tokio::time::sleep(self.behavior.phase_delay).await;
        }
        self.stats.lock().record_phase(phase);
        tracing::debug!(test_id = %self.test_id(), address = %self.address, %phase, "Phase completed");
    }

    /// Request the RUN phase to end; returns `false` if already requested
    pub fn stop(&self) -> bool {
        let already_stopped = self.stop.send_replace(true);
        if !already_stopped {
            tracing::debug!(test_id = %self.test_id(), address = %self.address, "Stop requested");
        }
        !already_stopped
    }

    /// Whether a stop was requested
    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    async fn run(&self) {
        let mut stop = self.stop.subscribe();
        self.stats.lock().start_run();

        let mut iterations = 0;
        while iterations < self.behavior.iterations {
            let stopped = *stop.borrow();
            if stopped {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.behavior.iteration_delay) => iterations += 1,
                _ = stop.changed() => {}
            }
        }

        let stopped = *stop.borrow();
        let mut stats = self.stats.lock();
        stats.iterations = iterations;
        stats.stopped = stopped;
        stats.end_run();
    }
}

impl std::fmt::Debug for TestInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestInstance")
            .field("address", &self.address)
            .field("test_id", &self.test_case.id)
            .field("behavior", &self.behavior)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_behavior_defaults() {
        let behavior = TestBehavior::from_test_case(&TestCase::new("map")).unwrap();
        assert_eq!(behavior, TestBehavior::default());
        assert!(!behavior.fails_at(TestPhase::Run, &SimulatorAddress::worker(1, 1)));
    }

    #[test]
    fn test_behavior_from_properties() {
        let test_case = TestCase::new("map")
            .with_property("fail_phase", "global_verify")
            .with_property("failure_type", "oom")
            .with_property("fail_worker", "A1_W2")
            .with_property("phase_delay_ms", "5")
            .with_property("iterations", "10");
        let behavior = TestBehavior::from_test_case(&test_case).unwrap();

        assert_eq!(behavior.fail_phase, Some(TestPhase::GlobalVerify));
        assert_eq!(behavior.failure_type, FailureType::WorkerOom);
        assert_eq!(behavior.phase_delay, Duration::from_millis(5));
        assert_eq!(behavior.iterations, 10);
        assert!(behavior.fails_at(TestPhase::GlobalVerify, &SimulatorAddress::worker(1, 2)));
        assert!(!behavior.fails_at(TestPhase::GlobalVerify, &SimulatorAddress::worker(1, 1)));
        assert!(!behavior.fails_at(TestPhase::Run, &SimulatorAddress::worker(1, 2)));
    }

    #[test]
    fn test_behavior_rejects_bad_values() {
        let test_case = TestCase::new("map").with_property("iterations", "many");
        let err = TestBehavior::from_test_case(&test_case).unwrap_err();
        assert!(err.message.contains("iterations"));

        let test_case = TestCase::new("map").with_property("fail_phase", "warmup");
        assert!(TestBehavior::from_test_case(&test_case).is_err());
    }

    #[tokio::test]
    async fn test_phases_recorded() {
        let test = TestInstance::new(SimulatorAddress::test(1, 1, 1), TestCase::new("map")).unwrap();
        assert_eq!(test.worker(), SimulatorAddress::worker(1, 1));

        test.run_phase(TestPhase::Setup).await;
        test.run_phase(TestPhase::Run).await;

        let stats = test.stats();
        assert_eq!(stats.completed_phases, vec![TestPhase::Setup, TestPhase::Run]);
        assert_eq!(stats.iterations, 1);
        assert!(!stats.stopped);
    }

    #[tokio::test]
    async fn test_stop_ends_run_early() {
        let test_case = TestCase::new("map")
            .with_property("iterations", "1000000")
            .with_property("iteration_delay_ms", "10");
        let test = std::sync::Arc::new(
            TestInstance::new(SimulatorAddress::test(1, 1, 1), test_case).unwrap(),
        );

        let running = {
            let test = test.clone();
            tokio::spawn(async move { test.run_phase(TestPhase::Run).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(test.stop());
        assert!(!test.stop());
        running.await.unwrap();

        let stats = test.stats();
        assert!(stats.stopped);
        assert!(stats.iterations < 1_000_000);
        assert!(test.is_stopped());
    }
}
