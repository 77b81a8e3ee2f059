//! Integration tests for the worker module

use super::*;
use crate::dispatch::{DispatchNode, OperationContext, OperationHandler, ParentLink};
use crate::error::SimResult;
use crate::failure::FailureType;
use crate::protocol::{
    FailureReport, OperationType, ResponseType, SimulatorAddress, SimulatorOperation,
};
use crate::suite::{TestCase, TestPhase};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Mock coordinator
// ============================================================================

#[derive(Default)]
struct RecordingFailureHandler {
    reports: Mutex<Vec<FailureReport>>,
}

impl RecordingFailureHandler {
    fn reports(&self) -> Vec<FailureReport> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl OperationHandler for RecordingFailureHandler {
    async fn handle(
        &self,
        _context: OperationContext<'_>,
        operation: SimulatorOperation,
    ) -> SimResult<ResponseType> {
        match operation {
            SimulatorOperation::Failure(report) => {
                self.reports.lock().push(report);
                Ok(ResponseType::Success)
            }
            _ => Ok(ResponseType::UnsupportedOperation),
        }
    }
}

struct Harness {
    coordinator: Arc<DispatchNode>,
    worker: Arc<DispatchNode>,
    failures: Arc<RecordingFailureHandler>,
}

impl Harness {
    fn new() -> Self {
        let failures = Arc::new(RecordingFailureHandler::default());
        let coordinator = DispatchNode::builder(SimulatorAddress::COORDINATOR)
            .handler(OperationType::Failure, failures.clone())
            .build()
            .unwrap();
        let agent = DispatchNode::builder(SimulatorAddress::agent(1))
            .upstream(ParentLink::new(&coordinator))
            .build()
            .unwrap();
        coordinator.add_child(agent.clone()).unwrap();

        let worker = WorkerBuilder::new(1, 1).upstream(ParentLink::new(&agent)).build().unwrap();
        agent.add_child(worker.clone()).unwrap();

        Self {
            coordinator,
            worker,
            failures,
        }
    }

    async fn create_test(&self, test_index: u32, test_case: TestCase) -> ResponseType {
        let response = self
            .coordinator
            .send_operation(
                SimulatorAddress::all_workers(),
                &SimulatorOperation::CreateTest {
                    test_index,
                    test_case,
                },
            )
            .await
            .unwrap();
        response.get(&SimulatorAddress::worker(1, 1)).unwrap()
    }

    async fn start_phase(&self, test_id: &str, phase: TestPhase) -> ResponseType {
        let response = self
            .coordinator
            .send_operation(
                SimulatorAddress::test_on_all_workers(1),
                &SimulatorOperation::StartTestPhase {
                    test_id: test_id.into(),
                    phase,
                },
            )
            .await
            .unwrap();
        assert_eq!(response.size(), 1);
        response.get(&SimulatorAddress::test(1, 1, 1)).unwrap()
    }
}

// ============================================================================
// Test creation
// ============================================================================

#[tokio::test]
async fn test_create_test_adds_child() {
    let harness = Harness::new();
    assert_eq!(harness.create_test(1, TestCase::new("map")).await, ResponseType::Success);
    assert!(harness.worker.children().contains(1));

    let test = harness.worker.children().get(1).unwrap();
    assert_eq!(test.remote_address(), SimulatorAddress::test(1, 1, 1));
}

#[tokio::test]
async fn test_create_test_with_bad_properties() {
    let harness = Harness::new();
    let test_case = TestCase::new("map").with_property("phase_delay_ms", "soon");
    assert_eq!(
        harness.create_test(1, test_case).await,
        ResponseType::ExceptionDuringOperationExecution
    );
    assert!(harness.worker.children().is_empty());
}

#[tokio::test]
async fn test_create_test_rejects_wildcard_index() {
    let harness = Harness::new();
    assert_eq!(
        harness.create_test(0, TestCase::new("map")).await,
        ResponseType::ExceptionDuringOperationExecution
    );
}

// ============================================================================
// Phases
// ============================================================================

#[tokio::test]
async fn test_all_phases_succeed() {
    let harness = Harness::new();
    harness.create_test(1, TestCase::new("map")).await;

    for phase in TestPhase::ALL {
        assert_eq!(harness.start_phase("map", phase).await, ResponseType::Success);
    }
    assert!(harness.failures.reports().is_empty());
}

#[tokio::test]
async fn test_wrong_test_id_is_an_exception() {
    let harness = Harness::new();
    harness.create_test(1, TestCase::new("map")).await;
    assert_eq!(
        harness.start_phase("queue", TestPhase::Setup).await,
        ResponseType::ExceptionDuringOperationExecution
    );
}

#[tokio::test]
async fn test_failing_phase_reports_to_coordinator() {
    let harness = Harness::new();
    harness
        .create_test(1, TestCase::new("map").with_property("fail_phase", "run"))
        .await;

    assert_eq!(harness.start_phase("map", TestPhase::Setup).await, ResponseType::Success);
    assert_eq!(
        harness.start_phase("map", TestPhase::Run).await,
        ResponseType::ExceptionDuringOperationExecution
    );

    let reports = harness.failures.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].failure_type, FailureType::WorkerException);
    assert_eq!(reports[0].reporter, SimulatorAddress::worker(1, 1));
    assert_eq!(reports[0].test_id.as_deref(), Some("map"));
}

#[tokio::test]
async fn test_failure_restricted_to_other_worker() {
    let harness = Harness::new();
    let test_case = TestCase::new("map")
        .with_property("fail_phase", "run")
        .with_property("fail_worker", "A2_W1");
    harness.create_test(1, test_case).await;

    assert_eq!(harness.start_phase("map", TestPhase::Run).await, ResponseType::Success);
    assert!(harness.failures.reports().is_empty());
}

#[tokio::test]
async fn test_stop_ends_timed_run() {
    let harness = Arc::new(Harness::new());
    let test_case = TestCase::new("map")
        .with_property("iterations", "1000000")
        .with_property("iteration_delay_ms", "5");
    harness.create_test(1, test_case).await;

    let run = {
        let harness = harness.clone();
        tokio::spawn(async move { harness.start_phase("map", TestPhase::Run).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stop = harness
        .coordinator
        .send_operation(
            SimulatorAddress::test_on_all_workers(1),
            &SimulatorOperation::StopTest {
                test_id: "map".into(),
            },
        )
        .await
        .unwrap();
    assert!(stop.is_success());

    let outcome = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, ResponseType::Success);
}

// ============================================================================
// Termination
// ============================================================================

#[tokio::test]
async fn test_terminate_reports_finished() {
    let harness = Harness::new();
    harness.create_test(1, TestCase::new("map")).await;

    let response = harness
        .coordinator
        .send_operation(SimulatorAddress::all_workers(), &SimulatorOperation::TerminateWorkers)
        .await
        .unwrap();
    assert_eq!(
        response.get(&SimulatorAddress::worker(1, 1)),
        Some(ResponseType::Success)
    );
    assert!(harness.worker.children().is_empty());

    let reports = harness.failures.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].failure_type, FailureType::WorkerFinished);
    assert_eq!(reports[0].reporter, SimulatorAddress::worker(1, 1));
}
