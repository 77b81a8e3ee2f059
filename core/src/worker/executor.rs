//! Operation handlers executed on workers and their tests

use std::sync::Arc;

use async_trait::async_trait;

use crate::dispatch::{AcknowledgeHandler, DispatchNode, OperationContext, OperationHandler, ParentLink};
use crate::error::{SimError, SimResult};
use crate::failure::FailureType;
use crate::protocol::{
    FailureReport, OperationType, ResponseType, SimulatorAddress, SimulatorOperation,
};

use super::test_instance::TestInstance;

/// Send a failure report from `node` to the coordinator
///
/// Delivery problems are logged, never propagated: the report is best effort.
pub async fn report_to_coordinator(node: &DispatchNode, report: FailureReport) {
    let failure_type = report.failure_type;
    match node
        .send_operation(SimulatorAddress::COORDINATOR, &SimulatorOperation::Failure(report))
        .await
    {
        Ok(response) if response.is_success() && !response.is_empty() => {
            tracing::debug!(address = %node.address(), %failure_type, "Report delivered");
        }
        Ok(response) => {
            tracing::warn!(
                address = %node.address(),
                %failure_type,
                entries = ?response.sorted_entries(),
                "Report not accepted by the coordinator"
            );
        }
        Err(e) => {
            tracing::warn!(address = %node.address(), %failure_type, error = %e, "Report not delivered");
        }
    }
}

/// Runs test phases and stop requests on a test node
pub struct TestPhaseHandler {
    test: Arc<TestInstance>,
}

impl TestPhaseHandler {
    /// Handler driving `test`
    pub fn new(test: Arc<TestInstance>) -> Self {
        Self { test }
    }

    fn check_test_id(&self, test_id: &str) -> SimResult<()> {
        if test_id != self.test.test_id() {
            return Err(SimError::orchestration(format!(
                "{} hosts test {}, not {}",
                self.test.address(),
                self.test.test_id(),
                test_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl OperationHandler for TestPhaseHandler {
    async fn handle(
        &self,
        context: OperationContext<'_>,
        operation: SimulatorOperation,
    ) -> SimResult<ResponseType> {
        match operation {
            SimulatorOperation::StartTestPhase { test_id, phase } => {
                self.check_test_id(&test_id)?;
                if self.test.should_fail(phase) {
                    let failure_type = self.test.behavior().failure_type;
                    let message = format!("test {} failed in {}", test_id, phase);
                    report_to_coordinator(
                        context.node,
                        FailureReport {
                            failure_type,
                            reporter: self.test.worker(),
                            test_id: Some(test_id),
                            message: message.clone(),
                        },
                    )
                    .await;

                    if matches!(failure_type, FailureType::WorkerOom | FailureType::WorkerExit) {
                        // the worker is gone; its parent has to be unblocked
                        tracing::error!(worker = %self.test.worker(), %failure_type, "Worker died");
                        std::future::pending::<()>().await;
                    }
                    return Err(SimError::orchestration(message));
                }
                self.test.run_phase(phase).await;
                Ok(ResponseType::Success)
            }
            SimulatorOperation::StopTest { test_id } => {
                self.check_test_id(&test_id)?;
                self.test.stop();
                Ok(ResponseType::Success)
            }
            _ => Ok(ResponseType::UnsupportedOperation),
        }
    }
}

/// Creates a test node below the worker for every `CreateTest`
///
/// Tests live inside the worker process: the test node is attached as an
/// in-process child and reports upward through the worker node itself.
#[derive(Debug, Default)]
pub struct CreateTestHandler;

#[async_trait]
impl OperationHandler for CreateTestHandler {
    async fn handle(
        &self,
        context: OperationContext<'_>,
        operation: SimulatorOperation,
    ) -> SimResult<ResponseType> {
        let SimulatorOperation::CreateTest {
            test_index,
            test_case,
        } = operation
        else {
            return Ok(ResponseType::UnsupportedOperation);
        };

        let address = context
            .address()
            .child(test_index)
            .filter(|a| !a.is_wildcard())
            .ok_or_else(|| SimError::routing(format!("invalid test index {}", test_index)))?;

        let test = Arc::new(TestInstance::new(address, test_case)?);
        let handler: Arc<dyn OperationHandler> = Arc::new(TestPhaseHandler::new(Arc::clone(&test)));
        let node = DispatchNode::builder(address)
            .handler(OperationType::StartTestPhase, Arc::clone(&handler))
            .handler(OperationType::StopTest, handler)
            .handler(OperationType::IntegrationTest, Arc::new(AcknowledgeHandler))
            .build()?;
        let worker = context.node.shared().ok_or_else(SimError::shutdown)?;
        node.set_upstream(ParentLink::new(&worker));
        if context.node.children().contains(test_index) {
            tracing::warn!(address = %address, "Replacing existing test");
        }
        context.node.add_child(node)?;

        tracing::info!(address = %address, test_id = %test.test_id(), "Test created");
        Ok(ResponseType::Success)
    }
}

/// Reports the worker finished and drops its tests
#[derive(Debug, Default)]
pub struct TerminateWorkerHandler;

#[async_trait]
impl OperationHandler for TerminateWorkerHandler {
    async fn handle(
        &self,
        context: OperationContext<'_>,
        operation: SimulatorOperation,
    ) -> SimResult<ResponseType> {
        if !matches!(operation, SimulatorOperation::TerminateWorkers) {
            return Ok(ResponseType::UnsupportedOperation);
        }

        for (index, _) in context.node.children().all() {
            context.node.remove_child(index);
        }
        report_to_coordinator(
            context.node,
            FailureReport {
                failure_type: FailureType::WorkerFinished,
                reporter: context.address(),
                test_id: None,
                message: "worker terminated".into(),
            },
        )
        .await;

        tracing::info!(worker = %context.address(), "Worker terminated");
        Ok(ResponseType::Success)
    }
}
