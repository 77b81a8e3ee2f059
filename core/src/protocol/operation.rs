//! Operations carried as envelope payloads

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};
use crate::failure::FailureType;
use crate::protocol::SimulatorAddress;
use crate::suite::{TestCase, TestPhase};

/// Tag identifying the operation inside an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Protocol self-test, echoed by every addressed component
    IntegrationTest,
    /// Write a line to the component's log
    Log,
    /// Prepare an agent for a new test suite
    InitTestSuite,
    /// Create a test instance on a worker
    CreateTest,
    /// Execute one lifecycle phase of a test
    StartTestPhase,
    /// Stop a running test
    StopTest,
    /// Shut workers down
    TerminateWorkers,
    /// Failure or completion report sent towards the coordinator
    Failure,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationType::IntegrationTest => "integration_test",
            OperationType::Log => "log",
            OperationType::InitTestSuite => "init_test_suite",
            OperationType::CreateTest => "create_test",
            OperationType::StartTestPhase => "start_test_phase",
            OperationType::StopTest => "stop_test",
            OperationType::TerminateWorkers => "terminate_workers",
            OperationType::Failure => "failure",
        };
        write!(f, "{}", name)
    }
}

/// Report of a failure (or clean finish) raised by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    /// What happened
    pub failure_type: FailureType,
    /// Worker (or test) that raised the report
    pub reporter: SimulatorAddress,
    /// Test the failure belongs to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,
    /// Free-form description
    pub message: String,
}

/// Operation payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum SimulatorOperation {
    /// Protocol self-test
    IntegrationTest {
        /// Opaque data echoed back in logs
        data: String,
    },
    /// Log a line on the receiving component
    Log {
        /// Line to log
        message: String,
    },
    /// Prepare an agent for a test suite
    InitTestSuite {
        /// Suite identifier
        suite_id: String,
    },
    /// Create a test on a worker
    CreateTest {
        /// Test index used in test addresses
        test_index: u32,
        /// Test configuration
        test_case: TestCase,
    },
    /// Run one phase of a test
    StartTestPhase {
        /// Test identifier
        test_id: String,
        /// Phase to execute
        phase: TestPhase,
    },
    /// Stop a running test
    StopTest {
        /// Test identifier
        test_id: String,
    },
    /// Shut down workers
    TerminateWorkers,
    /// Failure report
    Failure(FailureReport),
}

impl SimulatorOperation {
    /// Tag of this operation
    pub fn operation_type(&self) -> OperationType {
        match self {
            SimulatorOperation::IntegrationTest { .. } => OperationType::IntegrationTest,
            SimulatorOperation::Log { .. } => OperationType::Log,
            SimulatorOperation::InitTestSuite { .. } => OperationType::InitTestSuite,
            SimulatorOperation::CreateTest { .. } => OperationType::CreateTest,
            SimulatorOperation::StartTestPhase { .. } => OperationType::StartTestPhase,
            SimulatorOperation::StopTest { .. } => OperationType::StopTest,
            SimulatorOperation::TerminateWorkers => OperationType::TerminateWorkers,
            SimulatorOperation::Failure(_) => OperationType::Failure,
        }
    }
}

/// Serialize an operation into an envelope payload
pub fn encode_operation(operation: &SimulatorOperation) -> SimResult<String> {
    Ok(serde_json::to_string(operation)?)
}

/// Deserialize an envelope payload, checking it matches the envelope's tag
pub fn decode_operation(
    operation_type: OperationType,
    payload: &str,
) -> SimResult<SimulatorOperation> {
    let operation: SimulatorOperation = serde_json::from_str(payload)?;
    if operation.operation_type() != operation_type {
        return Err(SimError::protocol(format!(
            "payload holds {} but envelope is tagged {}",
            operation.operation_type(),
            operation_type
        )));
    }
    Ok(operation)
}
