//! Aggregated responses

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::address::SimulatorAddress;
use super::message::SimulatorMessage;

const LAST_RESPONSE_ID: u64 = u64::MAX;

/// Outcome recorded for one addressed component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    /// Operation executed successfully
    Success,
    /// The handler raised an error while executing the operation
    ExceptionDuringOperationExecution,
    /// No handler registered for the operation on this component
    UnsupportedOperation,
    /// The coordinator could not be reached from this component
    FailureCoordinatorNotFound,
    /// Addressed agent does not exist
    FailureAgentNotFound,
    /// Addressed worker does not exist
    FailureWorkerNotFound,
    /// Addressed test does not exist
    FailureTestNotFound,
    /// The child exists but could not be reached
    FailureDestinationUnreachable,
    /// The same message is already being processed here
    AlreadyProcessing,
    /// A pending wait was released because the component failed
    Unblocked,
}

impl ResponseType {
    /// Whether this outcome is anything but success
    pub fn is_failure(&self) -> bool {
        !matches!(self, ResponseType::Success)
    }

    /// Whether this outcome means "no such component"
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ResponseType::FailureCoordinatorNotFound
                | ResponseType::FailureAgentNotFound
                | ResponseType::FailureWorkerNotFound
                | ResponseType::FailureTestNotFound
        )
    }
}

impl std::fmt::Display for ResponseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResponseType::Success => "success",
            ResponseType::ExceptionDuringOperationExecution => "exception_during_operation_execution",
            ResponseType::UnsupportedOperation => "unsupported_operation",
            ResponseType::FailureCoordinatorNotFound => "failure_coordinator_not_found",
            ResponseType::FailureAgentNotFound => "failure_agent_not_found",
            ResponseType::FailureWorkerNotFound => "failure_worker_not_found",
            ResponseType::FailureTestNotFound => "failure_test_not_found",
            ResponseType::FailureDestinationUnreachable => "failure_destination_unreachable",
            ResponseType::AlreadyProcessing => "already_processing",
            ResponseType::Unblocked => "unblocked",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of one message, aggregated over every component it reached
///
/// `destination` is the original sender of the message, i.e. where this
/// response must finally arrive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    message_id: u64,
    destination: SimulatorAddress,
    entries: HashMap<SimulatorAddress, ResponseType>,
}

impl Response {
    /// Empty response for `message_id`, travelling back to `destination`
    pub fn new(message_id: u64, destination: SimulatorAddress) -> Self {
        Self {
            message_id,
            destination,
            entries: HashMap::new(),
        }
    }

    /// Empty response answering `message`
    pub fn for_message(message: &SimulatorMessage) -> Self {
        Self::new(message.message_id, message.source)
    }

    /// Response answering `message` with a single entry
    pub fn single(
        message: &SimulatorMessage,
        address: SimulatorAddress,
        response_type: ResponseType,
    ) -> Self {
        let mut response = Self::for_message(message);
        response.add(address, response_type);
        response
    }

    /// Terminal sentinel: no further responses will arrive
    pub fn last() -> Self {
        Self::new(LAST_RESPONSE_ID, SimulatorAddress::COORDINATOR)
    }

    /// Whether this is the terminal sentinel
    pub fn is_last(&self) -> bool {
        self.message_id == LAST_RESPONSE_ID && self.destination == SimulatorAddress::COORDINATOR
    }

    /// Message this response belongs to
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    /// Original sender the response is delivered to
    pub fn destination(&self) -> SimulatorAddress {
        self.destination
    }

    /// Record the outcome for one address; a repeated address keeps the newer value
    pub fn add(&mut self, address: SimulatorAddress, response_type: ResponseType) {
        if let Some(previous) = self.entries.insert(address, response_type) {
            if previous != response_type {
                tracing::warn!(
                    message_id = self.message_id,
                    %address,
                    %previous,
                    current = %response_type,
                    "Duplicate response entry, keeping the latest"
                );
            }
        }
    }

    /// Union another response's entries into this one
    pub fn merge(&mut self, other: Response) {
        if other.message_id != self.message_id && !other.is_last() {
            tracing::warn!(
                message_id = self.message_id,
                other_message_id = other.message_id,
                "Merging responses of different messages"
            );
        }
        for (address, response_type) in other.entries {
            self.add(address, response_type);
        }
    }

    /// Outcome recorded for `address`
    pub fn get(&self, address: &SimulatorAddress) -> Option<ResponseType> {
        self.entries.get(address).copied()
    }

    /// Number of entries
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries were recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in arbitrary order
    pub fn entries(&self) -> impl Iterator<Item = (&SimulatorAddress, &ResponseType)> {
        self.entries.iter()
    }

    /// Entries sorted by address, for stable logging
    pub fn sorted_entries(&self) -> Vec<(SimulatorAddress, ResponseType)> {
        let mut entries: Vec<_> = self.entries.iter().map(|(a, t)| (*a, *t)).collect();
        entries.sort();
        entries
    }

    /// Entries whose outcome is a failure
    pub fn failures(&self) -> Vec<(SimulatorAddress, ResponseType)> {
        self.sorted_entries()
            .into_iter()
            .filter(|(_, response_type)| response_type.is_failure())
            .collect()
    }

    /// Whether every recorded entry is a success
    pub fn is_success(&self) -> bool {
        self.entries.values().all(|t| !t.is_failure())
    }
}
