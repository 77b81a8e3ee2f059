//! Message envelopes

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::SimResult;

use super::address::SimulatorAddress;
use super::operation::{decode_operation, encode_operation, OperationType, SimulatorOperation};

/// An addressed, uniquely identified unit of routed work
///
/// The pair (`source`, `message_id`) is the correlation identity. It is kept
/// unchanged on every hop so that replies can be matched end-to-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatorMessage {
    /// Where the message is going (may contain wildcards)
    pub destination: SimulatorAddress,
    /// Who sent it; responses are delivered back here
    pub source: SimulatorAddress,
    /// Per-source, strictly increasing identifier
    pub message_id: u64,
    /// Operation tag
    pub operation_type: OperationType,
    /// Serialized operation
    pub payload: String,
}

impl SimulatorMessage {
    /// Build a message from an operation
    pub fn new(
        destination: SimulatorAddress,
        source: SimulatorAddress,
        message_id: u64,
        operation: &SimulatorOperation,
    ) -> SimResult<Self> {
        Ok(Self {
            destination,
            source,
            message_id,
            operation_type: operation.operation_type(),
            payload: encode_operation(operation)?,
        })
    }

    /// Correlation key of this message (`source:message_id`)
    pub fn key(&self) -> String {
        correlation_key(&self.source, self.message_id)
    }

    /// Decode the carried operation
    pub fn operation(&self) -> SimResult<SimulatorOperation> {
        decode_operation(self.operation_type, &self.payload)
    }
}

/// Correlation key for a (source, message id) pair
pub fn correlation_key(source: &SimulatorAddress, message_id: u64) -> String {
    format!("{}:{}", source, message_id)
}

/// Source of strictly increasing message ids for one sending component
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    next: AtomicU64,
}

impl MessageIdGenerator {
    /// Create a generator starting at 1
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id; never returns the same value twice
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_message_key() {
        let message = SimulatorMessage::new(
            SimulatorAddress::worker(1, 1),
            SimulatorAddress::COORDINATOR,
            42,
            &SimulatorOperation::TerminateWorkers,
        )
        .unwrap();
        assert_eq!(message.key(), "C:42");
        assert_eq!(message.operation_type, OperationType::TerminateWorkers);
        assert_eq!(message.operation().unwrap(), SimulatorOperation::TerminateWorkers);
    }

    #[test]
    fn test_ids_strictly_increasing_across_threads() {
        let generator = Arc::new(MessageIdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = Arc::clone(&generator);
                std::thread::spawn(move || {
                    let mut ids = Vec::new();
                    for _ in 0..250 {
                        ids.push(generator.next_id());
                    }
                    ids
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            for id in ids {
                assert!(seen.insert(id), "id {id} reused");
            }
        }
        assert_eq!(seen.len(), 1000);
        assert!(!seen.contains(&0));
    }
}
