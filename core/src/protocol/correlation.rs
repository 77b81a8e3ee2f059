//! Correlation of outstanding requests with their responses
//!
//! A sender registers the message key (`source:message_id`) before the message
//! leaves, then waits on the returned [`ResponseSlot`]. Whoever receives the
//! matching [`Response`] calls [`CorrelationRegistry::complete`]. Each slot is
//! satisfied at most once: by the response, by the terminal sentinel when the
//! link closes, by an unblock after a worker failure, or by its timeout.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::{SimError, SimResult};

use super::address::SimulatorAddress;
use super::message::{correlation_key, SimulatorMessage};
use super::response::{Response, ResponseType};

struct PendingResponse {
    message_id: u64,
    source: SimulatorAddress,
    destination: SimulatorAddress,
    sender: oneshot::Sender<Response>,
}

struct PendingGuard<'a> {
    registry: &'a CorrelationRegistry,
    key: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.registry.pending.remove(self.key);
    }
}

/// Single-assignment slot a sender waits on
#[derive(Debug)]
pub struct ResponseSlot {
    key: String,
    receiver: oneshot::Receiver<Response>,
}

impl ResponseSlot {
    /// Correlation key of the slot
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Registry of outstanding requests on one link
#[derive(Default)]
pub struct CorrelationRegistry {
    pending: DashMap<String, PendingResponse>,
}

impl CorrelationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `message` as awaiting a response
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the key is already outstanding.
    pub fn register(&self, message: &SimulatorMessage) -> SimResult<ResponseSlot> {
        let key = message.key();
        let (sender, receiver) = oneshot::channel();

        match self.pending.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SimError::protocol(format!(
                "message {} is already awaiting a response",
                key
            ))),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(PendingResponse {
                    message_id: message.message_id,
                    source: message.source,
                    destination: message.destination,
                    sender,
                });
                Ok(ResponseSlot { key, receiver })
            }
        }
    }

    /// Deliver `response` to the slot registered under `key`
    ///
    /// Unknown keys (late or duplicate replies) are dropped. Returns whether a
    /// waiter was handed the response.
    pub fn complete(&self, key: &str, response: Response) -> bool {
        match self.pending.remove(key) {
            Some((_, pending)) => pending.sender.send(response).is_ok(),
            None => {
                tracing::debug!(key, "Dropping response without pending request");
                false
            }
        }
    }

    /// Deliver `response` using the key derived from its own message id
    pub fn complete_response(&self, response: Response) -> bool {
        let key = correlation_key(&response.destination(), response.message_id());
        self.complete(&key, response)
    }

    /// Wait for the slot to be completed, at most `timeout`
    ///
    /// On timeout the key is removed, so a late completion is discarded.
    pub async fn await_response(&self, slot: ResponseSlot, timeout: Duration) -> SimResult<Response> {
        let ResponseSlot { key, receiver } = slot;
        // the entry goes away however the wait ends, including the caller giving up
        let _pending = PendingGuard {
            registry: self,
            key: &key,
        };
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SimError::routing(format!(
                "response slot {} was dropped without an answer",
                key
            ))),
            Err(_) => {
                tracing::warn!(key = %key, timeout_ms = timeout.as_millis() as u64, "Response timed out");
                Err(SimError::timeout(&key, timeout))
            }
        }
    }

    /// Wait for the slot without a deadline
    ///
    /// The wait ends on completion, on [`unblock`](Self::unblock), when the
    /// link closes, or when the caller drops the future.
    pub async fn await_unbounded(&self, slot: ResponseSlot) -> SimResult<Response> {
        let ResponseSlot { key, receiver } = slot;
        let _pending = PendingGuard {
            registry: self,
            key: &key,
        };
        receiver.await.map_err(|_| {
            SimError::routing(format!("response slot {} was dropped without an answer", key))
        })
    }

    /// Release every pending request addressed at (or below) `failed`
    ///
    /// Waiters receive a response holding a single [`ResponseType::Unblocked`]
    /// entry for `failed`. Returns the number of released requests.
    pub fn unblock(&self, failed: &SimulatorAddress) -> usize {
        self.release(failed, |destination| failed.covers(destination))
    }

    /// Release every pending request, whatever its destination
    ///
    /// Used when the component on the other end of the link is the one that
    /// failed.
    pub fn unblock_all(&self, failed: &SimulatorAddress) -> usize {
        self.release(failed, |_| true)
    }

    fn release(&self, failed: &SimulatorAddress, matches: impl Fn(&SimulatorAddress) -> bool) -> usize {
        let keys: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| matches(&entry.value().destination))
            .map(|entry| entry.key().clone())
            .collect();

        let mut released = 0;
        for key in keys {
            if let Some((_, pending)) = self.pending.remove(&key) {
                let mut response = Response::new(pending.message_id, pending.source);
                response.add(*failed, ResponseType::Unblocked);
                if pending.sender.send(response).is_ok() {
                    released += 1;
                }
            }
        }
        if released > 0 {
            tracing::info!(address = %failed, released, "Unblocked pending requests after failure");
        }
        released
    }

    /// Complete every pending slot with the terminal sentinel
    pub fn complete_all_with_last(&self) -> usize {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter(|key| self.complete(key, Response::last()))
            .count()
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Keys of outstanding requests, sorted
    pub fn pending_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

impl std::fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("pending", &self.pending_keys())
            .finish()
    }
}
