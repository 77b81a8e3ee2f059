//! Links from a node to its children and parent

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::SimResult;
use crate::protocol::{Response, SimulatorAddress, SimulatorMessage};

/// Request/response channel to another component
#[async_trait]
pub trait Connector: Send + Sync {
    /// Address of the component on the other end
    fn remote_address(&self) -> SimulatorAddress;

    /// Deliver `message` and wait for the component's aggregated response
    ///
    /// # Errors
    ///
    /// A timeout error if no response arrived in time, a routing error if the
    /// component could not be reached.
    async fn send(&self, message: SimulatorMessage) -> SimResult<Response>;

    /// Release pending requests addressed at `failed`
    fn unblock(&self, _failed: &SimulatorAddress) -> usize {
        0
    }

    /// Outstanding correlated requests on this link
    fn pending_requests(&self) -> usize {
        0
    }
}

/// Live children of a node, keyed by their index at the child level
///
/// Read on every fan-out, written only when children start or stop.
#[derive(Default)]
pub struct ChildSet {
    children: RwLock<BTreeMap<u32, Arc<dyn Connector>>>,
}

impl ChildSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the child at `index`
    pub fn insert(&self, index: u32, connector: Arc<dyn Connector>) -> Option<Arc<dyn Connector>> {
        self.children.write().insert(index, connector)
    }

    /// Remove the child at `index`
    pub fn remove(&self, index: u32) -> Option<Arc<dyn Connector>> {
        self.children.write().remove(&index)
    }

    /// Child at `index`
    pub fn get(&self, index: u32) -> Option<Arc<dyn Connector>> {
        self.children.read().get(&index).cloned()
    }

    /// Snapshot of every child in index order
    pub fn all(&self) -> Vec<(u32, Arc<dyn Connector>)> {
        self.children
            .read()
            .iter()
            .map(|(index, connector)| (*index, Arc::clone(connector)))
            .collect()
    }

    /// Whether a child is registered at `index`
    pub fn contains(&self, index: u32) -> bool {
        self.children.read().contains_key(&index)
    }

    /// Number of children
    pub fn len(&self) -> usize {
        self.children.read().len()
    }

    /// Whether there are no children
    pub fn is_empty(&self) -> bool {
        self.children.read().is_empty()
    }
}

impl std::fmt::Debug for ChildSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let indices: Vec<u32> = self.children.read().keys().copied().collect();
        f.debug_struct("ChildSet").field("indices", &indices).finish()
    }
}
