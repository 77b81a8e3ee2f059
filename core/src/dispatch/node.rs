//! Routing node of the component tree
//!
//! Every component (coordinator, agent, worker, test) is a node. A node runs
//! messages addressed to itself, fans out messages addressed below it and
//! forwards everything else to its parent. The aggregated response holds one
//! entry per targeted child, or per component when the child answered.
//!
//! A wildcard at the node's own level only means "this node" for messages
//! that came down from the parent. Messages that start here or come up from a
//! child are passed upwards until they reach the node owning every addressed
//! component, so targets are expanded exactly once.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::RwLock;
use tokio::task::JoinSet;

use crate::error::{SimError, SimResult};
use crate::protocol::{
    AddressLevel, MessageIdGenerator, OperationType, Response, ResponseType, SimulatorAddress,
    SimulatorMessage, SimulatorOperation,
};

use super::connector::{ChildSet, Connector};
use super::handler::{HandlerTable, OperationContext, OperationHandler};

/// Outcome recorded for a component that does not exist at `level`
pub fn not_found(level: AddressLevel) -> ResponseType {
    match level {
        AddressLevel::Coordinator => ResponseType::FailureCoordinatorNotFound,
        AddressLevel::Agent => ResponseType::FailureAgentNotFound,
        AddressLevel::Worker => ResponseType::FailureWorkerNotFound,
        AddressLevel::Test => ResponseType::FailureTestNotFound,
    }
}

/// One component of the tree
pub struct DispatchNode {
    this: Weak<DispatchNode>,
    address: SimulatorAddress,
    handlers: HandlerTable,
    children: ChildSet,
    upstream: RwLock<Option<Arc<dyn Connector>>>,
    message_ids: MessageIdGenerator,
    in_flight: DashSet<String>,
}

/// Removes a message key from the in-flight set when execution ends
struct InFlightGuard<'a> {
    in_flight: &'a DashSet<String>,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// Where a message entered a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Local,
    Parent,
    Child,
}

impl DispatchNode {
    /// Start building a node for `address`
    pub fn builder(address: SimulatorAddress) -> DispatchNodeBuilder {
        DispatchNodeBuilder::new(address)
    }

    /// Address of this node
    pub fn address(&self) -> SimulatorAddress {
        self.address
    }

    /// Shared handle to this node, `None` while it is being dropped
    pub fn shared(&self) -> Option<Arc<DispatchNode>> {
        self.this.upgrade()
    }

    /// Live children
    pub fn children(&self) -> &ChildSet {
        &self.children
    }

    /// Attach a child; its address must be a concrete direct child of this node
    pub fn add_child(&self, connector: Arc<dyn Connector>) -> SimResult<()> {
        let child = connector.remote_address();
        if !self.address.is_parent_of(&child) || child.is_wildcard() {
            return Err(SimError::routing(format!(
                "{} cannot be a child of {}",
                child, self.address
            )));
        }
        let index = child.index_at(child.level());
        if self.children.insert(index, connector).is_some() {
            tracing::warn!(address = %self.address, %child, "Replaced existing child link");
        } else {
            tracing::debug!(address = %self.address, %child, "Child attached");
        }
        Ok(())
    }

    /// Detach the child at `index`
    pub fn remove_child(&self, index: u32) -> Option<Arc<dyn Connector>> {
        let removed = self.children.remove(index);
        if removed.is_some() {
            tracing::debug!(address = %self.address, index, "Child detached");
        }
        removed
    }

    /// Set the link towards the parent component
    pub fn set_upstream(&self, connector: Arc<dyn Connector>) {
        *self.upstream.write() = Some(connector);
    }

    /// Drop the link towards the parent component
    pub fn clear_upstream(&self) -> Option<Arc<dyn Connector>> {
        self.upstream.write().take()
    }

    /// Whether a parent link is set
    pub fn has_upstream(&self) -> bool {
        self.upstream.read().is_some()
    }

    /// Operation types this node executes locally
    pub fn operation_types(&self) -> Vec<OperationType> {
        self.handlers.operation_types()
    }

    /// Next id for a message originating at this node
    pub fn next_message_id(&self) -> u64 {
        self.message_ids.next_id()
    }

    /// Build a message from this node to `destination`
    pub fn message(
        &self,
        destination: SimulatorAddress,
        operation: &SimulatorOperation,
    ) -> SimResult<SimulatorMessage> {
        SimulatorMessage::new(destination, self.address, self.next_message_id(), operation)
    }

    /// Route `operation` from this node to `destination` and wait for the response
    pub async fn send_operation(
        &self,
        destination: SimulatorAddress,
        operation: &SimulatorOperation,
    ) -> SimResult<Response> {
        let message = self.message(destination, operation)?;
        self.send(message).await
    }

    /// Route `message` and wait for the aggregated response
    ///
    /// # Errors
    ///
    /// Returns the first timeout hit by a directly linked component. All other
    /// child outcomes are reported as entries.
    pub async fn send(&self, message: SimulatorMessage) -> SimResult<Response> {
        let (response, error) = self.route(message, Entry::Local).await;
        match error {
            Some(error) => Err(error),
            None => Ok(response),
        }
    }

    /// Route `message` received from the parent component
    ///
    /// Never fails: timeouts are reported as unreachable entries.
    pub async fn handle(&self, message: SimulatorMessage) -> Response {
        self.route(message, Entry::Parent).await.0
    }

    /// Route `message` received from a child component
    ///
    /// Never fails: timeouts are reported as unreachable entries.
    pub async fn handle_from_child(&self, message: SimulatorMessage) -> Response {
        self.route(message, Entry::Child).await.0
    }

    /// Release pending requests on every child link addressed at `failed`
    pub fn unblock(&self, failed: &SimulatorAddress) -> usize {
        self.children
            .all()
            .iter()
            .map(|(_, connector)| connector.unblock(failed))
            .sum()
    }

    /// Outstanding correlated requests on this node's links
    pub fn pending_requests(&self) -> usize {
        let upstream = self
            .upstream
            .read()
            .as_ref()
            .map(|link| link.pending_requests())
            .unwrap_or(0);
        let children: usize = self
            .children
            .all()
            .iter()
            .map(|(_, connector)| connector.pending_requests())
            .sum();
        upstream + children
    }

    /// Messages currently executing on this node
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether `destination` is this node or lies in its subtree
    fn owns(&self, destination: &SimulatorAddress) -> bool {
        if destination.level() < self.address.level() {
            return false;
        }
        let scope = SimulatorAddress::new(
            self.address.level(),
            destination.agent_index(),
            destination.worker_index(),
            destination.test_index(),
        );
        scope.covers(&self.address)
    }

    /// Whether `destination` also names components beside this node
    fn reaches_beyond(&self, destination: &SimulatorAddress) -> bool {
        SimulatorAddress::new(
            self.address.level(),
            destination.agent_index(),
            destination.worker_index(),
            destination.test_index(),
        )
        .is_wildcard()
    }

    async fn route(&self, message: SimulatorMessage, entry: Entry) -> (Response, Option<SimError>) {
        let destination = message.destination;
        if !self.owns(&destination) {
            return self.forward_upstream(message).await;
        }
        if entry != Entry::Parent && self.reaches_beyond(&destination) && self.has_upstream() {
            tracing::debug!(address = %self.address, %destination, ?entry, "Passing wildcard upwards");
            return self.forward_upstream(message).await;
        }
        if destination.level() == self.address.level() {
            return (self.execute(&message).await, None);
        }
        self.fan_out(message).await
    }

    async fn execute(&self, message: &SimulatorMessage) -> Response {
        let key = message.key();
        if !self.in_flight.insert(key.clone()) {
            tracing::debug!(address = %self.address, key = %key, "Message already processing");
            return Response::single(message, self.address, ResponseType::AlreadyProcessing);
        }
        let _guard = InFlightGuard {
            in_flight: &self.in_flight,
            key,
        };

        let response_type = self.execute_operation(message).await;
        Response::single(message, self.address, response_type)
    }

    async fn execute_operation(&self, message: &SimulatorMessage) -> ResponseType {
        let Some(handler) = self.handlers.get(message.operation_type) else {
            tracing::warn!(
                address = %self.address,
                operation = %message.operation_type,
                "Unsupported operation"
            );
            return ResponseType::UnsupportedOperation;
        };

        let operation = match message.operation() {
            Ok(operation) => operation,
            Err(e) => {
                tracing::warn!(address = %self.address, error = %e, "Undecodable payload");
                return ResponseType::ExceptionDuringOperationExecution;
            }
        };

        let context = OperationContext {
            node: self,
            source: message.source,
            message_id: message.message_id,
        };
        match handler.handle(context, operation).await {
            Ok(response_type) => response_type,
            Err(e) => {
                tracing::warn!(
                    address = %self.address,
                    operation = %message.operation_type,
                    error = %e,
                    "Operation failed"
                );
                ResponseType::ExceptionDuringOperationExecution
            }
        }
    }

    async fn fan_out(&self, message: SimulatorMessage) -> (Response, Option<SimError>) {
        let mut response = Response::for_message(&message);
        let Some(child_level) = self.address.level().child() else {
            response.add(message.destination, not_found(message.destination.level()));
            return (response, None);
        };

        let index = message.destination.index_at(child_level);
        let targets = if index == 0 {
            self.children.all()
        } else {
            match self.children.get(index) {
                Some(connector) => vec![(index, connector)],
                None => {
                    let child = self.address.child(index).unwrap_or(message.destination);
                    tracing::debug!(address = %self.address, %child, "Child not found");
                    response.add(child, not_found(child_level));
                    return (response, None);
                }
            }
        };

        if targets.is_empty() {
            tracing::debug!(
                address = %self.address,
                destination = %message.destination,
                "No live children to deliver to"
            );
            return (response, None);
        }

        // dropping the set aborts every delivery when the caller gives up
        let mut deliveries = JoinSet::new();
        let mut unanswered = BTreeSet::new();
        for (_, connector) in targets {
            let child = connector.remote_address();
            unanswered.insert(child);
            let message = message.clone();
            deliveries.spawn(async move { (child, connector.send(message).await) });
        }

        let mut first_error = None;
        while let Some(joined) = deliveries.join_next().await {
            let (child, result) = match joined {
                Ok(delivery) => delivery,
                Err(e) => {
                    tracing::error!(address = %self.address, error = %e, "Delivery task panicked");
                    continue;
                }
            };
            unanswered.remove(&child);
            match result {
                Ok(child_response) if !child_response.is_last() => {
                    response.merge(child_response);
                }
                Ok(_) => {
                    tracing::warn!(address = %self.address, %child, "Link closed before responding");
                    response.add(child, ResponseType::FailureDestinationUnreachable);
                }
                Err(e) => {
                    tracing::warn!(address = %self.address, %child, error = %e, "Child unreachable");
                    response.add(child, ResponseType::FailureDestinationUnreachable);
                    if e.is_timeout() && first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        for child in unanswered {
            response.add(child, ResponseType::FailureDestinationUnreachable);
        }
        (response, first_error)
    }

    async fn forward_upstream(&self, message: SimulatorMessage) -> (Response, Option<SimError>) {
        let destination = message.destination;
        let upstream = self.upstream.read().clone();
        let Some(link) = upstream else {
            tracing::debug!(address = %self.address, %destination, "Destination outside of this tree");
            let response = Response::single(&message, destination, not_found(destination.level()));
            return (response, None);
        };

        let unreachable = Response::single(&message, destination, ResponseType::FailureDestinationUnreachable);
        match link.send(message).await {
            Ok(response) if !response.is_last() => (response, None),
            Ok(_) => (unreachable, None),
            Err(e) => {
                tracing::warn!(address = %self.address, %destination, error = %e, "Parent unreachable");
                let error = e.is_timeout().then_some(e);
                (unreachable, error)
            }
        }
    }
}

#[async_trait]
impl Connector for DispatchNode {
    fn remote_address(&self) -> SimulatorAddress {
        self.address
    }

    async fn send(&self, message: SimulatorMessage) -> SimResult<Response> {
        Ok(self.handle(message).await)
    }

    fn unblock(&self, failed: &SimulatorAddress) -> usize {
        DispatchNode::unblock(self, failed)
    }

    fn pending_requests(&self) -> usize {
        DispatchNode::pending_requests(self)
    }
}

/// In-process link from a child node to its parent
///
/// Holds the parent weakly; the parent's child set owns the tree.
pub struct ParentLink {
    address: SimulatorAddress,
    parent: Weak<DispatchNode>,
}

impl ParentLink {
    /// Link to `parent`
    pub fn new(parent: &Arc<DispatchNode>) -> Arc<Self> {
        Arc::new(Self {
            address: parent.address(),
            parent: Arc::downgrade(parent),
        })
    }
}

#[async_trait]
impl Connector for ParentLink {
    fn remote_address(&self) -> SimulatorAddress {
        self.address
    }

    async fn send(&self, message: SimulatorMessage) -> SimResult<Response> {
        let parent = self
            .parent
            .upgrade()
            .ok_or_else(|| SimError::routing(format!("parent {} is gone", self.address)))?;
        Ok(parent.handle_from_child(message).await)
    }
}

impl std::fmt::Debug for ParentLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParentLink")
            .field("address", &self.address)
            .field("alive", &(self.parent.strong_count() > 0))
            .finish()
    }
}

impl std::fmt::Debug for DispatchNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchNode")
            .field("address", &self.address)
            .field("handlers", &self.handlers)
            .field("children", &self.children)
            .field("has_upstream", &self.has_upstream())
            .finish()
    }
}

/// Builder for [`DispatchNode`]
pub struct DispatchNodeBuilder {
    address: SimulatorAddress,
    handlers: HandlerTable,
    children: Vec<Arc<dyn Connector>>,
    upstream: Option<Arc<dyn Connector>>,
}

impl DispatchNodeBuilder {
    /// Create a builder for `address`
    pub fn new(address: SimulatorAddress) -> Self {
        Self {
            address,
            handlers: HandlerTable::new(),
            children: Vec::new(),
            upstream: None,
        }
    }

    /// Execute `operation_type` locally with `handler`
    pub fn handler(mut self, operation_type: OperationType, handler: Arc<dyn OperationHandler>) -> Self {
        self.handlers.insert(operation_type, handler);
        self
    }

    /// Attach a child link
    pub fn child(mut self, connector: Arc<dyn Connector>) -> Self {
        self.children.push(connector);
        self
    }

    /// Set the parent link
    pub fn upstream(mut self, connector: Arc<dyn Connector>) -> Self {
        self.upstream = Some(connector);
        self
    }

    /// Build the node
    ///
    /// # Errors
    ///
    /// Returns an error if the address is a wildcard or a child link does not
    /// point at a direct child.
    pub fn build(self) -> SimResult<Arc<DispatchNode>> {
        if self.address.is_wildcard() {
            return Err(SimError::routing(format!(
                "node address {} must not contain wildcards",
                self.address
            )));
        }

        let node = Arc::new_cyclic(|this| DispatchNode {
            this: this.clone(),
            address: self.address,
            handlers: self.handlers,
            children: ChildSet::new(),
            upstream: RwLock::new(self.upstream),
            message_ids: MessageIdGenerator::new(),
            in_flight: DashSet::new(),
        });
        for child in self.children {
            node.add_child(child)?;
        }
        Ok(node)
    }
}
