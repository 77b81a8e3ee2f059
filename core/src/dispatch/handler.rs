//! Local operation handlers

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SimResult;
use crate::protocol::{OperationType, ResponseType, SimulatorAddress, SimulatorOperation};

use super::node::DispatchNode;

/// What a handler knows about the message it is executing
pub struct OperationContext<'a> {
    /// Node executing the operation
    pub node: &'a DispatchNode,
    /// Original sender of the message
    pub source: SimulatorAddress,
    /// Id of the message
    pub message_id: u64,
}

impl OperationContext<'_> {
    /// Address of the executing node
    pub fn address(&self) -> SimulatorAddress {
        self.node.address()
    }
}

/// Executes one kind of operation on a node
///
/// `Ok` carries the outcome for the node's own address; `Err` is recorded as
/// [`ResponseType::ExceptionDuringOperationExecution`].
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Execute `operation`
    async fn handle(
        &self,
        context: OperationContext<'_>,
        operation: SimulatorOperation,
    ) -> SimResult<ResponseType>;
}

/// Handlers of one node, keyed by operation type
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<OperationType, Arc<dyn OperationHandler>>,
}

impl HandlerTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `operation_type`, replacing any previous one
    pub fn insert(&mut self, operation_type: OperationType, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(operation_type, handler);
    }

    /// Handler for `operation_type`
    pub fn get(&self, operation_type: OperationType) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(&operation_type).cloned()
    }

    /// Registered operation types, sorted
    pub fn operation_types(&self) -> Vec<OperationType> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.operation_types()).finish()
    }
}

/// Accepts an operation and answers success without doing anything
#[derive(Debug, Default, Clone, Copy)]
pub struct AcknowledgeHandler;

#[async_trait]
impl OperationHandler for AcknowledgeHandler {
    async fn handle(
        &self,
        context: OperationContext<'_>,
        operation: SimulatorOperation,
    ) -> SimResult<ResponseType> {
        tracing::debug!(
            address = %context.address(),
            source = %context.source,
            operation = %operation.operation_type(),
            "Acknowledged"
        );
        Ok(ResponseType::Success)
    }
}

/// Writes `Log` operations to this component's log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

#[async_trait]
impl OperationHandler for LogHandler {
    async fn handle(
        &self,
        context: OperationContext<'_>,
        operation: SimulatorOperation,
    ) -> SimResult<ResponseType> {
        match operation {
            SimulatorOperation::Log { message } => {
                tracing::info!(address = %context.address(), source = %context.source, "{}", message);
                Ok(ResponseType::Success)
            }
            _ => Ok(ResponseType::UnsupportedOperation),
        }
    }
}
