//! Message routing through the component tree
//!
//! - [`DispatchNode`]: executes, fans out or forwards a message
//! - [`Connector`]: request/response link to another component
//! - [`ChannelConnector`]: channel-backed link with response correlation
//! - [`OperationHandler`]: local execution of one operation type

mod connector;
mod handler;
mod link;
mod node;


pub use connector::{ChildSet, Connector};
pub use handler::{
    AcknowledgeHandler, HandlerTable, LogHandler, OperationContext, OperationHandler,
};
pub use link::{ChannelConnector, LinkDirection};
pub use node::{not_found, DispatchNode, DispatchNodeBuilder, ParentLink};
