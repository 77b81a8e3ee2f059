//! Addressing and message protocol
//!
//! - [`SimulatorAddress`]: four-level hierarchical addresses with wildcards
//! - [`SimulatorMessage`]: addressed envelope with a per-source message id
//! - [`Response`]: per-address outcomes aggregated for one message
//! - [`CorrelationRegistry`]: matches responses to waiting senders

mod address;
mod correlation;
mod message;
mod operation;
mod response;

pub use address::{AddressLevel, SimulatorAddress};
pub use correlation::{CorrelationRegistry, ResponseSlot};
pub use message::{correlation_key, MessageIdGenerator, SimulatorMessage};
pub use operation::{
    decode_operation, encode_operation, FailureReport, OperationType, SimulatorOperation,
};
pub use response::{Response, ResponseType};
