//! Error types for simbench-core
//!
//! Routing and operation failures are *not* errors here: they travel as
//! [`ResponseType`](crate::protocol::ResponseType) entries so aggregation always
//! completes. `SimError` is reserved for correlation timeouts, configuration
//! problems and fatal orchestration failures.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Classification of a [`SimError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimErrorKind {
    /// Invalid or missing configuration
    Config,
    /// Malformed envelope, payload or address
    Protocol,
    /// A message could not be routed at all (no link, closed channel)
    Routing,
    /// No response arrived before the deadline
    Timeout,
    /// Fatal orchestration failure (runner crash, cluster start failure)
    Orchestration,
    /// The suite completed but failures were reported
    TestFailures,
    /// The component is shutting down
    Shutdown,
    /// IO error while loading files
    Io,
}

impl fmt::Display for SimErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimErrorKind::Config => write!(f, "configuration error"),
            SimErrorKind::Protocol => write!(f, "protocol error"),
            SimErrorKind::Routing => write!(f, "routing error"),
            SimErrorKind::Timeout => write!(f, "timeout"),
            SimErrorKind::Orchestration => write!(f, "orchestration error"),
            SimErrorKind::TestFailures => write!(f, "test failures"),
            SimErrorKind::Shutdown => write!(f, "shutdown"),
            SimErrorKind::Io => write!(f, "IO error"),
        }
    }
}

/// Core error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct SimError {
    /// Error classification
    pub kind: SimErrorKind,
    /// Human readable detail
    pub message: String,
}

impl SimError {
    /// Create an error of the given kind
    pub fn new(kind: SimErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(SimErrorKind::Config, message)
    }

    /// A required builder field was not set
    pub fn missing_config(field: &str) -> Self {
        Self::config(format!("missing required field: {}", field))
    }

    /// Malformed protocol data
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(SimErrorKind::Protocol, message)
    }

    /// Message could not be routed
    pub fn routing(message: impl Into<String>) -> Self {
        Self::new(SimErrorKind::Routing, message)
    }

    /// Correlation timeout for the given key
    pub fn timeout(key: &str, after: Duration) -> Self {
        Self::new(
            SimErrorKind::Timeout,
            format!("no response for {} after {:?}", key, after),
        )
    }

    /// Fatal orchestration failure
    pub fn orchestration(message: impl Into<String>) -> Self {
        Self::new(SimErrorKind::Orchestration, message)
    }

    /// The suite finished with `count` reported failures
    pub fn test_failures(count: usize) -> Self {
        Self::new(
            SimErrorKind::TestFailures,
            format!("{} failures have been detected", count),
        )
    }

    /// Component is shutting down
    pub fn shutdown() -> Self {
        Self::new(SimErrorKind::Shutdown, "component is shutting down")
    }

    /// Whether this is a correlation timeout
    pub fn is_timeout(&self) -> bool {
        self.kind == SimErrorKind::Timeout
    }
}

impl From<std::io::Error> for SimError {
    fn from(e: std::io::Error) -> Self {
        Self::new(SimErrorKind::Io, e.to_string())
    }
}

impl From<serde_json::Error> for SimError {
    fn from(e: serde_json::Error) -> Self {
        Self::protocol(e.to_string())
    }
}

/// Result type alias
pub type SimResult<T> = std::result::Result<T, SimError>;
