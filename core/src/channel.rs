//! Channel configuration for links between components

use std::time::Duration;

/// Buffer and timeout settings of a request/response link
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Request channel buffer size (parent -> child)
    pub request_buffer: usize,

    /// Response channel buffer size (child -> parent)
    pub response_buffer: usize,

    /// How long a sender waits for the aggregated response
    ///
    /// `None` leaves the bound to the caller, who cancels the request by
    /// dropping it.
    pub send_timeout: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_buffer: 1_024,
            response_buffer: 1_024,
            send_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl ChannelConfig {
    /// Set the request buffer size
    pub fn with_request_buffer(mut self, size: usize) -> Self {
        self.request_buffer = size;
        self
    }

    /// Set the response buffer size
    pub fn with_response_buffer(mut self, size: usize) -> Self {
        self.response_buffer = size;
        self
    }

    /// Set the send timeout
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Wait for responses until they arrive, the link closes or the caller gives up
    pub fn without_send_timeout(mut self) -> Self {
        self.send_timeout = None;
        self
    }
}
