//! Channel-backed links between components
//!
//! A link owns a request channel into the remote node and a response channel
//! back. Every request is served on its own task, so a slow operation never
//! blocks other messages on the same link. Responses are matched to waiting
//! senders through the link's [`CorrelationRegistry`].
//!
//! A sender that stops waiting, because its own caller gave up or the link
//! deadline passed, cancels the remote task. Cancellation travels down the
//! tree with the dropped fan-outs, so no hop keeps working for nobody.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};

use crate::channel::ChannelConfig;
use crate::error::{SimError, SimResult};
use crate::protocol::{CorrelationRegistry, Response, SimulatorAddress, SimulatorMessage};

use super::connector::Connector;
use super::node::DispatchNode;

/// Which way a link carries requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    /// From a parent to one of its children
    Down,
    /// From a child to its parent
    Up,
}

enum LinkRequest {
    Deliver(SimulatorMessage),
    Cancel(String),
}

/// Cancels the remote task unless a response arrived
struct CancelOnDrop<'a> {
    requests: &'a mpsc::Sender<LinkRequest>,
    key: Option<String>,
}

impl CancelOnDrop<'_> {
    fn disarm(&mut self) {
        self.key = None;
    }
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            if self.requests.try_send(LinkRequest::Cancel(key)).is_err() {
                tracing::debug!("Cancellation not delivered, link is busy or closed");
            }
        }
    }
}

/// Sending end of a link to a remote [`DispatchNode`]
pub struct ChannelConnector {
    remote: SimulatorAddress,
    direction: LinkDirection,
    target: Weak<DispatchNode>,
    requests: mpsc::Sender<LinkRequest>,
    registry: Arc<CorrelationRegistry>,
    send_timeout: Option<Duration>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelConnector {
    /// Open a link from a parent down to the child `target`
    pub fn connect(target: Arc<DispatchNode>, config: &ChannelConfig) -> Arc<Self> {
        Self::open(target, LinkDirection::Down, config)
    }

    /// Open a link from a child up to the parent `target`
    pub fn connect_upstream(target: Arc<DispatchNode>, config: &ChannelConfig) -> Arc<Self> {
        Self::open(target, LinkDirection::Up, config)
    }

    fn open(target: Arc<DispatchNode>, direction: LinkDirection, config: &ChannelConfig) -> Arc<Self> {
        let remote = target.address();
        let (request_tx, request_rx) = mpsc::channel(config.request_buffer.max(1));
        let (response_tx, response_rx) = mpsc::channel(config.response_buffer.max(1));
        let registry = Arc::new(CorrelationRegistry::new());
        let weak_target = Arc::downgrade(&target);

        let server = tokio::spawn(serve(target, direction, request_rx, response_tx));
        tokio::spawn(read_responses(remote, Arc::clone(&registry), response_rx));

        tracing::debug!(%remote, ?direction, "Link opened");
        Arc::new(Self {
            remote,
            direction,
            target: weak_target,
            requests: request_tx,
            registry,
            send_timeout: config.send_timeout,
            server: Mutex::new(Some(server)),
        })
    }

    /// Which way this link carries requests
    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    /// Deadline for one request, `None` when the caller bounds it
    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout
    }

    /// Tear the link down without waiting for in-flight requests
    ///
    /// Requests still pending on this link complete as unreachable.
    pub fn close(&self) {
        if let Some(server) = self.server.lock().take() {
            server.abort();
            tracing::debug!(remote = %self.remote, "Link closed");
        }
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.server.lock().is_none()
    }

    /// Correlation registry of this link
    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    fn closed_error(&self) -> SimError {
        SimError::routing(format!("link to {} is closed", self.remote))
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    fn remote_address(&self) -> SimulatorAddress {
        self.remote
    }

    async fn send(&self, message: SimulatorMessage) -> SimResult<Response> {
        let slot = self.registry.register(&message)?;
        let key = slot.key().to_string();

        if self.requests.send(LinkRequest::Deliver(message)).await.is_err() {
            self.registry.complete(&key, Response::last());
            return Err(self.closed_error());
        }

        let mut cancel = CancelOnDrop {
            requests: &self.requests,
            key: Some(key),
        };
        let response = match self.send_timeout {
            Some(timeout) => self.registry.await_response(slot, timeout).await?,
            None => self.registry.await_unbounded(slot).await?,
        };
        cancel.disarm();
        if response.is_last() {
            return Err(self.closed_error());
        }
        Ok(response)
    }

    /// Release waiters on this link, then on the links below the remote node
    fn unblock(&self, failed: &SimulatorAddress) -> usize {
        let below = self
            .target
            .upgrade()
            .map(|node| node.unblock(failed))
            .unwrap_or(0);
        let here = if failed.covers(&self.remote) {
            self.registry.unblock_all(failed)
        } else {
            self.registry.unblock(failed)
        };
        here + below
    }

    fn pending_requests(&self) -> usize {
        self.registry.len()
    }
}

impl std::fmt::Debug for ChannelConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConnector")
            .field("remote", &self.remote)
            .field("direction", &self.direction)
            .field("pending", &self.registry.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn serve(
    target: Arc<DispatchNode>,
    direction: LinkDirection,
    mut requests: mpsc::Receiver<LinkRequest>,
    responses: mpsc::Sender<Response>,
) {
    let mut tasks = JoinSet::new();
    let mut running: HashMap<String, AbortHandle> = HashMap::new();
    loop {
        tokio::select! {
            request = requests.recv() => match request {
                None => break,
                Some(LinkRequest::Deliver(message)) => {
                    let key = message.key();
                    let target = Arc::clone(&target);
                    let responses = responses.clone();
                    let task_key = key.clone();
                    let handle = tasks.spawn(async move {
                        let response = match direction {
                            LinkDirection::Down => target.handle(message).await,
                            LinkDirection::Up => target.handle_from_child(message).await,
                        };
                        if responses.send(response).await.is_err() {
                            tracing::debug!(address = %target.address(), "Response dropped, link is gone");
                        }
                        task_key
                    });
                    running.insert(key, handle);
                }
                Some(LinkRequest::Cancel(key)) => {
                    if let Some(handle) = running.remove(&key) {
                        handle.abort();
                        tracing::debug!(address = %target.address(), key = %key, "Request cancelled by sender");
                    }
                }
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                Ok(key) => {
                    running.remove(&key);
                }
                Err(e) => {
                    if e.is_panic() {
                        tracing::error!(address = %target.address(), error = %e, "Request task panicked");
                    }
                    running.retain(|_, handle| !handle.is_finished());
                }
            },
        }
    }
    while tasks.join_next().await.is_some() {}
}

async fn read_responses(
    remote: SimulatorAddress,
    registry: Arc<CorrelationRegistry>,
    mut responses: mpsc::Receiver<Response>,
) {
    while let Some(response) = responses.recv().await {
        registry.complete_response(response);
    }
    let released = registry.complete_all_with_last();
    if released > 0 {
        tracing::warn!(%remote, released, "Link closed with pending requests");
    }
}
