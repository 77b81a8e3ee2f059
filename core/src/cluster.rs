//! In-process cluster
//!
//! [`LocalCluster`] builds agents and workers inside the coordinator's
//! process. Every parent/child pair is joined by a pair of
//! [`ChannelConnector`]s, one per direction, each with its own correlation
//! registry, so messages take the same path they would between processes.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::agent::{Agent, AgentBuilder};
use crate::channel::ChannelConfig;
use crate::coordinator::ClusterLauncher;
use crate::dispatch::{ChannelConnector, Connector, DispatchNode};
use crate::error::{SimError, SimResult};
use crate::registry::ComponentRegistry;
use crate::worker::WorkerBuilder;

struct ClusterState {
    coordinator: Arc<DispatchNode>,
    agents: Vec<Agent>,
    workers: Vec<Arc<DispatchNode>>,
    links: Vec<Arc<ChannelConnector>>,
    worker_links: Vec<Arc<ChannelConnector>>,
}

impl ClusterState {
    fn all_links(&self) -> impl Iterator<Item = &Arc<ChannelConnector>> {
        self.links.iter().chain(self.worker_links.iter())
    }
}

/// Agents and workers running as tasks of the current runtime
pub struct LocalCluster {
    agent_count: u32,
    workers_per_agent: u32,
    channel: ChannelConfig,
    state: Mutex<Option<ClusterState>>,
}

impl LocalCluster {
    /// Cluster of `agent_count` agents with `workers_per_agent` workers each
    ///
    /// When the registry already lists agents, those are started instead and
    /// `agent_count` is ignored.
    pub fn new(agent_count: u32, workers_per_agent: u32) -> Self {
        Self {
            agent_count,
            workers_per_agent,
            channel: ChannelConfig::default(),
            state: Mutex::new(None),
        }
    }

    /// Set the link configuration
    pub fn with_channel_config(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    /// Started agents
    pub fn agents(&self) -> Vec<Agent> {
        self.state
            .lock()
            .as_ref()
            .map(|state| state.agents.clone())
            .unwrap_or_default()
    }

    /// Started worker nodes
    pub fn workers(&self) -> Vec<Arc<DispatchNode>> {
        self.state
            .lock()
            .as_ref()
            .map(|state| state.workers.clone())
            .unwrap_or_default()
    }

    /// Whether the cluster is running
    pub fn is_running(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Requests still waiting for a response on any link
    pub fn pending_requests(&self) -> usize {
        self.state
            .lock()
            .as_ref()
            .map(|state| state.all_links().map(|link| link.pending_requests()).sum())
            .unwrap_or(0)
    }

    fn up_link(&self, parent: &Arc<DispatchNode>, links: &mut Vec<Arc<ChannelConnector>>) -> Arc<dyn Connector> {
        let up = ChannelConnector::connect_upstream(Arc::clone(parent), &self.channel);
        links.push(up.clone());
        up
    }

    /// Start the workers of `agent`, linked in both directions
    fn start_workers(
        &self,
        agent: &Agent,
        links: &mut Vec<Arc<ChannelConnector>>,
    ) -> SimResult<Vec<Arc<DispatchNode>>> {
        let agent_index = agent.address().agent_index();
        let mut workers = Vec::new();
        for worker_index in 1..=self.workers_per_agent {
            let worker = WorkerBuilder::new(agent_index, worker_index)
                .upstream(self.up_link(agent.node(), links))
                .build()?;
            self.down_link(agent.node(), &worker, links)?;
            workers.push(worker);
        }
        Ok(workers)
    }

    fn down_link(
        &self,
        parent: &Arc<DispatchNode>,
        child: &Arc<DispatchNode>,
        links: &mut Vec<Arc<ChannelConnector>>,
    ) -> SimResult<()> {
        // The coordinator bounds each request; a dropped caller cancels down the tree.
        let config = self.channel.clone().without_send_timeout();
        let down = ChannelConnector::connect(Arc::clone(child), &config);
        parent.add_child(down.clone())?;
        links.push(down);
        Ok(())
    }
}

#[async_trait]
impl ClusterLauncher for LocalCluster {
    async fn start_agents(
        &self,
        registry: &ComponentRegistry,
        coordinator: Arc<DispatchNode>,
    ) -> SimResult<()> {
        if self.is_running() {
            return Err(SimError::orchestration("local cluster is already running"));
        }
        if registry.agent_count() == 0 {
            for index in 1..=self.agent_count {
                let address = format!("local-{}", index);
                registry.add_agent(&address, &address);
            }
        }
        if registry.agent_count() == 0 {
            return Err(SimError::config("cluster has no agents"));
        }

        let mut agents = Vec::new();
        let mut workers = Vec::new();
        let mut links = Vec::new();
        let mut worker_links = Vec::new();
        for agent_data in registry.agents() {
            let agent_index = agent_data.address_index();
            let agent = AgentBuilder::new(agent_index)
                .upstream(self.up_link(&coordinator, &mut links))
                .build()?;

            for worker in self.start_workers(&agent, &mut worker_links)? {
                let address = worker.address();
                registry.add_worker(address.agent_index(), address.worker_index())?;
                workers.push(worker);
            }

            self.down_link(&coordinator, agent.node(), &mut links)?;
            tracing::info!(
                agent = %agent.address(),
                public_address = %agent_data.public_address(),
                workers = self.workers_per_agent,
                "Agent started"
            );
            agents.push(agent);
        }

        *self.state.lock() = Some(ClusterState {
            coordinator,
            agents,
            workers,
            links,
            worker_links,
        });
        Ok(())
    }

    async fn restart_workers(&self, _registry: &ComponentRegistry) -> SimResult<()> {
        let mut guard = self.state.lock();
        let Some(state) = guard.as_mut() else {
            return Err(SimError::orchestration("local cluster is not running"));
        };

        for worker in state.workers.drain(..) {
            let address = worker.address();
            if let Some(agent) = state.agents.iter().find(|a| a.address().agent_index() == address.agent_index()) {
                agent.node().remove_child(address.worker_index());
            }
            for (index, _) in worker.children().all() {
                worker.remove_child(index);
            }
            worker.clear_upstream();
        }
        let released: usize = state.worker_links.iter().map(|link| link.pending_requests()).sum();
        for link in state.worker_links.drain(..) {
            link.close();
        }

        let mut worker_links = Vec::new();
        for agent in &state.agents {
            let workers = self.start_workers(agent, &mut worker_links)?;
            state.workers.extend(workers);
        }
        state.worker_links = worker_links;
        tracing::info!(workers = state.workers.len(), released, "Workers restarted");
        Ok(())
    }

    async fn stop_agents(&self) -> SimResult<()> {
        let Some(state) = self.state.lock().take() else {
            return Ok(());
        };

        for agent in &state.agents {
            state.coordinator.remove_child(agent.address().agent_index());
            for (index, _) in agent.node().children().all() {
                agent.node().remove_child(index);
            }
            agent.node().clear_upstream();
        }
        for worker in &state.workers {
            for (index, _) in worker.children().all() {
                worker.remove_child(index);
            }
            worker.clear_upstream();
        }
        let mut released = 0;
        for link in state.all_links() {
            released += link.pending_requests();
            link.close();
        }
        if released > 0 {
            tracing::warn!(released, "Local cluster stopped with pending requests");
        }
        tracing::info!(agents = state.agents.len(), workers = state.workers.len(), "Local cluster stopped");
        Ok(())
    }
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("agent_count", &self.agent_count)
            .field("workers_per_agent", &self.workers_per_agent)
            .field("running", &self.is_running())
            .finish()
    }
}
