//! Directory of agents, workers and tests
//!
//! Built once from static configuration. During a run only worker
//! registration changes, serialized behind a write lock.

use std::collections::BTreeSet;
use std::path::Path;

use parking_lot::RwLock;

use crate::error::{SimError, SimResult};
use crate::protocol::{AddressLevel, SimulatorAddress};
use crate::suite::{TestCase, TestSuite};

/// A registered agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentData {
    address: SimulatorAddress,
    public_address: String,
    private_address: String,
    workers: BTreeSet<u32>,
}

impl AgentData {
    /// Agent address (`A<n>`)
    pub fn address(&self) -> SimulatorAddress {
        self.address
    }

    /// Agent index
    pub fn address_index(&self) -> u32 {
        self.address.agent_index()
    }

    /// Address reachable from the coordinator
    pub fn public_address(&self) -> &str {
        &self.public_address
    }

    /// Address used inside the cluster network
    pub fn private_address(&self) -> &str {
        &self.private_address
    }

    /// Addresses of the agent's registered workers
    pub fn workers(&self) -> Vec<SimulatorAddress> {
        self.workers
            .iter()
            .map(|w| SimulatorAddress::worker(self.address_index(), *w))
            .collect()
    }
}

/// A test registered for the current suite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestData {
    test_index: u32,
    test_case: TestCase,
}

impl TestData {
    /// Index used in test addresses
    pub fn test_index(&self) -> u32 {
        self.test_index
    }

    /// Test id
    pub fn test_id(&self) -> &str {
        &self.test_case.id
    }

    /// Test configuration
    pub fn test_case(&self) -> &TestCase {
        &self.test_case
    }

    /// Address of this test on every worker
    pub fn address(&self) -> SimulatorAddress {
        SimulatorAddress::test_on_all_workers(self.test_index)
    }
}

#[derive(Debug, Default)]
struct Directory {
    agents: Vec<AgentData>,
    tests: Vec<TestData>,
}

impl Directory {
    fn agent_mut(&mut self, agent_index: u32) -> Option<&mut AgentData> {
        self.agents
            .iter_mut()
            .find(|a| a.address_index() == agent_index)
    }
}

/// Authoritative registry of cluster components
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    directory: RwLock<Directory>,
}

impl ComponentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an agents file: one `publicAddress[,privateAddress]` per line
    ///
    /// Blank lines and lines starting with `#` are skipped.
    pub fn parse_agents(content: &str) -> SimResult<Self> {
        let registry = Self::new();
        for (line_number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split(',').map(str::trim);
            let public_address = parts.next().unwrap_or_default();
            let private_address = parts.next().unwrap_or(public_address);
            if public_address.is_empty() || private_address.is_empty() || parts.next().is_some() {
                return Err(SimError::config(format!(
                    "invalid agents line {}: {}",
                    line_number + 1,
                    line
                )));
            }
            registry.add_agent(public_address, private_address);
        }
        Ok(registry)
    }

    /// Load an agents file
    pub fn from_agents_file(path: impl AsRef<Path>) -> SimResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let registry = Self::parse_agents(&content)?;
        if registry.agent_count() == 0 {
            return Err(SimError::config(format!(
                "agents file {} contains no agents",
                path.display()
            )));
        }
        Ok(registry)
    }

    /// Register an agent; indices are assigned in order starting at 1
    pub fn add_agent(&self, public_address: &str, private_address: &str) -> SimulatorAddress {
        let mut directory = self.directory.write();
        let index = directory.agents.len() as u32 + 1;
        let address = SimulatorAddress::agent(index);
        directory.agents.push(AgentData {
            address,
            public_address: public_address.to_string(),
            private_address: private_address.to_string(),
            workers: BTreeSet::new(),
        });
        address
    }

    /// Snapshot of all agents in index order
    pub fn agents(&self) -> Vec<AgentData> {
        self.directory.read().agents.clone()
    }

    /// Look up one agent
    pub fn agent(&self, agent_index: u32) -> Option<AgentData> {
        self.directory
            .read()
            .agents
            .iter()
            .find(|a| a.address_index() == agent_index)
            .cloned()
    }

    /// Number of agents
    pub fn agent_count(&self) -> usize {
        self.directory.read().agents.len()
    }

    /// Register a started worker under its agent
    pub fn add_worker(&self, agent_index: u32, worker_index: u32) -> SimResult<SimulatorAddress> {
        if worker_index == 0 {
            return Err(SimError::config("worker index 0 is reserved for wildcards"));
        }
        let mut directory = self.directory.write();
        let agent = directory
            .agent_mut(agent_index)
            .ok_or_else(|| SimError::config(format!("unknown agent index {}", agent_index)))?;
        agent.workers.insert(worker_index);
        Ok(SimulatorAddress::worker(agent_index, worker_index))
    }

    /// Remove a stopped worker; returns whether it was registered
    pub fn remove_worker(&self, worker: &SimulatorAddress) -> bool {
        if worker.level() != AddressLevel::Worker {
            return false;
        }
        let mut directory = self.directory.write();
        directory
            .agent_mut(worker.agent_index())
            .map(|agent| agent.workers.remove(&worker.worker_index()))
            .unwrap_or(false)
    }

    /// Workers of one agent
    pub fn workers_of(&self, agent: &SimulatorAddress) -> Vec<SimulatorAddress> {
        self.agent(agent.agent_index())
            .map(|a| a.workers())
            .unwrap_or_default()
    }

    /// All workers in address order
    pub fn workers(&self) -> BTreeSet<SimulatorAddress> {
        self.directory
            .read()
            .agents
            .iter()
            .flat_map(|a| a.workers())
            .collect()
    }

    /// Number of workers
    pub fn worker_count(&self) -> usize {
        self.directory
            .read()
            .agents
            .iter()
            .map(|a| a.workers.len())
            .sum()
    }

    /// `workers()` minus `finished`
    pub fn missing_workers(&self, finished: &BTreeSet<SimulatorAddress>) -> BTreeSet<SimulatorAddress> {
        self.workers().difference(finished).copied().collect()
    }

    /// Register the suite's tests; indices follow suite order starting at 1
    pub fn add_tests(&self, suite: &TestSuite) -> Vec<TestData> {
        let mut directory = self.directory.write();
        directory.tests = suite
            .tests
            .iter()
            .enumerate()
            .map(|(i, test_case)| TestData {
                test_index: i as u32 + 1,
                test_case: test_case.clone(),
            })
            .collect();
        directory.tests.clone()
    }

    /// Registered tests
    pub fn tests(&self) -> Vec<TestData> {
        self.directory.read().tests.clone()
    }

    /// Number of registered tests
    pub fn test_count(&self) -> usize {
        self.directory.read().tests.len()
    }

    /// Look up a test by id
    pub fn test(&self, test_id: &str) -> Option<TestData> {
        self.directory
            .read()
            .tests
            .iter()
            .find(|t| t.test_id() == test_id)
            .cloned()
    }

    /// Every registered concrete address covered by `destination`
    ///
    /// This is the set of components that must reply to a message sent to
    /// `destination`. Only registered components are returned.
    pub fn expand(&self, destination: &SimulatorAddress) -> Vec<SimulatorAddress> {
        let directory = self.directory.read();
        let mut targets: Vec<SimulatorAddress> = match destination.level() {
            AddressLevel::Coordinator => vec![SimulatorAddress::COORDINATOR],
            AddressLevel::Agent => directory.agents.iter().map(|a| a.address).collect(),
            AddressLevel::Worker => directory.agents.iter().flat_map(|a| a.workers()).collect(),
            AddressLevel::Test => directory
                .agents
                .iter()
                .flat_map(|a| a.workers())
                .flat_map(|worker| {
                    directory
                        .tests
                        .iter()
                        .filter_map(move |t| worker.child(t.test_index))
                })
                .collect(),
        };
        targets.retain(|target| destination.covers(target));
        targets.sort();
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(agents: u32, workers_per_agent: u32) -> ComponentRegistry {
        let registry = ComponentRegistry::new();
        for agent in 1..=agents {
            registry.add_agent(&format!("10.0.0.{}", agent), &format!("192.168.0.{}", agent));
            for worker in 1..=workers_per_agent {
                registry.add_worker(agent, worker).unwrap();
            }
        }
        registry
    }

    #[test]
    fn test_parse_agents() {
        let registry = ComponentRegistry::parse_agents(
            "# cluster\n10.0.0.1\n\n10.0.0.2, 192.168.0.2\n",
        )
        .unwrap();
        let agents = registry.agents();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].address(), SimulatorAddress::agent(1));
        assert_eq!(agents[0].private_address(), "10.0.0.1");
        assert_eq!(agents[1].public_address(), "10.0.0.2");
        assert_eq!(agents[1].private_address(), "192.168.0.2");
    }

    #[test]
    fn test_parse_agents_rejects_garbage() {
        assert!(ComponentRegistry::parse_agents("1.1.1.1,2.2.2.2,3.3.3.3").is_err());
        assert!(ComponentRegistry::parse_agents(",1.1.1.1").is_err());
    }

    #[test]
    fn test_worker_registration() {
        let registry = registry(2, 2);
        assert_eq!(registry.agent_count(), 2);
        assert_eq!(registry.worker_count(), 4);
        assert_eq!(
            registry.workers_of(&SimulatorAddress::agent(2)),
            vec![SimulatorAddress::worker(2, 1), SimulatorAddress::worker(2, 2)]
        );

        assert!(registry.remove_worker(&SimulatorAddress::worker(2, 1)));
        assert!(!registry.remove_worker(&SimulatorAddress::worker(2, 1)));
        assert_eq!(registry.worker_count(), 3);

        assert!(registry.add_worker(9, 1).is_err());
        assert!(registry.add_worker(1, 0).is_err());
    }

    #[test]
    fn test_missing_workers() {
        let registry = registry(1, 3);
        let finished: BTreeSet<_> = [SimulatorAddress::worker(1, 2)].into_iter().collect();
        let missing = registry.missing_workers(&finished);
        assert_eq!(missing.len(), 2);
        assert!(!missing.contains(&SimulatorAddress::worker(1, 2)));
    }

    #[test]
    fn test_tests_indexed_in_suite_order() {
        let registry = registry(1, 1);
        let suite = TestSuite::new("s")
            .with_test(TestCase::new("map"))
            .with_test(TestCase::new("queue"));
        let tests = registry.add_tests(&suite);
        assert_eq!(tests[1].test_index(), 2);
        assert_eq!(tests[1].address(), SimulatorAddress::test(0, 0, 2));
        assert_eq!(registry.test("queue").map(|t| t.test_index()), Some(2));
    }

    #[test]
    fn test_expand_wildcards() {
        let registry = registry(2, 2);
        registry.add_tests(&TestSuite::new("s").with_test(TestCase::new("map")));

        assert_eq!(registry.expand(&SimulatorAddress::all_agents()).len(), 2);
        assert_eq!(registry.expand(&SimulatorAddress::all_workers()).len(), 4);
        assert_eq!(registry.expand(&SimulatorAddress::worker(2, 0)).len(), 2);
        assert_eq!(registry.expand(&SimulatorAddress::test_on_all_workers(1)).len(), 4);
        assert!(registry.expand(&SimulatorAddress::test_on_all_workers(2)).is_empty());
        assert!(registry.expand(&SimulatorAddress::worker(3, 0)).is_empty());
    }
}
