//! Hierarchical component addresses
//!
//! Every component in the cluster is located by a four-level address:
//! the coordinator (root), an agent, a worker on that agent, and a test on
//! that worker. An index of `0` is the wildcard "all children at this level".

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

const COORDINATOR_STRING: &str = "C";

/// Level of a [`SimulatorAddress`] in the cluster tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressLevel {
    /// The coordinator (root of the tree)
    Coordinator = 0,
    /// An agent process
    Agent = 1,
    /// A worker process supervised by an agent
    Worker = 2,
    /// A test case running on a worker
    Test = 3,
}

impl AddressLevel {
    /// Numeric depth of the level (coordinator = 0)
    pub fn depth(self) -> u8 {
        self as u8
    }

    /// Level one step towards the leaves, `None` for tests
    pub fn child(self) -> Option<AddressLevel> {
        match self {
            AddressLevel::Coordinator => Some(AddressLevel::Agent),
            AddressLevel::Agent => Some(AddressLevel::Worker),
            AddressLevel::Worker => Some(AddressLevel::Test),
            AddressLevel::Test => None,
        }
    }

    /// Level one step towards the root, `None` for the coordinator
    pub fn parent(self) -> Option<AddressLevel> {
        match self {
            AddressLevel::Coordinator => None,
            AddressLevel::Agent => Some(AddressLevel::Coordinator),
            AddressLevel::Worker => Some(AddressLevel::Agent),
            AddressLevel::Test => Some(AddressLevel::Worker),
        }
    }
}

impl fmt::Display for AddressLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressLevel::Coordinator => write!(f, "coordinator"),
            AddressLevel::Agent => write!(f, "agent"),
            AddressLevel::Worker => write!(f, "worker"),
            AddressLevel::Test => write!(f, "test"),
        }
    }
}

/// Immutable address of a cluster component
///
/// Ordering is by level first, then by the index tuple. It exists for
/// deterministic iteration and logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SimulatorAddress {
    level: AddressLevel,
    agent_index: u32,
    worker_index: u32,
    test_index: u32,
}

impl SimulatorAddress {
    /// The coordinator address
    pub const COORDINATOR: SimulatorAddress = SimulatorAddress {
        level: AddressLevel::Coordinator,
        agent_index: 0,
        worker_index: 0,
        test_index: 0,
    };

    /// Create an address; indices below `level` are forced to `0`
    pub fn new(level: AddressLevel, agent_index: u32, worker_index: u32, test_index: u32) -> Self {
        let depth = level.depth();
        Self {
            level,
            agent_index: if depth >= 1 { agent_index } else { 0 },
            worker_index: if depth >= 2 { worker_index } else { 0 },
            test_index: if depth >= 3 { test_index } else { 0 },
        }
    }

    /// Agent address (`0` addresses all agents)
    pub fn agent(agent_index: u32) -> Self {
        Self::new(AddressLevel::Agent, agent_index, 0, 0)
    }

    /// Worker address (`0` indices are wildcards)
    pub fn worker(agent_index: u32, worker_index: u32) -> Self {
        Self::new(AddressLevel::Worker, agent_index, worker_index, 0)
    }

    /// Test address (`0` indices are wildcards)
    pub fn test(agent_index: u32, worker_index: u32, test_index: u32) -> Self {
        Self::new(AddressLevel::Test, agent_index, worker_index, test_index)
    }

    /// Address of every agent
    pub fn all_agents() -> Self {
        Self::agent(0)
    }

    /// Address of every worker in the cluster
    pub fn all_workers() -> Self {
        Self::worker(0, 0)
    }

    /// Address of the test with `test_index` on every worker
    pub fn test_on_all_workers(test_index: u32) -> Self {
        Self::test(0, 0, test_index)
    }

    /// Level of this address
    pub fn level(&self) -> AddressLevel {
        self.level
    }

    /// Agent index (0 if unset or wildcard)
    pub fn agent_index(&self) -> u32 {
        self.agent_index
    }

    /// Worker index (0 if unset or wildcard)
    pub fn worker_index(&self) -> u32 {
        self.worker_index
    }

    /// Test index (0 if unset or wildcard)
    pub fn test_index(&self) -> u32 {
        self.test_index
    }

    /// Index stored for `level`; the coordinator level has no index
    pub fn index_at(&self, level: AddressLevel) -> u32 {
        match level {
            AddressLevel::Coordinator => 0,
            AddressLevel::Agent => self.agent_index,
            AddressLevel::Worker => self.worker_index,
            AddressLevel::Test => self.test_index,
        }
    }

    /// Address one level up, `None` for the coordinator
    pub fn parent(&self) -> Option<SimulatorAddress> {
        let level = self.level.parent()?;
        Some(Self::new(
            level,
            self.agent_index,
            self.worker_index,
            self.test_index,
        ))
    }

    /// Address of the child with `index` one level down, `None` below tests
    pub fn child(&self, index: u32) -> Option<SimulatorAddress> {
        match self.level.child()? {
            AddressLevel::Agent => Some(Self::agent(index)),
            AddressLevel::Worker => Some(Self::worker(self.agent_index, index)),
            AddressLevel::Test => Some(Self::test(self.agent_index, self.worker_index, index)),
            AddressLevel::Coordinator => None,
        }
    }

    /// Whether `other` is a direct child of this address
    pub fn is_parent_of(&self, other: &SimulatorAddress) -> bool {
        other.level.depth() == self.level.depth() + 1 && self.is_prefix_of(other)
    }

    /// Whether `other` is strictly below this address
    pub fn is_ancestor_of(&self, other: &SimulatorAddress) -> bool {
        other.level > self.level && self.is_prefix_of(other)
    }

    /// Whether this (possibly wildcard) address covers `other`
    ///
    /// `other` is covered when it sits at or below this address' level and
    /// every index of this address up to its level is either `0` or equal.
    pub fn covers(&self, other: &SimulatorAddress) -> bool {
        if other.level < self.level {
            return false;
        }
        levels_up_to(self.level).all(|level| {
            let index = self.index_at(level);
            index == 0 || index == other.index_at(level)
        })
    }

    /// Whether any index up to this address' level is a wildcard
    pub fn is_wildcard(&self) -> bool {
        levels_up_to(self.level).any(|level| self.index_at(level) == 0)
    }

    fn is_prefix_of(&self, other: &SimulatorAddress) -> bool {
        levels_up_to(self.level).all(|level| self.index_at(level) == other.index_at(level))
    }
}

fn levels_up_to(level: AddressLevel) -> impl Iterator<Item = AddressLevel> {
    [AddressLevel::Agent, AddressLevel::Worker, AddressLevel::Test]
        .into_iter()
        .filter(move |l| *l <= level)
}

impl fmt::Display for SimulatorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            AddressLevel::Coordinator => write!(f, "{}", COORDINATOR_STRING),
            AddressLevel::Agent => write!(f, "A{}", self.agent_index),
            AddressLevel::Worker => write!(f, "A{}_W{}", self.agent_index, self.worker_index),
            AddressLevel::Test => write!(
                f,
                "A{}_W{}_T{}",
                self.agent_index, self.worker_index, self.test_index
            ),
        }
    }
}

impl FromStr for SimulatorAddress {
    type Err = SimError;

    fn from_str(s: &str) -> SimResult<Self> {
        if s == COORDINATOR_STRING {
            return Ok(Self::COORDINATOR);
        }

        let parts: Vec<&str> = s.split('_').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(SimError::protocol(format!("invalid address: {}", s)));
        }

        let mut indices = [0u32; 3];
        for (position, (part, tag)) in parts.iter().zip(['A', 'W', 'T']).enumerate() {
            let digits = part
                .strip_prefix(tag)
                .ok_or_else(|| SimError::protocol(format!("invalid address: {}", s)))?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(SimError::protocol(format!("invalid address index in: {}", s)));
            }
            indices[position] = digits
                .parse()
                .map_err(|_| SimError::protocol(format!("address index out of range: {}", s)))?;
        }

        let level = match parts.len() {
            1 => AddressLevel::Agent,
            2 => AddressLevel::Worker,
            _ => AddressLevel::Test,
        };
        Ok(Self::new(level, indices[0], indices[1], indices[2]))
    }
}

impl From<SimulatorAddress> for String {
    fn from(address: SimulatorAddress) -> Self {
        address.to_string()
    }
}

impl TryFrom<String> for SimulatorAddress {
    type Error = SimError;

    fn try_from(value: String) -> SimResult<Self> {
        value.parse()
    }
}
