//! Test suites, test cases and test lifecycle phases

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

/// Lifecycle phase of a test case, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    /// Create test resources
    Setup,
    /// Warmup executed by every worker on its own
    LocalWarmup,
    /// Warmup that needs the whole cluster
    GlobalWarmup,
    /// The measured run
    Run,
    /// Cluster-wide verification
    GlobalVerify,
    /// Per-worker verification
    LocalVerify,
    /// Cluster-wide teardown
    GlobalTeardown,
    /// Per-worker teardown
    LocalTeardown,
}

impl TestPhase {
    /// All phases in execution order
    pub const ALL: [TestPhase; 8] = [
        TestPhase::Setup,
        TestPhase::LocalWarmup,
        TestPhase::GlobalWarmup,
        TestPhase::Run,
        TestPhase::GlobalVerify,
        TestPhase::LocalVerify,
        TestPhase::GlobalTeardown,
        TestPhase::LocalTeardown,
    ];

    /// Whether the phase must be synchronized cluster-wide
    pub fn is_global(&self) -> bool {
        matches!(
            self,
            TestPhase::GlobalWarmup | TestPhase::GlobalVerify | TestPhase::GlobalTeardown
        )
    }

    /// Human readable name
    pub fn desc(&self) -> &'static str {
        match self {
            TestPhase::Setup => "setup",
            TestPhase::LocalWarmup => "local warmup",
            TestPhase::GlobalWarmup => "global warmup",
            TestPhase::Run => "run",
            TestPhase::GlobalVerify => "global verify",
            TestPhase::LocalVerify => "local verify",
            TestPhase::GlobalTeardown => "global teardown",
            TestPhase::LocalTeardown => "local teardown",
        }
    }

    /// The final phase
    pub fn last() -> TestPhase {
        TestPhase::LocalTeardown
    }
}

impl std::fmt::Display for TestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.desc())
    }
}

impl std::str::FromStr for TestPhase {
    type Err = SimError;

    fn from_str(s: &str) -> SimResult<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        TestPhase::ALL
            .into_iter()
            .find(|phase| phase.desc().replace(' ', "_") == normalized)
            .ok_or_else(|| SimError::config(format!("unknown test phase: {}", s)))
    }
}

/// Configuration of a single test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    /// Unique id within the suite
    pub id: String,

    /// Free-form properties handed to the test on the workers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl TestCase {
    /// Create a test case without properties
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Add a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Look up a property
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

impl std::fmt::Display for TestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TestCase{{id={}", self.id)?;
        for (key, value) in &self.properties {
            write!(f, ", {}={}", key, value)?;
        }
        write!(f, "}}")
    }
}

/// An ordered set of test cases run together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuite {
    /// Suite id, used in logs and worker directories
    pub id: String,

    /// Test cases in execution order
    pub tests: Vec<TestCase>,

    /// How long the RUN phase lasts; `None` lets the test decide
    #[serde(default, with = "optional_secs", skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
}

impl TestSuite {
    /// Create an empty suite
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tests: Vec::new(),
            duration: None,
        }
    }

    /// Append a test case
    pub fn with_test(mut self, test_case: TestCase) -> Self {
        self.tests.push(test_case);
        self
    }

    /// Set the RUN phase duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Load a suite from a JSON file
    pub fn load(path: impl AsRef<Path>) -> SimResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let suite: TestSuite = serde_json::from_str(&content)
            .map_err(|e| SimError::config(format!("{}: {}", path.display(), e)))?;
        suite.validate()?;
        Ok(suite)
    }

    /// Check the suite is runnable
    pub fn validate(&self) -> SimResult<()> {
        if self.tests.is_empty() {
            return Err(SimError::config(format!("test suite {} has no tests", self.id)));
        }
        let mut seen = std::collections::HashSet::new();
        for test in &self.tests {
            if test.id.is_empty() {
                return Err(SimError::config("test case id must not be empty"));
            }
            if !seen.insert(test.id.as_str()) {
                return Err(SimError::config(format!("duplicate test case id: {}", test.id)));
            }
        }
        Ok(())
    }

    /// Number of test cases
    pub fn size(&self) -> usize {
        self.tests.len()
    }

    /// Length of the longest test id, for aligned log output
    pub fn max_test_case_id_length(&self) -> usize {
        self.tests.iter().map(|t| t.id.len()).max().unwrap_or(0)
    }
}

mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let secs: Option<f64> = Option::deserialize(deserializer)?;
        match secs {
            Some(secs) if secs < 0.0 || !secs.is_finite() => Err(serde::de::Error::custom(
                "duration must be a non-negative number of seconds",
            )),
            Some(secs) => Ok(Some(Duration::from_secs_f64(secs))),
            None => Ok(None),
        }
    }
}
