//! Process-wide ledger of reported failures
//!
//! The container is the authoritative source for fail-fast decisions and for
//! the final pass/fail verdict. It also tracks which workers have signalled
//! that they are finished, so the coordinator can wait for shutdown.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};
use crate::protocol::{AddressLevel, FailureReport, SimulatorAddress};

/// Kind of a failure report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// The test code raised an error
    WorkerException,
    /// A worker stopped responding
    WorkerTimeout,
    /// A worker ran out of memory and died
    WorkerOom,
    /// A worker process exited unexpectedly
    WorkerExit,
    /// A worker shut down cleanly (not a failure)
    WorkerFinished,
    /// An operation returned a failure outcome to the coordinator
    OperationFailure,
}

impl FailureType {
    /// Whether the report counts towards the failure total
    pub fn is_failure(&self) -> bool {
        !matches!(self, FailureType::WorkerFinished)
    }

    /// Whether the reporting worker is gone afterwards
    pub fn is_worker_finished(&self) -> bool {
        matches!(
            self,
            FailureType::WorkerFinished | FailureType::WorkerOom | FailureType::WorkerExit
        )
    }
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureType::WorkerException => "worker exception",
            FailureType::WorkerTimeout => "worker timeout",
            FailureType::WorkerOom => "worker out of memory",
            FailureType::WorkerExit => "worker exit",
            FailureType::WorkerFinished => "worker finished",
            FailureType::OperationFailure => "operation failure",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for FailureType {
    type Err = SimError;

    fn from_str(s: &str) -> SimResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exception" | "worker_exception" => Ok(FailureType::WorkerException),
            "timeout" | "worker_timeout" => Ok(FailureType::WorkerTimeout),
            "oom" | "worker_oom" => Ok(FailureType::WorkerOom),
            "exit" | "worker_exit" => Ok(FailureType::WorkerExit),
            "finished" | "worker_finished" => Ok(FailureType::WorkerFinished),
            "operation_failure" => Ok(FailureType::OperationFailure),
            _ => Err(SimError::config(format!("unknown failure type: {}", s))),
        }
    }
}

/// One recorded failure; never mutated after it is appended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    /// Component that reported it
    pub reporter: SimulatorAddress,
    /// Test the failure belongs to
    pub test_id: Option<String>,
    /// Kind of failure
    pub failure_type: FailureType,
    /// Description
    pub message: String,
    /// When the coordinator recorded it
    pub timestamp: DateTime<Utc>,
}

impl std::fmt::Display for FailureEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} from {}", self.failure_type, self.reporter)?;
        if let Some(test_id) = &self.test_id {
            write!(f, " (test {})", test_id)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Notified after a report has been appended
pub trait FailureListener: Send + Sync {
    /// Called outside the container's lock
    fn on_failure(&self, entry: &FailureEntry);
}

type DedupKey = (SimulatorAddress, Option<String>, FailureType, String);

#[derive(Default)]
struct Ledger {
    failures: Vec<FailureEntry>,
    seen: HashSet<DedupKey>,
    finished_workers: BTreeSet<SimulatorAddress>,
}

/// Append-only failure ledger shared by every dispatching task
pub struct FailureContainer {
    suite_id: String,
    ledger: Mutex<Ledger>,
    listeners: RwLock<Vec<Arc<dyn FailureListener>>>,
}

impl FailureContainer {
    /// Create an empty container for `suite_id`
    pub fn new(suite_id: impl Into<String>) -> Self {
        Self {
            suite_id: suite_id.into(),
            ledger: Mutex::new(Ledger::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener for appended reports
    pub fn add_listener(&self, listener: Arc<dyn FailureListener>) {
        self.listeners.write().push(listener);
    }

    /// Record a report; returns `false` if an identical report was already recorded
    pub fn report_failure(&self, report: FailureReport) -> bool {
        let entry = FailureEntry {
            reporter: report.reporter,
            test_id: report.test_id,
            failure_type: report.failure_type,
            message: report.message,
            timestamp: Utc::now(),
        };

        let failure_count = {
            let mut ledger = self.ledger.lock();
            let key = (
                entry.reporter,
                entry.test_id.clone(),
                entry.failure_type,
                entry.message.clone(),
            );
            if !ledger.seen.insert(key) {
                tracing::debug!(reporter = %entry.reporter, "Ignoring duplicate failure report");
                return false;
            }
            if entry.failure_type.is_worker_finished() {
                ledger.finished_workers.insert(worker_of(&entry.reporter));
            }
            if entry.failure_type.is_failure() {
                ledger.failures.push(entry.clone());
            }
            ledger.failures.len()
        };

        if entry.failure_type.is_failure() {
            tracing::error!(
                suite_id = %self.suite_id,
                reporter = %entry.reporter,
                test_id = ?entry.test_id,
                failure_type = %entry.failure_type,
                failure_count,
                "Failure reported: {}",
                entry.message
            );
        } else {
            tracing::info!(worker = %entry.reporter, "Worker finished");
        }

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_failure(&entry);
        }
        true
    }

    /// Number of recorded failures
    pub fn count(&self) -> usize {
        self.ledger.lock().failures.len()
    }

    /// Whether any failure was recorded
    pub fn has_failures(&self) -> bool {
        self.count() > 0
    }

    /// Number of failures attributed to `test_id`
    pub fn failures_for_test(&self, test_id: &str) -> usize {
        self.ledger
            .lock()
            .failures
            .iter()
            .filter(|f| f.test_id.as_deref() == Some(test_id))
            .count()
    }

    /// Snapshot of all failures, in report order
    pub fn failures(&self) -> Vec<FailureEntry> {
        self.ledger.lock().failures.clone()
    }

    /// Workers that reported they are finished
    pub fn finished_workers(&self) -> BTreeSet<SimulatorAddress> {
        self.ledger.lock().finished_workers.clone()
    }

    /// `expected` minus the finished workers
    pub fn missing_workers<'a>(
        &self,
        expected: impl IntoIterator<Item = &'a SimulatorAddress>,
    ) -> BTreeSet<SimulatorAddress> {
        let ledger = self.ledger.lock();
        expected
            .into_iter()
            .filter(|address| !ledger.finished_workers.contains(address))
            .copied()
            .collect()
    }

    /// Suite this container belongs to
    pub fn suite_id(&self) -> &str {
        &self.suite_id
    }
}

impl std::fmt::Debug for FailureContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ledger = self.ledger.lock();
        f.debug_struct("FailureContainer")
            .field("suite_id", &self.suite_id)
            .field("failures", &ledger.failures.len())
            .field("finished_workers", &ledger.finished_workers.len())
            .finish()
    }
}

fn worker_of(address: &SimulatorAddress) -> SimulatorAddress {
    match address.level() {
        AddressLevel::Test => address.parent().unwrap_or(*address),
        _ => *address,
    }
}
