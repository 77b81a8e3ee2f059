//! Per-test statistics tracked on a worker

use std::time::{Duration, Instant};

use crate::suite::TestPhase;

/// Statistics tracked by each test instance
#[derive(Debug, Clone)]
pub struct TestStats {
    /// Phases that finished without error, in execution order
    pub completed_phases: Vec<TestPhase>,

    /// Number of RUN iterations executed
    pub iterations: u64,

    /// Whether the RUN phase was cut short by a stop request
    pub stopped: bool,

    /// When the test was created
    pub created_at: Instant,

    /// RUN start time
    pub run_started_at: Option<Instant>,

    /// RUN end time
    pub run_ended_at: Option<Instant>,
}

impl Default for TestStats {
    fn default() -> Self {
        Self {
            completed_phases: Vec::new(),
            iterations: 0,
            stopped: false,
            created_at: Instant::now(),
            run_started_at: None,
            run_ended_at: None,
        }
    }
}

impl TestStats {
    /// Create new empty stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished phase
    pub fn record_phase(&mut self, phase: TestPhase) {
        self.completed_phases.push(phase);
    }

    /// Whether `phase` finished without error
    pub fn has_completed(&self, phase: TestPhase) -> bool {
        self.completed_phases.contains(&phase)
    }

    /// Last finished phase
    pub fn last_phase(&self) -> Option<TestPhase> {
        self.completed_phases.last().copied()
    }

    /// Start tracking the RUN phase
    pub fn start_run(&mut self) {
        self.run_started_at = Some(Instant::now());
    }

    /// Stop tracking the RUN phase
    pub fn end_run(&mut self) {
        self.run_ended_at = Some(Instant::now());
    }

    /// Time spent in RUN so far
    pub fn run_elapsed(&self) -> Option<Duration> {
        self.run_started_at.map(|start| {
            self.run_ended_at
                .map(|end| end.duration_since(start))
                .unwrap_or_else(|| start.elapsed())
        })
    }

    /// RUN iterations per second
    pub fn iterations_per_second(&self) -> f64 {
        self.run_elapsed()
            .map(|d| {
                let secs = d.as_secs_f64();
                if secs > 0.0 {
                    self.iterations as f64 / secs
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0)
    }
}
