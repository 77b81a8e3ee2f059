//! Phase barriers for parallel test cases

use std::collections::BTreeMap;

use tokio::sync::watch;

use crate::config::CoordinatorConfig;
use crate::suite::TestPhase;

/// Counting gate: armed with `n`, released for everyone once `n` arrivals happened
#[derive(Debug)]
pub struct CountdownGate {
    remaining: watch::Sender<usize>,
}

impl CountdownGate {
    /// Arm the gate for `count` arrivals
    pub fn new(count: usize) -> Self {
        let (remaining, _) = watch::channel(count);
        Self { remaining }
    }

    /// Arrivals still missing
    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    /// Whether the gate is open
    pub fn is_open(&self) -> bool {
        self.remaining() == 0
    }

    /// Record one arrival without waiting
    pub fn count_down(&self) {
        self.remaining.send_modify(|remaining| *remaining = remaining.saturating_sub(1));
    }

    /// Wait until the gate is open
    pub async fn wait(&self) {
        let mut remaining = self.remaining.subscribe();
        // the sender lives in `self`, so the channel cannot close while we wait
        let _ = remaining.wait_for(|remaining| *remaining == 0).await;
    }

    /// Record one arrival, then wait for the others
    pub async fn arrive_and_wait(&self) {
        self.count_down();
        self.wait().await;
    }
}

/// One gate per synchronized phase, each sized to the number of test cases
#[derive(Debug)]
pub struct PhaseBarriers {
    gates: BTreeMap<TestPhase, CountdownGate>,
}

impl PhaseBarriers {
    /// Gates for every phase `config` synchronizes, for `test_count` runners
    pub fn new(config: &CoordinatorConfig, test_count: usize) -> Self {
        let gates = TestPhase::ALL
            .into_iter()
            .filter(|phase| config.syncs(*phase))
            .map(|phase| (phase, CountdownGate::new(test_count)))
            .collect();
        Self { gates }
    }

    /// Whether `phase` has a gate
    pub fn syncs(&self, phase: TestPhase) -> bool {
        self.gates.contains_key(&phase)
    }

    /// Synchronized phases in order
    pub fn phases(&self) -> Vec<TestPhase> {
        self.gates.keys().copied().collect()
    }

    /// Arrive at the gate of `phase` and wait for the other runners
    ///
    /// Returns immediately for unsynchronized phases.
    pub async fn arrive_and_wait(&self, phase: TestPhase) {
        if let Some(gate) = self.gates.get(&phase) {
            tracing::debug!(%phase, remaining = gate.remaining(), "Waiting at phase barrier");
            gate.arrive_and_wait().await;
        }
    }

    /// Arrive, without waiting, at every gate after `passed`
    ///
    /// Called by a runner that stops early so the remaining runners are not
    /// left waiting for it. `None` means the runner passed no gate at all.
    pub fn leave(&self, passed: Option<TestPhase>) {
        for (phase, gate) in &self.gates {
            if passed.map_or(true, |passed| *phase > passed) {
                gate.count_down();
            }
        }
    }
}
