//! Tests for the Orchestrator module

use super::aggregator::TestStatus;
use super::builder::OrchestratorBuilder;
use super::executor::Orchestrator;
use crate::cluster::LocalCluster;
use crate::config::{CoordinatorConfig, ParallelFailFast};
use crate::coordinator::{coordinator_node, ClusterLauncher, Coordinator};
use crate::dispatch::DispatchNode;
use crate::error::{SimError, SimErrorKind, SimResult};
use crate::failure::{FailureContainer, FailureType};
use crate::protocol::{ResponseType, SimulatorAddress};
use crate::registry::ComponentRegistry;
use crate::suite::{TestCase, TestPhase, TestSuite};

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Fixtures
// ============================================================================

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig::new()
        .with_send_timeout(Duration::from_secs(10))
        .with_worker_shutdown_timeout(Duration::from_secs(2))
        .with_shutdown_poll_interval(Duration::from_millis(10))
        .with_failure_check_interval(Duration::from_millis(10))
}

struct Cluster {
    local: LocalCluster,
    registry: Arc<ComponentRegistry>,
    node: Arc<DispatchNode>,
    failures: Arc<FailureContainer>,
}

impl Cluster {
    async fn start(agents: u32, workers: u32) -> Self {
        let failures = Arc::new(FailureContainer::new("suite"));
        let node = coordinator_node(failures.clone()).unwrap();
        let registry = Arc::new(ComponentRegistry::new());
        let local = LocalCluster::new(agents, workers);
        local.start_agents(&registry, node.clone()).await.unwrap();
        Self {
            local,
            registry,
            node,
            failures,
        }
    }

    fn orchestrator(&self, config: CoordinatorConfig, suite: TestSuite) -> Orchestrator {
        OrchestratorBuilder::new()
            .config(config)
            .suite(suite)
            .coordinator(self.node.clone())
            .registry(self.registry.clone())
            .failures(self.failures.clone())
            .build()
            .unwrap()
    }

    async fn stop(self) {
        // abandoned requests are cancelled on the links asynchronously
        tokio::time::timeout(Duration::from_secs(1), async {
            while self.local.pending_requests() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        self.local.stop_agents().await.unwrap();
    }
}

fn suite(tests: Vec<TestCase>) -> TestSuite {
    tests
        .into_iter()
        .fold(TestSuite::new("suite"), |suite, test| suite.with_test(test))
}

// ============================================================================
// Mock launcher
// ============================================================================

#[derive(Default)]
struct FailingLauncher {
    stops: AtomicUsize,
}

#[async_trait]
impl ClusterLauncher for FailingLauncher {
    async fn start_agents(
        &self,
        _registry: &ComponentRegistry,
        _coordinator: Arc<DispatchNode>,
    ) -> SimResult<()> {
        Err(SimError::orchestration("no machines available"))
    }

    async fn stop_agents(&self) -> SimResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Local cluster that counts worker restarts
struct RestartCounter {
    cluster: LocalCluster,
    restarts: AtomicUsize,
}

impl RestartCounter {
    fn new(agents: u32, workers: u32) -> Arc<Self> {
        Arc::new(Self {
            cluster: LocalCluster::new(agents, workers),
            restarts: AtomicUsize::new(0),
        })
    }

    fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterLauncher for RestartCounter {
    async fn start_agents(
        &self,
        registry: &ComponentRegistry,
        coordinator: Arc<DispatchNode>,
    ) -> SimResult<()> {
        self.cluster.start_agents(registry, coordinator).await
    }

    async fn stop_agents(&self) -> SimResult<()> {
        self.cluster.stop_agents().await
    }

    async fn restart_workers(&self, registry: &ComponentRegistry) -> SimResult<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.cluster.restart_workers(registry).await
    }
}

// ============================================================================
// Builder Tests
// ============================================================================

#[test]
fn test_builder_missing_components() {
    let err = OrchestratorBuilder::new().build().unwrap_err();
    assert!(err.message.contains("suite"));

    let err = OrchestratorBuilder::new()
        .suite(suite(vec![TestCase::new("map")]))
        .build()
        .unwrap_err();
    assert!(err.message.contains("coordinator"));
}

#[tokio::test]
async fn test_builder_invalid_config() {
    let cluster = Cluster::start(1, 1).await;
    let result = OrchestratorBuilder::new()
        .config(CoordinatorConfig::new().with_send_timeout(Duration::ZERO))
        .suite(suite(vec![TestCase::new("map")]))
        .coordinator(cluster.node.clone())
        .registry(cluster.registry.clone())
        .failures(cluster.failures.clone())
        .build();

    assert_eq!(result.err().map(|e| e.kind), Some(SimErrorKind::Config));
    cluster.stop().await;
}

#[tokio::test]
async fn test_builder_rejects_empty_suite() {
    let cluster = Cluster::start(1, 1).await;
    let result = OrchestratorBuilder::new()
        .suite(TestSuite::new("empty"))
        .coordinator(cluster.node.clone())
        .registry(cluster.registry.clone())
        .failures(cluster.failures.clone())
        .build();

    assert!(result.is_err());
    cluster.stop().await;
}

// ============================================================================
// Sequential Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sequential_suite_without_failures() {
    let cluster = Cluster::start(2, 2).await;
    let orchestrator = cluster.orchestrator(fast_config(), suite(vec![TestCase::new("map")]));

    let report = orchestrator.run().await.unwrap();

    let outcome = report.outcome("map").unwrap();
    assert_eq!(outcome.status, TestStatus::Completed);
    assert_eq!(outcome.completed_phases(), TestPhase::ALL.to_vec());
    for phase in &outcome.phases {
        assert_eq!(phase.entries, 4, "phase {}", phase.phase);
        assert!(phase.is_success());
    }
    assert_eq!(report.failure_count(), 0);
    assert!(report.missing_workers.is_empty());
    assert!(report.check().is_ok());

    assert_eq!(cluster.registry.test_count(), 1);
    for agent in cluster.local.agents() {
        assert_eq!(agent.suite_id().as_deref(), Some("suite"));
    }
    assert_eq!(cluster.failures.finished_workers().len(), 4);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_failure_with_fail_fast_skips_remaining() {
    let cluster = Cluster::start(2, 2).await;
    let failing = TestCase::new("first")
        .with_property("fail_phase", "run")
        .with_property("fail_worker", "A1_W1");
    let orchestrator = cluster.orchestrator(
        fast_config(),
        suite(vec![failing, TestCase::new("second")]),
    );

    let report = orchestrator.run().await.unwrap();

    let first = report.outcome("first").unwrap();
    assert_eq!(first.status, TestStatus::Failed);
    assert_eq!(first.completed_phases().last(), Some(&TestPhase::Run));
    let run = first.phase(TestPhase::Run).unwrap();
    assert_eq!(run.entries, 4);
    assert_eq!(
        run.failures,
        vec![(SimulatorAddress::test(1, 1, 1), ResponseType::ExceptionDuringOperationExecution)]
    );

    assert_eq!(report.outcome("second").unwrap().status, TestStatus::Skipped);
    assert!(report.failure_count() >= 1);
    assert_eq!(report.check().unwrap_err().kind, SimErrorKind::TestFailures);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_without_fail_fast_runs_remaining() {
    let cluster = Cluster::start(1, 2).await;
    let failing = TestCase::new("first").with_property("fail_phase", "setup");
    let orchestrator = cluster.orchestrator(
        fast_config().with_fail_fast(false),
        suite(vec![failing, TestCase::new("second")]),
    );

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.outcome("first").unwrap().status, TestStatus::Failed);
    assert_eq!(report.outcome("second").unwrap().status, TestStatus::Completed);
    // both workers of the failing test reported
    assert_eq!(report.failure_count(), 2);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abort_before_run_skips_everything() {
    let cluster = Cluster::start(1, 1).await;
    let orchestrator = cluster.orchestrator(
        fast_config(),
        suite(vec![TestCase::new("map"), TestCase::new("queue")]),
    );
    orchestrator.abort();
    assert!(orchestrator.is_aborted());

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.count(TestStatus::Skipped), 2);
    assert!(report.missing_workers.is_empty());
    cluster.stop().await;
}

// ============================================================================
// Parallel Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_suite_completes() {
    let cluster = Cluster::start(2, 1).await;
    let tests = vec![
        TestCase::new("fast"),
        TestCase::new("slow").with_property("phase_delay_ms", "20"),
        TestCase::new("slower").with_property("phase_delay_ms", "40"),
    ];
    let orchestrator = cluster.orchestrator(fast_config().with_parallel(true), suite(tests));

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.count(TestStatus::Completed), 3);
    for outcome in &report.outcomes {
        assert_eq!(outcome.phases.len(), TestPhase::ALL.len());
        assert!(outcome.phases.iter().all(|p| p.entries == 2));
    }
    assert!(report.is_success());
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_barrier_holds_fast_test() {
    let cluster = Cluster::start(1, 1).await;
    let tests = vec![
        TestCase::new("fast"),
        TestCase::new("slow").with_property("phase_delay_ms", "50"),
    ];
    let config = fast_config()
        .with_parallel(true)
        .with_last_phase_to_sync(TestPhase::LocalWarmup);
    let orchestrator = cluster.orchestrator(config, suite(tests));

    let report = orchestrator.run().await.unwrap();

    let fast = report.outcome("fast").unwrap();
    let slow = report.outcome("slow").unwrap();
    assert_eq!(fast.status, TestStatus::Completed);
    assert_eq!(slow.status, TestStatus::Completed);

    // the fast test waits at the LOCAL_WARMUP gate until the slow SETUP is done
    let slow_setup = slow.phase(TestPhase::Setup).unwrap();
    let fast_warmup = fast.phase(TestPhase::LocalWarmup).unwrap();
    assert!(slow_setup.elapsed >= Duration::from_millis(50));
    assert!(fast_warmup.started_at >= slow_setup.started_at + chrono::Duration::milliseconds(50));
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_flag_only_keeps_siblings_running() {
    let cluster = Cluster::start(1, 2).await;
    let tests = vec![
        TestCase::new("broken").with_property("fail_phase", "setup"),
        TestCase::new("healthy"),
    ];
    let config = fast_config()
        .with_parallel(true)
        .with_parallel_fail_fast(ParallelFailFast::FlagOnly);
    let orchestrator = cluster.orchestrator(config, suite(tests));

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.outcome("broken").unwrap().status, TestStatus::Failed);
    assert_eq!(report.outcome("healthy").unwrap().status, TestStatus::Completed);
    assert!(!report.is_success());
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_abort_all_stops_siblings() {
    let cluster = Cluster::start(1, 1).await;
    let tests = vec![
        TestCase::new("broken").with_property("fail_phase", "setup"),
        TestCase::new("healthy").with_property("phase_delay_ms", "200"),
    ];
    let config = fast_config()
        .with_parallel(true)
        .with_parallel_fail_fast(ParallelFailFast::AbortAll);
    let orchestrator = cluster.orchestrator(config, suite(tests));

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.outcome("broken").unwrap().status, TestStatus::Failed);
    let healthy = report.outcome("healthy").unwrap();
    assert_eq!(healthy.status, TestStatus::Aborted);
    assert_eq!(healthy.completed_phases(), vec![TestPhase::Setup]);
    assert!(orchestrator.is_aborted());
    cluster.stop().await;
}

// ============================================================================
// RUN phase and worker failures
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timed_run_stops_tests() {
    let cluster = Cluster::start(1, 2).await;
    let endless = TestCase::new("endless")
        .with_property("iterations", "1000000")
        .with_property("iteration_delay_ms", "5");
    let config = fast_config().with_run_duration(Duration::from_millis(100));
    let orchestrator = cluster.orchestrator(config, suite(vec![endless]));

    let report = tokio::time::timeout(Duration::from_secs(10), orchestrator.run())
        .await
        .unwrap()
        .unwrap();

    let outcome = report.outcome("endless").unwrap();
    assert_eq!(outcome.status, TestStatus::Completed);
    let run = outcome.phase(TestPhase::Run).unwrap();
    assert!(run.elapsed >= Duration::from_millis(100));
    assert_eq!(run.entries, 2);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_suite_duration_used_without_config_duration() {
    let cluster = Cluster::start(1, 1).await;
    let endless = TestCase::new("endless")
        .with_property("iterations", "1000000")
        .with_property("iteration_delay_ms", "5");
    let suite = suite(vec![endless]).with_duration(Duration::from_millis(50));
    let orchestrator = cluster.orchestrator(fast_config(), suite);

    let report = tokio::time::timeout(Duration::from_secs(10), orchestrator.run())
        .await
        .unwrap()
        .unwrap();

    assert!(report.is_success());
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_oom_unblocks_phase() {
    let cluster = Cluster::start(2, 2).await;
    let oom = TestCase::new("oom")
        .with_property("fail_phase", "run")
        .with_property("failure_type", "oom")
        .with_property("fail_worker", "A1_W1");
    let orchestrator = cluster.orchestrator(fast_config(), suite(vec![oom]));

    let report = tokio::time::timeout(Duration::from_secs(5), orchestrator.run())
        .await
        .unwrap()
        .unwrap();

    let outcome = report.outcome("oom").unwrap();
    assert_eq!(outcome.status, TestStatus::Failed);
    let run = outcome.phase(TestPhase::Run).unwrap();
    assert_eq!(run.entries, 4);
    assert_eq!(
        run.failures,
        vec![(SimulatorAddress::worker(1, 1), ResponseType::Unblocked)]
    );
    assert_eq!(report.failure_count(), 1);
    assert!(cluster
        .failures
        .finished_workers()
        .contains(&SimulatorAddress::worker(1, 1)));
    cluster.local.stop_agents().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_phase_hits_send_timeout() {
    let cluster = Cluster::start(1, 1).await;
    let slow = TestCase::new("slow").with_property("phase_delay_ms", "1000");
    let config = fast_config().with_send_timeout(Duration::from_millis(100));
    let orchestrator = cluster.orchestrator(config, suite(vec![slow]));

    let report = orchestrator.run().await.unwrap();

    let outcome = report.outcome("slow").unwrap();
    assert_eq!(outcome.status, TestStatus::Failed);
    assert_eq!(outcome.completed_phases(), vec![TestPhase::Setup]);
    assert!(outcome.error.as_ref().unwrap().contains("no response"));
    assert_eq!(report.failures[0].failure_type, FailureType::WorkerTimeout);
    assert_eq!(report.failures[0].reporter, SimulatorAddress::COORDINATOR);
    cluster.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_long_phases_follow_coordinator_send_timeout() {
    let cluster = Cluster::start(1, 2).await;
    let long = TestCase::new("long")
        .with_property("phase_delay_ms", "70000")
        .with_property("iterations", "1000000")
        .with_property("iteration_delay_ms", "1000");
    let config = fast_config()
        .with_send_timeout(Duration::from_secs(300))
        .with_run_duration(Duration::from_secs(90));
    let orchestrator = cluster.orchestrator(config, suite(vec![long]));

    let report = orchestrator.run().await.unwrap();

    let outcome = report.outcome("long").unwrap();
    assert_eq!(outcome.status, TestStatus::Completed);
    assert!(outcome.phase(TestPhase::Run).unwrap().elapsed >= Duration::from_secs(90));
    assert_eq!(report.failure_count(), 0);
    cluster.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_untimed_run_outlasts_send_timeout() {
    let cluster = Cluster::start(1, 1).await;
    let long = TestCase::new("long")
        .with_property("iterations", "120")
        .with_property("iteration_delay_ms", "1000");
    let config = fast_config().with_send_timeout(Duration::from_secs(30));
    let orchestrator = cluster.orchestrator(config, suite(vec![long]));

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.outcome("long").unwrap().status, TestStatus::Completed);
    assert_eq!(report.failure_count(), 0);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_worker_is_only_a_warning() {
    let cluster = Cluster::start(1, 1).await;
    // registered, but never started
    cluster.registry.add_worker(1, 9).unwrap();
    let config = fast_config().with_worker_shutdown_timeout(Duration::from_millis(100));
    let orchestrator = cluster.orchestrator(config, suite(vec![TestCase::new("map")]));

    let report = orchestrator.run().await.unwrap();

    assert_eq!(
        report.missing_workers.iter().copied().collect::<Vec<_>>(),
        vec![SimulatorAddress::worker(1, 9)]
    );
    assert_eq!(report.failure_count(), 0);
    cluster.stop().await;
}

// ============================================================================
// Coordinator Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coordinator_run_succeeds() {
    let launcher = Arc::new(LocalCluster::new(2, 2));
    let coordinator = Coordinator::builder()
        .config(fast_config())
        .launcher(launcher.clone())
        .build()
        .unwrap();

    let report = coordinator.run(suite(vec![TestCase::new("map")])).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.count(TestStatus::Completed), 1);
    assert_eq!(coordinator.registry().worker_count(), 4);
    assert!(!launcher.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coordinator_run_fails_on_failures() {
    let launcher = Arc::new(LocalCluster::new(1, 1));
    let coordinator = Coordinator::builder()
        .config(fast_config())
        .launcher(launcher.clone())
        .build()
        .unwrap();
    let failing = TestCase::new("map").with_property("fail_phase", "global_verify");

    let err = coordinator.run(suite(vec![failing])).await.unwrap_err();

    assert_eq!(err.kind, SimErrorKind::TestFailures);
    assert!(!launcher.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_test_restarts_workers_before_the_next() {
    let launcher = RestartCounter::new(1, 2);
    let coordinator = Coordinator::builder()
        .config(fast_config().with_fail_fast(false))
        .launcher(launcher.clone())
        .build()
        .unwrap();
    let crash = TestCase::new("crash")
        .with_property("fail_phase", "global_warmup")
        .with_property("failure_type", "exit")
        .with_property("fail_worker", "A1_W1");

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        coordinator.run_suite(suite(vec![crash, TestCase::new("map")])),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(report.outcome("crash").unwrap().status, TestStatus::Failed);
    assert_eq!(report.outcome("map").unwrap().status, TestStatus::Completed);
    assert_eq!(
        report.outcome("map").unwrap().phase(TestPhase::Run).unwrap().entries,
        2
    );
    assert_eq!(launcher.restarts(), 1);
    assert!(report.missing_workers.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_restart_after_the_last_test() {
    let launcher = RestartCounter::new(1, 1);
    let coordinator = Coordinator::builder()
        .config(fast_config().with_fail_fast(false))
        .launcher(launcher.clone())
        .build()
        .unwrap();
    let failing = TestCase::new("verify").with_property("fail_phase", "global_verify");

    let report = coordinator
        .run_suite(suite(vec![TestCase::new("map"), failing]))
        .await
        .unwrap();

    assert_eq!(report.outcome("map").unwrap().status, TestStatus::Completed);
    assert_eq!(report.outcome("verify").unwrap().status, TestStatus::Failed);
    assert_eq!(launcher.restarts(), 0);
}

#[tokio::test]
async fn test_coordinator_stops_agents_when_start_fails() {
    let launcher = Arc::new(FailingLauncher::default());
    let coordinator = Coordinator::builder()
        .config(fast_config())
        .launcher(launcher.clone())
        .build()
        .unwrap();

    let err = coordinator
        .run_suite(suite(vec![TestCase::new("map")]))
        .await
        .unwrap_err();

    assert_eq!(err.kind, SimErrorKind::Orchestration);
    assert!(err.message.contains("no machines available"));
    assert_eq!(launcher.stops.load(Ordering::SeqCst), 1);
}
