//! CLI argument parsing and command dispatch

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use simbench_core::{
    ComponentRegistry, Coordinator, CoordinatorConfig, LocalCluster, ParallelFailFast, SuiteReport,
    TestPhase, TestStatus, TestSuite,
};

#[derive(Parser)]
#[command(name = "simbench")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a test suite against an in-process cluster
    Run(RunArgs),
    /// Validate a test suite and agents file without running them
    Validate {
        /// Path to the test suite JSON file
        #[arg(short, long)]
        test_suite: PathBuf,

        /// Path to the agents file
        #[arg(short, long)]
        agents: Option<PathBuf>,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to the test suite JSON file
    #[arg(short, long, env = "SIMBENCH_TEST_SUITE")]
    pub test_suite: PathBuf,

    /// Agents file, one `publicAddress[,privateAddress]` per line
    #[arg(short, long, env = "SIMBENCH_AGENTS")]
    pub agents: Option<PathBuf>,

    /// Number of agents when no agents file is given
    #[arg(long, default_value_t = 1)]
    pub agents_count: u32,

    /// Workers started on every agent
    #[arg(long, default_value_t = 1)]
    pub workers_per_agent: u32,

    /// Run the test cases concurrently
    #[arg(long)]
    pub parallel: bool,

    /// Stop the suite on the first failure
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub fail_fast: bool,

    /// What a failing test does to its siblings in parallel mode (flag_only, abort_all)
    #[arg(long, default_value = "flag_only")]
    pub parallel_fail_fast: ParallelFailFast,

    /// Last phase synchronized across parallel tests
    #[arg(long, default_value = "local_teardown")]
    pub sync_to_phase: TestPhase,

    /// Seconds to wait for a response before giving up
    #[arg(long, default_value_t = 300)]
    pub send_timeout_secs: u64,

    /// Seconds to wait for the workers to shut down
    #[arg(long, default_value_t = 120)]
    pub worker_shutdown_timeout_secs: u64,

    /// Seconds the RUN phase lasts; overrides the suite's duration
    #[arg(long)]
    pub run_duration_secs: Option<u64>,
}

impl RunArgs {
    fn config(&self) -> CoordinatorConfig {
        let config = CoordinatorConfig::new()
            .with_parallel(self.parallel)
            .with_fail_fast(self.fail_fast)
            .with_parallel_fail_fast(self.parallel_fail_fast)
            .with_last_phase_to_sync(self.sync_to_phase)
            .with_send_timeout(Duration::from_secs(self.send_timeout_secs))
            .with_worker_shutdown_timeout(Duration::from_secs(self.worker_shutdown_timeout_secs));
        match self.run_duration_secs {
            Some(secs) => config.with_run_duration(Duration::from_secs(secs)),
            None => config,
        }
    }

    fn registry(&self) -> Result<ComponentRegistry> {
        match &self.agents {
            Some(path) => ComponentRegistry::from_agents_file(path)
                .with_context(|| format!("Failed to load agents file {}", path.display())),
            None => Ok(ComponentRegistry::new()),
        }
    }
}

impl Cli {
    /// Dispatch the selected command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run(args) => run(args).await,
            Commands::Validate { test_suite, agents } => validate(&test_suite, agents.as_deref()),
        }
    }
}

fn load_suite(path: &std::path::Path) -> Result<TestSuite> {
    let suite = TestSuite::load(path)
        .with_context(|| format!("Failed to load test suite {}", path.display()))?;
    suite
        .validate()
        .with_context(|| format!("Invalid test suite {}", path.display()))?;
    Ok(suite)
}

async fn run(args: RunArgs) -> Result<()> {
    let suite = load_suite(&args.test_suite)?;
    let registry = Arc::new(args.registry()?);
    let launcher = Arc::new(LocalCluster::new(args.agents_count, args.workers_per_agent));

    let coordinator = Coordinator::builder()
        .config(args.config())
        .registry(registry)
        .launcher(launcher)
        .handle_signals(true)
        .build()
        .context("Invalid coordinator configuration")?;

    tracing::info!(
        suite_id = %suite.id,
        tests = suite.size(),
        parallel = args.parallel,
        "Starting test suite"
    );
    let report = coordinator
        .run_suite(suite)
        .await
        .context("Test suite did not complete")?;

    print_summary(&report);
    report.check()?;
    Ok(())
}

fn validate(test_suite: &std::path::Path, agents: Option<&std::path::Path>) -> Result<()> {
    let suite = load_suite(test_suite)?;
    println!("Test suite {} is valid ({} tests)", suite.id, suite.size());
    for test in &suite.tests {
        println!("  {} ({} properties)", test.id, test.properties.len());
    }

    if let Some(path) = agents {
        let registry = ComponentRegistry::from_agents_file(path)
            .with_context(|| format!("Failed to load agents file {}", path.display()))?;
        println!("Agents file {} lists {} agents", path.display(), registry.agent_count());
    }
    Ok(())
}

fn print_summary(report: &SuiteReport) {
    let width = report
        .outcomes
        .iter()
        .map(|o| o.test_id.len())
        .max()
        .unwrap_or(0);

    println!();
    println!("Test suite {} finished in {:.1}s", report.suite_id, report.elapsed.as_secs_f64());
    for outcome in &report.outcomes {
        println!(
            "  {:width$}  {:9}  {} phases  {:.1}s",
            outcome.test_id,
            outcome.status.to_string(),
            outcome.phases.len(),
            outcome.elapsed().as_secs_f64(),
            width = width
        );
    }
    println!(
        "Completed: {}, failed: {}, aborted: {}, skipped: {}",
        report.count(TestStatus::Completed),
        report.count(TestStatus::Failed),
        report.count(TestStatus::Aborted),
        report.count(TestStatus::Skipped)
    );
    if !report.missing_workers.is_empty() {
        println!("Workers that did not shut down: {:?}", report.missing_workers);
    }
    for failure in &report.failures {
        println!("  {}", failure);
    }
    println!("Failures: {}", report.failure_count());
}
