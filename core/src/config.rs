//! Coordinator configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::suite::TestPhase;

/// What a failing test does to its siblings when tests run in parallel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelFailFast {
    /// Record the failure and let the other tests finish
    #[default]
    FlagOnly,
    /// Stop every running test after its current phase
    AbortAll,
}

impl std::str::FromStr for ParallelFailFast {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "flag_only" | "flag" => Ok(ParallelFailFast::FlagOnly),
            "abort_all" | "abort" => Ok(ParallelFailFast::AbortAll),
            other => Err(ConfigError::InvalidPolicy(other.to_string())),
        }
    }
}

/// Coordinator configuration
///
/// Controls how the test suite is scheduled, when it is aborted, and how
/// long the coordinator waits on the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Run all test cases at the same time instead of one after another
    pub parallel: bool,

    /// Stop after the first failing test case
    pub fail_fast: bool,

    /// Fail-fast behavior in parallel mode
    pub parallel_fail_fast: ParallelFailFast,

    /// Last phase whose start is synchronized across parallel test cases
    pub last_phase_to_sync: TestPhase,

    /// How long a single phase request may take
    #[serde(with = "millis")]
    pub send_timeout: Duration,

    /// How long to wait for workers to confirm shutdown
    #[serde(with = "millis")]
    pub worker_shutdown_timeout: Duration,

    /// Interval between worker shutdown checks
    #[serde(with = "millis")]
    pub shutdown_poll_interval: Duration,

    /// Interval between failure checks during a timed RUN phase
    #[serde(with = "millis")]
    pub failure_check_interval: Duration,

    /// RUN phase duration; overrides the suite's own duration
    #[serde(with = "optional_millis", skip_serializing_if = "Option::is_none")]
    pub run_duration: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            fail_fast: true,
            parallel_fail_fast: ParallelFailFast::default(),
            last_phase_to_sync: TestPhase::last(),
            send_timeout: Duration::from_secs(300),
            worker_shutdown_timeout: Duration::from_secs(120),
            shutdown_poll_interval: Duration::from_millis(500),
            failure_check_interval: Duration::from_secs(1),
            run_duration: None,
        }
    }
}

impl CoordinatorConfig {
    /// Create a config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Run test cases in parallel
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Enable or disable fail-fast
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Set the parallel fail-fast policy
    pub fn with_parallel_fail_fast(mut self, policy: ParallelFailFast) -> Self {
        self.parallel_fail_fast = policy;
        self
    }

    /// Set the last synchronized phase
    pub fn with_last_phase_to_sync(mut self, phase: TestPhase) -> Self {
        self.last_phase_to_sync = phase;
        self
    }

    /// Set the per-phase send timeout
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set the worker shutdown timeout
    pub fn with_worker_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.worker_shutdown_timeout = timeout;
        self
    }

    /// Set the worker shutdown poll interval
    pub fn with_shutdown_poll_interval(mut self, interval: Duration) -> Self {
        self.shutdown_poll_interval = interval;
        self
    }

    /// Set the failure check interval of timed RUN phases
    pub fn with_failure_check_interval(mut self, interval: Duration) -> Self {
        self.failure_check_interval = interval;
        self
    }

    /// Set the RUN phase duration
    pub fn with_run_duration(mut self, duration: Duration) -> Self {
        self.run_duration = Some(duration);
        self
    }

    /// Whether `phase` is synchronized across parallel test cases
    pub fn syncs(&self, phase: TestPhase) -> bool {
        self.parallel && phase <= self.last_phase_to_sync
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "send timeout must be positive".into(),
            ));
        }

        if self.shutdown_poll_interval.is_zero() || self.failure_check_interval.is_zero() {
            return Err(ConfigError::InvalidInterval(
                "poll intervals must be positive".into(),
            ));
        }

        if self.shutdown_poll_interval > self.worker_shutdown_timeout {
            return Err(ConfigError::InvalidInterval(format!(
                "shutdown poll interval {:?} exceeds the shutdown timeout {:?}",
                self.shutdown_poll_interval, self.worker_shutdown_timeout
            )));
        }

        if self.run_duration.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::InvalidDuration(
                "run duration must be positive".into(),
            ));
        }

        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid timeout
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),

    /// Invalid poll interval
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    /// Invalid run duration
    #[error("Invalid run duration: {0}")]
    InvalidDuration(String),

    /// Unknown fail-fast policy
    #[error("Invalid parallel fail-fast policy: {0}")]
    InvalidPolicy(String),
}

impl From<ConfigError> for SimError {
    fn from(err: ConfigError) -> Self {
        SimError::config(err.to_string())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SimErrorKind;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert!(!config.parallel);
        assert!(config.fail_fast);
        assert_eq!(config.parallel_fail_fast, ParallelFailFast::FlagOnly);
        assert_eq!(config.last_phase_to_sync, TestPhase::LocalTeardown);
        assert!(config.run_duration.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_pattern() {
        let config = CoordinatorConfig::new()
            .with_parallel(true)
            .with_fail_fast(false)
            .with_parallel_fail_fast(ParallelFailFast::AbortAll)
            .with_last_phase_to_sync(TestPhase::Run)
            .with_send_timeout(Duration::from_secs(5))
            .with_run_duration(Duration::from_secs(30));

        assert!(config.parallel);
        assert!(!config.fail_fast);
        assert_eq!(config.parallel_fail_fast, ParallelFailFast::AbortAll);
        assert_eq!(config.send_timeout, Duration::from_secs(5));
        assert_eq!(config.run_duration, Some(Duration::from_secs(30)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_syncs_only_in_parallel_mode() {
        let sequential = CoordinatorConfig::new().with_last_phase_to_sync(TestPhase::Run);
        assert!(!sequential.syncs(TestPhase::Setup));

        let parallel = sequential.with_parallel(true);
        assert!(parallel.syncs(TestPhase::Setup));
        assert!(parallel.syncs(TestPhase::Run));
        assert!(!parallel.syncs(TestPhase::GlobalVerify));
    }

    #[test]
    fn test_config_validation_zero_send_timeout() {
        let config = CoordinatorConfig::new().with_send_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTimeout(_))));
    }

    #[test]
    fn test_config_validation_poll_interval() {
        let config = CoordinatorConfig::new().with_shutdown_poll_interval(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = CoordinatorConfig::new()
            .with_worker_shutdown_timeout(Duration::from_millis(100))
            .with_shutdown_poll_interval(Duration::from_secs(1));
        assert!(matches!(config.validate(), Err(ConfigError::InvalidInterval(_))));
    }

    #[test]
    fn test_config_validation_zero_run_duration() {
        let config = CoordinatorConfig::new().with_run_duration(Duration::ZERO);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidDuration(_))));
    }

    #[test]
    fn test_config_error_into_sim_error() {
        let err: SimError = ConfigError::InvalidTimeout("zero".into()).into();
        assert_eq!(err.kind, SimErrorKind::Config);
        assert!(err.message.contains("zero"));
    }

    #[test]
    fn test_parallel_fail_fast_from_str() {
        assert_eq!("abort-all".parse::<ParallelFailFast>().unwrap(), ParallelFailFast::AbortAll);
        assert_eq!("flag_only".parse::<ParallelFailFast>().unwrap(), ParallelFailFast::FlagOnly);
        assert!("panic".parse::<ParallelFailFast>().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = CoordinatorConfig::new()
            .with_parallel(true)
            .with_run_duration(Duration::from_millis(1500));

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"run_duration\":1500"));
        assert!(json.contains("\"parallel_fail_fast\":\"flag_only\""));

        let deserialized: CoordinatorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, config);
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"parallel": true, "send_timeout": 2000}"#).unwrap();
        assert!(config.parallel);
        assert!(config.fail_fast);
        assert_eq!(config.send_timeout, Duration::from_secs(2));
    }
}
