//! YAML configuration file.
//!
//! One file holds every named API profile and test profile plus the
//! monitoring, analysis and data blocks. The whole file is validated when it
//! is loaded, and a [`TestConfig`] is validated again when it is resolved into
//! a [`TestPlan`] (after CLI overrides are applied), so no request is ever
//! issued against an invalid plan.
//!
//! ```yaml
//! api_configs:
//!   openai:
//!     name: OpenAI
//!     base_url: https://api.openai.com/v1
//!     endpoints: { chat: /chat/completions }
//!     headers: { Authorization: "Bearer {api_key}" }
//!     request_format:
//!       model: gpt-4o-mini
//!       messages: [{ role: user, content: "{prompt}" }]
//! test_configs:
//!   default:
//!     name: Default sweep
//!     concurrent_levels: [1, 5, 10]
//!     requests_per_level: 50
//!     timeout: 30s
//!     retry_count: 2
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::time::Duration;

use crate::config_validation::{
    LevelListValidator, RangeValidator, UrlValidator, ValidationContext,
};
use crate::executor::RetryPolicy;
use crate::template::ApiProfile;
use crate::utils::parse_duration_string;

/// Errors that can occur when loading or resolving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Unknown API profile '{name}' (available: {available})")]
    UnknownApi { name: String, available: String },

    #[error("Unknown test profile '{name}' (available: {available})")]
    UnknownTest { name: String, available: String },
}

/// Duration as written in YAML: integer or fractional seconds, or a string
/// such as "500ms", "30s", "5m".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YamlDuration {
    Seconds(u64),
    FractionalSeconds(f64),
    String(String),
}

impl YamlDuration {
    pub fn to_duration(&self) -> Result<Duration, String> {
        match self {
            YamlDuration::Seconds(s) => Ok(Duration::from_secs(*s)),
            YamlDuration::FractionalSeconds(s) => Duration::try_from_secs_f64(*s)
                .map_err(|_| format!("Invalid duration: {} seconds", s)),
            YamlDuration::String(s) => {
                parse_duration_string(s).map_err(|e| format!("Invalid duration '{}': {}", s, e))
            }
        }
    }
}

impl From<Duration> for YamlDuration {
    fn from(d: Duration) -> Self {
        YamlDuration::String(format!("{}ms", d.as_millis()))
    }
}

/// One named test profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestConfig {
    pub name: String,

    /// Concurrency levels, executed in this order
    pub concurrent_levels: Vec<u32>,

    pub requests_per_level: usize,

    /// Per-attempt timeout
    #[serde(default = "default_timeout")]
    pub timeout: YamlDuration,

    /// Additional attempts after the first one
    #[serde(default)]
    pub retry_count: u32,

    /// Pause before the first level
    #[serde(default = "zero_duration")]
    pub ramp_up_time: YamlDuration,

    /// Pause between levels
    #[serde(default = "zero_duration")]
    pub cool_down_time: YamlDuration,

    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay: YamlDuration,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: YamlDuration,
}

fn default_timeout() -> YamlDuration {
    YamlDuration::Seconds(30)
}

fn zero_duration() -> YamlDuration {
    YamlDuration::Seconds(0)
}

fn default_retry_initial_delay() -> YamlDuration {
    YamlDuration::Seconds(1)
}

fn default_retry_max_delay() -> YamlDuration {
    YamlDuration::Seconds(10)
}

/// A validated test profile with concrete durations.
#[derive(Debug, Clone, PartialEq)]
pub struct TestPlan {
    pub name: String,
    pub levels: Vec<u32>,
    pub requests_per_level: usize,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub ramp_up: Duration,
    pub cool_down: Duration,
}

impl TestConfig {
    fn validate_into(&self, ctx: &mut ValidationContext) -> Option<TestPlan> {
        ctx.check(LevelListValidator::validate(&self.concurrent_levels));

        ctx.enter("requests_per_level");
        ctx.check(RangeValidator::validate_positive_u64(
            self.requests_per_level as u64,
            "requests_per_level",
        ));
        ctx.exit();

        ctx.enter("retry_count");
        ctx.check(RangeValidator::validate_u64(
            u64::from(self.retry_count),
            0,
            20,
            "retry_count",
        ));
        ctx.exit();

        let timeout = resolve_duration(ctx, "timeout", &self.timeout);
        if timeout == Some(Duration::ZERO) {
            ctx.enter("timeout");
            ctx.field_error("timeout must be greater than zero".to_string());
            ctx.exit();
        }
        let ramp_up = resolve_duration(ctx, "ramp_up_time", &self.ramp_up_time);
        let cool_down = resolve_duration(ctx, "cool_down_time", &self.cool_down_time);
        let initial_delay = resolve_duration(ctx, "retry_initial_delay", &self.retry_initial_delay);
        let max_delay = resolve_duration(ctx, "retry_max_delay", &self.retry_max_delay);

        if let (Some(initial), Some(max)) = (initial_delay, max_delay) {
            if initial > max {
                ctx.enter("retry_initial_delay");
                ctx.field_error(format!(
                    "retry_initial_delay ({:?}) exceeds retry_max_delay ({:?})",
                    initial, max
                ));
                ctx.exit();
            }
        }

        Some(TestPlan {
            name: self.name.clone(),
            levels: self.concurrent_levels.clone(),
            requests_per_level: self.requests_per_level,
            timeout: timeout?,
            retry: RetryPolicy {
                max_retries: self.retry_count,
                initial_delay: initial_delay?,
                max_delay: max_delay?,
            },
            ramp_up: ramp_up?,
            cool_down: cool_down?,
        })
    }

    /// Validate and resolve into a [`TestPlan`].
    pub fn to_plan(&self) -> Result<TestPlan, ConfigError> {
        let mut ctx = ValidationContext::new();
        let plan = self.validate_into(&mut ctx);
        ctx.into_result()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        plan.ok_or_else(|| ConfigError::Validation("unresolvable test profile".to_string()))
    }
}

fn resolve_duration(
    ctx: &mut ValidationContext,
    field: &str,
    value: &YamlDuration,
) -> Option<Duration> {
    match value.to_duration() {
        Ok(d) => Some(d),
        Err(e) => {
            ctx.enter(field);
            ctx.field_error(e);
            ctx.exit();
            None
        }
    }
}

/// How the network prober reaches the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    /// HEAD request against the health URL or base URL
    #[default]
    Http,
    /// Plain TCP connect to host:port
    Tcp,
}

/// Settings for the network quality prober.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitoringConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_probe_interval")]
    pub probe_interval: YamlDuration,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: YamlDuration,

    #[serde(default)]
    pub method: ProbeMethod,

    /// Explicit probe target (URL for http, host:port for tcp). Defaults to
    /// the API profile's health URL or base URL.
    #[serde(default)]
    pub target: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_probe_interval() -> YamlDuration {
    YamlDuration::Seconds(5)
}

fn default_probe_timeout() -> YamlDuration {
    YamlDuration::Seconds(2)
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_interval: default_probe_interval(),
            probe_timeout: default_probe_timeout(),
            method: ProbeMethod::Http,
            target: None,
        }
    }
}

/// Thresholds used for optimal-concurrency detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Minimum relative RPS gain for a level to count as an improvement
    #[serde(default = "default_rps_gain_tolerance")]
    pub rps_gain_tolerance: f64,

    /// Maximum error rate (0.0 - 1.0) for a level to qualify
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
}

fn default_rps_gain_tolerance() -> f64 {
    0.05
}

fn default_max_error_rate() -> f64 {
    0.05
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            rps_gain_tolerance: default_rps_gain_tolerance(),
            max_error_rate: default_max_error_rate(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    /// Prompt file (.jsonl, .csv or plain text)
    #[serde(default)]
    pub prompt_file: Option<PathBuf>,
}

/// Root of the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
    #[serde(default)]
    pub api_configs: BTreeMap<String, ApiProfile>,

    #[serde(default)]
    pub test_configs: BTreeMap<String, TestConfig>,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub data: DataConfig,
}

impl SuiteConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: SuiteConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every profile, collecting all problems.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ctx = ValidationContext::new();

        ctx.enter("api_configs");
        for (key, profile) in &self.api_configs {
            ctx.enter(key);
            validate_profile(&mut ctx, profile);
            ctx.exit();
        }
        ctx.exit();

        ctx.enter("test_configs");
        for (key, test) in &self.test_configs {
            ctx.enter(key);
            test.validate_into(&mut ctx);
            ctx.exit();
        }
        ctx.exit();

        ctx.enter("monitoring");
        for (field, value) in [
            ("probe_interval", &self.monitoring.probe_interval),
            ("probe_timeout", &self.monitoring.probe_timeout),
        ] {
            if resolve_duration(&mut ctx, field, value) == Some(Duration::ZERO) {
                ctx.enter(field);
                ctx.field_error(format!("{} must be greater than zero", field));
                ctx.exit();
            }
        }
        ctx.exit();

        ctx.enter("analysis");
        ctx.check(RangeValidator::validate_f64(
            self.analysis.rps_gain_tolerance,
            0.0,
            1.0,
            "rps_gain_tolerance",
        ));
        ctx.check(RangeValidator::validate_f64(
            self.analysis.max_error_rate,
            0.0,
            1.0,
            "max_error_rate",
        ));
        ctx.exit();

        ctx.into_result()
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    pub fn api(&self, name: &str) -> Result<&ApiProfile, ConfigError> {
        self.api_configs
            .get(name)
            .ok_or_else(|| ConfigError::UnknownApi {
                name: name.to_string(),
                available: join_keys(&self.api_configs),
            })
    }

    pub fn test(&self, name: &str) -> Result<&TestConfig, ConfigError> {
        self.test_configs
            .get(name)
            .ok_or_else(|| ConfigError::UnknownTest {
                name: name.to_string(),
                available: join_keys(&self.test_configs),
            })
    }

    /// Probe interval and timeout, resolved.
    pub fn probe_timing(&self) -> Result<(Duration, Duration), ConfigError> {
        let interval = self
            .monitoring
            .probe_interval
            .to_duration()
            .map_err(ConfigError::Validation)?;
        let timeout = self
            .monitoring
            .probe_timeout
            .to_duration()
            .map_err(ConfigError::Validation)?;
        Ok((interval, timeout))
    }
}

fn validate_profile(ctx: &mut ValidationContext, profile: &ApiProfile) {
    ctx.enter("base_url");
    ctx.check(UrlValidator::validate(&profile.base_url));
    ctx.exit();

    ctx.enter("method");
    match profile.method.to_uppercase().as_str() {
        "GET" | "POST" | "PUT" | "PATCH" | "DELETE" => {}
        other => ctx.field_error(format!("Unsupported HTTP method '{}'", other)),
    }
    ctx.exit();

    ctx.enter("endpoints");
    if profile.endpoints.is_empty() {
        ctx.field_error("At least one endpoint must be defined".to_string());
    }
    ctx.exit();

    if let Some(health_url) = &profile.health_url {
        ctx.enter("health_url");
        ctx.check(UrlValidator::validate(health_url));
        ctx.exit();
    }
}

fn join_keys<V>(map: &BTreeMap<String, V>) -> String {
    if map.is_empty() {
        return "none".to_string();
    }
    map.keys().cloned().collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
api_configs:
  openai:
    name: OpenAI
    base_url: https://api.openai.com/v1
    endpoints:
      chat: /chat/completions
    headers:
      Authorization: "Bearer {api_key}"
    request_format:
      model: gpt-4o-mini
      messages:
        - role: user
          content: "{prompt}"
test_configs:
  quick:
    name: Quick sweep
    concurrent_levels: [1, 2, 4]
    requests_per_level: 10
    timeout: 15
    retry_count: 2
    ramp_up_time: 500ms
    cool_down_time: 2s
monitoring:
  probe_interval: 1s
  method: tcp
analysis:
  max_error_rate: 0.1
"#;

    #[test]
    fn test_parse_sample() {
        let config = SuiteConfig::from_str(SAMPLE).unwrap();
        assert_eq!(config.api("openai").unwrap().name, "OpenAI");
        assert_eq!(config.monitoring.method, ProbeMethod::Tcp);
        assert!(config.monitoring.enabled);
        assert_eq!(config.analysis.max_error_rate, 0.1);
        assert_eq!(config.analysis.rps_gain_tolerance, 0.05);

        let plan = config.test("quick").unwrap().to_plan().unwrap();
        assert_eq!(plan.levels, vec![1, 2, 4]);
        assert_eq!(plan.requests_per_level, 10);
        assert_eq!(plan.timeout, Duration::from_secs(15));
        assert_eq!(plan.ramp_up, Duration::from_millis(500));
        assert_eq!(plan.cool_down, Duration::from_secs(2));
        assert_eq!(plan.retry.max_retries, 2);
        assert_eq!(plan.retry.initial_delay, Duration::from_secs(1));
        assert_eq!(plan.retry.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_fractional_seconds() {
        assert_eq!(
            YamlDuration::FractionalSeconds(0.25).to_duration().unwrap(),
            Duration::from_millis(250)
        );
        assert!(YamlDuration::FractionalSeconds(-1.0).to_duration().is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = SAMPLE.replace("retry_count: 2", "retry_count: 2\n    retries: 3");
        assert!(matches!(
            SuiteConfig::from_str(&yaml),
            Err(ConfigError::YamlParse(_))
        ));
    }

    #[test]
    fn test_empty_levels_rejected() {
        let yaml = SAMPLE.replace("[1, 2, 4]", "[]");
        let err = SuiteConfig::from_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("concurrent_levels"), "{}", err);
    }

    #[test]
    fn test_zero_level_rejected() {
        let yaml = SAMPLE.replace("[1, 2, 4]", "[1, 0]");
        assert!(matches!(
            SuiteConfig::from_str(&yaml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_negative_level_rejected_by_parser() {
        let yaml = SAMPLE.replace("[1, 2, 4]", "[1, -2]");
        assert!(SuiteConfig::from_str(&yaml).is_err());
    }

    #[test]
    fn test_zero_requests_rejected() {
        let yaml = SAMPLE.replace("requests_per_level: 10", "requests_per_level: 0");
        let err = SuiteConfig::from_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("requests_per_level"), "{}", err);
    }

    #[test]
    fn test_multiple_errors_reported_together() {
        let yaml = SAMPLE
            .replace("[1, 2, 4]", "[]")
            .replace("requests_per_level: 10", "requests_per_level: 0")
            .replace("timeout: 15", "timeout: soon");
        let err = SuiteConfig::from_str(&yaml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Multiple validation errors"), "{}", msg);
        assert!(msg.contains("timeout"), "{}", msg);
    }

    #[test]
    fn test_unknown_profiles() {
        let config = SuiteConfig::from_str(SAMPLE).unwrap();
        let err = config.api("claude").unwrap_err();
        assert!(err.to_string().contains("available: openai"));
        assert!(matches!(
            config.test("nope"),
            Err(ConfigError::UnknownTest { .. })
        ));
    }

    #[test]
    fn test_bad_base_url() {
        let yaml = SAMPLE.replace("https://api.openai.com/v1", "api.openai.com");
        let err = SuiteConfig::from_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("api_configs.openai.base_url"), "{}", err);
    }

    #[test]
    fn test_retry_delays_ordered() {
        let yaml = SAMPLE.replace(
            "retry_count: 2",
            "retry_count: 2\n    retry_initial_delay: 20s\n    retry_max_delay: 5s",
        );
        assert!(SuiteConfig::from_str(&yaml).is_err());
    }

    #[test]
    fn test_plan_revalidates_overrides() {
        let config = SuiteConfig::from_str(SAMPLE).unwrap();
        let mut test = config.test("quick").unwrap().clone();
        test.concurrent_levels = vec![0];
        assert!(test.to_plan().is_err());
    }

    #[test]
    fn test_empty_file_is_valid() {
        let config = SuiteConfig::from_str("{}").unwrap();
        assert!(config.api_configs.is_empty());
        assert_eq!(
            config.probe_timing().unwrap(),
            (Duration::from_secs(5), Duration::from_secs(2))
        );
    }
}
