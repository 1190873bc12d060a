//! Engine configuration.
//!
//! Every field has a default, so an empty document is a valid
//! configuration.
//!
//! ```yaml
//! timestamps:
//!   clock_skew_secs: 60
//!   max_age_secs: 300
//!
//! nonces:
//!   ttl_secs: 300
//!
//! keys:
//!   overlap_days: 30
//!   cleanup_grace_days: 90
//!
//! budget:
//!   default_period_limit: 1000
//!   default_per_action_limit: 100
//!   reset:
//!     kind: fixed_utc
//!     period_secs: 86400
//!   history_retention_secs: 604800
//!   alert_thresholds: [80, 90, 100]
//!
//! resources:
//!   global_denies:
//!     - "org:*/secrets/**"
//!
//! witnesses:
//!   default_trust: 0.5
//!   attestation_max_age_secs: 3600
//!
//! sweeper:
//!   enabled: true
//!   interval_secs: 60
//! ```

use crate::budget::{
    ResetPolicy, DEFAULT_ALERT_THRESHOLDS, DEFAULT_HISTORY_RETENTION_SECS,
};
use crate::error::{Error, Result};
use crate::keys::{DEFAULT_CLEANUP_GRACE_DAYS, DEFAULT_OVERLAP_DAYS};
use crate::nonce::DEFAULT_NONCE_TTL_SECS;
use crate::resource::ResourcePattern;
use crate::timestamp::{DEFAULT_CLOCK_SKEW_SECS, DEFAULT_MAX_AGE_SECS};
use crate::witness::DEFAULT_INITIAL_TRUST;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default sweep interval.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Upper bound for every configured duration (100 years).
pub const MAX_DURATION_SECS: i64 = 100 * 365 * 86_400;

const MAX_DURATION_DAYS: i64 = MAX_DURATION_SECS / 86_400;

fn secs(value: i64) -> Duration {
    Duration::seconds(value.clamp(-MAX_DURATION_SECS, MAX_DURATION_SECS))
}

fn days(value: i64) -> Duration {
    Duration::days(value.clamp(-MAX_DURATION_DAYS, MAX_DURATION_DAYS))
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub timestamps: TimestampConfig,
    pub nonces: NonceConfig,
    pub keys: KeyConfig,
    pub budget: BudgetConfig,
    pub resources: ResourceConfig,
    pub witnesses: WitnessConfig,
    pub sweeper: SweeperConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampConfig {
    /// Tolerance for timestamps ahead of the local clock
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: i64,
    /// Maximum age of a request timestamp
    #[serde(default = "default_max_age")]
    pub max_age_secs: i64,
}

fn default_clock_skew() -> i64 {
    DEFAULT_CLOCK_SKEW_SECS
}

fn default_max_age() -> i64 {
    DEFAULT_MAX_AGE_SECS
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            clock_skew_secs: default_clock_skew(),
            max_age_secs: default_max_age(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonceConfig {
    #[serde(default = "default_nonce_ttl")]
    pub ttl_secs: i64,
}

fn default_nonce_ttl() -> i64 {
    DEFAULT_NONCE_TTL_SECS
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_nonce_ttl(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyConfig {
    /// How long a superseded key keeps verifying
    #[serde(default = "default_overlap_days")]
    pub overlap_days: i64,
    /// How long expired or revoked versions are kept before pruning
    #[serde(default = "default_cleanup_grace_days")]
    pub cleanup_grace_days: i64,
}

fn default_overlap_days() -> i64 {
    DEFAULT_OVERLAP_DAYS
}

fn default_cleanup_grace_days() -> i64 {
    DEFAULT_CLEANUP_GRACE_DAYS
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            overlap_days: default_overlap_days(),
            cleanup_grace_days: default_cleanup_grace_days(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Limits for accounts created on first use. Both or neither.
    #[serde(default)]
    pub default_period_limit: Option<u64>,
    #[serde(default)]
    pub default_per_action_limit: Option<u64>,
    #[serde(default)]
    pub reset: ResetPolicy,
    #[serde(default = "default_history_retention")]
    pub history_retention_secs: i64,
    /// Utilization percentages that raise an alert
    #[serde(default = "default_alert_thresholds")]
    pub alert_thresholds: Vec<u8>,
}

fn default_history_retention() -> i64 {
    DEFAULT_HISTORY_RETENTION_SECS
}

fn default_alert_thresholds() -> Vec<u8> {
    DEFAULT_ALERT_THRESHOLDS.to_vec()
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_period_limit: None,
            default_per_action_limit: None,
            reset: ResetPolicy::default(),
            history_retention_secs: default_history_retention(),
            alert_thresholds: default_alert_thresholds(),
        }
    }
}

impl BudgetConfig {
    pub fn default_limits(&self) -> Option<(u64, u64)> {
        self.default_period_limit.zip(self.default_per_action_limit)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Deny patterns applied to every delegation
    #[serde(default)]
    pub global_denies: Vec<String>,
}

impl ResourceConfig {
    pub fn compile_denies(&self) -> Result<Vec<ResourcePattern>> {
        self.global_denies
            .iter()
            .map(|p| ResourcePattern::deny(p))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WitnessConfig {
    /// Trust of witnesses registered without an explicit value
    #[serde(default = "default_trust")]
    pub default_trust: f64,
    /// Drop attestations older than this, if set
    #[serde(default)]
    pub attestation_max_age_secs: Option<i64>,
}

fn default_trust() -> f64 {
    DEFAULT_INITIAL_TRUST
}

impl Default for WitnessConfig {
    fn default() -> Self {
        Self {
            default_trust: default_trust(),
            attestation_max_age_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval(),
        }
    }
}

impl EngineConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn clock_skew(&self) -> Duration {
        secs(self.timestamps.clock_skew_secs)
    }

    pub fn max_age(&self) -> Duration {
        secs(self.timestamps.max_age_secs)
    }

    pub fn nonce_ttl(&self) -> Duration {
        secs(self.nonces.ttl_secs)
    }

    pub fn key_overlap(&self) -> Duration {
        days(self.keys.overlap_days)
    }

    pub fn key_cleanup_grace(&self) -> Duration {
        days(self.keys.cleanup_grace_days)
    }

    pub fn history_retention(&self) -> Duration {
        secs(self.budget.history_retention_secs)
    }

    pub fn attestation_max_age(&self) -> Option<Duration> {
        self.witnesses.attestation_max_age_secs.map(secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweeper.interval_secs.min(MAX_DURATION_SECS as u64))
    }

    /// Like [`validate`](Self::validate), folding every problem into one
    /// [`Error::Config`].
    pub fn ensure_valid(&self) -> Result<()> {
        self.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
            Error::Config(messages.join("; "))
        })
    }

    /// Validate the configuration for common errors.
    pub fn validate(&self) -> std::result::Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, location: &str, message: String| {
            if !ok {
                errors.push(ConfigValidationError {
                    location: location.to_string(),
                    message,
                });
            }
        };

        let non_negative = 0..=MAX_DURATION_SECS;
        let positive = 1..=MAX_DURATION_SECS;

        check(
            non_negative.contains(&self.timestamps.clock_skew_secs),
            "timestamps.clock_skew_secs",
            "must not be negative or exceed 100 years".into(),
        );
        check(
            positive.contains(&self.timestamps.max_age_secs),
            "timestamps.max_age_secs",
            "must be positive and at most 100 years".into(),
        );
        check(
            positive.contains(&self.nonces.ttl_secs),
            "nonces.ttl_secs",
            "must be positive and at most 100 years".into(),
        );
        check(
            (0..=MAX_DURATION_DAYS).contains(&self.keys.overlap_days),
            "keys.overlap_days",
            format!("must be within 0..={} days", MAX_DURATION_DAYS),
        );
        check(
            (0..=MAX_DURATION_DAYS).contains(&self.keys.cleanup_grace_days),
            "keys.cleanup_grace_days",
            format!("must be within 0..={} days", MAX_DURATION_DAYS),
        );

        let budget = &self.budget;
        check(
            budget.default_period_limit.is_some() == budget.default_per_action_limit.is_some(),
            "budget",
            "default_period_limit and default_per_action_limit must be set together".into(),
        );
        if let Some((period, per_action)) = budget.default_limits() {
            check(
                period > 0 && per_action > 0 && per_action <= period,
                "budget.default_per_action_limit",
                format!(
                    "limits must be positive with per-action ({}) <= period ({})",
                    per_action, period
                ),
            );
        }
        check(
            (1..=MAX_DURATION_SECS as u64).contains(&budget.reset.period_secs()),
            "budget.reset.period_secs",
            "must be positive and at most 100 years".into(),
        );
        check(
            positive.contains(&budget.history_retention_secs),
            "budget.history_retention_secs",
            "must be positive and at most 100 years".into(),
        );
        for (i, t) in budget.alert_thresholds.iter().enumerate() {
            check(
                (1..=100).contains(t),
                &format!("budget.alert_thresholds[{}]", i),
                format!("threshold {} outside 1..=100", t),
            );
        }

        for (i, pattern) in self.resources.global_denies.iter().enumerate() {
            if let Err(e) = ResourcePattern::deny(pattern) {
                check(false, &format!("resources.global_denies[{}]", i), e.to_string());
            }
        }

        let trust = self.witnesses.default_trust;
        check(
            trust.is_finite() && (0.0..=1.0).contains(&trust),
            "witnesses.default_trust",
            format!("{} outside [0, 1]", trust),
        );
        if let Some(age) = self.witnesses.attestation_max_age_secs {
            check(
                positive.contains(&age),
                "witnesses.attestation_max_age_secs",
                "must be positive and at most 100 years".into(),
            );
        }

        check(
            (1..=MAX_DURATION_SECS as u64).contains(&self.sweeper.interval_secs),
            "sweeper.interval_secs",
            "must be positive and at most 100 years".into(),
        );

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValidationError {
    /// Location in config (e.g., "budget.alert_thresholds[0]")
    pub location: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = r#"
timestamps:
  clock_skew_secs: 30
nonces:
  ttl_secs: 120
budget:
  default_period_limit: 1000
  default_per_action_limit: 100
  reset:
    kind: rolling
    period_secs: 3600
resources:
  global_denies:
    - "org:*/secrets/**"
witnesses:
  attestation_max_age_secs: 600
"#;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_yaml("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.timestamps.max_age_secs, DEFAULT_MAX_AGE_SECS);
        assert_eq!(config.keys.overlap_days, 30);
        assert_eq!(config.budget.reset, ResetPolicy::FixedUtc { period_secs: 86_400 });
        assert!(config.sweeper.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let config = EngineConfig::from_yaml(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.timestamps.clock_skew_secs, 30);
        assert_eq!(config.timestamps.max_age_secs, DEFAULT_MAX_AGE_SECS);
        assert_eq!(config.nonce_ttl(), Duration::seconds(120));
        assert_eq!(config.budget.default_limits(), Some((1000, 100)));
        assert_eq!(config.budget.reset, ResetPolicy::Rolling { period_secs: 3600 });
        assert_eq!(config.resources.compile_denies().unwrap().len(), 1);
        assert_eq!(config.attestation_max_age(), Some(Duration::seconds(600)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let bad = r#"
timestamps:
  max_age_secs: 0
budget:
  default_period_limit: 10
  alert_thresholds: [0, 150]
resources:
  global_denies: ["a//b"]
witnesses:
  default_trust: 1.5
sweeper:
  interval_secs: 0
"#;
        let errors = EngineConfig::from_yaml(bad).unwrap().validate().unwrap_err();
        let locations: Vec<&str> = errors.iter().map(|e| e.location.as_str()).collect();

        assert!(locations.contains(&"timestamps.max_age_secs"));
        assert!(locations.contains(&"budget"));
        assert!(locations.contains(&"budget.alert_thresholds[0]"));
        assert!(locations.contains(&"budget.alert_thresholds[1]"));
        assert!(locations.contains(&"resources.global_denies[0]"));
        assert!(locations.contains(&"witnesses.default_trust"));
        assert!(locations.contains(&"sweeper.interval_secs"));
    }

    #[test]
    fn test_huge_durations_are_rejected_not_panicking() {
        let huge = r#"
timestamps:
  clock_skew_secs: 9223372036854775807
  max_age_secs: 9223372036854775807
nonces:
  ttl_secs: 9223372036854775807
keys:
  overlap_days: 9223372036854775807
  cleanup_grace_days: 9223372036854775807
budget:
  history_retention_secs: 9223372036854775807
  reset:
    kind: rolling
    period_secs: 18446744073709551615
witnesses:
  attestation_max_age_secs: 9223372036854775807
sweeper:
  interval_secs: 18446744073709551615
"#;
        let config = EngineConfig::from_yaml(huge).unwrap();

        // Accessors saturate instead of panicking.
        assert_eq!(config.clock_skew(), Duration::seconds(MAX_DURATION_SECS));
        assert_eq!(config.key_overlap(), Duration::days(MAX_DURATION_DAYS));
        assert_eq!(config.attestation_max_age(), Some(Duration::seconds(MAX_DURATION_SECS)));

        let errors = config.validate().unwrap_err();
        let locations: Vec<&str> = errors.iter().map(|e| e.location.as_str()).collect();
        for expected in [
            "timestamps.clock_skew_secs",
            "timestamps.max_age_secs",
            "nonces.ttl_secs",
            "keys.overlap_days",
            "keys.cleanup_grace_days",
            "budget.reset.period_secs",
            "budget.history_retention_secs",
            "witnesses.attestation_max_age_secs",
            "sweeper.interval_secs",
        ] {
            assert!(locations.contains(&expected), "missing {}", expected);
        }
        assert!(matches!(config.ensure_valid(), Err(Error::Config(_))));
    }

    #[test]
    fn test_hundred_years_is_accepted() {
        let mut config = EngineConfig::default();
        config.timestamps.max_age_secs = MAX_DURATION_SECS;
        config.keys.overlap_days = MAX_DURATION_DAYS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        assert!(matches!(
            EngineConfig::from_yaml("timestamps: [1, 2"),
            Err(Error::Config(_))
        ));
        assert!(EngineConfig::from_file("/nonexistent/mandate.yaml").is_err());
    }
}
