//! Configuration loading and resolution.
//!
//! Loads kernel configuration from `./straylight.toml` (or
//! `$STRAYLIGHT_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults. Resolution never panics: invalid
//! combinations are reported as [`ConfigIssue`]s and replaced with
//! defaults, so the kernel always boots with a self-consistent config.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

// ── Top-level config ────────────────────────────────────────────

/// Top-level kernel configuration loaded from TOML.
///
/// Precedence: env vars > config file > defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Execution pipeline timeouts and thresholds.
    pub pipeline: PipelineConfig,
    /// Memory gate admission thresholds.
    pub memory: MemoryGateConfig,
    /// Trust scorer baselines and update bounds.
    pub trust: TrustConfig,
    /// Persona drift monitor window and weights.
    pub drift: DriftConfig,
    /// Filesystem paths for persistent state.
    pub paths: PathsConfig,
}

/// Pipeline timeouts and safe-mode thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How long a human approval may stay pending before auto-deny.
    pub approval_window_secs: u64,
    /// Per-check timeout inside the post-condition verifier.
    pub verifier_check_timeout_secs: u64,
    /// Timeout for a compensation function.
    pub compensation_timeout_secs: u64,
    /// Consecutive execution failures before safe mode engages.
    pub safe_mode_threshold: u32,
    /// Minimum source trust required to exit safe mode.
    pub safe_mode_exit_trust_floor: f64,
    /// Default trust floor for `automated` approval when no policy rule sets one.
    pub automated_trust_floor: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            approval_window_secs: 600,
            verifier_check_timeout_secs: 5,
            compensation_timeout_secs: 30,
            safe_mode_threshold: 3,
            safe_mode_exit_trust_floor: 0.8,
            automated_trust_floor: 0.7,
        }
    }
}

/// Memory gate admission thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryGateConfig {
    /// Trust at or above which a candidate is admitted.
    pub write_threshold: f64,
    /// Trust at or above which (but below `write_threshold`) a candidate
    /// is quarantined instead of rejected.
    pub quarantine_threshold: f64,
    /// Maximum quarantine entries retained; oldest are dropped beyond this.
    pub max_quarantine_size: usize,
    /// Hours after quarantine when an entry becomes due for review.
    pub review_after_hours: u64,
}

impl Default for MemoryGateConfig {
    fn default() -> Self {
        Self {
            write_threshold: 0.7,
            quarantine_threshold: 0.3,
            max_quarantine_size: 1000,
            review_after_hours: 24,
        }
    }
}

/// Trust scorer baselines and update bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Baseline for the `user` source.
    pub user_baseline: f64,
    /// Baseline for the `system` source.
    pub system_baseline: f64,
    /// Baseline for the `llm` source.
    pub llm_baseline: f64,
    /// Baseline for `plugin` and named plugins.
    pub plugin_baseline: f64,
    /// Baseline for the `external` source.
    pub external_baseline: f64,
    /// Maximum trust shift a single outcome may cause.
    pub max_step: f64,
    /// Bounded outcome window per source.
    pub history_window: usize,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            user_baseline: 0.8,
            system_baseline: 0.9,
            llm_baseline: 0.5,
            plugin_baseline: 0.6,
            external_baseline: 0.3,
            max_step: 0.05,
            history_window: 100,
        }
    }
}

/// Persona drift monitor window, weights, and severity thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Sliding window of recent outputs to analyze.
    pub window: usize,
    /// Weight of the value-alignment dimension.
    pub weight_value_alignment: f64,
    /// Weight of the style-consistency dimension.
    pub weight_style_consistency: f64,
    /// Weight of the boundary-respect dimension.
    pub weight_boundary_respect: f64,
    /// Weight of the topic-focus dimension.
    pub weight_topic_focus: f64,
    /// Drift score at or above which severity is `medium`.
    pub medium_threshold: f64,
    /// Drift score at or above which severity is `high`.
    pub high_threshold: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            window: 20,
            weight_value_alignment: 1.0,
            weight_style_consistency: 1.0,
            weight_boundary_respect: 1.0,
            weight_topic_focus: 1.0,
            medium_threshold: 0.15,
            high_threshold: 0.25,
        }
    }
}

/// Filesystem paths for persistent state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// SQLite journal database path.
    pub journal_db: String,
    /// Directory for rotated JSON logs.
    pub logs_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            journal_db: "straylight.db".to_owned(),
            logs_dir: "logs".to_owned(),
        }
    }
}

// ── Resolution ──────────────────────────────────────────────────

/// A problem found while resolving the configuration.
///
/// Issues never abort kernel boot; the offending value is replaced with
/// its default and the issue is surfaced through the init report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// Dotted path of the offending field (e.g. `memory.write_threshold`).
    pub field: String,
    /// Human-readable description of the problem.
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl KernelConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$STRAYLIGHT_CONFIG_PATH` or `./straylight.toml`.
    /// If the file does not exist, defaults are used.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: KernelConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(KernelConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve the config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(p) = env("STRAYLIGHT_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("straylight.toml")
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function for testability.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("STRAYLIGHT_JOURNAL_DB") {
            self.paths.journal_db = v;
        }
        if let Some(v) = env("STRAYLIGHT_LOGS_DIR") {
            self.paths.logs_dir = v;
        }
        if let Some(v) = env("STRAYLIGHT_APPROVAL_WINDOW_SECS") {
            match v.parse() {
                Ok(n) => self.pipeline.approval_window_secs = n,
                Err(_) => tracing::warn!(
                    var = "STRAYLIGHT_APPROVAL_WINDOW_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("STRAYLIGHT_SAFE_MODE_THRESHOLD") {
            match v.parse() {
                Ok(n) => self.pipeline.safe_mode_threshold = n,
                Err(_) => tracing::warn!(
                    var = "STRAYLIGHT_SAFE_MODE_THRESHOLD",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("STRAYLIGHT_MEMORY_WRITE_THRESHOLD") {
            match v.parse() {
                Ok(n) => self.memory.write_threshold = n,
                Err(_) => tracing::warn!(
                    var = "STRAYLIGHT_MEMORY_WRITE_THRESHOLD",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Validate the configuration, repairing invalid values with defaults.
    ///
    /// Returns the list of issues found (empty when the config was clean).
    /// Invariants enforced here rather than at call sites:
    /// `quarantine_threshold < write_threshold`, unit-interval bounds on
    /// every trust value, a non-zero drift window, and positive weights.
    pub fn resolve(&mut self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        let defaults = MemoryGateConfig::default();
        if !(0.0..=1.0).contains(&self.memory.write_threshold) {
            issues.push(ConfigIssue {
                field: "memory.write_threshold".to_owned(),
                message: format!("{} outside [0,1], using default", self.memory.write_threshold),
            });
            self.memory.write_threshold = defaults.write_threshold;
        }
        if !(0.0..=1.0).contains(&self.memory.quarantine_threshold) {
            issues.push(ConfigIssue {
                field: "memory.quarantine_threshold".to_owned(),
                message: format!(
                    "{} outside [0,1], using default",
                    self.memory.quarantine_threshold
                ),
            });
            self.memory.quarantine_threshold = defaults.quarantine_threshold;
        }
        if self.memory.quarantine_threshold >= self.memory.write_threshold {
            issues.push(ConfigIssue {
                field: "memory.quarantine_threshold".to_owned(),
                message: format!(
                    "quarantine threshold {} must be below write threshold {}, using defaults",
                    self.memory.quarantine_threshold, self.memory.write_threshold
                ),
            });
            self.memory.quarantine_threshold = defaults.quarantine_threshold;
            self.memory.write_threshold = defaults.write_threshold;
        }

        let trust_defaults = TrustConfig::default();
        for (field, value, default) in [
            ("trust.user_baseline", self.trust.user_baseline, trust_defaults.user_baseline),
            ("trust.system_baseline", self.trust.system_baseline, trust_defaults.system_baseline),
            ("trust.llm_baseline", self.trust.llm_baseline, trust_defaults.llm_baseline),
            ("trust.plugin_baseline", self.trust.plugin_baseline, trust_defaults.plugin_baseline),
            (
                "trust.external_baseline",
                self.trust.external_baseline,
                trust_defaults.external_baseline,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                issues.push(ConfigIssue {
                    field: field.to_owned(),
                    message: format!("{value} outside [0,1], using default"),
                });
                match field {
                    "trust.user_baseline" => self.trust.user_baseline = default,
                    "trust.system_baseline" => self.trust.system_baseline = default,
                    "trust.llm_baseline" => self.trust.llm_baseline = default,
                    "trust.plugin_baseline" => self.trust.plugin_baseline = default,
                    _ => self.trust.external_baseline = default,
                }
            }
        }
        if self.trust.history_window == 0 {
            issues.push(ConfigIssue {
                field: "trust.history_window".to_owned(),
                message: "window must be non-zero, using default".to_owned(),
            });
            self.trust.history_window = trust_defaults.history_window;
        }

        if self.drift.window == 0 {
            issues.push(ConfigIssue {
                field: "drift.window".to_owned(),
                message: "window must be non-zero, using default".to_owned(),
            });
            self.drift.window = DriftConfig::default().window;
        }
        let weight_sum = self.drift.weight_value_alignment
            + self.drift.weight_style_consistency
            + self.drift.weight_boundary_respect
            + self.drift.weight_topic_focus;
        if weight_sum <= 0.0 {
            issues.push(ConfigIssue {
                field: "drift.weights".to_owned(),
                message: "weights must sum to a positive value, using equal weights".to_owned(),
            });
            let d = DriftConfig::default();
            self.drift.weight_value_alignment = d.weight_value_alignment;
            self.drift.weight_style_consistency = d.weight_style_consistency;
            self.drift.weight_boundary_respect = d.weight_boundary_respect;
            self.drift.weight_topic_focus = d.weight_topic_focus;
        }
        if self.drift.medium_threshold > self.drift.high_threshold {
            issues.push(ConfigIssue {
                field: "drift.medium_threshold".to_owned(),
                message: "medium threshold above high threshold, using defaults".to_owned(),
            });
            let d = DriftConfig::default();
            self.drift.medium_threshold = d.medium_threshold;
            self.drift.high_threshold = d.high_threshold;
        }

        if !(0.0..=1.0).contains(&self.pipeline.safe_mode_exit_trust_floor) {
            issues.push(ConfigIssue {
                field: "pipeline.safe_mode_exit_trust_floor".to_owned(),
                message: format!(
                    "{} outside [0,1], using default",
                    self.pipeline.safe_mode_exit_trust_floor
                ),
            });
            self.pipeline.safe_mode_exit_trust_floor =
                PipelineConfig::default().safe_mode_exit_trust_floor;
        }
        if self.pipeline.safe_mode_threshold == 0 {
            issues.push(ConfigIssue {
                field: "pipeline.safe_mode_threshold".to_owned(),
                message: "threshold must be non-zero, using default".to_owned(),
            });
            self.pipeline.safe_mode_threshold = PipelineConfig::default().safe_mode_threshold;
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve_clean() {
        let mut config = KernelConfig::default();
        let issues = config.resolve();
        assert!(issues.is_empty(), "defaults should have no issues: {issues:?}");
        assert!((config.memory.write_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.pipeline.approval_window_secs, 600);
        assert_eq!(config.pipeline.safe_mode_threshold, 3);
    }

    #[test]
    fn test_quarantine_must_be_below_write_threshold() {
        let mut config = KernelConfig::default();
        config.memory.quarantine_threshold = 0.9;
        let issues = config.resolve();
        assert!(!issues.is_empty());
        assert!(config.memory.quarantine_threshold < config.memory.write_threshold);
    }

    #[test]
    fn test_out_of_range_trust_baseline_repaired() {
        let mut config = KernelConfig::default();
        config.trust.llm_baseline = 7.0;
        let issues = config.resolve();
        assert!(issues.iter().any(|i| i.field == "trust.llm_baseline"));
        assert!((config.trust.llm_baseline - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_drift_window_repaired() {
        let mut config = KernelConfig::default();
        config.drift.window = 0;
        let issues = config.resolve();
        assert!(issues.iter().any(|i| i.field == "drift.window"));
        assert_eq!(config.drift.window, 20);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = KernelConfig::default();
        config.apply_overrides(|key| match key {
            "STRAYLIGHT_JOURNAL_DB" => Some("/tmp/test.db".to_owned()),
            "STRAYLIGHT_APPROVAL_WINDOW_SECS" => Some("30".to_owned()),
            _ => None,
        });
        assert_eq!(config.paths.journal_db, "/tmp/test.db");
        assert_eq!(config.pipeline.approval_window_secs, 30);
    }

    #[test]
    fn test_invalid_env_override_ignored() {
        let mut config = KernelConfig::default();
        config.apply_overrides(|key| match key {
            "STRAYLIGHT_APPROVAL_WINDOW_SECS" => Some("not-a-number".to_owned()),
            _ => None,
        });
        assert_eq!(config.pipeline.approval_window_secs, 600);
    }

    #[test]
    fn test_config_path_env_override() {
        let path = KernelConfig::config_path_with(|key| {
            (key == "STRAYLIGHT_CONFIG_PATH").then(|| "/etc/straylight.toml".to_owned())
        });
        assert_eq!(path, PathBuf::from("/etc/straylight.toml"));
    }

    #[test]
    fn test_toml_parse_partial() {
        let toml_src = r#"
            [memory]
            write_threshold = 0.9

            [pipeline]
            safe_mode_threshold = 5
        "#;
        let config: KernelConfig = toml::from_str(toml_src).expect("parse");
        assert!((config.memory.write_threshold - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.pipeline.safe_mode_threshold, 5);
        // Unspecified sections fall back to defaults.
        assert_eq!(config.drift.window, 20);
    }
}
