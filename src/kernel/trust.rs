//! History-aware trust scoring for call sources.
//!
//! Maps a source identifier to a scalar in `[0,1]`. Each source starts at
//! a configured baseline and drifts with observed outcomes, one bounded
//! step at a time, over a bounded history window.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TrustConfig;
use crate::types::{CallSource, ComponentHealth};

/// Observed outcome attributed to a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustOutcome {
    /// The source's call completed and verified.
    Success,
    /// The source's call failed.
    Failure,
    /// The source attempted something policy rejected.
    Violation,
}

#[derive(Debug, Clone)]
struct SourceRecord {
    current: f64,
    history: VecDeque<TrustOutcome>,
}

/// Trust scorer over call sources.
///
/// Single-writer per source (the internal lock covers all mutation);
/// reads are cheap lookups.
pub struct TrustScorer {
    config: TrustConfig,
    sources: Mutex<HashMap<String, SourceRecord>>,
}

impl std::fmt::Debug for TrustScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.sources.lock().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("TrustScorer")
            .field("tracked_sources", &count)
            .finish()
    }
}

impl TrustScorer {
    /// Create a scorer with the given baselines and bounds.
    pub fn new(config: TrustConfig) -> Self {
        Self {
            config,
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Create a scorer with default baselines.
    pub fn with_defaults() -> Self {
        Self::new(TrustConfig::default())
    }

    /// Baseline trust for a source that has no history yet.
    pub fn baseline(&self, source: &CallSource) -> f64 {
        match source {
            CallSource::User => self.config.user_baseline,
            CallSource::System => self.config.system_baseline,
            CallSource::Llm => self.config.llm_baseline,
            CallSource::Plugin | CallSource::NamedPlugin(_) => self.config.plugin_baseline,
            CallSource::External => self.config.external_baseline,
        }
    }

    /// Current trust for a source, in `[0,1]`.
    pub fn get_source_trust(&self, source: &CallSource) -> f64 {
        let baseline = self.baseline(source);
        self.sources
            .lock()
            .ok()
            .and_then(|sources| sources.get(&source.key()).map(|r| r.current))
            .unwrap_or(baseline)
    }

    /// Register an explicit baseline for a source key (e.g. a named plugin
    /// vetted by the operator). Resets any accumulated history.
    pub fn register(&self, source: &CallSource, baseline: f64) {
        let clamped = baseline.clamp(0.0, 1.0);
        if let Ok(mut sources) = self.sources.lock() {
            sources.insert(
                source.key(),
                SourceRecord {
                    current: clamped,
                    history: VecDeque::new(),
                },
            );
        }
        debug!(source = %source, baseline = clamped, "trust baseline registered");
    }

    /// Record an outcome, shifting trust by at most the configured step.
    pub fn record_outcome(&self, source: &CallSource, outcome: TrustOutcome) {
        let baseline = self.baseline(source);
        let max_step = self.config.max_step.clamp(0.0, 1.0);
        let step = match outcome {
            TrustOutcome::Success => max_step * 0.2,
            TrustOutcome::Failure => -(max_step * 0.4),
            TrustOutcome::Violation => -max_step,
        };

        let Ok(mut sources) = self.sources.lock() else {
            return;
        };
        let record = sources.entry(source.key()).or_insert_with(|| SourceRecord {
            current: baseline,
            history: VecDeque::new(),
        });
        record.current = (record.current + step).clamp(0.0, 1.0);
        record.history.push_back(outcome);
        while record.history.len() > self.config.history_window {
            record.history.pop_front();
        }
        debug!(
            source = %source,
            outcome = ?outcome,
            trust = record.current,
            "trust outcome recorded"
        );
    }

    /// Recorded outcome history for a source, oldest first.
    pub fn history(&self, source: &CallSource) -> Vec<TrustOutcome> {
        self.sources
            .lock()
            .ok()
            .and_then(|sources| {
                sources
                    .get(&source.key())
                    .map(|r| r.history.iter().copied().collect())
            })
            .unwrap_or_default()
    }

    /// Health probe.
    pub fn health(&self) -> ComponentHealth {
        match self.sources.lock() {
            Ok(sources) => ComponentHealth {
                component: "trust_scorer".to_owned(),
                healthy: true,
                detail: format!("{} tracked sources", sources.len()),
            },
            Err(e) => ComponentHealth {
                component: "trust_scorer".to_owned(),
                healthy: false,
                detail: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_defaults() {
        let scorer = TrustScorer::with_defaults();
        assert!((scorer.get_source_trust(&CallSource::User) - 0.8).abs() < f64::EPSILON);
        assert!((scorer.get_source_trust(&CallSource::System) - 0.9).abs() < f64::EPSILON);
        assert!((scorer.get_source_trust(&CallSource::Llm) - 0.5).abs() < f64::EPSILON);
        assert!((scorer.get_source_trust(&CallSource::Plugin) - 0.6).abs() < f64::EPSILON);
        assert!((scorer.get_source_trust(&CallSource::External) - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_named_plugin_uses_plugin_baseline() {
        let scorer = TrustScorer::with_defaults();
        let named = CallSource::NamedPlugin("weather".to_owned());
        assert!((scorer.get_source_trust(&named) - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn test_outcomes_shift_trust_within_bounds() {
        let scorer = TrustScorer::with_defaults();
        let source = CallSource::Llm;
        let before = scorer.get_source_trust(&source);

        scorer.record_outcome(&source, TrustOutcome::Success);
        let after = scorer.get_source_trust(&source);
        assert!(after > before);
        assert!(after - before <= 0.05 + f64::EPSILON, "step bounded by 0.05");

        scorer.record_outcome(&source, TrustOutcome::Violation);
        let dropped = scorer.get_source_trust(&source);
        assert!(dropped < after);
        assert!(after - dropped <= 0.05 + f64::EPSILON);
    }

    #[test]
    fn test_trust_clamped_to_unit_interval() {
        let scorer = TrustScorer::with_defaults();
        let source = CallSource::External;
        for _ in 0..200 {
            scorer.record_outcome(&source, TrustOutcome::Violation);
        }
        assert!(scorer.get_source_trust(&source) >= 0.0);

        for _ in 0..2000 {
            scorer.record_outcome(&source, TrustOutcome::Success);
        }
        assert!(scorer.get_source_trust(&source) <= 1.0);
    }

    #[test]
    fn test_history_window_bounded() {
        let scorer = TrustScorer::with_defaults();
        let source = CallSource::Plugin;
        for _ in 0..250 {
            scorer.record_outcome(&source, TrustOutcome::Success);
        }
        assert_eq!(scorer.history(&source).len(), 100);
    }

    #[test]
    fn test_register_overrides_baseline() {
        let scorer = TrustScorer::with_defaults();
        let source = CallSource::NamedPlugin("vetted".to_owned());
        scorer.register(&source, 0.95);
        assert!((scorer.get_source_trust(&source) - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn test_register_clamps_baseline() {
        let scorer = TrustScorer::with_defaults();
        let source = CallSource::NamedPlugin("sketchy".to_owned());
        scorer.register(&source, 3.0);
        assert!((scorer.get_source_trust(&source) - 1.0).abs() < f64::EPSILON);
    }
}
