//! Persona drift monitor.
//!
//! Watches the agent's recent outputs and scores deviation from its
//! defined identity along four dimensions, each in `[0,1]` with higher
//! meaning *less* drift: value alignment, style consistency, boundary
//! respect, and topic focus. The composite drift score is
//! `1 − weighted_mean(dimensions)`; weights come from config and default
//! to equal.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::DriftConfig;
use crate::types::ComponentHealth;

/// The persona the monitor scores against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityProfile {
    /// Agent identifier.
    pub agent_id: String,
    /// Terms naming the agent's core values (e.g. "transparency").
    pub core_values: Vec<String>,
    /// Phrases characteristic of the agent's register.
    pub style_markers: Vec<String>,
    /// Phrases the agent must not produce.
    pub boundaries: Vec<String>,
    /// Terms naming the agent's topical remit.
    pub allowed_topics: Vec<String>,
}

/// Per-dimension scores; higher is less drift.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DriftDimensions {
    /// Outputs free of value-contradicting phrasing.
    pub value_alignment: f64,
    /// Outputs carrying at least one configured style marker.
    pub style_consistency: f64,
    /// Outputs free of boundary phrases.
    pub boundary_respect: f64,
    /// Outputs touching at least one allowed topic.
    pub topic_focus: f64,
}

/// Severity of a drift report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    /// No actionable drift.
    None,
    /// Worth a look.
    Medium,
    /// Needs intervention.
    High,
}

/// A drift analysis over the recent output window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    /// Agent analyzed.
    pub agent_id: String,
    /// Per-dimension scores.
    pub dimensions: DriftDimensions,
    /// Composite drift score in `[0,1]`; higher is worse.
    pub drift_score: f64,
    /// Severity band.
    pub severity: DriftSeverity,
    /// How many outputs were analyzed.
    pub window_size: usize,
}

/// Sliding-window drift monitor.
pub struct DriftMonitor {
    config: DriftConfig,
    window: Mutex<VecDeque<String>>,
}

impl std::fmt::Debug for DriftMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let held = self.window.lock().map(|w| w.len()).unwrap_or(0);
        f.debug_struct("DriftMonitor")
            .field("window", &held)
            .finish()
    }
}

impl DriftMonitor {
    /// Create a monitor.
    pub fn new(config: DriftConfig) -> Self {
        Self {
            config,
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Create a monitor with default window and weights.
    pub fn with_defaults() -> Self {
        Self::new(DriftConfig::default())
    }

    /// Record an output into the sliding window.
    pub fn observe(&self, output: impl Into<String>) {
        if let Ok(mut window) = self.window.lock() {
            window.push_back(output.into());
            while window.len() > self.config.window {
                window.pop_front();
            }
        }
    }

    /// Number of outputs currently in the window.
    pub fn window_len(&self) -> usize {
        self.window.lock().map(|w| w.len()).unwrap_or(0)
    }

    /// Analyze the current window against an identity.
    pub fn analyze(&self, identity: &IdentityProfile) -> DriftReport {
        let outputs: Vec<String> = self
            .window
            .lock()
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default();
        let report = analyze_outputs(&outputs, identity, &self.config);
        match report.severity {
            DriftSeverity::None => {
                info!(agent = %report.agent_id, score = report.drift_score, "drift analysis")
            }
            _ => warn!(
                agent = %report.agent_id,
                score = report.drift_score,
                severity = ?report.severity,
                "persona drift detected"
            ),
        }
        report
    }

    /// Health probe.
    pub fn health(&self) -> ComponentHealth {
        ComponentHealth {
            component: "drift_monitor".to_owned(),
            healthy: true,
            detail: format!("{} outputs in window", self.window_len()),
        }
    }
}

/// Pure analysis over an explicit output slice.
pub fn analyze_outputs(
    outputs: &[String],
    identity: &IdentityProfile,
    config: &DriftConfig,
) -> DriftReport {
    let dimensions = DriftDimensions {
        value_alignment: score_value_alignment(outputs, &identity.core_values),
        style_consistency: score_presence(outputs, &identity.style_markers),
        boundary_respect: score_absence(outputs, &identity.boundaries),
        topic_focus: score_presence(outputs, &identity.allowed_topics),
    };

    let weight_sum = config.weight_value_alignment
        + config.weight_style_consistency
        + config.weight_boundary_respect
        + config.weight_topic_focus;
    let weighted = if weight_sum > 0.0 {
        (dimensions.value_alignment * config.weight_value_alignment
            + dimensions.style_consistency * config.weight_style_consistency
            + dimensions.boundary_respect * config.weight_boundary_respect
            + dimensions.topic_focus * config.weight_topic_focus)
            / weight_sum
    } else {
        1.0
    };
    let drift_score = (1.0 - weighted).clamp(0.0, 1.0);

    let severity = if drift_score >= config.high_threshold {
        DriftSeverity::High
    } else if drift_score >= config.medium_threshold {
        DriftSeverity::Medium
    } else {
        DriftSeverity::None
    };

    DriftReport {
        agent_id: identity.agent_id.clone(),
        dimensions,
        drift_score,
        severity,
        window_size: outputs.len(),
    }
}

/// Fraction of outputs that do not contradict any core value.
///
/// A contradiction is the value term preceded by a negation nearby
/// ("ignore transparency", "transparency doesn't matter").
fn score_value_alignment(outputs: &[String], core_values: &[String]) -> f64 {
    if outputs.is_empty() || core_values.is_empty() {
        return 1.0;
    }
    let negations = ["ignore", "forget", "skip", "doesn't matter", "does not matter", "who cares about"];
    let clean = outputs
        .iter()
        .filter(|output| {
            let lower = output.to_lowercase();
            !core_values.iter().any(|value| {
                let value = value.to_lowercase();
                lower.contains(&value)
                    && negations.iter().any(|neg| {
                        lower.contains(&format!("{neg} {value}"))
                            || lower.contains(&format!("{value} {neg}"))
                    })
            })
        })
        .count();
    ratio(clean, outputs.len())
}

/// Fraction of outputs containing at least one of the given terms.
/// An empty term list scores a perfect 1.0.
fn score_presence(outputs: &[String], terms: &[String]) -> f64 {
    if outputs.is_empty() || terms.is_empty() {
        return 1.0;
    }
    let matching = outputs
        .iter()
        .filter(|output| {
            let lower = output.to_lowercase();
            terms.iter().any(|term| lower.contains(&term.to_lowercase()))
        })
        .count();
    ratio(matching, outputs.len())
}

/// Fraction of outputs containing none of the given phrases.
fn score_absence(outputs: &[String], phrases: &[String]) -> f64 {
    if outputs.is_empty() || phrases.is_empty() {
        return 1.0;
    }
    let clean = outputs
        .iter()
        .filter(|output| {
            let lower = output.to_lowercase();
            !phrases
                .iter()
                .any(|phrase| lower.contains(&phrase.to_lowercase()))
        })
        .count();
    ratio(clean, outputs.len())
}

/// Lossless usize ratio for window-sized counts.
fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        return 1.0;
    }
    let num = f64::from(u32::try_from(numerator).unwrap_or(u32::MAX));
    let den = f64::from(u32::try_from(denominator).unwrap_or(u32::MAX));
    num / den
}
