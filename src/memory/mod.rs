//! Memory types and admission control.
//!
//! Candidate memories pass through the [`gate::MemoryGate`] before they
//! reach any store: trusted candidates are admitted, borderline ones are
//! quarantined for review, and the rest are rejected.

pub mod gate;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CallSource, MemoryType};

/// A memory candidate, before gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCandidate {
    /// Raw content.
    pub content: String,
    /// Where it came from.
    pub source: CallSource,
    /// When it was produced.
    pub timestamp: DateTime<Utc>,
    /// Optional structured metadata.
    pub metadata: Option<serde_json::Value>,
}

impl MemoryCandidate {
    /// Build a candidate stamped now.
    pub fn new(content: impl Into<String>, source: CallSource) -> Self {
        Self {
            content: content.into(),
            source,
            timestamp: Utc::now(),
            metadata: None,
        }
    }
}

/// An admitted memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// Memory id.
    pub id: Uuid,
    /// Content as admitted.
    pub content: String,
    /// Origin of the candidate.
    pub source: CallSource,
    /// Trust score at admission time.
    pub trust_score: f64,
    /// Classified type.
    pub memory_type: MemoryType,
    /// Candidate timestamp.
    pub timestamp: DateTime<Utc>,
    /// Optional structured metadata.
    pub metadata: Option<serde_json::Value>,
}

/// A quarantined candidate awaiting review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantinedMemory {
    /// Quarantine entry id.
    pub id: Uuid,
    /// The held candidate.
    pub candidate: MemoryCandidate,
    /// Trust score at gating time.
    pub trust_score: f64,
    /// Why it was quarantined.
    pub reason: String,
    /// When it entered quarantine.
    pub quarantined_at: DateTime<Utc>,
    /// When it becomes due for review.
    pub review_after: DateTime<Utc>,
}

/// Classify a candidate's content into a [`MemoryType`].
///
/// Heuristic and intentionally conservative: anything phrased as a
/// directive is an instruction, which the gate scores with suspicion.
pub fn classify_content(content: &str, source: &CallSource) -> MemoryType {
    let lower = content.to_lowercase();
    let directive = ["always ", "never ", "you must", "from now on", "ignore "]
        .iter()
        .any(|marker| lower.contains(marker));
    if directive {
        return MemoryType::Instruction;
    }
    if lower.contains("prefer") || lower.contains("rather than") {
        return MemoryType::Preference;
    }
    if lower.contains("goal") || lower.starts_with("plan to") {
        return MemoryType::Goal;
    }
    if matches!(source, CallSource::System) {
        return MemoryType::System;
    }
    if lower.starts_with("observed") || lower.starts_with("noticed") {
        return MemoryType::Observation;
    }
    MemoryType::Fact
}

/// Extract naive entity mentions: capitalized tokens that are not
/// sentence-initial, deduplicated in order of first appearance.
pub fn extract_entities(content: &str) -> Vec<String> {
    let mut entities: Vec<String> = Vec::new();
    for sentence in content.split(['.', '!', '?', '\n']) {
        for (index, raw) in sentence.split_whitespace().enumerate() {
            let token: String = raw
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '-')
                .collect();
            if token.len() < 2 || index == 0 {
                continue;
            }
            let capitalized = token
                .chars()
                .next()
                .map(|c| c.is_uppercase())
                .unwrap_or(false);
            if capitalized && !entities.iter().any(|e| e == &token) {
                entities.push(token);
            }
        }
    }
    entities
}
