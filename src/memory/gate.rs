//! Admission control over candidate memories.
//!
//! Each candidate is scored from its source trust and content heuristics,
//! then routed: `allow` (admitted as a [`Memory`]), `quarantine` (held for
//! review), or `reject`. Every decision appends a gate event to the audit
//! chain. The quarantine is bounded; overflow drops the oldest entry.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::MemoryGateConfig;
use crate::kernel::events::EventStore;
use crate::kernel::trust::TrustScorer;
use crate::memory::{classify_content, extract_entities, Memory, MemoryCandidate, QuarantinedMemory};
use crate::types::{ComponentHealth, EventType, MemoryType};

/// Content markers that smell like prompt-injection; each hit lowers the
/// effective trust of the candidate.
const SUSPICIOUS_MARKERS: &[&str] = &[
    "ignore previous",
    "ignore all prior",
    "disregard",
    "system prompt",
    "new instructions",
    "you are now",
];

/// Trust penalty per suspicious marker found.
const MARKER_PENALTY: f64 = 0.15;

/// Extra penalty for directive content from non-user, non-system sources.
const FOREIGN_INSTRUCTION_PENALTY: f64 = 0.1;

/// The routing decision for a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    /// Admitted.
    Allow,
    /// Held for review.
    Quarantine,
    /// Dropped.
    Reject,
}

/// Outcome of gating one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    /// Routing decision.
    pub action: GateAction,
    /// Effective trust score used for the decision.
    pub trust_score: f64,
    /// Human-readable reason.
    pub reason: String,
    /// The admitted memory, when `action == Allow`.
    pub memory: Option<Memory>,
    /// Entity mentions extracted from admitted content.
    pub entities: Vec<String>,
}

/// Memory admission gate.
pub struct MemoryGate {
    config: MemoryGateConfig,
    trust: Arc<TrustScorer>,
    events: Arc<dyn EventStore>,
    quarantine: Mutex<VecDeque<QuarantinedMemory>>,
}

impl std::fmt::Debug for MemoryGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let held = self.quarantine.lock().map(|q| q.len()).unwrap_or(0);
        f.debug_struct("MemoryGate")
            .field("quarantined", &held)
            .finish()
    }
}

impl MemoryGate {
    /// Create a gate.
    ///
    /// The config is assumed resolved (`quarantine_threshold <
    /// write_threshold` is enforced by [`crate::config::KernelConfig::resolve`]).
    pub fn new(
        config: MemoryGateConfig,
        trust: Arc<TrustScorer>,
        events: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            config,
            trust,
            events,
            quarantine: Mutex::new(VecDeque::new()),
        }
    }

    /// Gate a candidate: allow, quarantine, or reject.
    pub fn write(&self, candidate: MemoryCandidate) -> GateDecision {
        let base_trust = self.trust.get_source_trust(&candidate.source);
        let memory_type = classify_content(&candidate.content, &candidate.source);
        let (effective, penalty_reasons) = self.apply_heuristics(&candidate, memory_type, base_trust);

        let decision = if effective >= self.config.write_threshold {
            self.admit(candidate, effective, memory_type, penalty_reasons)
        } else if effective >= self.config.quarantine_threshold {
            self.hold(candidate, effective, penalty_reasons)
        } else {
            self.drop_candidate(candidate, effective, penalty_reasons)
        };

        info!(
            action = ?decision.action,
            trust = decision.trust_score,
            reason = %decision.reason,
            "memory gate decision"
        );
        decision
    }

    fn apply_heuristics(
        &self,
        candidate: &MemoryCandidate,
        memory_type: MemoryType,
        base_trust: f64,
    ) -> (f64, Vec<String>) {
        let lower = candidate.content.to_lowercase();
        let mut effective = base_trust;
        let mut reasons = Vec::new();

        for marker in SUSPICIOUS_MARKERS {
            if lower.contains(marker) {
                effective -= MARKER_PENALTY;
                reasons.push(format!("suspicious marker `{marker}`"));
            }
        }

        let foreign = !matches!(
            candidate.source,
            crate::types::CallSource::User | crate::types::CallSource::System
        );
        if memory_type == MemoryType::Instruction && foreign {
            effective -= FOREIGN_INSTRUCTION_PENALTY;
            reasons.push("instruction from untrusted source".to_owned());
        }

        (effective.clamp(0.0, 1.0), reasons)
    }

    fn admit(
        &self,
        candidate: MemoryCandidate,
        trust_score: f64,
        memory_type: MemoryType,
        penalty_reasons: Vec<String>,
    ) -> GateDecision {
        let entities = extract_entities(&candidate.content);
        let memory = Memory {
            id: Uuid::new_v4(),
            content: candidate.content,
            source: candidate.source,
            trust_score,
            memory_type,
            timestamp: candidate.timestamp,
            metadata: candidate.metadata,
        };
        let reason = if penalty_reasons.is_empty() {
            format!("trust {trust_score:.2} clears write threshold")
        } else {
            format!(
                "trust {trust_score:.2} clears write threshold despite: {}",
                penalty_reasons.join("; ")
            )
        };

        self.emit(
            EventType::MemoryAdmitted,
            json!({
                "memory_id": memory.id,
                "memory_type": memory.memory_type,
                "source": memory.source.key(),
                "trust_score": trust_score,
                "entities": entities.clone(),
            }),
        );

        GateDecision {
            action: GateAction::Allow,
            trust_score,
            reason,
            memory: Some(memory),
            entities,
        }
    }

    fn hold(
        &self,
        candidate: MemoryCandidate,
        trust_score: f64,
        penalty_reasons: Vec<String>,
    ) -> GateDecision {
        let now = Utc::now();
        let review_after = now
            .checked_add_signed(ChronoDuration::hours(
                i64::try_from(self.config.review_after_hours).unwrap_or(24),
            ))
            .unwrap_or(now);
        let reason = if penalty_reasons.is_empty() {
            format!("trust {trust_score:.2} below write threshold")
        } else {
            format!(
                "trust {trust_score:.2} below write threshold: {}",
                penalty_reasons.join("; ")
            )
        };

        let entry = QuarantinedMemory {
            id: Uuid::new_v4(),
            candidate,
            trust_score,
            reason: reason.clone(),
            quarantined_at: now,
            review_after,
        };

        self.emit(
            EventType::MemoryQuarantined,
            json!({
                "quarantine_id": entry.id,
                "source": entry.candidate.source.key(),
                "trust_score": trust_score,
                "review_after": entry.review_after.to_rfc3339(),
            }),
        );

        if let Ok(mut quarantine) = self.quarantine.lock() {
            quarantine.push_back(entry);
            while quarantine.len() > self.config.max_quarantine_size {
                if let Some(dropped) = quarantine.pop_front() {
                    warn!(id = %dropped.id, "quarantine full, dropping oldest entry");
                }
            }
        }

        GateDecision {
            action: GateAction::Quarantine,
            trust_score,
            reason,
            memory: None,
            entities: Vec::new(),
        }
    }

    fn drop_candidate(
        &self,
        candidate: MemoryCandidate,
        trust_score: f64,
        penalty_reasons: Vec<String>,
    ) -> GateDecision {
        let reason = if penalty_reasons.is_empty() {
            format!("trust {trust_score:.2} below quarantine threshold")
        } else {
            format!(
                "trust {trust_score:.2} below quarantine threshold: {}",
                penalty_reasons.join("; ")
            )
        };

        self.emit(
            EventType::MemoryRejected,
            json!({
                "source": candidate.source.key(),
                "trust_score": trust_score,
                "reason": reason.clone(),
            }),
        );

        GateDecision {
            action: GateAction::Reject,
            trust_score,
            reason,
            memory: None,
            entities: Vec::new(),
        }
    }

    fn emit(&self, event_type: EventType, payload: serde_json::Value) {
        // Gate events get their own request id; they are not part of any
        // tool call's chain.
        if let Err(e) = self.events.append(Uuid::new_v4(), None, event_type, payload) {
            warn!(error = %e, "failed to append memory gate event");
        }
    }

    /// Number of entries currently quarantined.
    pub fn quarantine_len(&self) -> usize {
        self.quarantine.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// All quarantined entries (owned copies).
    pub fn quarantined(&self) -> Vec<QuarantinedMemory> {
        self.quarantine
            .lock()
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Entries whose review window has opened.
    pub fn due_for_review(&self, now: DateTime<Utc>) -> Vec<QuarantinedMemory> {
        self.quarantine
            .lock()
            .map(|q| q.iter().filter(|e| e.review_after <= now).cloned().collect())
            .unwrap_or_default()
    }

    /// Promote a reviewed entry into an admitted memory.
    ///
    /// Returns `None` when the id is unknown (already promoted/discarded).
    pub fn promote(&self, id: Uuid) -> Option<Memory> {
        let entry = self.take(id)?;
        let memory_type = classify_content(&entry.candidate.content, &entry.candidate.source);
        let memory = Memory {
            id: Uuid::new_v4(),
            content: entry.candidate.content,
            source: entry.candidate.source,
            trust_score: entry.trust_score,
            memory_type,
            timestamp: entry.candidate.timestamp,
            metadata: entry.candidate.metadata,
        };
        self.emit(
            EventType::MemoryAdmitted,
            json!({
                "memory_id": memory.id,
                "memory_type": memory.memory_type,
                "source": memory.source.key(),
                "trust_score": memory.trust_score,
                "promoted_from": id,
            }),
        );
        Some(memory)
    }

    /// Discard a reviewed entry.
    pub fn discard(&self, id: Uuid) -> bool {
        let removed = self.take(id).is_some();
        if removed {
            self.emit(EventType::MemoryRejected, json!({ "discarded_from": id }));
        }
        removed
    }

    fn take(&self, id: Uuid) -> Option<QuarantinedMemory> {
        let mut quarantine = self.quarantine.lock().ok()?;
        let index = quarantine.iter().position(|e| e.id == id)?;
        quarantine.remove(index)
    }

    /// Health probe.
    pub fn health(&self) -> ComponentHealth {
        match self.quarantine.lock() {
            Ok(q) => ComponentHealth {
                component: "memory_gate".to_owned(),
                healthy: true,
                detail: format!("{} quarantined", q.len()),
            },
            Err(e) => ComponentHealth {
                component: "memory_gate".to_owned(),
                healthy: false,
                detail: e.to_string(),
            },
        }
    }
}
