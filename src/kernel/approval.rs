//! Approval gate — risk-classed human-in-the-loop with trust floors.
//!
//! The pipeline submits an approval request with a resolved requirement.
//! `none` grants immediately; `automated` grants when source trust clears
//! the floor and escalates to a parked human request otherwise; `human`
//! parks the request on a `tokio::sync::oneshot` channel resolved by an
//! external `grant`/`deny` callback; `dual` additionally needs the
//! automated half, evaluated from source trust at submission.
//!
//! Parked requests race their timeout window: exactly one resolution
//! wins, the loser is discarded when the entry has already left the map.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{ApprovalRequirement, CallSource, ComponentHealth, RiskClass};

/// Default approval timeout: 10 minutes.
const DEFAULT_WINDOW_SECS: u64 = 600;

// ── Records and outcomes ────────────────────────────────────────

/// Lifecycle decision on an approval record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Awaiting resolution.
    Pending,
    /// Approved.
    Granted,
    /// Refused.
    Denied,
    /// Window elapsed without a decision.
    TimedOut,
}

/// An approval record, pending or resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Approval id.
    pub id: Uuid,
    /// Request awaiting approval.
    pub request_id: Uuid,
    /// Tool being approved.
    pub tool_name: String,
    /// Contract risk class.
    pub risk_class: RiskClass,
    /// Requirement that produced this record.
    pub requirement: ApprovalRequirement,
    /// Call origin.
    pub source: CallSource,
    /// Source trust at submission.
    pub source_trust: f64,
    /// When the request was submitted.
    pub requested_at: DateTime<Utc>,
    /// When it was resolved, if it was.
    pub decided_at: Option<DateTime<Utc>>,
    /// Current decision.
    pub decision: ApprovalDecision,
    /// Who decided (`automated`, or the human approver's identifier).
    pub approver: Option<String>,
    /// Denial or grant reason.
    pub reason: Option<String>,
}

/// Resolution delivered through the oneshot channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// Approved.
    Granted,
    /// Refused with a reason.
    Denied {
        /// Why the request was refused.
        reason: String,
    },
    /// Window elapsed.
    TimedOut,
}

/// What `submit` produced.
pub enum SubmitOutcome {
    /// Resolved without parking (requirement `none`, automated pass, or
    /// an immediate dual denial).
    Immediate(ApprovalRecord),
    /// Parked awaiting an external decision.
    Parked {
        /// The pending record.
        record: ApprovalRecord,
        /// Receiver resolved by `grant`/`deny`/timeout.
        receiver: oneshot::Receiver<ApprovalOutcome>,
        /// Window after which the caller should invoke
        /// [`ApprovalGate::timeout_pending`].
        window: Duration,
    },
}

/// A submission into the gate.
#[derive(Debug, Clone)]
pub struct ApprovalSubmission {
    /// Request id.
    pub request_id: Uuid,
    /// Tool being approved.
    pub tool_name: String,
    /// Contract risk class.
    pub risk_class: RiskClass,
    /// Requirement, already resolved by governance.
    pub requirement: ApprovalRequirement,
    /// Call origin.
    pub source: CallSource,
    /// Resolved source trust.
    pub source_trust: f64,
    /// Override of the gate's default window.
    pub window: Option<Duration>,
}

/// Approval gate errors.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// No pending request with this id.
    #[error("approval request not found: {0}")]
    NotFound(Uuid),
    /// Internal lock was poisoned.
    #[error("approval gate lock poisoned: {0}")]
    Lock(String),
}

// ── Gate ────────────────────────────────────────────────────────

struct PendingEntry {
    record: ApprovalRecord,
    sender: oneshot::Sender<ApprovalOutcome>,
    // Dual bookkeeping: which halves have arrived.
    needs_human: bool,
    human_granted: bool,
    automated_granted: bool,
    expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for PendingEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingEntry")
            .field("record", &self.record)
            .field("sender", &"<oneshot::Sender>")
            .finish()
    }
}

/// The approval gate.
pub struct ApprovalGate {
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
    resolved: Mutex<Vec<ApprovalRecord>>,
    default_window: Duration,
    automated_trust_floor: f64,
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.pending.lock().map(|p| p.len()).unwrap_or(0);
        f.debug_struct("ApprovalGate")
            .field("pending", &pending)
            .field("default_window", &self.default_window)
            .finish()
    }
}

impl ApprovalGate {
    /// Create a gate.
    pub fn new(default_window: Duration, automated_trust_floor: f64) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            resolved: Mutex::new(Vec::new()),
            default_window,
            automated_trust_floor: automated_trust_floor.clamp(0.0, 1.0),
        }
    }

    /// Create a gate with the default 10-minute window and 0.7 floor.
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(DEFAULT_WINDOW_SECS), 0.7)
    }

    /// Submit an approval request with an already-resolved requirement.
    pub fn request(&self, submission: ApprovalSubmission) -> Result<SubmitOutcome, ApprovalError> {
        let now = Utc::now();
        let mut record = ApprovalRecord {
            id: Uuid::new_v4(),
            request_id: submission.request_id,
            tool_name: submission.tool_name.clone(),
            risk_class: submission.risk_class,
            requirement: submission.requirement,
            source: submission.source.clone(),
            source_trust: submission.source_trust,
            requested_at: now,
            decided_at: None,
            decision: ApprovalDecision::Pending,
            approver: None,
            reason: None,
        };

        match submission.requirement {
            ApprovalRequirement::None => {
                record.decision = ApprovalDecision::Granted;
                record.decided_at = Some(now);
                record.approver = Some("automated".to_owned());
                record.reason = Some("no approval required".to_owned());
                self.push_resolved(record.clone())?;
                Ok(SubmitOutcome::Immediate(record))
            }
            ApprovalRequirement::Automated => {
                if submission.source_trust >= self.automated_trust_floor {
                    record.decision = ApprovalDecision::Granted;
                    record.decided_at = Some(now);
                    record.approver = Some("automated".to_owned());
                    record.reason = Some(format!(
                        "source trust {:.2} clears floor {:.2}",
                        submission.source_trust, self.automated_trust_floor
                    ));
                    self.push_resolved(record.clone())?;
                    Ok(SubmitOutcome::Immediate(record))
                } else {
                    // Escalate: park as a human decision.
                    record.requirement = ApprovalRequirement::Human;
                    self.park(record, submission.window, false)
                }
            }
            ApprovalRequirement::Human => self.park(record, submission.window, false),
            ApprovalRequirement::Dual => {
                if submission.source_trust >= self.automated_trust_floor {
                    // Automated half granted up front; park for the human half.
                    self.park(record, submission.window, true)
                } else {
                    record.decision = ApprovalDecision::Denied;
                    record.decided_at = Some(now);
                    record.approver = Some("automated".to_owned());
                    record.reason = Some(format!(
                        "automated half refused: trust {:.2} below floor {:.2}",
                        submission.source_trust, self.automated_trust_floor
                    ));
                    self.push_resolved(record.clone())?;
                    Ok(SubmitOutcome::Immediate(record))
                }
            }
        }
    }

    fn park(
        &self,
        record: ApprovalRecord,
        window: Option<Duration>,
        automated_granted: bool,
    ) -> Result<SubmitOutcome, ApprovalError> {
        let window = window.unwrap_or(self.default_window);
        let expires_at = record
            .requested_at
            .checked_add_signed(
                chrono::TimeDelta::from_std(window)
                    .unwrap_or_else(|_| chrono::TimeDelta::seconds(600)),
            )
            .unwrap_or(record.requested_at);

        let (sender, receiver) = oneshot::channel();
        info!(
            approval = %record.id,
            request = %record.request_id,
            tool = %record.tool_name,
            requirement = %record.requirement,
            "approval request parked"
        );

        let mut pending = self
            .pending
            .lock()
            .map_err(|e| ApprovalError::Lock(e.to_string()))?;
        pending.insert(
            record.id,
            PendingEntry {
                record: record.clone(),
                sender,
                needs_human: true,
                human_granted: false,
                automated_granted,
                expires_at,
            },
        );

        Ok(SubmitOutcome::Parked {
            record,
            receiver,
            window,
        })
    }

    /// Grant a pending request (human callback).
    ///
    /// For `dual` requests the grant completes the human half; the request
    /// resolves once both halves are present.
    pub fn grant(&self, id: Uuid, approver: impl Into<String>) -> Result<(), ApprovalError> {
        let approver = approver.into();
        let mut pending = self
            .pending
            .lock()
            .map_err(|e| ApprovalError::Lock(e.to_string()))?;

        let Some(entry) = pending.get_mut(&id) else {
            return Err(ApprovalError::NotFound(id));
        };

        entry.human_granted = true;
        entry.record.approver = Some(approver);

        let complete = (!entry.needs_human || entry.human_granted)
            && (entry.record.requirement != ApprovalRequirement::Dual || entry.automated_granted);
        if !complete {
            info!(approval = %id, "dual approval: human half granted, awaiting automated half");
            return Ok(());
        }

        let mut entry = pending.remove(&id).ok_or(ApprovalError::NotFound(id))?;
        drop(pending);

        entry.record.decision = ApprovalDecision::Granted;
        entry.record.decided_at = Some(Utc::now());
        info!(approval = %id, request = %entry.record.request_id, "approval granted");

        // Receiver may already be dropped (pipeline cancelled) — ignore.
        let _send_result = entry.sender.send(ApprovalOutcome::Granted);
        self.push_resolved(entry.record)?;
        Ok(())
    }

    /// Deny a pending request (human callback). Resolves immediately,
    /// regardless of any dual half already granted.
    pub fn deny(
        &self,
        id: Uuid,
        approver: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<(), ApprovalError> {
        let reason = reason.into();
        let mut pending = self
            .pending
            .lock()
            .map_err(|e| ApprovalError::Lock(e.to_string()))?;
        let mut entry = pending.remove(&id).ok_or(ApprovalError::NotFound(id))?;
        drop(pending);

        entry.record.decision = ApprovalDecision::Denied;
        entry.record.decided_at = Some(Utc::now());
        entry.record.approver = Some(approver.into());
        entry.record.reason = Some(reason.clone());
        info!(approval = %id, reason = %reason, "approval denied");

        let _send_result = entry.sender.send(ApprovalOutcome::Denied { reason });
        self.push_resolved(entry.record)?;
        Ok(())
    }

    /// Resolve a pending request as timed out.
    ///
    /// No-op (Ok) when the request was already resolved — the decision
    /// callback won the race.
    pub fn timeout_pending(&self, id: Uuid) -> Result<bool, ApprovalError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|e| ApprovalError::Lock(e.to_string()))?;
        let Some(mut entry) = pending.remove(&id) else {
            return Ok(false);
        };
        drop(pending);

        entry.record.decision = ApprovalDecision::TimedOut;
        entry.record.decided_at = Some(Utc::now());
        entry.record.reason = Some("timeout".to_owned());
        warn!(approval = %id, request = %entry.record.request_id, "approval timed out");

        let _send_result = entry.sender.send(ApprovalOutcome::TimedOut);
        self.push_resolved(entry.record)?;
        Ok(true)
    }

    /// Sweep every pending request past its window, timing each out.
    ///
    /// Returns how many were expired. Meant to be called periodically by
    /// the host when pipelines are not driving their own timeouts.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<Uuid> = self
            .pending
            .lock()
            .map(|pending| {
                pending
                    .iter()
                    .filter(|(_, e)| e.expires_at <= now)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default();

        let mut count = 0usize;
        for id in expired {
            if matches!(self.timeout_pending(id), Ok(true)) {
                count = count.saturating_add(1);
            }
        }
        count
    }

    /// A pending record by id.
    pub fn get_pending(&self, id: Uuid) -> Option<ApprovalRecord> {
        self.pending
            .lock()
            .ok()
            .and_then(|pending| pending.get(&id).map(|e| e.record.clone()))
    }

    /// All pending records.
    pub fn list_pending(&self) -> Vec<ApprovalRecord> {
        self.pending
            .lock()
            .map(|pending| pending.values().map(|e| e.record.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of requests awaiting a decision.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// All resolved records, oldest first.
    pub fn resolved_records(&self) -> Vec<ApprovalRecord> {
        self.resolved
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn push_resolved(&self, record: ApprovalRecord) -> Result<(), ApprovalError> {
        self.resolved
            .lock()
            .map_err(|e| ApprovalError::Lock(e.to_string()))?
            .push(record);
        Ok(())
    }

    /// Health probe.
    pub fn health(&self) -> ComponentHealth {
        match self.pending.lock() {
            Ok(pending) => ComponentHealth {
                component: "approval_gate".to_owned(),
                healthy: true,
                detail: format!("{} pending", pending.len()),
            },
            Err(e) => ComponentHealth {
                component: "approval_gate".to_owned(),
                healthy: false,
                detail: e.to_string(),
            },
        }
    }
}
