// Core types shared across the kernel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Risk classification of a tool contract.
///
/// Governs the default approval requirement and whether compensation is
/// expected to exist for the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskClass {
    /// No side effects; always safe to run.
    ReadOnly,
    /// Side effects that a compensation function can undo.
    Reversible,
    /// Side effects that cannot be undone.
    Irreversible,
}

impl std::fmt::Display for RiskClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadOnly => f.write_str("read-only"),
            Self::Reversible => f.write_str("reversible"),
            Self::Irreversible => f.write_str("irreversible"),
        }
    }
}

impl std::str::FromStr for RiskClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read-only" => Ok(Self::ReadOnly),
            "reversible" => Ok(Self::Reversible),
            "irreversible" => Ok(Self::Irreversible),
            other => Err(format!("unknown risk class: {other}")),
        }
    }
}

/// Tagged origin of a proposed call or memory candidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallSource {
    /// The human operator.
    User,
    /// The kernel or its host process.
    System,
    /// Model-generated proposals.
    Llm,
    /// An anonymous plugin.
    Plugin,
    /// Anything outside the trust boundary.
    External,
    /// A specific, named plugin.
    NamedPlugin(String),
}

impl CallSource {
    /// Stable key used by the trust scorer and persistence layer.
    pub fn key(&self) -> String {
        match self {
            Self::User => "user".to_owned(),
            Self::System => "system".to_owned(),
            Self::Llm => "llm".to_owned(),
            Self::Plugin => "plugin".to_owned(),
            Self::External => "external".to_owned(),
            Self::NamedPlugin(name) => format!("plugin:{name}"),
        }
    }
}

impl std::fmt::Display for CallSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Closed set of execution event types recorded in the audit chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A call entered the pipeline.
    #[serde(rename = "tool:proposed")]
    ToolProposed,
    /// Parameters passed schema validation.
    #[serde(rename = "tool:validated")]
    ToolValidated,
    /// The approval gate was consulted.
    #[serde(rename = "tool:approval_requested")]
    ToolApprovalRequested,
    /// Approval granted.
    #[serde(rename = "tool:approval_granted")]
    ToolApprovalGranted,
    /// Approval denied or timed out.
    #[serde(rename = "tool:approval_denied")]
    ToolApprovalDenied,
    /// Handler invocation started.
    #[serde(rename = "tool:executing")]
    ToolExecuting,
    /// Handler returned.
    #[serde(rename = "tool:executed")]
    ToolExecuted,
    /// Post-conditions were evaluated.
    #[serde(rename = "tool:verified")]
    ToolVerified,
    /// Handler threw or timed out.
    #[serde(rename = "tool:failed")]
    ToolFailed,
    /// Compensation ran (success or failure in payload).
    #[serde(rename = "tool:compensated")]
    ToolCompensated,
    /// The kernel state machine moved (or rejected a move).
    #[serde(rename = "state:transition")]
    StateTransition,
    /// A memory candidate was admitted.
    #[serde(rename = "memory:admitted")]
    MemoryAdmitted,
    /// A memory candidate was quarantined.
    #[serde(rename = "memory:quarantined")]
    MemoryQuarantined,
    /// A memory candidate was rejected.
    #[serde(rename = "memory:rejected")]
    MemoryRejected,
    /// A persona drift report was produced.
    #[serde(rename = "identity:drift:report")]
    DriftReport,
    /// Safe mode engaged.
    #[serde(rename = "safe_mode:entered")]
    SafeModeEntered,
    /// Safe mode exited on authorized request.
    #[serde(rename = "safe_mode:exited")]
    SafeModeExited,
    /// A compensation incident was opened.
    #[serde(rename = "compensation:incident")]
    CompensationIncident,
}

impl EventType {
    /// Wire representation, identical to the serde rename.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolProposed => "tool:proposed",
            Self::ToolValidated => "tool:validated",
            Self::ToolApprovalRequested => "tool:approval_requested",
            Self::ToolApprovalGranted => "tool:approval_granted",
            Self::ToolApprovalDenied => "tool:approval_denied",
            Self::ToolExecuting => "tool:executing",
            Self::ToolExecuted => "tool:executed",
            Self::ToolVerified => "tool:verified",
            Self::ToolFailed => "tool:failed",
            Self::ToolCompensated => "tool:compensated",
            Self::StateTransition => "state:transition",
            Self::MemoryAdmitted => "memory:admitted",
            Self::MemoryQuarantined => "memory:quarantined",
            Self::MemoryRejected => "memory:rejected",
            Self::DriftReport => "identity:drift:report",
            Self::SafeModeEntered => "safe_mode:entered",
            Self::SafeModeExited => "safe_mode:exited",
            Self::CompensationIncident => "compensation:incident",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool:proposed" => Ok(Self::ToolProposed),
            "tool:validated" => Ok(Self::ToolValidated),
            "tool:approval_requested" => Ok(Self::ToolApprovalRequested),
            "tool:approval_granted" => Ok(Self::ToolApprovalGranted),
            "tool:approval_denied" => Ok(Self::ToolApprovalDenied),
            "tool:executing" => Ok(Self::ToolExecuting),
            "tool:executed" => Ok(Self::ToolExecuted),
            "tool:verified" => Ok(Self::ToolVerified),
            "tool:failed" => Ok(Self::ToolFailed),
            "tool:compensated" => Ok(Self::ToolCompensated),
            "state:transition" => Ok(Self::StateTransition),
            "memory:admitted" => Ok(Self::MemoryAdmitted),
            "memory:quarantined" => Ok(Self::MemoryQuarantined),
            "memory:rejected" => Ok(Self::MemoryRejected),
            "identity:drift:report" => Ok(Self::DriftReport),
            "safe_mode:entered" => Ok(Self::SafeModeEntered),
            "safe_mode:exited" => Ok(Self::SafeModeExited),
            "compensation:incident" => Ok(Self::CompensationIncident),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// Global kernel lifecycle state. At most one state at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    /// No request in flight.
    Idle,
    /// Contract lookup and schema validation in progress.
    Validating,
    /// Parked on the approval gate.
    AwaitingApproval,
    /// Handler invocation in progress.
    Executing,
    /// Post-conditions being evaluated.
    Verifying,
    /// Rollback in progress.
    Compensating,
    /// Degraded regime: only read-only tools run.
    SafeMode,
    /// Terminal until reset.
    Error,
}

impl std::fmt::Display for KernelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Validating => f.write_str("validating"),
            Self::AwaitingApproval => f.write_str("awaiting_approval"),
            Self::Executing => f.write_str("executing"),
            Self::Verifying => f.write_str("verifying"),
            Self::Compensating => f.write_str("compensating"),
            Self::SafeMode => f.write_str("safe_mode"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Closed error taxonomy, stable across every kernel surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No contract registered for the proposed tool.
    UnknownTool,
    /// Parameters failed schema validation.
    InvalidParams,
    /// Approval denied, timed out, or refused in safe mode.
    Unapproved,
    /// Handler exceeded the contract timeout.
    HandlerTimeout,
    /// Handler returned an error.
    HandlerError,
    /// A critical post-condition did not hold.
    VerificationFailed,
    /// Compensation was absent, failed, or timed out.
    CompensationFailed,
    /// The state machine rejected an illegal transition.
    StateMachineRejected,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTool => f.write_str("unknown_tool"),
            Self::InvalidParams => f.write_str("invalid_params"),
            Self::Unapproved => f.write_str("unapproved"),
            Self::HandlerTimeout => f.write_str("handler_timeout"),
            Self::HandlerError => f.write_str("handler_error"),
            Self::VerificationFailed => f.write_str("verification_failed"),
            Self::CompensationFailed => f.write_str("compensation_failed"),
            Self::StateMachineRejected => f.write_str("state_machine_rejected"),
        }
    }
}

/// Classification of an admitted memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// A statement about the world.
    Fact,
    /// Behavioral directives — the gate treats these with suspicion.
    Instruction,
    /// An operator preference.
    Preference,
    /// Something the agent noticed.
    Observation,
    /// A long-lived objective.
    Goal,
    /// Kernel-originated bookkeeping.
    System,
}

/// What the approval gate demands before execution may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalRequirement {
    /// Immediate grant.
    None,
    /// Granted when source trust clears the floor; escalates otherwise.
    Automated,
    /// Requires an external human decision.
    Human,
    /// Requires both a human grant and an automated grant.
    Dual,
}

impl std::fmt::Display for ApprovalRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Automated => f.write_str("automated"),
            Self::Human => f.write_str("human"),
            Self::Dual => f.write_str("dual"),
        }
    }
}

/// Severity of a post-condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Failure fails the whole verification.
    Critical,
    /// Failure degrades the result to partial.
    Warning,
    /// Informational only.
    Info,
}

/// A proposed tool call entering the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedToolCall {
    /// Registered tool name.
    pub tool: String,
    /// Parameters to validate against the contract schema.
    pub params: serde_json::Value,
    /// Origin of the proposal.
    pub source: CallSource,
    /// Optional trust override; otherwise the scorer is consulted.
    pub source_trust: Option<f64>,
    /// Identifier keying the event chain for this call.
    pub request_id: Uuid,
    /// Optional grouping id (e.g. the steps of one plan).
    pub correlation_id: Option<Uuid>,
}

impl ProposedToolCall {
    /// Build a call with a fresh request id and no correlation.
    pub fn new(tool: impl Into<String>, params: serde_json::Value, source: CallSource) -> Self {
        Self {
            tool: tool.into(),
            params,
            source,
            source_trust: None,
            request_id: Uuid::new_v4(),
            correlation_id: None,
        }
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Override the scored source trust.
    #[must_use]
    pub fn with_trust(mut self, trust: f64) -> Self {
        self.source_trust = Some(trust.clamp(0.0, 1.0));
        self
    }
}

/// Health probe result every subsystem can produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Subsystem name.
    pub component: String,
    /// Whether the subsystem considers itself operational.
    pub healthy: bool,
    /// Free-form diagnostic detail.
    pub detail: String,
}

/// A long-lived goal tracked by the persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    /// Goal id.
    pub id: Uuid,
    /// What the goal is.
    pub description: String,
    /// Lifecycle status.
    pub status: GoalStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Goal lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    /// Being pursued.
    Active,
    /// Temporarily parked.
    Paused,
    /// Achieved.
    Completed,
    /// Dropped.
    Abandoned,
}

impl GoalStatus {
    /// Stable storage string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl std::str::FromStr for GoalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(format!("unknown goal status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_class_round_trip() {
        for (s, rc) in [
            ("read-only", RiskClass::ReadOnly),
            ("reversible", RiskClass::Reversible),
            ("irreversible", RiskClass::Irreversible),
        ] {
            assert_eq!(s.parse::<RiskClass>().expect("parse"), rc);
            assert_eq!(rc.to_string(), s);
        }
    }

    #[test]
    fn test_risk_class_ordering() {
        assert!(RiskClass::ReadOnly < RiskClass::Reversible);
        assert!(RiskClass::Reversible < RiskClass::Irreversible);
    }

    #[test]
    fn test_event_type_round_trip() {
        let all = [
            EventType::ToolProposed,
            EventType::ToolValidated,
            EventType::ToolApprovalRequested,
            EventType::ToolApprovalGranted,
            EventType::ToolApprovalDenied,
            EventType::ToolExecuting,
            EventType::ToolExecuted,
            EventType::ToolVerified,
            EventType::ToolFailed,
            EventType::ToolCompensated,
            EventType::StateTransition,
            EventType::MemoryAdmitted,
            EventType::MemoryQuarantined,
            EventType::MemoryRejected,
            EventType::DriftReport,
            EventType::SafeModeEntered,
            EventType::SafeModeExited,
            EventType::CompensationIncident,
        ];
        for ty in all {
            assert_eq!(ty.as_str().parse::<EventType>().expect("parse"), ty);
        }
    }

    #[test]
    fn test_event_type_serde_matches_as_str() {
        let json = serde_json::to_string(&EventType::ToolProposed).expect("serialize");
        assert_eq!(json, "\"tool:proposed\"");
        let json = serde_json::to_string(&EventType::DriftReport).expect("serialize");
        assert_eq!(json, "\"identity:drift:report\"");
    }

    #[test]
    fn test_call_source_keys() {
        assert_eq!(CallSource::User.key(), "user");
        assert_eq!(CallSource::NamedPlugin("weather".to_owned()).key(), "plugin:weather");
    }

    #[test]
    fn test_proposed_call_builders() {
        let call = ProposedToolCall::new("READ_FILE", serde_json::json!({"path": "a"}), CallSource::System)
            .with_trust(1.5);
        assert_eq!(call.source_trust, Some(1.0), "trust should clamp to [0,1]");
        assert!(call.correlation_id.is_none());
    }

    #[test]
    fn test_kernel_state_display() {
        assert_eq!(KernelState::AwaitingApproval.to_string(), "awaiting_approval");
        assert_eq!(KernelState::SafeMode.to_string(), "safe_mode");
    }

    #[test]
    fn test_error_kind_serde() {
        let json = serde_json::to_string(&ErrorKind::InvalidParams).expect("serialize");
        assert_eq!(json, "\"invalid_params\"");
    }
}
