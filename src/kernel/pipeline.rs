//! The governed execution pipeline.
//!
//! One call flows propose → validate → approve → execute → verify →
//! compensate, with an event appended at every step and the kernel state
//! machine driven through each phase. The pipeline never throws across
//! its boundary: every failure is folded into a [`PipelineResult`] with
//! a closed [`ErrorKind`].
//!
//! While safe mode is active, read-only contracts run with state
//! transitions suppressed and everything else is refused as unapproved.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::kernel::approval::{ApprovalGate, ApprovalOutcome, ApprovalSubmission, SubmitOutcome};
use crate::kernel::compensation::{
    CompensationContext, CompensationOutcome, CompensationRegistry, IncidentManager, IncidentReason,
};
use crate::kernel::contract::{ToolContract, ToolRegistry};
use crate::kernel::events::EventStore;
use crate::kernel::governance::{GovernanceContext, GovernanceEngine};
use crate::kernel::safe_mode::SafeModeController;
use crate::kernel::schema::ValidationReport;
use crate::kernel::state::StateMachine;
use crate::kernel::trust::{TrustOutcome, TrustScorer};
use crate::kernel::verifier::{StateQuery, VerificationResult, Verifier, VerifyContext};
use crate::types::{
    ApprovalRequirement, ComponentHealth, ErrorKind, EventType, KernelState, ProposedToolCall,
    RiskClass,
};

// ── Cancellation ────────────────────────────────────────────────

/// Cancels a pipeline run. Every suspension point observes the token.
pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

impl CancellationSource {
    /// Create a source/token pair.
    pub fn new() -> (Self, CancellationToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancellationToken { rx })
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cancellation token observed by the pipeline.
#[derive(Clone)]
pub struct CancellationToken {
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    /// A token that never cancels.
    pub fn none() -> Self {
        static NONE: std::sync::OnceLock<CancellationToken> = std::sync::OnceLock::new();
        NONE.get_or_init(|| {
            let (tx, rx) = watch::channel(false);
            // Keep the channel open for the process lifetime.
            std::mem::forget(tx);
            CancellationToken { rx }
        })
        .clone()
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is signalled; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// ── Handler & result types ──────────────────────────────────────

/// What a handler returns on success.
#[derive(Debug, Clone)]
pub struct HandlerOutput {
    /// Structured result.
    pub result: serde_json::Value,
    /// Self-reported duration in milliseconds.
    pub duration_ms: u64,
}

/// Boxed future returned by a tool handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<HandlerOutput, String>> + Send>>;

/// A caller-supplied tool handler.
pub type ToolHandler = Arc<dyn Fn(serde_json::Value) -> HandlerFuture + Send + Sync>;

/// Wrap a synchronous closure as a [`ToolHandler`].
pub fn sync_handler(
    f: impl Fn(serde_json::Value) -> Result<HandlerOutput, String> + Send + Sync + 'static,
) -> ToolHandler {
    Arc::new(move |params| {
        let outcome = f(params);
        Box::pin(async move { outcome }) as HandlerFuture
    })
}

/// Structured outcome of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// Whether the call executed and verified.
    pub success: bool,
    /// Request id of the call.
    pub request_id: Uuid,
    /// Failure classification, when unsuccessful.
    pub error_kind: Option<ErrorKind>,
    /// Failure detail.
    pub error: Option<String>,
    /// Schema validation report, when validation ran.
    pub validation: Option<ValidationReport>,
    /// Verification result, when the verifier ran.
    pub verification: Option<VerificationResult>,
    /// Compensation outcome, when compensation ran.
    pub compensation: Option<CompensationOutcome>,
    /// Wall-clock duration of the pipeline run.
    pub duration_ms: u64,
}

impl PipelineResult {
    fn failure(request_id: Uuid, kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            request_id,
            error_kind: Some(kind),
            error: Some(error.into()),
            validation: None,
            verification: None,
            compensation: None,
            duration_ms: 0,
        }
    }
}

// ── Pipeline ────────────────────────────────────────────────────

/// The execution pipeline. Owns references to every governing subsystem;
/// holds no per-call state of its own.
pub struct Pipeline {
    registry: Arc<ToolRegistry>,
    events: Arc<dyn EventStore>,
    state: Arc<StateMachine>,
    approval: Arc<ApprovalGate>,
    governance: Arc<GovernanceEngine>,
    trust: Arc<TrustScorer>,
    verifier: Arc<Verifier>,
    compensation: Arc<CompensationRegistry>,
    incidents: Arc<IncidentManager>,
    safe_mode: Arc<SafeModeController>,
    approval_window: Duration,
    policy_id: Option<String>,
    agent_id: String,
    state_query: Option<Arc<dyn StateQuery>>,
}

/// Constructor wiring for [`Pipeline`].
pub struct PipelineParts {
    /// Tool contract registry.
    pub registry: Arc<ToolRegistry>,
    /// Event store.
    pub events: Arc<dyn EventStore>,
    /// Kernel state machine.
    pub state: Arc<StateMachine>,
    /// Approval gate.
    pub approval: Arc<ApprovalGate>,
    /// Governance engine.
    pub governance: Arc<GovernanceEngine>,
    /// Trust scorer.
    pub trust: Arc<TrustScorer>,
    /// Post-condition verifier.
    pub verifier: Arc<Verifier>,
    /// Compensation registry.
    pub compensation: Arc<CompensationRegistry>,
    /// Incident manager.
    pub incidents: Arc<IncidentManager>,
    /// Safe-mode controller.
    pub safe_mode: Arc<SafeModeController>,
    /// Human-approval window.
    pub approval_window: Duration,
}

impl Pipeline {
    /// Wire a pipeline from its parts.
    pub fn new(parts: PipelineParts) -> Self {
        Self {
            registry: parts.registry,
            events: parts.events,
            state: parts.state,
            approval: parts.approval,
            governance: parts.governance,
            trust: parts.trust,
            verifier: parts.verifier,
            compensation: parts.compensation,
            incidents: parts.incidents,
            safe_mode: parts.safe_mode,
            approval_window: parts.approval_window,
            policy_id: None,
            agent_id: "kernel".to_owned(),
            state_query: None,
        }
    }

    /// Select the governance policy consulted for approvals.
    #[must_use]
    pub fn with_policy(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_id = Some(policy_id.into());
        self
    }

    /// Set the agent id stamped into verification contexts.
    #[must_use]
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    /// Attach an independent state lookup for verifier checks.
    #[must_use]
    pub fn with_state_query(mut self, query: Arc<dyn StateQuery>) -> Self {
        self.state_query = Some(query);
        self
    }

    /// Execute a proposed call with no external cancellation.
    pub async fn execute(&self, call: ProposedToolCall, handler: ToolHandler) -> PipelineResult {
        self.execute_with_cancellation(call, handler, CancellationToken::none())
            .await
    }

    /// Execute a proposed call, observing `cancel` at every suspension.
    pub async fn execute_with_cancellation(
        &self,
        call: ProposedToolCall,
        handler: ToolHandler,
        cancel: CancellationToken,
    ) -> PipelineResult {
        let started = Instant::now();
        let request_id = call.request_id;
        let correlation_id = call.correlation_id;
        let in_safe_mode =
            self.safe_mode.is_active() || self.state.current() == KernelState::SafeMode;

        info!(request = %request_id, tool = %call.tool, source = %call.source, "tool proposed");
        self.emit(
            request_id,
            correlation_id,
            EventType::ToolProposed,
            json!({
                "tool": call.tool.clone(),
                "source": call.source.key(),
                "params": call.params.clone(),
            }),
        );

        // Enter the validating phase. A rejected entry transition means
        // another request owns the machine (or it is in terminal error).
        if !in_safe_mode
            && self
                .state
                .transition(request_id, KernelState::Validating)
                .is_err()
        {
            return self.finish(
                PipelineResult::failure(
                    request_id,
                    ErrorKind::StateMachineRejected,
                    format!("kernel busy or faulted (state {})", self.state.current()),
                ),
                started,
            );
        }

        // Contract lookup.
        let Some(contract) = self.registry.get(&call.tool, None) else {
            self.emit(
                request_id,
                correlation_id,
                EventType::ToolFailed,
                json!({ "error_kind": "unknown_tool", "tool": call.tool.clone() }),
            );
            if !in_safe_mode {
                let _ = self.state.transition(request_id, KernelState::Error);
            }
            return self.finish(
                PipelineResult::failure(
                    request_id,
                    ErrorKind::UnknownTool,
                    format!("no contract registered for {}", call.tool),
                ),
                started,
            );
        };

        // Safe-mode refusal for anything that can mutate.
        if in_safe_mode && contract.risk_class != RiskClass::ReadOnly {
            self.emit(
                request_id,
                correlation_id,
                EventType::ToolApprovalDenied,
                json!({ "reason": "safe_mode", "risk_class": contract.risk_class }),
            );
            return self.finish(
                PipelineResult::failure(
                    request_id,
                    ErrorKind::Unapproved,
                    "safe mode refuses non-read-only tools",
                ),
                started,
            );
        }

        // Schema validation.
        let validation = contract.params.validate(&call.params);
        if !validation.valid {
            self.emit(
                request_id,
                correlation_id,
                EventType::ToolFailed,
                json!({ "error_kind": "invalid_params", "errors": validation.errors.clone() }),
            );
            if !in_safe_mode {
                let _ = self.state.transition(request_id, KernelState::Idle);
            }
            let mut result = PipelineResult::failure(
                request_id,
                ErrorKind::InvalidParams,
                "parameters failed contract validation",
            );
            result.validation = Some(validation);
            return self.finish(result, started);
        }
        self.emit(
            request_id,
            correlation_id,
            EventType::ToolValidated,
            json!({ "tool": call.tool.clone() }),
        );

        // Approval resolution.
        let source_trust = call
            .source_trust
            .unwrap_or_else(|| self.trust.get_source_trust(&call.source));
        let governance_ctx = GovernanceContext {
            tool_name: call.tool.clone(),
            risk_class: contract.risk_class,
            source: call.source.clone(),
            source_trust,
            params: call.params.clone(),
        };
        let decision = self
            .governance
            .evaluate(&governance_ctx, self.policy_id.as_deref());

        if !decision.approved {
            self.emit(
                request_id,
                correlation_id,
                EventType::ToolApprovalDenied,
                json!({ "reason": "compliance", "reasons": decision.reasons.clone() }),
            );
            if !in_safe_mode {
                let _ = self.state.transition(request_id, KernelState::Idle);
            }
            self.trust.record_outcome(&call.source, TrustOutcome::Violation);
            return self.finish(
                PipelineResult::failure(
                    request_id,
                    ErrorKind::Unapproved,
                    format!("compliance denied: {}", decision.reasons.join("; ")),
                ),
                started,
            );
        }

        let mut requirement = decision.approval_requirement;
        if contract.approval_required && requirement == ApprovalRequirement::None {
            requirement = ApprovalRequirement::Human;
        }

        if requirement != ApprovalRequirement::None {
            if let Some(result) = self
                .await_approval(&call, &contract, requirement, source_trust, &cancel, in_safe_mode)
                .await
            {
                return self.finish(result, started);
            }
        }

        // Execution.
        if !in_safe_mode {
            let _ = self.state.transition(request_id, KernelState::Executing);
        }
        self.emit(
            request_id,
            correlation_id,
            EventType::ToolExecuting,
            json!({
                "tool": call.tool.clone(),
                "timeout_ms": u64::try_from(contract.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        );

        let invocation = handler(call.params.clone());
        let handler_outcome = tokio::select! {
            outcome = tokio::time::timeout(contract.timeout, invocation) => match outcome {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(message)) => Err((ErrorKind::HandlerError, message)),
                Err(_) => Err((
                    ErrorKind::HandlerTimeout,
                    format!("handler exceeded {} ms", contract.timeout.as_millis()),
                )),
            },
            () = cancel.cancelled() => Err((ErrorKind::HandlerError, "cancelled".to_owned())),
        };

        match handler_outcome {
            Ok(output) => {
                self.emit(
                    request_id,
                    correlation_id,
                    EventType::ToolExecuted,
                    json!({
                        "tool": call.tool.clone(),
                        "success": true,
                        "result": output.result.clone(),
                        "duration_ms": output.duration_ms,
                    }),
                );
                self.verify_and_settle(&call, &contract, output, validation, in_safe_mode, started)
                    .await
            }
            Err((kind, message)) => {
                self.emit(
                    request_id,
                    correlation_id,
                    EventType::ToolFailed,
                    json!({ "error_kind": kind, "error": message.clone() }),
                );
                self.compensate_and_settle(
                    &call, &contract, kind, message, None, validation, None, in_safe_mode, started,
                )
                .await
            }
        }
    }

    /// Consult the approval gate. Returns `Some(result)` when the call
    /// must stop (denied, timed out, cancelled), `None` when granted.
    async fn await_approval(
        &self,
        call: &ProposedToolCall,
        contract: &ToolContract,
        requirement: ApprovalRequirement,
        source_trust: f64,
        cancel: &CancellationToken,
        in_safe_mode: bool,
    ) -> Option<PipelineResult> {
        let request_id = call.request_id;
        let correlation_id = call.correlation_id;

        if !in_safe_mode {
            let _ = self
                .state
                .transition(request_id, KernelState::AwaitingApproval);
        }
        self.emit(
            request_id,
            correlation_id,
            EventType::ToolApprovalRequested,
            json!({
                "tool": call.tool.clone(),
                "requirement": requirement,
                "risk_class": contract.risk_class,
                "source_trust": source_trust,
            }),
        );

        if cancel.is_cancelled() {
            return Some(self.deny(call, "cancelled", in_safe_mode));
        }

        let submitted = self.approval.request(ApprovalSubmission {
            request_id,
            tool_name: call.tool.clone(),
            risk_class: contract.risk_class,
            requirement,
            source: call.source.clone(),
            source_trust,
            window: Some(self.approval_window),
        });

        let outcome = match submitted {
            Err(e) => ApprovalOutcome::Denied {
                reason: format!("approval gate unavailable: {e}"),
            },
            Ok(SubmitOutcome::Immediate(record)) => match record.decision {
                crate::kernel::approval::ApprovalDecision::Granted => ApprovalOutcome::Granted,
                _ => ApprovalOutcome::Denied {
                    reason: record.reason.unwrap_or_else(|| "denied".to_owned()),
                },
            },
            Ok(SubmitOutcome::Parked {
                record,
                mut receiver,
                window,
            }) => {
                tokio::select! {
                    resolved = tokio::time::timeout(window, &mut receiver) => match resolved {
                        Ok(Ok(outcome)) => outcome,
                        Ok(Err(_closed)) => ApprovalOutcome::Denied {
                            reason: "approval channel closed".to_owned(),
                        },
                        Err(_elapsed) => {
                            // Race the decision callback for the entry.
                            if self.approval.timeout_pending(record.id).unwrap_or(false) {
                                ApprovalOutcome::TimedOut
                            } else {
                                (&mut receiver).await.unwrap_or(ApprovalOutcome::TimedOut)
                            }
                        }
                    },
                    () = cancel.cancelled() => {
                        let _ = self.approval.deny(record.id, "kernel", "cancelled");
                        ApprovalOutcome::Denied { reason: "cancelled".to_owned() }
                    }
                }
            }
        };

        match outcome {
            ApprovalOutcome::Granted => {
                self.emit(
                    request_id,
                    correlation_id,
                    EventType::ToolApprovalGranted,
                    json!({ "tool": call.tool.clone(), "requirement": requirement }),
                );
                None
            }
            ApprovalOutcome::Denied { reason } => Some(self.deny(call, &reason, in_safe_mode)),
            ApprovalOutcome::TimedOut => Some(self.deny(call, "timeout", in_safe_mode)),
        }
    }

    /// Record an approval denial and return the unapproved result.
    fn deny(&self, call: &ProposedToolCall, reason: &str, in_safe_mode: bool) -> PipelineResult {
        self.emit(
            call.request_id,
            call.correlation_id,
            EventType::ToolApprovalDenied,
            json!({ "tool": call.tool.clone(), "reason": reason }),
        );
        if !in_safe_mode {
            let _ = self.state.transition(call.request_id, KernelState::Idle);
        }
        self.trust
            .record_outcome(&call.source, TrustOutcome::Violation);
        PipelineResult::failure(
            call.request_id,
            ErrorKind::Unapproved,
            format!("approval denied: {reason}"),
        )
    }

    /// Run verification after a successful handler and settle the call.
    #[allow(clippy::too_many_arguments)]
    async fn verify_and_settle(
        &self,
        call: &ProposedToolCall,
        contract: &ToolContract,
        output: HandlerOutput,
        validation: ValidationReport,
        in_safe_mode: bool,
        started: Instant,
    ) -> PipelineResult {
        let request_id = call.request_id;
        let correlation_id = call.correlation_id;

        if !in_safe_mode {
            let _ = self.state.transition(request_id, KernelState::Verifying);
        }

        let verification = self
            .verifier
            .verify(VerifyContext {
                tool_name: call.tool.clone(),
                params: call.params.clone(),
                result: output.result.clone(),
                duration_ms: output.duration_ms,
                agent_id: self.agent_id.clone(),
                request_id,
                query: self.state_query.clone(),
            })
            .await;

        self.emit(
            request_id,
            correlation_id,
            EventType::ToolVerified,
            json!({
                "tool": call.tool.clone(),
                "status": verification.status,
                "has_critical_failure": verification.has_critical_failure,
                "taxonomy": verification.taxonomy,
            }),
        );

        if verification.has_critical_failure {
            return self
                .compensate_and_settle(
                    call,
                    contract,
                    ErrorKind::VerificationFailed,
                    "critical post-condition failed".to_owned(),
                    Some(output.result),
                    validation,
                    Some(verification),
                    in_safe_mode,
                    started,
                )
                .await;
        }

        if !in_safe_mode {
            let _ = self.state.transition(request_id, KernelState::Idle);
        }
        self.state.record_success();
        self.trust.record_outcome(&call.source, TrustOutcome::Success);
        info!(request = %request_id, tool = %call.tool, "pipeline completed");

        self.finish(
            PipelineResult {
                success: true,
                request_id,
                error_kind: None,
                error: None,
                validation: Some(validation),
                verification: Some(verification),
                compensation: None,
                duration_ms: 0,
            },
            started,
        )
    }

    /// Compensation path: roll back, open incidents, drive error/safe-mode
    /// state, and settle the call.
    #[allow(clippy::too_many_arguments)]
    async fn compensate_and_settle(
        &self,
        call: &ProposedToolCall,
        contract: &ToolContract,
        primary_kind: ErrorKind,
        primary_error: String,
        result: Option<serde_json::Value>,
        validation: ValidationReport,
        verification: Option<VerificationResult>,
        in_safe_mode: bool,
        started: Instant,
    ) -> PipelineResult {
        let request_id = call.request_id;
        let correlation_id = call.correlation_id;

        if !in_safe_mode {
            let _ = self.state.transition(request_id, KernelState::Compensating);
        }

        let had_compensation = self.compensation.has(&call.tool);
        // A tool with no declared side effects and no registered rollback
        // has nothing to undo; its failure is not an incident.
        let outcome = if !had_compensation && !contract.has_side_effects() {
            CompensationOutcome {
                success: true,
                detail: Some("no side effects to undo".to_owned()),
                timed_out: false,
            }
        } else {
            self.compensation
                .compensate(CompensationContext {
                    request_id,
                    tool_name: call.tool.clone(),
                    params: call.params.clone(),
                    result,
                    error: Some(primary_error.clone()),
                })
                .await
        };

        self.emit(
            request_id,
            correlation_id,
            EventType::ToolCompensated,
            json!({
                "tool": call.tool.clone(),
                "success": outcome.success,
                "detail": outcome.detail.clone(),
            }),
        );

        let (final_kind, final_error) = if outcome.success {
            (primary_kind, primary_error)
        } else {
            let reason = if !had_compensation {
                IncidentReason::NoCompensation
            } else if outcome.timed_out {
                IncidentReason::CompensationTimeout
            } else {
                IncidentReason::CompensationError
            };
            let incident = self.incidents.open(request_id, call.tool.clone(), reason);
            self.emit(
                request_id,
                correlation_id,
                EventType::CompensationIncident,
                json!({
                    "incident_id": incident.id,
                    "tool": call.tool.clone(),
                    "reason": reason,
                }),
            );
            (
                ErrorKind::CompensationFailed,
                outcome
                    .detail
                    .clone()
                    .unwrap_or_else(|| "compensation failed".to_owned()),
            )
        };

        // Error accounting and terminal state.
        let consecutive = self.state.record_error();
        self.trust.record_outcome(&call.source, TrustOutcome::Failure);

        let triggered = self.safe_mode.should_trigger(consecutive);
        if triggered {
            self.safe_mode
                .enter(format!("{consecutive} consecutive execution failures"));
            let _ = self.state.enter_safe_mode(request_id);
            self.emit(
                request_id,
                correlation_id,
                EventType::SafeModeEntered,
                json!({
                    "reason": "consecutive_errors",
                    "consecutive_errors": consecutive,
                }),
            );
        } else if !in_safe_mode {
            let target = if outcome.success {
                KernelState::Idle
            } else {
                KernelState::Error
            };
            let _ = self.state.transition(request_id, target);
        }

        warn!(
            request = %request_id,
            tool = %call.tool,
            kind = %final_kind,
            compensated = outcome.success,
            "pipeline failed"
        );

        self.finish(
            PipelineResult {
                success: false,
                request_id,
                error_kind: Some(final_kind),
                error: Some(final_error),
                validation: Some(validation),
                verification,
                compensation: Some(outcome),
                duration_ms: 0,
            },
            started,
        )
    }

    fn finish(&self, mut result: PipelineResult, started: Instant) -> PipelineResult {
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        result
    }

    fn emit(
        &self,
        request_id: Uuid,
        correlation_id: Option<Uuid>,
        event_type: EventType,
        payload: serde_json::Value,
    ) {
        if let Err(e) = self
            .events
            .append(request_id, correlation_id, event_type, payload)
        {
            warn!(error = %e, event = %event_type, "failed to append pipeline event");
        }
    }

    /// Health probe.
    pub fn health(&self) -> ComponentHealth {
        ComponentHealth {
            component: "pipeline".to_owned(),
            healthy: true,
            detail: format!("state {}", self.state.current()),
        }
    }
}
