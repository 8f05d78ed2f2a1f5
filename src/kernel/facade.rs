//! The kernel facade — the inward-facing API.
//!
//! The surrounding agent depends on this typed surface, never on a
//! global. [`Kernel::init`] wires every subsystem from a resolved
//! configuration and reports config issues instead of failing; all
//! subsequent operations go through explicit methods that fold failures
//! into structured results.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ConfigIssue, KernelConfig};
use crate::kernel::approval::{ApprovalError, ApprovalGate};
use crate::kernel::compensation::{
    CompensationFn, CompensationIncident, CompensationRegistry, IncidentManager,
};
use crate::kernel::contract::{CustomToolSpec, RegistryError, ToolContract, ToolRegistry};
use crate::kernel::drift::{DriftMonitor, DriftReport, IdentityProfile};
use crate::kernel::events::{
    ChainVerification, EventStore, EventStoreError, ExecutionEvent, InMemoryEventStore,
    RequestProjection,
};
use crate::kernel::governance::{GovernanceEngine, GovernancePolicy};
use crate::kernel::journal::{AutonomyJournal, JournalError};
use crate::kernel::pipeline::{CancellationToken, Pipeline, PipelineParts, PipelineResult, ToolHandler};
use crate::kernel::safe_mode::{ExitDecision, SafeModeController};
use crate::kernel::state::StateMachine;
use crate::kernel::trust::TrustScorer;
use crate::kernel::verifier::{PostCondition, Verifier};
use crate::memory::gate::{GateAction, GateDecision, MemoryGate};
use crate::memory::MemoryCandidate;
use crate::types::{CallSource, ComponentHealth, EventType, KernelState, ProposedToolCall};

/// Outcome of kernel initialization.
#[derive(Debug, Clone)]
pub struct InitReport {
    /// Whether the kernel is operational.
    pub enabled: bool,
    /// Config problems found (and repaired) during resolution.
    pub issues: Vec<ConfigIssue>,
}

/// Event query filter: by request id, correlation id, or both.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Restrict to one request's chain.
    pub request_id: Option<Uuid>,
    /// Restrict to a correlation group.
    pub correlation_id: Option<Uuid>,
}

/// The assembled kernel.
pub struct Kernel {
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
    drift: Arc<DriftMonitor>,
    memory_gate: Arc<MemoryGate>,
    pipeline: Pipeline,
    journal: Option<Arc<AutonomyJournal>>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("state", &self.state.current())
            .field("persistent", &self.journal.is_some())
            .finish()
    }
}

impl Kernel {
    /// Initialize an in-memory kernel.
    pub fn init(config: KernelConfig) -> (Self, InitReport) {
        let events: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        Self::build(config, events, None)
    }

    /// Initialize a kernel persisted through the SQLite journal at
    /// `config.paths.journal_db`.
    pub fn init_persistent(config: KernelConfig) -> Result<(Self, InitReport), JournalError> {
        let journal = Arc::new(AutonomyJournal::open(&config.paths.journal_db)?);
        let events: Arc<dyn EventStore> = journal.clone();
        Ok(Self::build(config, events, Some(journal)))
    }

    fn build(
        mut config: KernelConfig,
        events: Arc<dyn EventStore>,
        journal: Option<Arc<AutonomyJournal>>,
    ) -> (Self, InitReport) {
        let issues = config.resolve();
        for issue in &issues {
            warn!(field = %issue.field, message = %issue.message, "config issue");
        }

        let registry = Arc::new(ToolRegistry::new());
        let state = Arc::new(StateMachine::new(events.clone()));
        let approval = Arc::new(ApprovalGate::new(
            Duration::from_secs(config.pipeline.approval_window_secs),
            config.pipeline.automated_trust_floor,
        ));
        let governance = Arc::new(GovernanceEngine::new(config.pipeline.automated_trust_floor));
        let trust = Arc::new(TrustScorer::new(config.trust.clone()));
        let verifier = Arc::new(Verifier::new(Duration::from_secs(
            config.pipeline.verifier_check_timeout_secs,
        )));
        let compensation = Arc::new(CompensationRegistry::new(Duration::from_secs(
            config.pipeline.compensation_timeout_secs,
        )));
        let incidents = Arc::new(IncidentManager::new());
        let safe_mode = Arc::new(SafeModeController::new(
            config.pipeline.safe_mode_threshold,
            config.pipeline.safe_mode_exit_trust_floor,
        ));
        let drift = Arc::new(DriftMonitor::new(config.drift.clone()));
        let memory_gate = Arc::new(MemoryGate::new(
            config.memory.clone(),
            trust.clone(),
            events.clone(),
        ));

        let pipeline = Pipeline::new(PipelineParts {
            registry: registry.clone(),
            events: events.clone(),
            state: state.clone(),
            approval: approval.clone(),
            governance: governance.clone(),
            trust: trust.clone(),
            verifier: verifier.clone(),
            compensation: compensation.clone(),
            incidents: incidents.clone(),
            safe_mode: safe_mode.clone(),
            approval_window: Duration::from_secs(config.pipeline.approval_window_secs),
        });

        info!(
            persistent = journal.is_some(),
            issues = issues.len(),
            "kernel initialized"
        );

        let kernel = Self {
            registry,
            events,
            state,
            approval,
            governance,
            trust,
            verifier,
            compensation,
            incidents,
            safe_mode,
            drift,
            memory_gate,
            pipeline,
            journal,
        };
        (
            kernel,
            InitReport {
                enabled: true,
                issues,
            },
        )
    }

    // ── Registration surface ────────────────────────────────────

    /// Register a tool contract.
    pub fn register_tool_contract(&self, contract: ToolContract) -> Result<(), RegistryError> {
        self.registry.register(contract)
    }

    /// Synthesize and register a user-defined tool.
    pub fn register_custom_tool(
        &self,
        spec: &CustomToolSpec,
    ) -> Result<Arc<ToolContract>, RegistryError> {
        self.registry.register_custom(spec)
    }

    /// Register post-conditions for a tool.
    pub fn register_conditions(&self, tool_name: impl Into<String>, conditions: Vec<PostCondition>) {
        self.verifier.register_conditions(tool_name, conditions);
    }

    /// Register a compensation function for a tool.
    pub fn register_compensation(&self, tool_name: impl Into<String>, f: CompensationFn) {
        self.compensation.register(tool_name, f);
    }

    /// Register a synchronous compensation closure for a tool.
    pub fn register_compensation_sync(
        &self,
        tool_name: impl Into<String>,
        f: impl Fn(&crate::kernel::compensation::CompensationContext) -> Result<(), String>
            + Send
            + Sync
            + 'static,
    ) {
        self.compensation.register_sync(tool_name, f);
    }

    /// Register a governance policy.
    pub fn register_policy(&self, policy: GovernancePolicy) {
        self.governance.register_policy(policy);
    }

    // ── Execution surface ───────────────────────────────────────

    /// Propose a tool call; the handler runs only if the call clears the
    /// full pipeline.
    pub async fn propose_tool(&self, call: ProposedToolCall, handler: ToolHandler) -> PipelineResult {
        self.pipeline.execute(call, handler).await
    }

    /// Propose a tool call with an external cancellation token.
    pub async fn propose_tool_with_cancellation(
        &self,
        call: ProposedToolCall,
        handler: ToolHandler,
        cancel: CancellationToken,
    ) -> PipelineResult {
        self.pipeline
            .execute_with_cancellation(call, handler, cancel)
            .await
    }

    // ── Memory surface ──────────────────────────────────────────

    /// Gate a memory candidate, persisting the outcome when a journal is
    /// attached.
    pub fn write_memory(&self, candidate: MemoryCandidate) -> GateDecision {
        let decision = self.memory_gate.write(candidate);
        if let Some(journal) = &self.journal {
            match decision.action {
                GateAction::Allow => {
                    if let Some(memory) = &decision.memory {
                        if let Err(e) = journal.save_memory(memory, &decision.entities) {
                            warn!(error = %e, "failed to persist admitted memory");
                        }
                    }
                }
                GateAction::Quarantine => {
                    // The newest quarantine entry is the one just written.
                    if let Some(entry) = self.memory_gate.quarantined().last() {
                        if let Err(e) = journal.save_quarantined(entry) {
                            warn!(error = %e, "failed to persist quarantine entry");
                        }
                    }
                }
                GateAction::Reject => {}
            }
        }
        decision
    }

    // ── Approval surface ────────────────────────────────────────

    /// Grant a parked approval.
    pub fn grant_approval(
        &self,
        id: Uuid,
        approver: impl Into<String>,
    ) -> Result<(), ApprovalError> {
        self.approval.grant(id, approver)?;
        self.persist_approval(id);
        Ok(())
    }

    /// Deny a parked approval.
    pub fn deny_approval(
        &self,
        id: Uuid,
        approver: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<(), ApprovalError> {
        self.approval.deny(id, approver, reason)?;
        self.persist_approval(id);
        Ok(())
    }

    fn persist_approval(&self, id: Uuid) {
        if let Some(journal) = &self.journal {
            let record = self
                .approval
                .resolved_records()
                .into_iter()
                .find(|r| r.id == id);
            if let Some(record) = record {
                if let Err(e) = journal.save_approval(&record) {
                    warn!(error = %e, "failed to persist approval record");
                }
            }
        }
    }

    // ── Safe mode & state surface ───────────────────────────────

    /// Request a safe-mode exit on behalf of a source.
    pub fn exit_safe_mode(&self, source: &CallSource, trust: f64) -> ExitDecision {
        let decision = self.safe_mode.request_exit(source, trust);
        if decision.allowed {
            let request_id = Uuid::new_v4();
            let _ = self.state.transition(request_id, KernelState::Idle);
            if let Err(e) = self.events.append(
                request_id,
                None,
                EventType::SafeModeExited,
                json!({ "source": source.key(), "trust": trust }),
            ) {
                warn!(error = %e, "failed to append safe mode exit event");
            }
        }
        decision
    }

    /// Reset a terminal `error` state back to `idle`.
    pub fn reset(&self) -> bool {
        self.state.reset()
    }

    /// Current kernel state.
    pub fn state(&self) -> KernelState {
        self.state.current()
    }

    // ── Audit surface ───────────────────────────────────────────

    /// Query events by request or correlation id.
    pub fn query_events(&self, query: &EventQuery) -> Result<Vec<ExecutionEvent>, EventStoreError> {
        match (query.request_id, query.correlation_id) {
            (Some(request_id), _) => self.events.events_for_request(request_id),
            (None, Some(correlation_id)) => self.events.events_for_correlation(correlation_id),
            (None, None) => Ok(Vec::new()),
        }
    }

    /// Verify a request's hash chain.
    pub fn verify_event_chain(&self, request_id: Uuid) -> Result<ChainVerification, EventStoreError> {
        self.events.verify_chain(request_id)
    }

    /// Project a request's event sequence.
    pub fn project_request(&self, request_id: Uuid) -> Result<RequestProjection, EventStoreError> {
        self.events.project_request(request_id)
    }

    /// All incidents still open.
    pub fn open_incidents(&self) -> Vec<CompensationIncident> {
        self.incidents.open_incidents()
    }

    // ── Drift surface ───────────────────────────────────────────

    /// Record an agent output into the drift window.
    pub fn observe_output(&self, output: impl Into<String>) {
        self.drift.observe(output);
    }

    /// Analyze persona drift against an identity, recording the report.
    pub fn analyze_drift(&self, identity: &IdentityProfile) -> DriftReport {
        let report = self.drift.analyze(identity);
        if let Err(e) = self.events.append(
            Uuid::new_v4(),
            None,
            EventType::DriftReport,
            json!({
                "agent_id": report.agent_id.clone(),
                "drift_score": report.drift_score,
                "severity": report.severity,
                "window_size": report.window_size,
            }),
        ) {
            warn!(error = %e, "failed to append drift report event");
        }
        report
    }

    // ── Health ──────────────────────────────────────────────────

    /// Probe every subsystem.
    pub fn health_report(&self) -> Vec<ComponentHealth> {
        vec![
            self.registry.health(),
            self.events.health(),
            self.state.health(),
            self.approval.health(),
            self.governance.health(),
            self.trust.health(),
            self.verifier.health(),
            self.compensation.health(),
            self.incidents.health(),
            self.safe_mode.health(),
            self.drift.health(),
            self.memory_gate.health(),
            self.pipeline.health(),
        ]
    }

    // ── Component access for the orchestrator roles ─────────────

    /// The event store.
    pub fn events(&self) -> Arc<dyn EventStore> {
        self.events.clone()
    }

    /// The trust scorer.
    pub fn trust(&self) -> Arc<TrustScorer> {
        self.trust.clone()
    }

    /// The memory gate.
    pub fn memory_gate(&self) -> Arc<MemoryGate> {
        self.memory_gate.clone()
    }

    /// The drift monitor.
    pub fn drift_monitor(&self) -> Arc<DriftMonitor> {
        self.drift.clone()
    }

    /// The tool registry.
    pub fn tool_registry(&self) -> Arc<ToolRegistry> {
        self.registry.clone()
    }

    /// The approval gate (for rendering pending requests to an operator).
    pub fn approval_gate(&self) -> Arc<ApprovalGate> {
        self.approval.clone()
    }

    /// The attached journal, when persistent.
    pub fn journal(&self) -> Option<Arc<AutonomyJournal>> {
        self.journal.clone()
    }
}
