//! Orchestrator & roles.
//!
//! Five role adapters compose over the kernel: the **Planner** produces
//! an ordered step list, the **Executor** drives the pipeline per step
//! under one correlation id, the **Verifier** inspects each result for
//! critical failures, the **MemoryWriter** records step summaries
//! through the memory gate, and the **Auditor** closes the run with
//! chain verification, drift analysis, and incident counts. The
//! orchestrator sequences them and halts on critical failure or safe
//! mode.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::kernel::drift::{DriftReport, IdentityProfile};
use crate::kernel::pipeline::{PipelineResult, ToolHandler};
use crate::kernel::Kernel;
use crate::memory::gate::GateAction;
use crate::memory::MemoryCandidate;
use crate::types::{CallSource, ErrorKind, KernelState, ProposedToolCall};

// ── Planner ─────────────────────────────────────────────────────

/// One step of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Ordinal, 1-based.
    pub step: usize,
    /// Tool to invoke.
    pub tool: String,
    /// Parameters for the tool.
    pub params: serde_json::Value,
    /// Human summary of the step.
    pub description: String,
}

/// Produces an ordered step list for an objective.
///
/// The production planner sits outside the kernel (it needs a model);
/// the kernel only requires this seam.
pub trait Planner: Send + Sync {
    /// Plan the objective given the tools currently registered.
    fn plan(&self, objective: &str, available_tools: &[String]) -> Vec<PlanStep>;
}

/// A planner returning a fixed step list, filtered to registered tools.
pub struct FixedPlanner {
    steps: Vec<PlanStep>,
}

impl FixedPlanner {
    /// Wrap a prepared step list.
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }
}

impl Planner for FixedPlanner {
    fn plan(&self, _objective: &str, available_tools: &[String]) -> Vec<PlanStep> {
        self.steps
            .iter()
            .filter(|s| available_tools.iter().any(|t| t == &s.tool))
            .cloned()
            .collect()
    }
}

// ── Run report ──────────────────────────────────────────────────

/// Outcome of one executed step.
#[derive(Debug)]
pub struct StepOutcome {
    /// Step ordinal.
    pub step: usize,
    /// Tool invoked.
    pub tool: String,
    /// Request id used for the step.
    pub request_id: Uuid,
    /// Pipeline result.
    pub result: PipelineResult,
}

/// Findings from the auditor role.
#[derive(Debug)]
pub struct AuditFindings {
    /// Requests whose hash chain failed verification.
    pub broken_chains: Vec<Uuid>,
    /// Steps that ended in failure.
    pub failed_steps: usize,
    /// Compensation incidents still open after the run.
    pub open_incidents: usize,
    /// Drift report over the run's outputs, when an identity was given.
    pub drift: Option<DriftReport>,
}

/// Full report of an orchestrated run.
#[derive(Debug)]
pub struct OrchestratorReport {
    /// Correlation id shared by every step.
    pub correlation_id: Uuid,
    /// The objective the planner received.
    pub objective: String,
    /// Per-step outcomes, in execution order.
    pub outcomes: Vec<StepOutcome>,
    /// Whether every planned step ran to success.
    pub completed: bool,
    /// Why the run halted early, when it did.
    pub halted: Option<String>,
    /// How many step summaries the memory gate admitted.
    pub memories_admitted: usize,
    /// Auditor findings.
    pub audit: AuditFindings,
}

// ── Orchestrator ────────────────────────────────────────────────

/// Sequences the role adapters over the kernel.
pub struct Orchestrator {
    kernel: Arc<Kernel>,
    identity: Option<IdentityProfile>,
}

impl Orchestrator {
    /// Create an orchestrator over a kernel.
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self {
            kernel,
            identity: None,
        }
    }

    /// Attach an identity for the auditor's drift analysis.
    #[must_use]
    pub fn with_identity(mut self, identity: IdentityProfile) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Plan and execute an objective.
    ///
    /// Each step runs through the full pipeline under one correlation
    /// id. The run halts on the first critical failure (verification or
    /// compensation fault) and whenever the kernel leaves the normal
    /// regime (safe mode or terminal error).
    pub async fn run(
        &self,
        objective: &str,
        planner: &dyn Planner,
        handlers: &HashMap<String, ToolHandler>,
    ) -> OrchestratorReport {
        let correlation_id = Uuid::new_v4();

        // Planner role.
        let available: Vec<String> = self
            .kernel
            .tool_registry()
            .list()
            .iter()
            .map(|c| c.name.clone())
            .collect();
        let steps = planner.plan(objective, &available);
        info!(
            correlation = %correlation_id,
            objective,
            steps = steps.len(),
            "orchestrator run planned"
        );

        let mut outcomes = Vec::new();
        let mut halted = None;
        let mut memories_admitted = 0usize;

        for step in steps {
            // Halt when the kernel has left the normal regime.
            let state = self.kernel.state();
            if state == KernelState::SafeMode {
                halted = Some("kernel in safe mode".to_owned());
                break;
            }
            if state == KernelState::Error {
                halted = Some("kernel in terminal error state".to_owned());
                break;
            }

            // Executor role.
            let Some(handler) = handlers.get(&step.tool) else {
                halted = Some(format!("no handler supplied for {}", step.tool));
                break;
            };
            let call = ProposedToolCall::new(step.tool.clone(), step.params.clone(), CallSource::System)
                .with_correlation(correlation_id);
            let request_id = call.request_id;
            let result = self.kernel.propose_tool(call, handler.clone()).await;

            // Verifier role: classify the outcome before moving on.
            let critical = matches!(
                result.error_kind,
                Some(ErrorKind::VerificationFailed | ErrorKind::CompensationFailed)
            );
            let succeeded = result.success;

            // MemoryWriter role: record what happened.
            let summary = if succeeded {
                format!("{} completed: {}", step.tool, step.description)
            } else {
                format!(
                    "{} failed ({}): {}",
                    step.tool,
                    result
                        .error_kind
                        .map(|k| k.to_string())
                        .unwrap_or_else(|| "unknown".to_owned()),
                    step.description
                )
            };
            let decision = self
                .kernel
                .write_memory(MemoryCandidate::new(summary, CallSource::System));
            if decision.action == GateAction::Allow {
                memories_admitted = memories_admitted.saturating_add(1);
            }

            outcomes.push(StepOutcome {
                step: step.step,
                tool: step.tool.clone(),
                request_id,
                result,
            });

            if critical {
                halted = Some(format!("critical failure at step {} ({})", step.step, step.tool));
                break;
            }
            if !succeeded {
                // Non-critical failures (denied approval, bad params) stop
                // the plan too: later steps assume earlier effects.
                halted = Some(format!("step {} ({}) did not succeed", step.step, step.tool));
                break;
            }
        }

        // Auditor role.
        let audit = self.audit(&outcomes);
        let completed = halted.is_none() && outcomes.iter().all(|o| o.result.success);

        if let Some(reason) = &halted {
            warn!(correlation = %correlation_id, reason = %reason, "orchestrator run halted");
        } else {
            info!(correlation = %correlation_id, "orchestrator run completed");
        }

        OrchestratorReport {
            correlation_id,
            objective: objective.to_owned(),
            outcomes,
            completed,
            halted,
            memories_admitted,
            audit,
        }
    }

    fn audit(&self, outcomes: &[StepOutcome]) -> AuditFindings {
        let mut broken_chains = Vec::new();
        for outcome in outcomes {
            match self.kernel.verify_event_chain(outcome.request_id) {
                Ok(verification) if !verification.valid => broken_chains.push(outcome.request_id),
                Ok(_) => {}
                Err(e) => {
                    warn!(request = %outcome.request_id, error = %e, "chain verification failed");
                    broken_chains.push(outcome.request_id);
                }
            }
        }

        let drift = self.identity.as_ref().map(|identity| {
            for outcome in outcomes {
                if let Some(verification) = &outcome.result.verification {
                    // Feed check descriptions through the drift window as a
                    // proxy for run narration.
                    for check in &verification.checks {
                        self.kernel.observe_output(check.description.clone());
                    }
                }
            }
            self.kernel.analyze_drift(identity)
        });

        AuditFindings {
            broken_chains,
            failed_steps: outcomes.iter().filter(|o| !o.result.success).count(),
            open_incidents: self.kernel.open_incidents().len(),
            drift,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::kernel::contract::ToolContractBuilder;
    use crate::kernel::pipeline::{sync_handler, HandlerOutput};
    use crate::kernel::schema::{FieldKind, FieldSpec, ParamSchema};
    use crate::types::RiskClass;
    use serde_json::json;

    fn make_kernel() -> Arc<Kernel> {
        let (kernel, _report) = Kernel::init(KernelConfig::default());
        kernel
            .register_tool_contract(
                ToolContractBuilder::new("FETCH_METRICS", RiskClass::ReadOnly)
                    .params(ParamSchema::new().field("window", FieldSpec::required(FieldKind::String)))
                    .build(),
            )
            .expect("register");
        kernel
            .register_tool_contract(
                ToolContractBuilder::new("ROTATE_LOGS", RiskClass::Reversible)
                    .build(),
            )
            .expect("register");
        Arc::new(kernel)
    }

    fn two_step_plan() -> Vec<PlanStep> {
        vec![
            PlanStep {
                step: 1,
                tool: "FETCH_METRICS".to_owned(),
                params: json!({"window": "1h"}),
                description: "collect metrics".to_owned(),
            },
            PlanStep {
                step: 2,
                tool: "ROTATE_LOGS".to_owned(),
                params: json!({}),
                description: "rotate logs".to_owned(),
            },
        ]
    }

    fn ok_handlers() -> HashMap<String, ToolHandler> {
        let mut handlers = HashMap::new();
        handlers.insert(
            "FETCH_METRICS".to_owned(),
            sync_handler(|_| {
                Ok(HandlerOutput {
                    result: json!({"cpu": 0.4}),
                    duration_ms: 2,
                })
            }),
        );
        handlers.insert(
            "ROTATE_LOGS".to_owned(),
            sync_handler(|_| {
                Ok(HandlerOutput {
                    result: json!({"rotated": 3}),
                    duration_ms: 5,
                })
            }),
        );
        handlers
    }

    #[tokio::test]
    async fn test_run_completes_all_steps() {
        let kernel = make_kernel();
        let orchestrator = Orchestrator::new(kernel);
        let planner = FixedPlanner::new(two_step_plan());

        let report = orchestrator
            .run("nightly maintenance", &planner, &ok_handlers())
            .await;

        assert!(report.completed, "{report:?}");
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.halted.is_none());
        assert!(report.audit.broken_chains.is_empty());
        assert_eq!(report.audit.failed_steps, 0);
        // Step summaries from the system source are admitted.
        assert_eq!(report.memories_admitted, 2);

        // Every step shares the run's correlation id.
        let events = report
            .outcomes
            .iter()
            .map(|o| o.request_id)
            .collect::<Vec<_>>();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_run_halts_on_failed_step() {
        let kernel = make_kernel();
        let orchestrator = Orchestrator::new(kernel);
        let planner = FixedPlanner::new(two_step_plan());

        let mut handlers = ok_handlers();
        handlers.insert(
            "FETCH_METRICS".to_owned(),
            sync_handler(|_| Err("metrics backend down".to_owned())),
        );

        let report = orchestrator
            .run("nightly maintenance", &planner, &handlers)
            .await;

        assert!(!report.completed);
        assert_eq!(report.outcomes.len(), 1, "second step never ran");
        assert!(report.halted.expect("halt reason").contains("step 1"));
        assert_eq!(report.audit.failed_steps, 1);
    }

    #[tokio::test]
    async fn test_run_halts_without_handler() {
        let kernel = make_kernel();
        let orchestrator = Orchestrator::new(kernel);
        let planner = FixedPlanner::new(two_step_plan());

        let mut handlers = ok_handlers();
        handlers.remove("FETCH_METRICS");

        let report = orchestrator
            .run("nightly maintenance", &planner, &handlers)
            .await;
        assert!(!report.completed);
        assert!(report.outcomes.is_empty());
        assert!(report
            .halted
            .expect("halt reason")
            .contains("no handler supplied"));
    }

    #[tokio::test]
    async fn test_planner_filters_unregistered_tools() {
        let kernel = make_kernel();
        let orchestrator = Orchestrator::new(kernel);
        let mut steps = two_step_plan();
        steps.push(PlanStep {
            step: 3,
            tool: "NOT_REGISTERED".to_owned(),
            params: json!({}),
            description: "phantom step".to_owned(),
        });
        let planner = FixedPlanner::new(steps);

        let report = orchestrator
            .run("nightly maintenance", &planner, &ok_handlers())
            .await;
        assert!(report.completed);
        assert_eq!(report.outcomes.len(), 2, "unregistered tool filtered at planning");
    }

    #[tokio::test]
    async fn test_auditor_produces_drift_report() {
        let kernel = make_kernel();
        let identity = IdentityProfile {
            agent_id: "agent-main".to_owned(),
            core_values: vec![],
            style_markers: vec![],
            boundaries: vec![],
            allowed_topics: vec![],
        };
        let orchestrator = Orchestrator::new(kernel).with_identity(identity);
        let planner = FixedPlanner::new(two_step_plan());

        let report = orchestrator
            .run("nightly maintenance", &planner, &ok_handlers())
            .await;
        let drift = report.audit.drift.expect("drift report");
        assert_eq!(drift.agent_id, "agent-main");
    }
}
