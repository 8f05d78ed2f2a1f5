//! Governance policy engine.
//!
//! Policies map risk classes to approval requirements (with optional
//! trust floors), carry compliance checks evaluated against each call,
//! and declare retention windows for the audit surface. In the absence
//! of a registered policy the engine falls back to a built-in mapping:
//! read-only tools need nothing, reversible tools need an automated
//! grant, irreversible tools need a human.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{ApprovalRequirement, CallSource, ComponentHealth, RiskClass};

// ── Policy model ────────────────────────────────────────────────

/// Approval rule for one risk class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ApprovalRule {
    /// Requirement when this rule matches.
    pub requirement: ApprovalRequirement,
    /// Trust floor for `automated` resolution; engine default when absent.
    pub trust_floor: Option<f64>,
}

/// Retention windows for persisted audit state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// How long execution events are retained, in milliseconds.
    pub event_ms: u64,
    /// How long audit records are retained, in milliseconds.
    pub audit_ms: u64,
    /// Whether eviction requires a prior export.
    pub export_before_eviction: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            // 30 days of events, 90 days of audit records.
            event_ms: 30 * 24 * 60 * 60 * 1000,
            audit_ms: 90 * 24 * 60 * 60 * 1000,
            export_before_eviction: true,
        }
    }
}

/// Predicate evaluated against every governed call.
pub type ComplianceFn = Arc<dyn Fn(&GovernanceContext) -> bool + Send + Sync>;

/// A named compliance check.
#[derive(Clone)]
pub struct ComplianceCheck {
    /// Stable check id.
    pub id: String,
    /// What the check enforces; doubles as the failure reason.
    pub description: String,
    check: ComplianceFn,
}

impl std::fmt::Debug for ComplianceCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplianceCheck")
            .field("id", &self.id)
            .finish()
    }
}

impl ComplianceCheck {
    /// Build a check from a predicate.
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        check: impl Fn(&GovernanceContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            check: Arc::new(check),
        }
    }
}

/// A governance policy.
#[derive(Clone)]
pub struct GovernancePolicy {
    /// Policy id.
    pub id: String,
    /// Approval rules by risk class.
    pub approval_rules: BTreeMap<RiskClass, ApprovalRule>,
    /// Retention windows.
    pub retention: RetentionPolicy,
    /// Compliance checks.
    pub compliance_checks: Vec<ComplianceCheck>,
    /// External references (tickets, regulations).
    pub references: Vec<String>,
}

impl std::fmt::Debug for GovernancePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernancePolicy")
            .field("id", &self.id)
            .field("rules", &self.approval_rules.len())
            .field("checks", &self.compliance_checks.len())
            .finish()
    }
}

impl GovernancePolicy {
    /// An empty policy with default retention.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            approval_rules: BTreeMap::new(),
            retention: RetentionPolicy::default(),
            compliance_checks: Vec::new(),
            references: Vec::new(),
        }
    }

    /// Add an approval rule for a risk class.
    #[must_use]
    pub fn rule(
        mut self,
        risk_class: RiskClass,
        requirement: ApprovalRequirement,
        trust_floor: Option<f64>,
    ) -> Self {
        self.approval_rules.insert(
            risk_class,
            ApprovalRule {
                requirement,
                trust_floor,
            },
        );
        self
    }

    /// Add a compliance check.
    #[must_use]
    pub fn check(mut self, check: ComplianceCheck) -> Self {
        self.compliance_checks.push(check);
        self
    }

    /// Set the retention windows.
    #[must_use]
    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Add an external reference.
    #[must_use]
    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.references.push(reference.into());
        self
    }
}

// ── Evaluation ──────────────────────────────────────────────────

/// Call attributes the engine evaluates.
#[derive(Debug, Clone)]
pub struct GovernanceContext {
    /// Tool being proposed.
    pub tool_name: String,
    /// Contract risk class.
    pub risk_class: RiskClass,
    /// Call origin.
    pub source: CallSource,
    /// Resolved source trust.
    pub source_trust: f64,
    /// Proposed parameters.
    pub params: serde_json::Value,
}

/// Result of one compliance check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceResult {
    /// Check id.
    pub id: String,
    /// Whether it held.
    pub compliant: bool,
    /// Failure reason, when it did not.
    pub reason: Option<String>,
}

/// Outcome of evaluating a call against a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceDecision {
    /// False when any compliance check failed.
    pub approved: bool,
    /// Resolved approval requirement.
    pub approval_requirement: ApprovalRequirement,
    /// Per-check outcomes.
    pub compliance_results: Vec<ComplianceResult>,
    /// All checks held.
    pub overall_compliant: bool,
    /// Denial reasons accumulated during evaluation.
    pub reasons: Vec<String>,
}

/// Governance policy engine.
pub struct GovernanceEngine {
    policies: RwLock<HashMap<String, Arc<GovernancePolicy>>>,
    default_trust_floor: f64,
}

impl std::fmt::Debug for GovernanceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.policies.read().map(|p| p.len()).unwrap_or(0);
        f.debug_struct("GovernanceEngine")
            .field("policies", &count)
            .finish()
    }
}

impl GovernanceEngine {
    /// Create an engine with the given default automated trust floor.
    pub fn new(default_trust_floor: f64) -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            default_trust_floor: default_trust_floor.clamp(0.0, 1.0),
        }
    }

    /// Create an engine with the default 0.7 trust floor.
    pub fn with_defaults() -> Self {
        Self::new(0.7)
    }

    /// Register a policy, replacing any prior policy with the same id.
    pub fn register_policy(&self, policy: GovernancePolicy) {
        info!(policy = %policy.id, "governance policy registered");
        if let Ok(mut policies) = self.policies.write() {
            policies.insert(policy.id.clone(), Arc::new(policy));
        }
    }

    /// Look up a registered policy.
    pub fn get_policy(&self, id: &str) -> Option<Arc<GovernancePolicy>> {
        self.policies.read().ok().and_then(|p| p.get(id).cloned())
    }

    /// Built-in requirement mapping used when no policy rule matches.
    pub fn default_requirement(risk_class: RiskClass) -> ApprovalRequirement {
        match risk_class {
            RiskClass::ReadOnly => ApprovalRequirement::None,
            RiskClass::Reversible => ApprovalRequirement::Automated,
            RiskClass::Irreversible => ApprovalRequirement::Human,
        }
    }

    /// Evaluate a call against a policy (or the built-in mapping when
    /// `policy_id` is absent or unknown).
    pub fn evaluate(&self, ctx: &GovernanceContext, policy_id: Option<&str>) -> GovernanceDecision {
        let policy = policy_id.and_then(|id| self.get_policy(id));

        let mut reasons = Vec::new();
        let approval_requirement = match &policy {
            None => self.resolve_requirement(
                Self::default_requirement(ctx.risk_class),
                None,
                ctx.source_trust,
                &mut reasons,
            ),
            Some(policy) => match policy.approval_rules.get(&ctx.risk_class) {
                // No rule for the risk class means no requirement.
                None => ApprovalRequirement::None,
                Some(rule) => self.resolve_requirement(
                    rule.requirement,
                    rule.trust_floor,
                    ctx.source_trust,
                    &mut reasons,
                ),
            },
        };

        let mut compliance_results = Vec::new();
        let mut overall_compliant = true;
        if let Some(policy) = &policy {
            for check in &policy.compliance_checks {
                let compliant = (check.check)(ctx);
                if !compliant {
                    overall_compliant = false;
                    reasons.push(check.description.clone());
                }
                compliance_results.push(ComplianceResult {
                    id: check.id.clone(),
                    compliant,
                    reason: (!compliant).then(|| check.description.clone()),
                });
            }
        }

        debug!(
            tool = %ctx.tool_name,
            risk = %ctx.risk_class,
            requirement = %approval_requirement,
            compliant = overall_compliant,
            "governance evaluation"
        );

        GovernanceDecision {
            approved: overall_compliant,
            approval_requirement,
            compliance_results,
            overall_compliant,
            reasons,
        }
    }

    /// Collapse `automated` into `none` or `human` from the trust floor.
    fn resolve_requirement(
        &self,
        requirement: ApprovalRequirement,
        trust_floor: Option<f64>,
        source_trust: f64,
        reasons: &mut Vec<String>,
    ) -> ApprovalRequirement {
        match requirement {
            ApprovalRequirement::Automated => {
                let floor = trust_floor.unwrap_or(self.default_trust_floor);
                if source_trust >= floor {
                    ApprovalRequirement::None
                } else {
                    reasons.push(format!(
                        "source trust {source_trust:.2} below automated floor {floor:.2}"
                    ));
                    ApprovalRequirement::Human
                }
            }
            other => other,
        }
    }

    /// Health probe.
    pub fn health(&self) -> ComponentHealth {
        match self.policies.read() {
            Ok(policies) => ComponentHealth {
                component: "governance_engine".to_owned(),
                healthy: true,
                detail: format!("{} policies", policies.len()),
            },
            Err(e) => ComponentHealth {
                component: "governance_engine".to_owned(),
                healthy: false,
                detail: e.to_string(),
            },
        }
    }
}
