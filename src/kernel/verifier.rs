//! Post-condition verification with failure taxonomy.
//!
//! Tools register declarative checks; after a handler runs, the verifier
//! evaluates every check for that tool under a per-check timeout and
//! classifies the outcome. A check that returns an error is a
//! `check_error`, one that exceeds its timeout is a `timeout`; neither
//! ever propagates out of [`Verifier::verify`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{ComponentHealth, Severity};

/// Boxed future returned by a check function.
pub type CheckFuture = Pin<Box<dyn Future<Output = Result<bool, String>> + Send>>;

/// A check function: receives the verification context, resolves to
/// `Ok(held)` or `Err(detail)`.
pub type CheckFn = Arc<dyn Fn(VerifyContext) -> CheckFuture + Send + Sync>;

/// Independent state lookup a check may consult (e.g. "does this plugin
/// now appear installed?").
#[async_trait]
pub trait StateQuery: Send + Sync {
    /// Look up a value by key; `None` when the key is unknown.
    async fn lookup(&self, key: &str) -> Option<serde_json::Value>;
}

/// Context handed to every check.
#[derive(Clone)]
pub struct VerifyContext {
    /// Tool that ran.
    pub tool_name: String,
    /// Parameters the handler received.
    pub params: serde_json::Value,
    /// Handler result.
    pub result: serde_json::Value,
    /// Handler-reported duration.
    pub duration_ms: u64,
    /// Agent on whose behalf the tool ran.
    pub agent_id: String,
    /// Request being verified.
    pub request_id: Uuid,
    /// Optional independent lookup.
    pub query: Option<Arc<dyn StateQuery>>,
}

impl std::fmt::Debug for VerifyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyContext")
            .field("tool_name", &self.tool_name)
            .field("request_id", &self.request_id)
            .field("duration_ms", &self.duration_ms)
            .finish()
    }
}

/// A registered post-condition.
#[derive(Clone)]
pub struct PostCondition {
    /// Stable check id.
    pub id: String,
    /// What the check asserts.
    pub description: String,
    /// How a failure is weighted.
    pub severity: Severity,
    check: CheckFn,
}

impl std::fmt::Debug for PostCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostCondition")
            .field("id", &self.id)
            .field("severity", &self.severity)
            .finish()
    }
}

impl PostCondition {
    /// A condition backed by an async check.
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
        check: CheckFn,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            severity,
            check,
        }
    }

    /// A condition backed by a synchronous predicate.
    pub fn sync(
        id: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
        predicate: impl Fn(&VerifyContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        let check: CheckFn = Arc::new(move |ctx: VerifyContext| {
            let held = predicate(&ctx);
            Box::pin(async move { Ok(held) }) as CheckFuture
        });
        Self::new(id, description, severity, check)
    }
}

/// How a single check resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum CheckOutcome {
    /// The condition held.
    Passed,
    /// The condition did not hold.
    Failed,
    /// The check function returned an error.
    CheckError(String),
    /// The check exceeded its timeout.
    TimedOut,
}

/// Result of one evaluated check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check id.
    pub id: String,
    /// Check description.
    pub description: String,
    /// Declared severity.
    pub severity: Severity,
    /// How it resolved.
    pub outcome: CheckOutcome,
}

/// Aggregate status of a verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Every check held.
    Passed,
    /// A critical check did not hold (or errored, or timed out).
    Failed,
    /// Only non-critical checks misbehaved.
    Partial,
}

/// Failure counts by class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureTaxonomy {
    /// Non-passed checks.
    pub total: u32,
    /// Non-passed checks declared critical.
    pub critical: u32,
    /// Non-passed checks declared warning.
    pub warning: u32,
    /// Non-passed checks declared info.
    pub info: u32,
    /// Checks whose condition did not hold.
    pub check_failed: u32,
    /// Checks that returned an error.
    pub check_error: u32,
    /// Checks that exceeded the timeout.
    pub timeout: u32,
}

/// Outcome of verifying one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Aggregate status.
    pub status: VerificationStatus,
    /// Per-check results, in registration order.
    pub checks: Vec<CheckResult>,
    /// Whether any critical check misbehaved.
    pub has_critical_failure: bool,
    /// Failure counts.
    pub taxonomy: FailureTaxonomy,
}

impl VerificationResult {
    /// The empty result: no conditions registered.
    pub fn passed_empty() -> Self {
        Self {
            status: VerificationStatus::Passed,
            checks: Vec::new(),
            has_critical_failure: false,
            taxonomy: FailureTaxonomy::default(),
        }
    }
}

/// Post-condition verifier.
pub struct Verifier {
    conditions: RwLock<HashMap<String, Vec<PostCondition>>>,
    check_timeout: Duration,
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tools = self.conditions.read().map(|c| c.len()).unwrap_or(0);
        f.debug_struct("Verifier")
            .field("tools_with_conditions", &tools)
            .field("check_timeout", &self.check_timeout)
            .finish()
    }
}

impl Verifier {
    /// Create a verifier with the given per-check timeout.
    pub fn new(check_timeout: Duration) -> Self {
        Self {
            conditions: RwLock::new(HashMap::new()),
            check_timeout,
        }
    }

    /// Create a verifier with the default 5-second per-check timeout.
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(5))
    }

    /// Register the condition set for a tool, replacing any prior set.
    pub fn register_conditions(&self, tool_name: impl Into<String>, conditions: Vec<PostCondition>) {
        if let Ok(mut map) = self.conditions.write() {
            map.insert(tool_name.into(), conditions);
        }
    }

    /// Whether a tool has any registered conditions.
    pub fn has_conditions(&self, tool_name: &str) -> bool {
        self.conditions
            .read()
            .map(|map| map.get(tool_name).map(|c| !c.is_empty()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Evaluate every condition registered for `ctx.tool_name`.
    ///
    /// With no conditions registered the result is `passed` with an
    /// empty check list.
    pub async fn verify(&self, ctx: VerifyContext) -> VerificationResult {
        let conditions: Vec<PostCondition> = self
            .conditions
            .read()
            .ok()
            .and_then(|map| map.get(&ctx.tool_name).cloned())
            .unwrap_or_default();

        if conditions.is_empty() {
            return VerificationResult::passed_empty();
        }

        let mut checks = Vec::with_capacity(conditions.len());
        let mut taxonomy = FailureTaxonomy::default();
        let mut has_critical_failure = false;
        let mut any_failure = false;

        for condition in conditions {
            let outcome = self.run_check(&condition, ctx.clone()).await;

            if outcome != CheckOutcome::Passed {
                any_failure = true;
                taxonomy.total = taxonomy.total.saturating_add(1);
                match condition.severity {
                    Severity::Critical => {
                        taxonomy.critical = taxonomy.critical.saturating_add(1);
                        has_critical_failure = true;
                    }
                    Severity::Warning => taxonomy.warning = taxonomy.warning.saturating_add(1),
                    Severity::Info => taxonomy.info = taxonomy.info.saturating_add(1),
                }
                match &outcome {
                    CheckOutcome::Failed => {
                        taxonomy.check_failed = taxonomy.check_failed.saturating_add(1);
                    }
                    CheckOutcome::CheckError(_) => {
                        taxonomy.check_error = taxonomy.check_error.saturating_add(1);
                    }
                    CheckOutcome::TimedOut => {
                        taxonomy.timeout = taxonomy.timeout.saturating_add(1);
                    }
                    CheckOutcome::Passed => {}
                }
                warn!(
                    tool = %ctx.tool_name,
                    check = %condition.id,
                    severity = ?condition.severity,
                    outcome = ?outcome,
                    "post-condition did not hold"
                );
            } else {
                debug!(tool = %ctx.tool_name, check = %condition.id, "post-condition held");
            }

            checks.push(CheckResult {
                id: condition.id.clone(),
                description: condition.description.clone(),
                severity: condition.severity,
                outcome,
            });
        }

        let status = if has_critical_failure {
            VerificationStatus::Failed
        } else if any_failure {
            VerificationStatus::Partial
        } else {
            VerificationStatus::Passed
        };

        VerificationResult {
            status,
            checks,
            has_critical_failure,
            taxonomy,
        }
    }

    async fn run_check(&self, condition: &PostCondition, ctx: VerifyContext) -> CheckOutcome {
        let future = (condition.check)(ctx);
        match tokio::time::timeout(self.check_timeout, future).await {
            Ok(Ok(true)) => CheckOutcome::Passed,
            Ok(Ok(false)) => CheckOutcome::Failed,
            Ok(Err(detail)) => CheckOutcome::CheckError(detail),
            Err(_) => CheckOutcome::TimedOut,
        }
    }

    /// Health probe.
    pub fn health(&self) -> ComponentHealth {
        match self.conditions.read() {
            Ok(map) => ComponentHealth {
                component: "verifier".to_owned(),
                healthy: true,
                detail: format!("{} tools with conditions", map.len()),
            },
            Err(e) => ComponentHealth {
                component: "verifier".to_owned(),
                healthy: false,
                detail: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_for(tool: &str) -> VerifyContext {
        VerifyContext {
            tool_name: tool.to_owned(),
            params: json!({}),
            result: json!({"ok": true}),
            duration_ms: 1,
            agent_id: "agent-test".to_owned(),
            request_id: Uuid::new_v4(),
            query: None,
        }
    }

    #[tokio::test]
    async fn test_no_conditions_passes_empty() {
        let verifier = Verifier::with_defaults();
        let result = verifier.verify(ctx_for("UNREGISTERED")).await;
        assert_eq!(result.status, VerificationStatus::Passed);
        assert!(result.checks.is_empty());
        assert!(!result.has_critical_failure);
    }

    #[tokio::test]
    async fn test_all_passing() {
        let verifier = Verifier::with_defaults();
        verifier.register_conditions(
            "TOOL",
            vec![
                PostCondition::sync("result_ok", "result has ok flag", Severity::Critical, |c| {
                    c.result.get("ok").and_then(|v| v.as_bool()).unwrap_or(false)
                }),
                PostCondition::sync("fast", "ran under a second", Severity::Info, |c| {
                    c.duration_ms < 1000
                }),
            ],
        );

        let result = verifier.verify(ctx_for("TOOL")).await;
        assert_eq!(result.status, VerificationStatus::Passed);
        assert_eq!(result.checks.len(), 2);
        assert_eq!(result.taxonomy, FailureTaxonomy::default());
    }

    #[tokio::test]
    async fn test_critical_failure() {
        let verifier = Verifier::with_defaults();
        verifier.register_conditions(
            "INSTALL_PLUGIN",
            vec![PostCondition::sync(
                "installed",
                "plugin appears installed",
                Severity::Critical,
                |_| false,
            )],
        );

        let result = verifier.verify(ctx_for("INSTALL_PLUGIN")).await;
        assert_eq!(result.status, VerificationStatus::Failed);
        assert!(result.has_critical_failure);
        assert_eq!(result.taxonomy.critical, 1);
        assert_eq!(result.taxonomy.check_failed, 1);
    }

    #[tokio::test]
    async fn test_warning_failure_is_partial() {
        let verifier = Verifier::with_defaults();
        verifier.register_conditions(
            "TOOL",
            vec![
                PostCondition::sync("held", "fine", Severity::Critical, |_| true),
                PostCondition::sync("slow", "too slow", Severity::Warning, |_| false),
            ],
        );

        let result = verifier.verify(ctx_for("TOOL")).await;
        assert_eq!(result.status, VerificationStatus::Partial);
        assert!(!result.has_critical_failure);
        assert_eq!(result.taxonomy.warning, 1);
    }

    #[tokio::test]
    async fn test_check_error_classified() {
        let verifier = Verifier::with_defaults();
        let erroring: CheckFn = Arc::new(|_ctx| {
            Box::pin(async { Err("lookup backend unavailable".to_owned()) }) as CheckFuture
        });
        verifier.register_conditions(
            "TOOL",
            vec![PostCondition::new("probe", "backend probe", Severity::Warning, erroring)],
        );

        let result = verifier.verify(ctx_for("TOOL")).await;
        assert_eq!(result.status, VerificationStatus::Partial);
        assert_eq!(result.taxonomy.check_error, 1);
        assert!(matches!(result.checks[0].outcome, CheckOutcome::CheckError(_)));
    }

    #[tokio::test]
    async fn test_check_timeout_classified() {
        let verifier = Verifier::new(Duration::from_millis(20));
        let hanging: CheckFn = Arc::new(|_ctx| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(true)
            }) as CheckFuture
        });
        verifier.register_conditions(
            "TOOL",
            vec![PostCondition::new("hang", "never resolves", Severity::Critical, hanging)],
        );

        let result = verifier.verify(ctx_for("TOOL")).await;
        assert_eq!(result.status, VerificationStatus::Failed);
        assert!(result.has_critical_failure, "critical timeout counts as critical failure");
        assert_eq!(result.taxonomy.timeout, 1);
        assert_eq!(result.checks[0].outcome, CheckOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_query_lookup_available_to_checks() {
        struct FixedQuery;

        #[async_trait]
        impl StateQuery for FixedQuery {
            async fn lookup(&self, key: &str) -> Option<serde_json::Value> {
                (key == "plugin:installed").then(|| json!(true))
            }
        }

        let verifier = Verifier::with_defaults();
        let querying: CheckFn = Arc::new(|ctx: VerifyContext| {
            Box::pin(async move {
                let Some(query) = ctx.query else {
                    return Err("no query available".to_owned());
                };
                Ok(query
                    .lookup("plugin:installed")
                    .await
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false))
            }) as CheckFuture
        });
        verifier.register_conditions(
            "INSTALL_PLUGIN",
            vec![PostCondition::new("installed", "query says installed", Severity::Critical, querying)],
        );

        let mut ctx = ctx_for("INSTALL_PLUGIN");
        ctx.query = Some(Arc::new(FixedQuery));
        let result = verifier.verify(ctx).await;
        assert_eq!(result.status, VerificationStatus::Passed);
    }

    #[tokio::test]
    async fn test_register_replaces_prior_set() {
        let verifier = Verifier::with_defaults();
        verifier.register_conditions(
            "TOOL",
            vec![PostCondition::sync("a", "first", Severity::Critical, |_| false)],
        );
        verifier.register_conditions(
            "TOOL",
            vec![PostCondition::sync("b", "second", Severity::Info, |_| true)],
        );

        let result = verifier.verify(ctx_for("TOOL")).await;
        assert_eq!(result.checks.len(), 1);
        assert_eq!(result.checks[0].id, "b");
        assert_eq!(result.status, VerificationStatus::Passed);
    }
}
