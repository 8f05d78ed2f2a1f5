//! Compensation registry and incident manager.
//!
//! A compensation function is a best-effort inverse of a tool's side
//! effects, invoked when the handler fails or verification critically
//! fails. Errors inside a compensation function are caught and surfaced
//! in the outcome, never propagated. When no compensation exists, or one
//! fails or times out, the incident manager opens a record for operator
//! follow-up.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::ComponentHealth;

// ── Compensation ────────────────────────────────────────────────

/// Context handed to a compensation function.
#[derive(Debug, Clone)]
pub struct CompensationContext {
    /// Request being compensated.
    pub request_id: Uuid,
    /// Tool whose effects are being undone.
    pub tool_name: String,
    /// Parameters the handler received.
    pub params: serde_json::Value,
    /// Handler result, when one exists.
    pub result: Option<serde_json::Value>,
    /// The error that triggered compensation.
    pub error: Option<String>,
}

/// Boxed future returned by a compensation function.
pub type CompensationFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// A compensation function: resolves to `Ok(())` on successful rollback
/// or `Err(detail)` on failure.
pub type CompensationFn = Arc<dyn Fn(CompensationContext) -> CompensationFuture + Send + Sync>;

/// Outcome of running (or failing to find) a compensation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationOutcome {
    /// Whether rollback completed.
    pub success: bool,
    /// Failure detail, when unsuccessful.
    pub detail: Option<String>,
    /// Whether the failure was a timeout.
    pub timed_out: bool,
}

/// Registry of rollback functions, keyed by tool name.
///
/// Re-registering a tool replaces the prior entry. Read-only at request
/// time; registration happens at startup.
pub struct CompensationRegistry {
    fns: RwLock<HashMap<String, CompensationFn>>,
    timeout: Duration,
}

impl std::fmt::Debug for CompensationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.fns.read().map(|f| f.len()).unwrap_or(0);
        f.debug_struct("CompensationRegistry")
            .field("registered", &count)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CompensationRegistry {
    /// Create a registry with the given compensation timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            fns: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Create a registry with the default 30-second timeout.
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(30))
    }

    /// Register a compensation for a tool, replacing any prior entry.
    pub fn register(&self, tool_name: impl Into<String>, f: CompensationFn) {
        let name = tool_name.into();
        if let Ok(mut fns) = self.fns.write() {
            if fns.insert(name.clone(), f).is_some() {
                info!(tool = %name, "compensation replaced");
            } else {
                info!(tool = %name, "compensation registered");
            }
        }
    }

    /// Register a synchronous compensation closure.
    pub fn register_sync(
        &self,
        tool_name: impl Into<String>,
        f: impl Fn(&CompensationContext) -> Result<(), String> + Send + Sync + 'static,
    ) {
        let wrapped: CompensationFn = Arc::new(move |ctx: CompensationContext| {
            let outcome = f(&ctx);
            Box::pin(async move { outcome }) as CompensationFuture
        });
        self.register(tool_name, wrapped);
    }

    /// Whether a compensation exists for the tool.
    pub fn has(&self, tool_name: &str) -> bool {
        self.fns
            .read()
            .map(|fns| fns.contains_key(tool_name))
            .unwrap_or(false)
    }

    /// Run the compensation for `ctx.tool_name` under the registry timeout.
    ///
    /// Absent compensation, internal failure, and timeout all surface as
    /// `success == false` with a detail — nothing propagates.
    pub async fn compensate(&self, ctx: CompensationContext) -> CompensationOutcome {
        let f = self
            .fns
            .read()
            .ok()
            .and_then(|fns| fns.get(&ctx.tool_name).cloned());

        let Some(f) = f else {
            return CompensationOutcome {
                success: false,
                detail: Some(format!("no compensation registered for {}", ctx.tool_name)),
                timed_out: false,
            };
        };

        let tool = ctx.tool_name.clone();
        match tokio::time::timeout(self.timeout, f(ctx)).await {
            Ok(Ok(())) => {
                info!(tool = %tool, "compensation succeeded");
                CompensationOutcome {
                    success: true,
                    detail: None,
                    timed_out: false,
                }
            }
            Ok(Err(detail)) => {
                warn!(tool = %tool, detail = %detail, "compensation failed");
                CompensationOutcome {
                    success: false,
                    detail: Some(detail),
                    timed_out: false,
                }
            }
            Err(_) => {
                warn!(tool = %tool, "compensation timed out");
                CompensationOutcome {
                    success: false,
                    detail: Some(format!(
                        "compensation exceeded {} ms",
                        self.timeout.as_millis()
                    )),
                    timed_out: true,
                }
            }
        }
    }

    /// Health probe.
    pub fn health(&self) -> ComponentHealth {
        match self.fns.read() {
            Ok(fns) => ComponentHealth {
                component: "compensation_registry".to_owned(),
                healthy: true,
                detail: format!("{} compensations", fns.len()),
            },
            Err(e) => ComponentHealth {
                component: "compensation_registry".to_owned(),
                healthy: false,
                detail: e.to_string(),
            },
        }
    }
}

// ── Incidents ───────────────────────────────────────────────────

/// Why an incident was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentReason {
    /// No compensation registered for the failed tool.
    NoCompensation,
    /// The compensation ran and failed.
    CompensationError,
    /// The compensation exceeded its timeout.
    CompensationTimeout,
}

impl std::fmt::Display for IncidentReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoCompensation => f.write_str("no_compensation"),
            Self::CompensationError => f.write_str("compensation_error"),
            Self::CompensationTimeout => f.write_str("compensation_timeout"),
        }
    }
}

/// Incident lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    /// Newly opened.
    Open,
    /// An operator has seen it.
    Acknowledged,
    /// Follow-up complete.
    Resolved,
}

/// A recorded compensation incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationIncident {
    /// Incident id.
    pub id: Uuid,
    /// Request that triggered it.
    pub request_id: Uuid,
    /// Tool involved.
    pub tool_name: String,
    /// Why it was opened.
    pub reason: IncidentReason,
    /// Lifecycle status.
    pub status: IncidentStatus,
    /// When it was opened.
    pub created_at: DateTime<Utc>,
    /// When it was resolved, if it was.
    pub resolved_at: Option<DateTime<Utc>>,
}

/// In-memory incident ledger.
#[derive(Default)]
pub struct IncidentManager {
    incidents: Mutex<Vec<CompensationIncident>>,
}

impl std::fmt::Debug for IncidentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open = self
            .incidents
            .lock()
            .map(|i| i.iter().filter(|x| x.status == IncidentStatus::Open).count())
            .unwrap_or(0);
        f.debug_struct("IncidentManager").field("open", &open).finish()
    }
}

impl IncidentManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an incident.
    pub fn open(
        &self,
        request_id: Uuid,
        tool_name: impl Into<String>,
        reason: IncidentReason,
    ) -> CompensationIncident {
        let incident = CompensationIncident {
            id: Uuid::new_v4(),
            request_id,
            tool_name: tool_name.into(),
            reason,
            status: IncidentStatus::Open,
            created_at: Utc::now(),
            resolved_at: None,
        };
        warn!(
            incident = %incident.id,
            request = %request_id,
            tool = %incident.tool_name,
            reason = %reason,
            "compensation incident opened"
        );
        if let Ok(mut incidents) = self.incidents.lock() {
            incidents.push(incident.clone());
        }
        incident
    }

    /// Mark an incident acknowledged. Returns false when unknown.
    pub fn acknowledge(&self, id: Uuid) -> bool {
        self.set_status(id, IncidentStatus::Acknowledged)
    }

    /// Mark an incident resolved. Returns false when unknown.
    pub fn resolve(&self, id: Uuid) -> bool {
        self.set_status(id, IncidentStatus::Resolved)
    }

    fn set_status(&self, id: Uuid, status: IncidentStatus) -> bool {
        let Ok(mut incidents) = self.incidents.lock() else {
            return false;
        };
        let Some(incident) = incidents.iter_mut().find(|i| i.id == id) else {
            return false;
        };
        incident.status = status;
        if status == IncidentStatus::Resolved {
            incident.resolved_at = Some(Utc::now());
        }
        true
    }

    /// Look up an incident by id.
    pub fn get(&self, id: Uuid) -> Option<CompensationIncident> {
        self.incidents
            .lock()
            .ok()
            .and_then(|incidents| incidents.iter().find(|i| i.id == id).cloned())
    }

    /// All incidents still open.
    pub fn open_incidents(&self) -> Vec<CompensationIncident> {
        self.incidents
            .lock()
            .map(|incidents| {
                incidents
                    .iter()
                    .filter(|i| i.status == IncidentStatus::Open)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Health probe: unhealthy while incidents are open.
    pub fn health(&self) -> ComponentHealth {
        let open = self.open_incidents().len();
        ComponentHealth {
            component: "incident_manager".to_owned(),
            healthy: open == 0,
            detail: format!("{open} open incidents"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(tool: &str) -> CompensationContext {
        CompensationContext {
            request_id: Uuid::new_v4(),
            tool_name: tool.to_owned(),
            params: json!({"path": "./out.txt"}),
            result: None,
            error: Some("handler exploded".to_owned()),
        }
    }

    #[tokio::test]
    async fn test_compensate_success() {
        let registry = CompensationRegistry::with_defaults();
        registry.register_sync("WRITE_FILE", |_| Ok(()));

        let outcome = registry.compensate(ctx("WRITE_FILE")).await;
        assert!(outcome.success);
        assert!(outcome.detail.is_none());
    }

    #[tokio::test]
    async fn test_compensate_missing() {
        let registry = CompensationRegistry::with_defaults();
        assert!(!registry.has("UNKNOWN"));

        let outcome = registry.compensate(ctx("UNKNOWN")).await;
        assert!(!outcome.success);
        assert!(outcome.detail.expect("detail").contains("no compensation"));
    }

    #[tokio::test]
    async fn test_compensate_failure_caught() {
        let registry = CompensationRegistry::with_defaults();
        registry.register_sync("WRITE_FILE", |_| Err("original file missing".to_owned()));

        let outcome = registry.compensate(ctx("WRITE_FILE")).await;
        assert!(!outcome.success);
        assert_eq!(outcome.detail.as_deref(), Some("original file missing"));
    }

    #[tokio::test]
    async fn test_compensate_timeout() {
        let registry = CompensationRegistry::new(Duration::from_millis(20));
        let hanging: CompensationFn = Arc::new(|_ctx| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }) as CompensationFuture
        });
        registry.register("SLOW_TOOL", hanging);

        let outcome = registry.compensate(ctx("SLOW_TOOL")).await;
        assert!(!outcome.success);
        assert!(outcome.timed_out);
        assert!(outcome.detail.expect("detail").contains("exceeded"));
    }

    #[tokio::test]
    async fn test_register_twice_replaces() {
        let registry = CompensationRegistry::with_defaults();
        registry.register_sync("TOOL", |_| Err("first".to_owned()));
        registry.register_sync("TOOL", |_| Ok(()));

        let outcome = registry.compensate(ctx("TOOL")).await;
        assert!(outcome.success, "second registration should replace the first");
    }

    #[test]
    fn test_incident_lifecycle() {
        let manager = IncidentManager::new();
        let incident = manager.open(Uuid::new_v4(), "WRITE_FILE", IncidentReason::NoCompensation);
        assert_eq!(incident.status, IncidentStatus::Open);
        assert_eq!(manager.open_incidents().len(), 1);

        assert!(manager.acknowledge(incident.id));
        assert!(manager.open_incidents().is_empty());

        assert!(manager.resolve(incident.id));
        let resolved = manager.get(incident.id).expect("incident");
        assert_eq!(resolved.status, IncidentStatus::Resolved);
        assert!(resolved.resolved_at.is_some());
    }

    #[test]
    fn test_unknown_incident_ops() {
        let manager = IncidentManager::new();
        assert!(!manager.acknowledge(Uuid::new_v4()));
        assert!(!manager.resolve(Uuid::new_v4()));
        assert!(manager.get(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_health_reflects_open_incidents() {
        let manager = IncidentManager::new();
        assert!(manager.health().healthy);
        manager.open(Uuid::new_v4(), "TOOL", IncidentReason::CompensationError);
        assert!(!manager.health().healthy);
    }
}
