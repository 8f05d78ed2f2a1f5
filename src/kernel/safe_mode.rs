//! Safe-mode controller.
//!
//! Safe mode is the kernel's degraded regime: only read-only tools run.
//! It triggers when consecutive execution errors reach a threshold, and
//! exits only on an authorized request — the source must be `user` or
//! `system` and its trust must clear the exit floor. The exit floor is
//! the stricter gate: no governance rule can lower it.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{CallSource, ComponentHealth};

/// Why safe mode is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafeModeStatus {
    /// Trigger reason.
    pub reason: String,
    /// When safe mode engaged.
    pub entered_at: DateTime<Utc>,
}

/// Decision on a safe-mode exit request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitDecision {
    /// Whether the exit is authorized.
    pub allowed: bool,
    /// Why (or why not).
    pub reason: String,
}

/// The safe-mode controller.
pub struct SafeModeController {
    threshold: u32,
    exit_trust_floor: f64,
    active: Mutex<Option<SafeModeStatus>>,
}

impl std::fmt::Debug for SafeModeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeModeController")
            .field("threshold", &self.threshold)
            .field("active", &self.is_active())
            .finish()
    }
}

impl SafeModeController {
    /// Create a controller.
    pub fn new(threshold: u32, exit_trust_floor: f64) -> Self {
        Self {
            threshold: threshold.max(1),
            exit_trust_floor: exit_trust_floor.clamp(0.0, 1.0),
            active: Mutex::new(None),
        }
    }

    /// Create a controller with the defaults: threshold 3, exit floor 0.8.
    pub fn with_defaults() -> Self {
        Self::new(3, 0.8)
    }

    /// Whether the consecutive error count has reached the trigger.
    pub fn should_trigger(&self, consecutive_errors: u32) -> bool {
        consecutive_errors >= self.threshold
    }

    /// Engage safe mode. Idempotent while already active.
    pub fn enter(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Ok(mut active) = self.active.lock() {
            if active.is_some() {
                return;
            }
            warn!(reason = %reason, "safe mode engaged");
            *active = Some(SafeModeStatus {
                reason,
                entered_at: Utc::now(),
            });
        }
    }

    /// Whether safe mode is currently active.
    pub fn is_active(&self) -> bool {
        self.active.lock().map(|a| a.is_some()).unwrap_or(true)
    }

    /// Current status, when active.
    pub fn status(&self) -> Option<SafeModeStatus> {
        self.active.lock().ok().and_then(|a| a.clone())
    }

    /// Request an exit.
    ///
    /// Authorized only for `user`/`system` sources whose trust clears the
    /// exit floor. Idempotent while safe mode is not active — the state
    /// never changes and the decision reports there is nothing to exit.
    pub fn request_exit(&self, source: &CallSource, trust: f64) -> ExitDecision {
        let authorized_source = matches!(source, CallSource::User | CallSource::System);
        if !authorized_source {
            return ExitDecision {
                allowed: false,
                reason: format!("source {source} may not exit safe mode"),
            };
        }
        if trust < self.exit_trust_floor {
            return ExitDecision {
                allowed: false,
                reason: format!(
                    "trust {trust:.2} below exit floor {:.2}",
                    self.exit_trust_floor
                ),
            };
        }

        let Ok(mut active) = self.active.lock() else {
            return ExitDecision {
                allowed: false,
                reason: "safe mode state unavailable".to_owned(),
            };
        };
        if active.is_none() {
            return ExitDecision {
                allowed: false,
                reason: "safe mode not active".to_owned(),
            };
        }

        *active = None;
        drop(active);
        info!(source = %source, trust, "safe mode exited");
        ExitDecision {
            allowed: true,
            reason: "authorized exit".to_owned(),
        }
    }

    /// Configured trigger threshold.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Health probe: degraded while active.
    pub fn health(&self) -> ComponentHealth {
        let active = self.is_active();
        ComponentHealth {
            component: "safe_mode".to_owned(),
            healthy: !active,
            detail: if active {
                self.status()
                    .map(|s| format!("active: {}", s.reason))
                    .unwrap_or_else(|| "active".to_owned())
            } else {
                "inactive".to_owned()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_threshold() {
        let controller = SafeModeController::with_defaults();
        assert!(!controller.should_trigger(0));
        assert!(!controller.should_trigger(2));
        assert!(controller.should_trigger(3));
        assert!(controller.should_trigger(10));
    }

    #[test]
    fn test_enter_and_status() {
        let controller = SafeModeController::with_defaults();
        assert!(!controller.is_active());

        controller.enter("three consecutive handler failures");
        assert!(controller.is_active());
        let status = controller.status().expect("status");
        assert!(status.reason.contains("consecutive"));

        // Idempotent: re-entry keeps the original reason.
        controller.enter("second reason");
        assert!(controller
            .status()
            .expect("status")
            .reason
            .contains("consecutive"));
    }

    #[test]
    fn test_exit_requires_authorized_source() {
        let controller = SafeModeController::with_defaults();
        controller.enter("test");

        let denied = controller.request_exit(&CallSource::Llm, 0.99);
        assert!(!denied.allowed);
        assert!(controller.is_active());

        let denied = controller.request_exit(&CallSource::External, 1.0);
        assert!(!denied.allowed);
    }

    #[test]
    fn test_exit_requires_trust_floor() {
        let controller = SafeModeController::with_defaults();
        controller.enter("test");

        let denied = controller.request_exit(&CallSource::User, 0.5);
        assert!(!denied.allowed);
        assert!(denied.reason.contains("exit floor"));
        assert!(controller.is_active());

        let granted = controller.request_exit(&CallSource::User, 0.9);
        assert!(granted.allowed);
        assert!(!controller.is_active());
    }

    #[test]
    fn test_exit_idempotent_when_inactive() {
        let controller = SafeModeController::with_defaults();
        let first = controller.request_exit(&CallSource::System, 0.95);
        assert!(!first.allowed);
        assert_eq!(first.reason, "safe mode not active");

        // Repeat call: identical answer, no state change.
        let second = controller.request_exit(&CallSource::System, 0.95);
        assert_eq!(first, second);
    }

    #[test]
    fn test_system_source_may_exit() {
        let controller = SafeModeController::with_defaults();
        controller.enter("test");
        let decision = controller.request_exit(&CallSource::System, 0.9);
        assert!(decision.allowed);
    }

    #[test]
    fn test_health() {
        let controller = SafeModeController::with_defaults();
        assert!(controller.health().healthy);
        controller.enter("test");
        assert!(!controller.health().healthy);
    }
}
