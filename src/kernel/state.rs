//! Kernel state machine.
//!
//! Single global lifecycle state, mutated only by the pipeline. Legal
//! transitions are enumerated in [`StateMachine::allowed`]; an illegal
//! attempt leaves the machine in place, records a warning-level
//! `state:transition` event, and surfaces an error the pipeline maps to
//! `state_machine_rejected`. The machine also tracks consecutive
//! execution errors for the safe-mode controller.

use std::sync::{Arc, Mutex};

use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::kernel::events::EventStore;
use crate::types::{ComponentHealth, EventType, KernelState};

/// State machine errors.
#[derive(Debug, Error)]
pub enum TransitionError {
    /// The requested transition is not in the legal table.
    #[error("illegal transition {from} -> {to}")]
    Illegal {
        /// State the machine was in.
        from: KernelState,
        /// Requested target state.
        to: KernelState,
    },
    /// Internal lock was poisoned.
    #[error("state machine lock poisoned: {0}")]
    Lock(String),
}

struct MachineInner {
    state: KernelState,
    consecutive_errors: u32,
}

/// The kernel's single-writer state machine.
pub struct StateMachine {
    inner: Mutex<MachineInner>,
    events: Arc<dyn EventStore>,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.current())
            .finish()
    }
}

impl StateMachine {
    /// Create a machine in `idle`.
    pub fn new(events: Arc<dyn EventStore>) -> Self {
        Self {
            inner: Mutex::new(MachineInner {
                state: KernelState::Idle,
                consecutive_errors: 0,
            }),
            events,
        }
    }

    /// Whether `from -> to` is a legal transition.
    pub fn allowed(from: KernelState, to: KernelState) -> bool {
        use KernelState::{
            AwaitingApproval, Compensating, Error, Executing, Idle, SafeMode, Validating,
            Verifying,
        };
        match from {
            Idle => matches!(to, Validating | SafeMode),
            Validating => matches!(to, AwaitingApproval | Executing | Error | Idle),
            AwaitingApproval => matches!(to, Executing | Idle | SafeMode),
            Executing => matches!(to, Verifying | Compensating | Error | SafeMode),
            Verifying => matches!(to, Idle | Compensating | Error),
            Compensating => matches!(to, Idle | Error | SafeMode),
            SafeMode => matches!(to, Idle),
            Error => false,
        }
    }

    /// Current state.
    pub fn current(&self) -> KernelState {
        self.inner
            .lock()
            .map(|i| i.state)
            .unwrap_or(KernelState::Error)
    }

    /// Attempt a transition, recording it in the event chain.
    ///
    /// Returns the new state on success. Illegal attempts leave the
    /// machine in place and record a warning-level event.
    pub fn transition(
        &self,
        request_id: Uuid,
        to: KernelState,
    ) -> Result<KernelState, TransitionError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| TransitionError::Lock(e.to_string()))?;
        let from = inner.state;

        if !Self::allowed(from, to) {
            drop(inner);
            warn!(%from, %to, request = %request_id, "illegal state transition rejected");
            self.emit(
                request_id,
                json!({
                    "from": from.to_string(),
                    "to": to.to_string(),
                    "rejected": true,
                    "level": "warning",
                }),
            );
            return Err(TransitionError::Illegal { from, to });
        }

        inner.state = to;
        drop(inner);

        info!(%from, %to, request = %request_id, "state transition");
        self.emit(
            request_id,
            json!({
                "from": from.to_string(),
                "to": to.to_string(),
            }),
        );
        Ok(to)
    }

    /// Force entry into safe mode from any non-terminal state.
    ///
    /// Idempotent while already in safe mode. Fails only from `error`.
    pub fn enter_safe_mode(&self, request_id: Uuid) -> Result<(), TransitionError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| TransitionError::Lock(e.to_string()))?;
        let from = inner.state;
        if from == KernelState::SafeMode {
            return Ok(());
        }
        if from == KernelState::Error {
            return Err(TransitionError::Illegal {
                from,
                to: KernelState::SafeMode,
            });
        }
        inner.state = KernelState::SafeMode;
        drop(inner);

        warn!(%from, request = %request_id, "entering safe mode");
        self.emit(
            request_id,
            json!({
                "from": from.to_string(),
                "to": KernelState::SafeMode.to_string(),
            }),
        );
        Ok(())
    }

    /// Record an execution-layer failure; returns the new consecutive count.
    pub fn record_error(&self) -> u32 {
        self.inner
            .lock()
            .map(|mut inner| {
                inner.consecutive_errors = inner.consecutive_errors.saturating_add(1);
                inner.consecutive_errors
            })
            .unwrap_or(u32::MAX)
    }

    /// Reset the consecutive error counter after a successful run.
    pub fn record_success(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.consecutive_errors = 0;
        }
    }

    /// Current consecutive error count.
    pub fn consecutive_errors(&self) -> u32 {
        self.inner.lock().map(|i| i.consecutive_errors).unwrap_or(0)
    }

    /// Reset a terminal `error` state back to `idle`.
    ///
    /// Returns true when a reset happened. No-op in any other state.
    pub fn reset(&self) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if inner.state != KernelState::Error {
            return false;
        }
        inner.state = KernelState::Idle;
        inner.consecutive_errors = 0;
        drop(inner);

        info!("state machine reset from error to idle");
        self.emit(
            Uuid::new_v4(),
            json!({
                "from": KernelState::Error.to_string(),
                "to": KernelState::Idle.to_string(),
                "reset": true,
            }),
        );
        true
    }

    // Transition stream loss is tolerated (logged); tool events are not.
    fn emit(&self, request_id: Uuid, payload: serde_json::Value) {
        if let Err(e) = self
            .events
            .append(request_id, None, EventType::StateTransition, payload)
        {
            warn!(error = %e, "failed to append state transition event");
        }
    }

    /// Health probe.
    pub fn health(&self) -> ComponentHealth {
        let state = self.current();
        ComponentHealth {
            component: "state_machine".to_owned(),
            healthy: state != KernelState::Error,
            detail: state.to_string(),
        }
    }
}
