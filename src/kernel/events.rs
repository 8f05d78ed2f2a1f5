//! Append-only execution event store with a per-request hash chain.
//!
//! Every pipeline step appends an [`ExecutionEvent`] keyed by request id.
//! Each event's hash covers its type, timestamp, canonicalized payload,
//! and the previous event's hash, so any post-hoc mutation of a stored
//! event is detectable by [`EventStore::verify_chain`].
//!
//! Appends are serialized per request: concurrent appends to the same
//! request id produce a total order with correct `prev_hash` linkage.
//! Readers always receive owned copies; the store never hands out
//! mutable views of recorded events.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{ComponentHealth, EventType};

// ── Errors ──────────────────────────────────────────────────────

/// Event store operation errors.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Internal lock was poisoned.
    #[error("event store lock poisoned: {0}")]
    Lock(String),
    /// Persistence backend failure.
    #[error("event store backend error: {0}")]
    Backend(String),
}

// ── Event record ────────────────────────────────────────────────

/// A single recorded execution event.
///
/// Immutable after append; the store returns owned copies only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Event id.
    pub id: Uuid,
    /// Request this event belongs to.
    pub request_id: Uuid,
    /// Optional grouping id shared by related requests.
    pub correlation_id: Option<Uuid>,
    /// Event type discriminator.
    pub event_type: EventType,
    /// Append time.
    pub timestamp: DateTime<Utc>,
    /// Structured event payload.
    pub payload: serde_json::Value,
    /// Hash of the preceding event for this request ("" for the first).
    pub prev_hash: String,
    /// SHA-256 over type, timestamp, canonical payload, and `prev_hash`.
    pub hash: String,
}

impl ExecutionEvent {
    /// Recompute this event's hash from its stored fields.
    pub fn recomputed_hash(&self) -> String {
        chain_hash(
            self.event_type.as_str(),
            &self.timestamp.to_rfc3339(),
            &canonical_json(&self.payload),
            &self.prev_hash,
        )
    }
}

/// Compute the chain hash for one event.
///
/// Preimage layout: `type '\n' timestamp '\n' canonical(payload) '\n' prev_hash`.
pub fn chain_hash(
    event_type: &str,
    timestamp_rfc3339: &str,
    canonical_payload: &str,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(timestamp_rfc3339.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_payload.as_bytes());
    hasher.update(b"\n");
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic serialization: compact JSON with recursively sorted keys.
///
/// Two structurally equal payloads always canonicalize identically,
/// regardless of the insertion order of their maps.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            out.push('{');
            let sorted: BTreeMap<&String, &serde_json::Value> = map.iter().collect();
            let mut first = true;
            for (key, val) in sorted {
                if !first {
                    out.push(',');
                }
                first = false;
                // Key serialization via Value::String gives correct escaping.
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            let mut first = true;
            for item in items {
                if !first {
                    out.push(',');
                }
                first = false;
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

// ── Chain verification & projection ─────────────────────────────

/// Result of verifying a request's hash chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    /// Whether every link and every hash held.
    pub valid: bool,
    /// Zero-based index of the first broken record, when invalid.
    pub first_broken_at: Option<usize>,
}

/// Collapsed view of a request's event sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestProjection {
    /// Request id.
    pub request_id: Uuid,
    /// Derived status.
    pub status: RequestStatus,
    /// Payload of the `tool:executed` event, when present.
    pub outcome: Option<serde_json::Value>,
    /// Milliseconds between the first and last event.
    pub total_ms: i64,
    /// Handler-reported duration, when present.
    pub handler_ms: Option<u64>,
    /// Event counts by type.
    pub counts: BTreeMap<String, u64>,
}

/// Derived request status for projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Proposed but not yet decided.
    Pending,
    /// Approval granted, execution not yet observed.
    Approved,
    /// Approval denied or timed out.
    Denied,
    /// Handler running.
    Executing,
    /// Verified successfully.
    Verified,
    /// Handler or verification failed.
    Failed,
    /// Compensation completed.
    Compensated,
    /// A compensation incident was opened.
    Incident,
}

/// Verify the hash chain over an ordered event sequence.
pub fn verify_event_sequence(events: &[ExecutionEvent]) -> ChainVerification {
    let mut expected_prev = String::new();
    for (index, event) in events.iter().enumerate() {
        if event.prev_hash != expected_prev || event.recomputed_hash() != event.hash {
            return ChainVerification {
                valid: false,
                first_broken_at: Some(index),
            };
        }
        expected_prev.clone_from(&event.hash);
    }
    ChainVerification {
        valid: true,
        first_broken_at: None,
    }
}

/// Collapse an ordered event sequence into a [`RequestProjection`].
pub fn project_event_sequence(request_id: Uuid, events: &[ExecutionEvent]) -> RequestProjection {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut status = RequestStatus::Pending;
    let mut outcome = None;
    let mut handler_ms = None;

    for event in events {
        let slot = counts.entry(event.event_type.as_str().to_owned()).or_insert(0);
        *slot = slot.saturating_add(1);

        match event.event_type {
            EventType::ToolApprovalGranted => status = RequestStatus::Approved,
            EventType::ToolApprovalDenied => status = RequestStatus::Denied,
            EventType::ToolExecuting => status = RequestStatus::Executing,
            EventType::ToolExecuted => {
                outcome = Some(event.payload.clone());
                handler_ms = event.payload.get("duration_ms").and_then(|v| v.as_u64());
            }
            EventType::ToolFailed => status = RequestStatus::Failed,
            EventType::ToolVerified => {
                let verified_ok = event
                    .payload
                    .get("status")
                    .and_then(|v| v.as_str())
                    .map(|s| s != "failed")
                    .unwrap_or(false);
                status = if verified_ok {
                    RequestStatus::Verified
                } else {
                    RequestStatus::Failed
                };
            }
            EventType::ToolCompensated => status = RequestStatus::Compensated,
            EventType::CompensationIncident => status = RequestStatus::Incident,
            _ => {}
        }
    }

    let total_ms = match (events.first(), events.last()) {
        (Some(first), Some(last)) => last
            .timestamp
            .signed_duration_since(first.timestamp)
            .num_milliseconds()
            .max(0),
        _ => 0,
    };

    RequestProjection {
        request_id,
        status,
        outcome,
        total_ms,
        handler_ms,
        counts,
    }
}

// ── Store trait ─────────────────────────────────────────────────

/// Append-only event log with per-request hash chains.
///
/// Implementations must serialize appends per request id so that the
/// chain linkage is a total order even under concurrent writers.
pub trait EventStore: Send + Sync {
    /// Append an event, computing its chain hash.
    fn append(
        &self,
        request_id: Uuid,
        correlation_id: Option<Uuid>,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<ExecutionEvent, EventStoreError>;

    /// All events for a request, in append order.
    fn events_for_request(&self, request_id: Uuid) -> Result<Vec<ExecutionEvent>, EventStoreError>;

    /// All events sharing a correlation id, in append order.
    fn events_for_correlation(
        &self,
        correlation_id: Uuid,
    ) -> Result<Vec<ExecutionEvent>, EventStoreError>;

    /// Total number of stored events.
    fn size(&self) -> Result<usize, EventStoreError>;

    /// Verify a request's hash chain.
    fn verify_chain(&self, request_id: Uuid) -> Result<ChainVerification, EventStoreError> {
        Ok(verify_event_sequence(&self.events_for_request(request_id)?))
    }

    /// Collapse a request's events into a projection.
    fn project_request(&self, request_id: Uuid) -> Result<RequestProjection, EventStoreError> {
        Ok(project_event_sequence(
            request_id,
            &self.events_for_request(request_id)?,
        ))
    }

    /// Health probe.
    fn health(&self) -> ComponentHealth {
        match self.size() {
            Ok(n) => ComponentHealth {
                component: "event_store".to_owned(),
                healthy: true,
                detail: format!("{n} events"),
            },
            Err(e) => ComponentHealth {
                component: "event_store".to_owned(),
                healthy: false,
                detail: e.to_string(),
            },
        }
    }
}

// ── In-memory implementation ────────────────────────────────────

/// In-memory [`EventStore`] for tests and ephemeral kernels.
#[derive(Default)]
pub struct InMemoryEventStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    by_request: HashMap<Uuid, Vec<ExecutionEvent>>,
    by_correlation: HashMap<Uuid, Vec<ExecutionEvent>>,
    total: usize,
}

impl InMemoryEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total = self.inner.lock().map(|i| i.total).unwrap_or(0);
        f.debug_struct("InMemoryEventStore")
            .field("total", &total)
            .finish()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        request_id: Uuid,
        correlation_id: Option<Uuid>,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<ExecutionEvent, EventStoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| EventStoreError::Lock(e.to_string()))?;

        let chain = inner.by_request.entry(request_id).or_default();
        let prev_hash = chain.last().map(|e| e.hash.clone()).unwrap_or_default();

        let timestamp = Utc::now();
        let hash = chain_hash(
            event_type.as_str(),
            &timestamp.to_rfc3339(),
            &canonical_json(&payload),
            &prev_hash,
        );

        let event = ExecutionEvent {
            id: Uuid::new_v4(),
            request_id,
            correlation_id,
            event_type,
            timestamp,
            payload,
            prev_hash,
            hash,
        };

        chain.push(event.clone());
        if let Some(cid) = correlation_id {
            inner.by_correlation.entry(cid).or_default().push(event.clone());
        }
        inner.total = inner.total.saturating_add(1);

        Ok(event)
    }

    fn events_for_request(&self, request_id: Uuid) -> Result<Vec<ExecutionEvent>, EventStoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| EventStoreError::Lock(e.to_string()))?;
        Ok(inner.by_request.get(&request_id).cloned().unwrap_or_default())
    }

    fn events_for_correlation(
        &self,
        correlation_id: Uuid,
    ) -> Result<Vec<ExecutionEvent>, EventStoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| EventStoreError::Lock(e.to_string()))?;
        Ok(inner
            .by_correlation
            .get(&correlation_id)
            .cloned()
            .unwrap_or_default())
    }

    fn size(&self) -> Result<usize, EventStoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| EventStoreError::Lock(e.to_string()))?;
        Ok(inner.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"z": true, "y": [1, 2]}});
        let b = json!({"a": {"y": [1, 2], "z": true}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"y":[1,2],"z":true},"b":1}"#);
    }

    #[test]
    fn test_canonical_json_scalars() {
        assert_eq!(canonical_json(&json!(null)), "null");
        assert_eq!(canonical_json(&json!("x\"y")), r#""x\"y""#);
        assert_eq!(canonical_json(&json!(3.5)), "3.5");
    }

    #[test]
    fn test_append_links_chain() {
        let store = InMemoryEventStore::new();
        let request = Uuid::new_v4();

        let first = store
            .append(request, None, EventType::ToolProposed, json!({"tool": "READ_FILE"}))
            .expect("append");
        let second = store
            .append(request, None, EventType::ToolValidated, json!({}))
            .expect("append");

        assert_eq!(first.prev_hash, "");
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(store.size().expect("size"), 2);
    }

    #[test]
    fn test_verify_chain_valid() {
        let store = InMemoryEventStore::new();
        let request = Uuid::new_v4();
        for ty in [
            EventType::ToolProposed,
            EventType::ToolValidated,
            EventType::ToolExecuting,
            EventType::ToolExecuted,
            EventType::ToolVerified,
        ] {
            store
                .append(request, None, ty, json!({"step": ty.as_str()}))
                .expect("append");
        }
        let verification = store.verify_chain(request).expect("verify");
        assert!(verification.valid);
        assert!(verification.first_broken_at.is_none());
    }

    #[test]
    fn test_verify_chain_detects_payload_mutation() {
        let store = InMemoryEventStore::new();
        let request = Uuid::new_v4();
        store
            .append(request, None, EventType::ToolProposed, json!({"n": 1}))
            .expect("append");
        store
            .append(request, None, EventType::ToolValidated, json!({"n": 2}))
            .expect("append");
        store
            .append(request, None, EventType::ToolExecuted, json!({"n": 3}))
            .expect("append");

        // Tamper with the middle event's payload out of band.
        let mut events = store.events_for_request(request).expect("events");
        events[1].payload = json!({"n": 999});

        let verification = verify_event_sequence(&events);
        assert!(!verification.valid);
        assert_eq!(verification.first_broken_at, Some(1));
    }

    #[test]
    fn test_verify_chain_detects_reordering() {
        let store = InMemoryEventStore::new();
        let request = Uuid::new_v4();
        store
            .append(request, None, EventType::ToolProposed, json!({}))
            .expect("append");
        store
            .append(request, None, EventType::ToolValidated, json!({}))
            .expect("append");

        let mut events = store.events_for_request(request).expect("events");
        events.swap(0, 1);

        let verification = verify_event_sequence(&events);
        assert!(!verification.valid);
        assert_eq!(verification.first_broken_at, Some(0));
    }

    #[test]
    fn test_empty_chain_is_valid() {
        let store = InMemoryEventStore::new();
        let verification = store.verify_chain(Uuid::new_v4()).expect("verify");
        assert!(verification.valid);
    }

    #[test]
    fn test_projection_happy_path() {
        let store = InMemoryEventStore::new();
        let request = Uuid::new_v4();
        store
            .append(request, None, EventType::ToolProposed, json!({}))
            .expect("append");
        store
            .append(request, None, EventType::ToolValidated, json!({}))
            .expect("append");
        store
            .append(request, None, EventType::ToolExecuting, json!({}))
            .expect("append");
        store
            .append(
                request,
                None,
                EventType::ToolExecuted,
                json!({"result": "hello", "duration_ms": 7}),
            )
            .expect("append");
        store
            .append(request, None, EventType::ToolVerified, json!({"status": "passed"}))
            .expect("append");

        let projection = store.project_request(request).expect("project");
        assert_eq!(projection.status, RequestStatus::Verified);
        assert_eq!(projection.handler_ms, Some(7));
        assert_eq!(projection.counts.get("tool:proposed"), Some(&1));
        assert!(projection.outcome.is_some());
    }

    #[test]
    fn test_projection_incident_wins() {
        let store = InMemoryEventStore::new();
        let request = Uuid::new_v4();
        store
            .append(request, None, EventType::ToolVerified, json!({"status": "failed"}))
            .expect("append");
        store
            .append(
                request,
                None,
                EventType::CompensationIncident,
                json!({"reason": "no_compensation"}),
            )
            .expect("append");

        let projection = store.project_request(request).expect("project");
        assert_eq!(projection.status, RequestStatus::Incident);
    }

    #[test]
    fn test_correlation_index() {
        let store = InMemoryEventStore::new();
        let correlation = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        store
            .append(first, Some(correlation), EventType::ToolProposed, json!({}))
            .expect("append");
        store
            .append(second, Some(correlation), EventType::ToolProposed, json!({}))
            .expect("append");

        let grouped = store.events_for_correlation(correlation).expect("events");
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].request_id, first);
        assert_eq!(grouped[1].request_id, second);
    }

    #[test]
    fn test_concurrent_appends_same_request_keep_linkage() {
        use std::sync::Arc;
        let store = Arc::new(InMemoryEventStore::new());
        let request = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for _ in 0..25 {
                    store
                        .append(request, None, EventType::StateTransition, json!({}))
                        .expect("append");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }

        let events = store.events_for_request(request).expect("events");
        assert_eq!(events.len(), 200);
        assert!(verify_event_sequence(&events).valid);
    }
}
