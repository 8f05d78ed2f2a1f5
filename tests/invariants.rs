//! Cross-module invariants: chain integrity, gate monotonicity,
//! registration idempotence, and the closed failure taxonomy.

use std::sync::Arc;

use serde_json::json;

use straylight::config::KernelConfig;
use straylight::kernel::contract::{CustomToolSpec, HandlerType, ToolContractBuilder, ToolRegistry};
use straylight::kernel::events::{verify_event_sequence, EventStore, InMemoryEventStore};
use straylight::kernel::pipeline::{sync_handler, HandlerOutput};
use straylight::kernel::safe_mode::SafeModeController;
use straylight::kernel::schema::{FieldKind, FieldSpec, ParamSchema};
use straylight::kernel::trust::TrustScorer;
use straylight::kernel::Kernel;
use straylight::memory::gate::{GateAction, MemoryGate};
use straylight::memory::MemoryCandidate;
use straylight::types::{CallSource, EventType, ProposedToolCall, RiskClass};
use uuid::Uuid;

/// Schema validation is total: arbitrary shapes classify, never panic.
#[test]
fn validation_is_total() {
    let schema = ParamSchema::new()
        .field("path", FieldSpec::required(FieldKind::String))
        .field("limit", FieldSpec::optional(FieldKind::Integer).in_range(Some(0.0), Some(10.0)));

    let inputs = [
        json!(null),
        json!(42),
        json!("string"),
        json!([1, 2, 3]),
        json!({}),
        json!({"path": null}),
        json!({"path": {"nested": true}}),
        json!({"path": "ok", "limit": "not a number"}),
        json!({"path": "ok", "limit": 99}),
        json!({"path": "ok", "unknown": 1, "another": 2}),
    ];
    for input in &inputs {
        let report = schema.validate(input);
        assert_eq!(
            report.valid,
            report.errors.is_empty(),
            "valid flag must match error list for {input}"
        );
    }
}

/// Any single-byte payload mutation falsifies the chain at that record.
#[test]
fn chain_verification_catches_every_position() {
    let store = InMemoryEventStore::new();
    let request = Uuid::new_v4();
    for i in 0..5 {
        store
            .append(request, None, EventType::StateTransition, json!({"i": i}))
            .expect("append");
    }

    let pristine = store.events_for_request(request).expect("events");
    assert!(verify_event_sequence(&pristine).valid);

    for position in 0..pristine.len() {
        let mut tampered = pristine.clone();
        tampered[position].payload = json!({"i": "tampered"});
        let verification = verify_event_sequence(&tampered);
        assert!(!verification.valid);
        assert_eq!(verification.first_broken_at, Some(position));
    }
}

/// Double registration of the same (name, version) is rejected; a new
/// version of the same name is not.
#[test]
fn contract_registration_idempotence() {
    let registry = ToolRegistry::new();
    let build = || {
        ToolContractBuilder::new("TOOL", RiskClass::ReadOnly)
            .version("1.0.0")
            .build()
    };
    registry.register(build()).expect("first registration");
    assert!(registry.register(build()).is_err(), "duplicate must be rejected");
    registry
        .register(
            ToolContractBuilder::new("TOOL", RiskClass::ReadOnly)
                .version("1.0.1")
                .build(),
        )
        .expect("new version accepted");
}

/// Memory gate action is monotone in trust for fixed thresholds.
#[test]
fn memory_gate_monotone_in_trust() {
    let events = Arc::new(InMemoryEventStore::new());
    let trust = Arc::new(TrustScorer::with_defaults());
    let gate = MemoryGate::new(
        straylight::config::MemoryGateConfig::default(),
        trust.clone(),
        events as Arc<dyn EventStore>,
    );

    // Sources ordered by baseline trust: system 0.9, llm 0.5, external 0.3.
    let rank = |action: GateAction| match action {
        GateAction::Reject => 0,
        GateAction::Quarantine => 1,
        GateAction::Allow => 2,
    };
    let content = "The migration finished";
    let high = gate.write(MemoryCandidate::new(content, CallSource::System));
    let mid = gate.write(MemoryCandidate::new(content, CallSource::Llm));
    let low = gate.write(MemoryCandidate::new(content, CallSource::External));

    assert!(high.trust_score >= mid.trust_score && mid.trust_score >= low.trust_score);
    assert!(rank(high.action) >= rank(mid.action));
    assert!(rank(mid.action) >= rank(low.action));
}

/// Safe-mode exit requests are idempotent while safe mode is inactive.
#[test]
fn safe_mode_exit_idempotent_when_inactive() {
    let controller = SafeModeController::with_defaults();
    let first = controller.request_exit(&CallSource::User, 0.95);
    let second = controller.request_exit(&CallSource::User, 0.95);
    assert_eq!(first, second);
    assert!(!controller.is_active());
}

/// Every pipeline run produces exactly one outcome: success, or one
/// error kind from the closed set.
#[tokio::test]
async fn pipeline_outcome_is_exclusive() {
    let (kernel, _report) = Kernel::init(KernelConfig::default());
    kernel
        .register_tool_contract(
            ToolContractBuilder::new("READ_FILE", RiskClass::ReadOnly)
                .params(ParamSchema::new().field("path", FieldSpec::required(FieldKind::String)))
                .build(),
        )
        .expect("register");

    let runs = [
        (json!({"path": "a"}), true),
        (json!({}), false),
        (json!({"path": 1}), false),
    ];
    for (params, expect_success) in runs {
        let call = ProposedToolCall::new("READ_FILE", params, CallSource::System);
        let handler = sync_handler(|_| {
            Ok(HandlerOutput {
                result: json!("data"),
                duration_ms: 1,
            })
        });
        let result = kernel.propose_tool(call, handler).await;
        assert_eq!(result.success, expect_success, "{result:?}");
        assert_eq!(
            result.error_kind.is_none(),
            result.success,
            "error kind present iff the run failed: {result:?}"
        );
    }
}

/// Custom tool synthesis derives risk from the handler type.
#[test]
fn custom_tool_risk_derivation() {
    let registry = ToolRegistry::new();
    for (name, handler_type, expected_risk, expects_approval) in [
        ("custom_shell", HandlerType::Shell, RiskClass::Irreversible, true),
        ("custom_http", HandlerType::Http, RiskClass::Reversible, false),
        ("custom_code", HandlerType::Code, RiskClass::Reversible, false),
    ] {
        let spec = CustomToolSpec {
            name: name.to_owned(),
            handler_type,
            parameters: vec![],
        };
        let contract = registry.register_custom(&spec).expect("register");
        assert_eq!(contract.risk_class, expected_risk);
        assert_eq!(contract.approval_required, expects_approval);
    }
}

/// Read-only proposals keep working while safe mode is active, and the
/// chain of every request stays verifiable.
#[tokio::test]
async fn safe_mode_read_only_chain_integrity() {
    let mut config = KernelConfig::default();
    config.pipeline.safe_mode_threshold = 1;
    let (kernel, _report) = Kernel::init(config);

    kernel
        .register_tool_contract(
            ToolContractBuilder::new("READ_FILE", RiskClass::ReadOnly)
                .params(ParamSchema::new().field("path", FieldSpec::required(FieldKind::String)))
                .build(),
        )
        .expect("register read");
    kernel
        .register_tool_contract(
            ToolContractBuilder::new("MUTATE", RiskClass::Reversible).build(),
        )
        .expect("register mutate");
    kernel.register_compensation_sync("MUTATE", |_| Ok(()));

    // One failure trips the threshold-1 safe mode.
    let failing = sync_handler(|_| Err("boom".to_owned()));
    let call = ProposedToolCall::new("MUTATE", json!({}), CallSource::System);
    let failed = kernel.propose_tool(call, failing).await;
    assert!(!failed.success);
    assert_eq!(kernel.state(), straylight::types::KernelState::SafeMode);

    // Read-only still runs; its chain verifies.
    let call = ProposedToolCall::new("READ_FILE", json!({"path": "a"}), CallSource::User);
    let request = call.request_id;
    let handler = sync_handler(|_| {
        Ok(HandlerOutput {
            result: json!("data"),
            duration_ms: 1,
        })
    });
    let result = kernel.propose_tool(call, handler).await;
    assert!(result.success, "{result:?}");
    assert!(kernel.verify_event_chain(request).expect("verify").valid);

    // Mutating tools are refused; exit restores normal service.
    let call = ProposedToolCall::new("MUTATE", json!({}), CallSource::System);
    let refused = kernel
        .propose_tool(
            call,
            sync_handler(|_| {
                Ok(HandlerOutput {
                    result: json!(null),
                    duration_ms: 1,
                })
            }),
        )
        .await;
    assert_eq!(
        refused.error_kind,
        Some(straylight::types::ErrorKind::Unapproved)
    );

    let exit = kernel.exit_safe_mode(&CallSource::User, 0.9);
    assert!(exit.allowed, "{exit:?}");
    assert_eq!(kernel.state(), straylight::types::KernelState::Idle);
}
