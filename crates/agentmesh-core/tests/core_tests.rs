//! Tests for agentmesh-core: lifecycle table, message envelope, error taxonomy

use agentmesh_core::*;

// ===========================================================================
// Lifecycle
// ===========================================================================

#[test]
fn lifecycle_allows_only_declared_edges() {
    use AgentStatus::*;
    let all = [Uninitialized, Initializing, Idle, Processing, Error, ShuttingDown, Terminated];
    let allowed = [
        (Uninitialized, Initializing),
        (Initializing, Idle),
        (Initializing, Error),
        (Idle, Processing),
        (Processing, Idle),
        (Processing, Error),
        (Error, Idle),
        (Idle, ShuttingDown),
        (Error, ShuttingDown),
        (ShuttingDown, Terminated),
    ];
    for from in all {
        for to in all {
            assert_eq!(
                from.can_transition_to(to),
                allowed.contains(&(from, to)),
                "{} -> {}",
                from,
                to
            );
        }
    }
}

#[test]
fn only_live_agents_are_routable() {
    assert!(AgentStatus::Idle.is_routable());
    assert!(AgentStatus::Processing.is_routable());
    assert!(!AgentStatus::Error.is_routable());
    assert!(!AgentStatus::Terminated.is_routable());
}

// ===========================================================================
// Messages
// ===========================================================================

#[test]
fn envelope_has_the_documented_shape() {
    let msg = Message::request("planner", Recipient::Capability("image.embed".into()), serde_json::json!({ "url": "x" }));
    let wire = serde_json::to_value(&msg).unwrap();
    assert_eq!(wire["sender_id"], "planner");
    assert_eq!(wire["recipient"]["capability"], "image.embed");
    assert_eq!(wire["broadcast"], false);
    assert_eq!(wire["kind"], "request");
    assert!(wire.get("correlation_id").is_none());

    let back: Message = serde_json::from_value(wire).unwrap();
    assert_eq!(back, msg);
}

#[test]
fn replies_correlate_to_the_request() {
    let request = Message::request("planner", Recipient::Agent("a1".into()), serde_json::json!({}));
    let reply = request.reply(&"a1".into(), serde_json::json!({ "ok": true }));
    assert_eq!(reply.kind, MessageKind::Response);
    assert_eq!(reply.correlation_id.as_ref(), Some(&request.id));
    assert_eq!(reply.recipient, Recipient::Agent("planner".into()));
    assert_ne!(reply.id, request.id);

    let failed = request.error_reply(&"a1".into(), "boom");
    assert_eq!(failed.kind, MessageKind::Error);
    assert_eq!(failed.payload["error"], "boom");
}

#[test]
fn broadcast_targets_a_capability() {
    let msg = Message::broadcast("health", "image.embed", serde_json::json!({}));
    assert!(msg.broadcast);
    assert_eq!(msg.kind, MessageKind::Broadcast);
    let direct = msg.addressed_to(&"a2".into());
    assert_eq!(direct.recipient, Recipient::Agent("a2".into()));
    assert_eq!(direct.id, msg.id);
}

// ===========================================================================
// Errors
// ===========================================================================

#[test]
fn dispatch_errors_classify_for_recovery() {
    let cases: Vec<(DispatchError, FailureKind)> = vec![
        (ExecutionError::timeout("step b", 50).into(), FailureKind::Timeout),
        (ExecutionError::ResourceExhaustion("full".into()).into(), FailureKind::ResourceExhaustion),
        (ExecutionError::application("bad").into(), FailureKind::Application),
        (RoutingError::AgentUnavailable("a1".into()).into(), FailureKind::CommunicationFailure),
        (RoutingError::NoEligibleAgent("x".into()).into(), FailureKind::ResourceExhaustion),
    ];
    for (error, kind) in cases {
        assert_eq!(error.failure_kind(), kind, "{}", error);
    }
}

#[test]
fn step_errors_survive_persistence() {
    let err = StepError {
        step: "b".into(),
        attempt: 2,
        error: ExecutionError::timeout("delivery to a1", 100).into(),
    };
    let text = serde_json::to_string(&err).unwrap();
    let back: StepError = serde_json::from_str(&text).unwrap();
    assert_eq!(back, err);
    assert!(err.to_string().starts_with("step b attempt 2"));
}

#[test]
fn validation_report_is_tagged_per_violation() {
    let report = vec![
        ValidationError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        },
        ValidationError::NoEligibleAgent {
            step: "c".into(),
            capability: "paint".into(),
        },
    ];
    let wire = serde_json::to_value(&report).unwrap();
    assert_eq!(wire[0]["violation"], "cycle");
    assert_eq!(wire[1]["violation"], "no_eligible_agent");
    assert!(report[0].to_string().contains("a -> b -> a"));

    let umbrella: Error = Error::Validation(report);
    assert!(umbrella.to_string().contains("2"));
}
