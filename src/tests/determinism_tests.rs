// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use serde_json::json;

use super::harness::Harness;
use crate::bpmn::ProcessBuilder;
use crate::engine::{Engine, ProcessingResult};
use crate::record::*;
use crate::state::EngineState;

fn workflow() -> ProcessBuilder {
    ProcessBuilder::new("claims")
        .start_event("start")
        .parallel_gateway("fork")
        .service_task("assess", "assess")
        .receive_task("documents", "documents", "$.claimId")
        .parallel_gateway("join")
        .exclusive_gateway("decide", Some("reject"))
        .service_task("pay", "pay")
        .timer_boundary_event("slow", "pay", "PT1H", true)
        .end_event("paid")
        .end_event("rejected")
        .end_event("escalated")
        .flow("start", "fork")
        .flow("fork", "assess")
        .flow("fork", "documents")
        .flow("assess", "join")
        .flow("documents", "join")
        .flow("join", "decide")
        .conditional_flow("approve", "decide", "pay", "$.score > 50")
        .named_flow("reject", "decide", "rejected")
        .flow("pay", "paid")
        .flow("slow", "escalated")
}

/// Drives a few instances down different paths.
fn run_scenario() -> Harness {
    let mut h = Harness::new();
    h.deploy(workflow());

    for (claim, score) in [("c-1", 80), ("c-2", 10), ("c-3", 90)] {
        h.create_instance("claims", json!({ "claimId": claim }));
        let assess = h
            .state
            .jobs()
            .iter()
            .find(|j| j.record.element_id == "assess")
            .map(|j| j.key)
            .unwrap();
        h.complete_job(assess, json!({ "score": score }));
        h.advance(10);
        h.publish("documents", claim, 0, json!({ "pages": 3 }));
    }

    let pay = h.job_key("pay");
    h.complete_job(pay, json!({ "paid": true }));
    h.advance(3_600_000);
    h.fire_due_timers();
    h
}

#[test]
fn test_scenario_outcome() {
    let h = run_scenario();
    assert_eq!(h.element_events("paid", ProcessInstanceIntent::ElementCompleted).len(), 1);
    assert_eq!(h.element_events("rejected", ProcessInstanceIntent::ElementCompleted).len(), 1);
    assert_eq!(h.element_events("escalated", ProcessInstanceIntent::ElementCompleted).len(), 1);
    assert!(h.state.element_instances().is_empty());
    assert!(h.state.jobs().is_empty());
}

#[test]
fn test_same_log_same_state() {
    let a = run_scenario();
    let b = run_scenario();
    assert_eq!(a.log.len(), b.log.len());
    assert_eq!(a.state.hash_hex().unwrap(), b.state.hash_hex().unwrap());
}

#[test]
fn test_replay_reproduces_follow_ups_and_state() {
    let h = run_scenario();
    let engine = Engine::new();
    let mut state = EngineState::new(1);

    for entry in h.log.iter().filter(|l| !l.skip) {
        let mut result = ProcessingResult::new();
        engine.process(&mut state, &entry.record, &mut result).unwrap();

        let produced: Vec<(ValueType, Intent, i64)> = result
            .records()
            .iter()
            .map(|f| (f.value.value_type(), f.intent(), f.key))
            .collect();
        let written: Vec<(ValueType, Intent, i64)> = h
            .log
            .iter()
            .filter(|l| l.record.source_position == entry.record.position)
            .map(|l| (l.record.value_type(), l.record.intent(), l.record.key))
            .collect();
        assert_eq!(produced, written, "follow-ups of position {}", entry.record.position);
    }

    assert_eq!(state.hash().unwrap(), h.state.hash().unwrap());
}

#[test]
fn test_snapshot_round_trip_mid_flight() {
    let mut h = Harness::new();
    h.deploy(workflow());
    let pi = h.create_instance("claims", json!({ "claimId": "c-9" }));
    h.publish("documents", "c-9", 0, json!({}));

    let bytes = h.state.encode().unwrap();
    let restored = EngineState::decode(&bytes).unwrap();
    assert_eq!(restored, h.state);
    assert_eq!(restored.hash().unwrap(), h.state.hash().unwrap());
    assert_eq!(restored.summary(), h.state.summary());

    // processing continues on the restored state
    h.state = restored;
    let assess = h.job_key("assess");
    h.complete_job(assess, json!({ "score": 99 }));
    assert!(h.has("pay", ProcessInstanceIntent::ElementActivated));
    assert!(!h.is_finished(pi));
}

#[test]
fn test_snapshot_rejects_garbage() {
    let h = run_scenario();
    let mut bytes = h.state.encode().unwrap();
    bytes.push(0);
    assert!(EngineState::decode(&bytes).is_err());
    assert!(EngineState::decode(&[0xff, 0xff, 0xff]).is_err());
}
