// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use serde_json::json;

use super::harness::Harness;
use crate::bpmn::ProcessBuilder;
use crate::record::*;
use ProcessInstanceIntent::*;

fn order() -> ProcessBuilder {
    ProcessBuilder::new("order")
        .start_event("start")
        .receive_task("wait", "paid", "$.orderId")
        .end_event("end")
        .sequence(&["start", "wait", "end"])
}

fn variable_created(h: &Harness, name: &str) -> Option<VariableRecord> {
    h.events(VariableIntent::Created)
        .into_iter()
        .find_map(|r| match &r.value {
            RecordValue::Variable(v) if v.name == name => Some(v.clone()),
            _ => None,
        })
}

#[test]
fn test_message_correlates_to_open_subscription() {
    let mut h = Harness::new();
    h.deploy(order());
    let pi = h.create_instance("order", json!({ "orderId": "o-1" }));
    assert_eq!(h.events(MessageSubscriptionIntent::Opened).len(), 1);

    h.publish("paid", "o-2", 0, json!({}));
    assert!(h.events(MessageSubscriptionIntent::Correlated).is_empty());
    assert!(!h.is_finished(pi));

    let response = h.publish("paid", "o-1", 0, json!({ "amount": 10 }));
    assert_eq!(response.rejection, None);
    assert_eq!(response.intent, Intent::Message(MessageIntent::Published));
    assert_eq!(h.events(MessageSubscriptionIntent::Correlated).len(), 1);
    assert!(h.is_finished(pi));

    let amount = variable_created(&h, "amount").unwrap();
    assert_eq!(amount.value, "10");
    assert_eq!(amount.scope_key, pi);
    assert_eq!(h.state.messages().subscription_count(), 0);
    assert_eq!(h.state.messages().buffered_count(), 0);
}

#[test]
fn test_numeric_correlation_key() {
    let mut h = Harness::new();
    h.deploy(order());
    let pi = h.create_instance("order", json!({ "orderId": 42 }));
    h.publish("paid", "42", 0, json!({}));
    assert!(h.is_finished(pi));
}

#[test]
fn test_buffered_message_correlates_on_subscribe() {
    let mut h = Harness::new();
    h.deploy(order());
    h.publish("paid", "o-1", 10_000, json!({ "paidAt": 5 }));
    assert_eq!(h.state.messages().buffered_count(), 1);

    let first = h.create_instance("order", json!({ "orderId": "o-1" }));
    let second = h.create_instance("order", json!({ "orderId": "o-1" }));
    assert!(h.is_finished(first));
    assert!(h.is_finished(second));
    // once per process instance
    assert_eq!(h.events(MessageSubscriptionIntent::Correlated).len(), 2);
}

#[test]
fn test_expired_message_is_not_correlated() {
    let mut h = Harness::new();
    h.deploy(order());
    h.publish("paid", "o-1", 100, json!({}));
    h.advance(200);

    let pi = h.create_instance("order", json!({ "orderId": "o-1" }));
    assert!(!h.is_finished(pi));
    assert!(h.events(MessageSubscriptionIntent::Correlated).is_empty());

    // publishing purges what expired
    h.publish("other", "x", 0, json!({}));
    assert_eq!(h.state.messages().buffered_count(), 0);
}

#[test]
fn test_duplicate_message_id_is_rejected() {
    let mut h = Harness::new();
    let response = h.publish_with_id("paid", "o-1", 1_000, "m-1", json!({}));
    assert_eq!(response.rejection, None);

    let response = h.publish_with_id("paid", "o-1", 1_000, "m-1", json!({}));
    let (rejection_type, reason) = response.rejection.unwrap();
    assert_eq!(rejection_type, RejectionType::AlreadyExists);
    assert!(reason.contains("m-1"));
    assert_eq!(h.state.messages().buffered_count(), 1);

    let response = h.publish_with_id("paid", "o-2", 1_000, "m-1", json!({}));
    assert_eq!(response.rejection, None);
}

#[test]
fn test_missing_correlation_key_raises_incident() {
    let mut h = Harness::new();
    h.deploy(order());
    let pi = h.create_instance("order", json!({}));

    let incidents = h.incidents();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].record.error_type, ErrorType::ExtractValueError);
    assert!(incidents[0]
        .record
        .error_message
        .starts_with("Failed to extract the correlation key"));
    assert_eq!(h.state.messages().subscription_count(), 0);

    h.update_variables(pi, UpdateSemantics::Propagate, json!({ "orderId": "o-9" }));
    h.resolve_incident(incidents[0].key);
    assert_eq!(h.state.messages().subscription_count(), 1);

    h.publish("paid", "o-9", 0, json!({}));
    assert!(h.is_finished(pi));
}

fn sla(cancel_activity: bool) -> ProcessBuilder {
    ProcessBuilder::new("sla")
        .start_event("start")
        .service_task("work", "work")
        .timer_boundary_event("timeout", "work", "PT10S", cancel_activity)
        .end_event("done")
        .end_event("escalated")
        .sequence(&["start", "work", "done"])
        .flow("timeout", "escalated")
}

#[test]
fn test_interrupting_timer_boundary_event() {
    let mut h = Harness::new();
    h.deploy(sla(true));
    let pi = h.create_instance("sla", json!({}));
    assert_eq!(h.state.timers().len(), 1);

    h.advance(9_999);
    assert_eq!(h.fire_due_timers(), 0);
    h.advance(1);
    assert_eq!(h.fire_due_timers(), 1);

    assert!(h.has("work", ElementTerminated));
    assert_eq!(h.events(JobIntent::Canceled).len(), 1);
    assert_eq!(
        h.lifecycle("timeout"),
        vec![ElementActivating, ElementActivated, ElementCompleting, ElementCompleted]
    );
    assert!(h.has("escalated", ElementCompleted));
    assert!(!h.has("done", ElementActivating));
    assert!(h.is_finished(pi));
    assert!(h.state.jobs().is_empty());
}

#[test]
fn test_completing_task_cancels_boundary_timer() {
    let mut h = Harness::new();
    h.deploy(sla(true));
    let pi = h.create_instance("sla", json!({}));

    let job = h.job_key("work");
    h.complete_job(job, json!({}));
    assert_eq!(h.events(TimerIntent::Canceled).len(), 1);
    assert!(h.state.timers().is_empty());
    assert!(h.has("done", ElementCompleted));
    assert!(h.is_finished(pi));
}

#[test]
fn test_non_interrupting_timer_boundary_event() {
    let mut h = Harness::new();
    h.deploy(sla(false));
    let pi = h.create_instance("sla", json!({}));

    h.advance(10_000);
    assert_eq!(h.fire_due_timers(), 1);
    assert!(h.has("escalated", ElementCompleted));
    assert!(!h.has("work", ElementTerminating));
    assert!(!h.is_finished(pi));

    let job = h.job_key("work");
    h.complete_job(job, json!({}));
    assert!(h.has("done", ElementCompleted));
    assert!(h.is_finished(pi));
}

#[test]
fn test_interrupting_message_boundary_passes_variables() {
    let mut h = Harness::new();
    h.deploy(
        ProcessBuilder::new("shipment")
            .start_event("start")
            .service_task("ship", "ship")
            .message_boundary_event("cancelled", "ship", "cancel", "$.orderId", true)
            .end_event("shipped")
            .end_event("aborted")
            .sequence(&["start", "ship", "shipped"])
            .flow("cancelled", "aborted"),
    );
    let pi = h.create_instance("shipment", json!({ "orderId": "o-1" }));

    h.publish("cancel", "o-1", 0, json!({ "reason": "customer" }));
    assert!(h.has("ship", ElementTerminated));
    assert!(h.has("aborted", ElementCompleted));
    assert_eq!(variable_created(&h, "reason").unwrap().value, "\"customer\"");
    assert!(h.is_finished(pi));
}

fn race() -> ProcessBuilder {
    ProcessBuilder::new("race")
        .start_event("start")
        .event_based_gateway("gw")
        .message_catch_event("answer", "answer", "$.key")
        .timer_catch_event("too_late", "PT1M")
        .end_event("answered")
        .end_event("expired")
        .sequence(&["start", "gw"])
        .sequence(&["gw", "answer", "answered"])
        .sequence(&["gw", "too_late", "expired"])
}

#[test]
fn test_event_based_gateway_message_wins() {
    let mut h = Harness::new();
    h.deploy(race());
    let pi = h.create_instance("race", json!({ "key": "k" }));
    assert_eq!(h.state.timers().len(), 1);
    assert_eq!(h.state.messages().subscription_count(), 1);

    h.publish("answer", "k", 0, json!({ "reply": "yes" }));
    assert_eq!(h.events(TimerIntent::Canceled).len(), 1);
    assert!(h.has("answer", ElementCompleted));
    assert!(!h.has("too_late", ElementActivating));
    assert!(h.has("answered", ElementCompleted));
    assert!(variable_created(&h, "reply").is_some());
    assert!(h.is_finished(pi));
}

#[test]
fn test_event_based_gateway_timer_wins() {
    let mut h = Harness::new();
    h.deploy(race());
    let pi = h.create_instance("race", json!({ "key": "k" }));

    h.advance(60_000);
    assert_eq!(h.fire_due_timers(), 1);
    assert_eq!(h.events(MessageSubscriptionIntent::Closed).len(), 1);
    assert!(h.has("too_late", ElementCompleted));
    assert!(!h.has("answer", ElementActivating));
    assert!(h.is_finished(pi));

    // nobody is listening any more
    h.publish("answer", "k", 0, json!({}));
    assert!(h.events(MessageSubscriptionIntent::Correlated).is_empty());
}

#[test]
fn test_intermediate_timer_catch_event() {
    let mut h = Harness::new();
    h.deploy(
        ProcessBuilder::new("delay")
            .start_event("start")
            .timer_catch_event("wait", "PT30S")
            .end_event("end")
            .sequence(&["start", "wait", "end"]),
    );
    let pi = h.create_instance("delay", json!({}));
    let timer = h.state.timers().iter().next().map(|(_, t)| t.clone()).unwrap();
    assert_eq!(timer.due_date, h.clock + 30_000);

    h.advance(30_000);
    h.fire_due_timers();
    assert!(h.is_finished(pi));
}

fn ticker(duration: &str) -> ProcessBuilder {
    ProcessBuilder::new("ticker")
        .timer_start_event("tick", duration)
        .end_event("end")
        .flow("tick", "end")
}

#[test]
fn test_timer_start_event_creates_instance() {
    let mut h = Harness::new();
    h.deploy(ticker("PT1M"));
    assert_eq!(h.state.timers().len(), 1);

    let response = h.try_create_instance("ticker", json!({}));
    assert_eq!(response.rejection.unwrap().0, RejectionType::InvalidState);

    h.advance(60_000);
    assert_eq!(h.fire_due_timers(), 1);
    assert_eq!(h.events(ProcessInstanceCreationIntent::Created).len(), 1);
    assert!(h.has("tick", ElementCompleted));
    assert!(h.has("end", ElementCompleted));
    assert!(h.state.element_instances().is_empty());
}

#[test]
fn test_redeployment_replaces_start_timers() {
    let mut h = Harness::new();
    let first = h.deploy(ticker("PT1M"));
    let again = h.deploy(ticker("PT1M"));
    assert_eq!(first, again);
    assert!(h.events(TimerIntent::Canceled).is_empty());

    let second = h.deploy(ticker("PT2M"));
    assert_ne!(first, second);
    assert_eq!(h.state.processes().latest_by_id("ticker").unwrap().version, 2);
    assert_eq!(h.events(TimerIntent::Canceled).len(), 1);
    assert_eq!(h.state.timers().len(), 1);
    let (_, timer) = h.state.timers().iter().next().unwrap();
    assert_eq!(timer.process_definition_key, second);
}

fn signup() -> ProcessBuilder {
    ProcessBuilder::new("signup")
        .message_start_event("registered", "user-registered")
        .service_task("welcome", "send-mail")
        .end_event("end")
        .sequence(&["registered", "welcome", "end"])
}

fn started_definitions(h: &Harness) -> Vec<i64> {
    h.events(ProcessInstanceCreationIntent::Created)
        .into_iter()
        .filter_map(|r| match &r.value {
            RecordValue::ProcessInstanceCreation(v) => Some(v.process_definition_key),
            _ => None,
        })
        .collect()
}

#[test]
fn test_message_start_event_creates_instance() {
    let mut h = Harness::new();
    let definition = h.deploy(signup());
    assert_eq!(h.events(MessageSubscriptionIntent::Opened).len(), 1);

    let response = h.try_create_instance("signup", json!({}));
    assert_eq!(response.rejection.unwrap().0, RejectionType::InvalidState);

    let response = h.publish("user-registered", "u-1", 0, json!({ "email": "ada@example.com" }));
    assert_eq!(response.rejection, None);
    assert_eq!(response.intent, Intent::Message(MessageIntent::Published));
    assert_eq!(started_definitions(&h), vec![definition]);
    assert!(h.has("registered", ElementCompleted));

    let job = h.job_key("welcome");
    let pi = h.state.job(job).unwrap().record.process_instance_key;
    assert_eq!(h.state.variables(pi).get("email"), Some(&json!("ada@example.com")));
    let correlated = h.events(MessageSubscriptionIntent::Correlated);
    assert_eq!(correlated.len(), 1);
    assert!(matches!(
        &correlated[0].value,
        RecordValue::MessageSubscription(s) if s.process_instance_key == pi
    ));

    // every message starts another instance
    h.publish("user-registered", "u-1", 0, json!({}));
    h.publish("user-deleted", "u-1", 0, json!({}));
    assert_eq!(started_definitions(&h).len(), 2);
    assert_eq!(h.state.messages().subscription_count(), 1);

    h.complete_job(job, json!({}));
    assert!(h.is_finished(pi));
}

#[test]
fn test_buffered_message_does_not_reenter_started_instance() {
    let mut h = Harness::new();
    h.deploy(
        ProcessBuilder::new("signup")
            .message_start_event("registered", "user-registered")
            .message_catch_event("confirm", "user-registered", "$.user")
            .end_event("end")
            .sequence(&["registered", "confirm", "end"]),
    );

    h.publish("user-registered", "u-1", 60_000, json!({ "user": "u-1" }));
    assert_eq!(started_definitions(&h).len(), 1);
    // the catch event waits for a second message
    assert!(h.has("confirm", ElementActivated));
    assert!(!h.has("confirm", ElementCompleted));
    assert_eq!(h.events(MessageSubscriptionIntent::Correlated).len(), 1);
}

#[test]
fn test_redeployment_moves_message_start_subscription() {
    let mut h = Harness::new();
    h.deploy(signup());
    let second = h.deploy(signup().name("signup v2"));
    assert_eq!(h.events(MessageSubscriptionIntent::Closed).len(), 1);
    assert_eq!(h.state.messages().subscription_count(), 1);

    h.publish("user-registered", "u-1", 0, json!({}));
    assert_eq!(started_definitions(&h), vec![second]);

    // a version without the message start event stops listening
    h.deploy(
        ProcessBuilder::new("signup")
            .start_event("start")
            .end_event("end")
            .flow("start", "end"),
    );
    assert_eq!(h.events(MessageSubscriptionIntent::Closed).len(), 2);
    h.publish("user-registered", "u-2", 0, json!({}));
    assert_eq!(started_definitions(&h).len(), 1);
}
