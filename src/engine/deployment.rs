// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! `Deployment Create`.
//!
//! Every resource is compiled before anything is stored; one invalid
//! resource rejects the whole deployment. Redeploying an unchanged resource
//! keeps the deployed version. Start timers and message start subscriptions
//! always belong to the latest version.

use std::sync::Arc;

use rustc_hash::FxHashSet;
use tracing::info;

use super::{Context, ProcessingError, ProcessingOutcome};
use crate::bpmn::{compile_json, ElementKind, ExecutableProcess};
use crate::expr::Document;
use crate::record::*;
use crate::state::processes::resource_digest;
use crate::state::DeployedProcess;

pub(super) fn create(ctx: &mut Context<'_>) -> ProcessingOutcome {
    let RecordValue::Deployment(deployment) = &ctx.record.value else {
        return Err(ProcessingError::invalid_argument("Expected a deployment record"));
    };
    if deployment.resources.is_empty() {
        return Err(ProcessingError::invalid_argument(
            "Expected to deploy at least one resource, but none given",
        ));
    }

    let mut errors = Vec::new();
    let mut compiled = Vec::with_capacity(deployment.resources.len());
    for resource in &deployment.resources {
        match compile_json(&resource.content) {
            Ok(process) => compiled.push((resource, process)),
            Err(e) => errors.push(format!("'{}': {e}", resource.name)),
        }
    }
    if !errors.is_empty() {
        return Err(ProcessingError::invalid_argument(format!(
            "Expected to deploy new resources, but encountered the following errors:\n{}",
            errors.join("\n")
        )));
    }

    let mut seen = FxHashSet::default();
    for (resource, process) in &compiled {
        if !seen.insert(process.bpmn_process_id.as_str()) {
            return Err(ProcessingError::invalid_argument(format!(
                "Expected process ids to be unique within a deployment, but '{}' in '{}' is duplicated",
                process.bpmn_process_id, resource.name
            )));
        }
    }

    let mut processes = Vec::with_capacity(compiled.len());
    for (resource, process) in compiled {
        let digest = resource_digest(&resource.content);
        let previous = ctx.state.processes.latest_by_id(&process.bpmn_process_id).cloned();

        if let Some(previous) = previous.as_ref().filter(|p| p.digest == digest) {
            processes.push(ProcessMetadata {
                bpmn_process_id: previous.bpmn_process_id.clone(),
                version: previous.version,
                process_definition_key: previous.key,
                resource_name: previous.resource_name.clone(),
            });
            continue;
        }

        let key = ctx.next_key();
        let version = previous.as_ref().map_or(1, |p| p.version + 1);
        let process = Arc::new(process);
        ctx.state.processes.put(
            DeployedProcess {
                key,
                bpmn_process_id: process.bpmn_process_id.clone(),
                version,
                resource_name: resource.name.clone(),
                resource: resource.content.clone(),
                digest,
            },
            Arc::clone(&process),
        );

        if let Some(previous) = &previous {
            cancel_start_timers(ctx, previous.key);
        }
        close_start_subscriptions(ctx, &process.bpmn_process_id);
        create_start_timers(ctx, key, &process);
        open_start_subscriptions(ctx, &process);

        info!(
            bpmn_process_id = %process.bpmn_process_id,
            version,
            key,
            "process deployed"
        );
        processes.push(ProcessMetadata {
            bpmn_process_id: process.bpmn_process_id.clone(),
            version,
            process_definition_key: key,
            resource_name: resource.name.clone(),
        });
    }

    let key = ctx.next_key();
    let created = DeploymentRecord {
        resources: deployment.resources.clone(),
        processes,
    };
    ctx.result.append_event(key, DeploymentIntent::Created, created);
    ctx.result.respond_with_last();
    Ok(())
}

fn cancel_start_timers(ctx: &mut Context<'_>, process_definition_key: i64) {
    for key in ctx.state.timers.of_element(NO_KEY) {
        let owned = ctx
            .state
            .timers
            .get(key)
            .is_some_and(|t| t.process_definition_key == process_definition_key);
        if !owned {
            continue;
        }
        if let Some(timer) = ctx.state.timers.remove(key) {
            ctx.result.append_event(key, TimerIntent::Canceled, timer);
        }
    }
}

fn create_start_timers(ctx: &mut Context<'_>, process_definition_key: i64, process: &ExecutableProcess) {
    for index in &process.timer_start_events {
        let element = process.element(*index);
        let ElementKind::StartEvent {
            timer: Some(duration_ms),
            ..
        } = element.kind
        else {
            continue;
        };
        let key = ctx.next_key();
        let timer = TimerRecord {
            element_instance_key: NO_KEY,
            process_instance_key: NO_KEY,
            process_definition_key,
            target_element_id: element.id.clone(),
            due_date: ctx.now().saturating_add(duration_ms),
        };
        ctx.state.timers.create(key, timer.clone());
        ctx.result.append_event(key, TimerIntent::Created, timer);
    }
}

fn close_start_subscriptions(ctx: &mut Context<'_>, bpmn_process_id: &str) {
    for (key, subscription) in ctx.state.messages.close_start_subscriptions(bpmn_process_id) {
        ctx.result
            .append_event(key, MessageSubscriptionIntent::Closed, subscription);
    }
}

fn open_start_subscriptions(ctx: &mut Context<'_>, process: &ExecutableProcess) {
    for index in &process.message_start_events {
        let element = process.element(*index);
        let ElementKind::StartEvent {
            message: Some(name), ..
        } = &element.kind
        else {
            continue;
        };
        let key = ctx.next_key();
        let subscription = MessageSubscriptionRecord {
            process_instance_key: NO_KEY,
            element_instance_key: NO_KEY,
            bpmn_process_id: process.bpmn_process_id.clone(),
            message_name: name.clone(),
            correlation_key: String::new(),
            target_element_id: element.id.clone(),
            message_key: NO_KEY,
            variables: Document::new(),
        };
        ctx.state
            .messages
            .open_start_subscription(key, subscription.clone());
        ctx.result
            .append_event(key, MessageSubscriptionIntent::Opened, subscription);
    }
}
