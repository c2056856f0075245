// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Inclusive joins.
//!
//! A joining inclusive gateway activates once every incoming flow holds a
//! token, or once no other token of its flow scope can still reach it.
//! Parked tokens are checked whenever a token of the scope appears or goes
//! away, i.e. when an element of the scope is activated, completed or
//! terminated.

use rustc_hash::FxHashSet;

use crate::bpmn::{ElementIndex, ElementKind, ExecutableProcess};
use crate::engine::Context;
use crate::state::LifecycleState;

pub(super) fn activate_inclusive_joins(ctx: &mut Context<'_>, process: &ExecutableProcess, scope_key: i64) {
    let Some(scope) = ctx.state.instances.get(scope_key).cloned() else {
        return;
    };
    if scope.state != LifecycleState::Activated {
        return;
    }
    let waiting = ctx.state.instances.waiting_joins(scope_key);
    if !waiting
        .iter()
        .any(|(gateway, _)| matches!(process.element(*gateway).kind, ElementKind::InclusiveGateway { .. }))
    {
        return;
    }

    let children: Vec<ElementIndex> = ctx
        .state
        .instances
        .children(scope_key)
        .into_iter()
        .filter_map(|key| ctx.state.instances.get(key))
        .filter(|child| !child.state.is_final())
        .map(|child| child.element)
        .collect();
    let parked: u32 = waiting.iter().map(|(_, count)| count).sum();
    // activations written but not processed yet have no instance
    let unseen = scope
        .active_tokens
        .saturating_sub(children.len() as u32 + parked);

    for (gateway, _) in &waiting {
        let element = process.element(*gateway);
        if !matches!(element.kind, ElementKind::InclusiveGateway { .. }) {
            continue;
        }
        let full = ctx
            .state
            .instances
            .join_is_full(scope_key, *gateway, &element.incoming);
        if !full {
            if unseen > 0 {
                continue;
            }
            let blocked = children
                .iter()
                .chain(waiting.iter().map(|(other, _)| other).filter(|other| *other != gateway))
                .any(|from| can_reach(process, *from, *gateway));
            if blocked {
                continue;
            }
        }

        let taken = ctx
            .state
            .instances
            .take_join_tokens(scope_key, *gateway, &element.incoming);
        ctx.state.instances.consume_tokens(scope_key, taken);
        ctx.activate_element(scope_key, &scope.record, element);
        tracing::trace!(gateway = %element.id, tokens = taken, "inclusive join activated");
        // the others are checked again when this activation is processed
        return;
    }
}

/// Whether a token at `from` may still arrive at `to`, following outgoing
/// flows and boundary events but not passing through `to`.
fn can_reach(process: &ExecutableProcess, from: ElementIndex, to: ElementIndex) -> bool {
    let mut seen = FxHashSet::default();
    let mut stack = vec![from];
    while let Some(index) = stack.pop() {
        let element = process.element(index);
        let next = process
            .outgoing(index)
            .map(|flow| flow.target)
            .chain(element.boundary_events.iter().copied());
        for target in next {
            if target == to {
                return true;
            }
            if seen.insert(target) {
                stack.push(target);
            }
        }
    }
    false
}
