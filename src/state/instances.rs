// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Element instances, tokens, event triggers and parallel joins.
//!
//! # Invariants
//! - An instance with a flow scope is listed as a child of that scope.
//! - `active_tokens` of a scope counts its live children, activations that
//!   are written but not yet processed, and flows waiting at a join.

use serde::{Deserialize, Serialize};

use super::journal::{TxMap, TxSet};
use crate::bpmn::{ElementIndex, FlowIndex};
use crate::expr::Document;
use crate::record::{ProcessInstanceIntent, ProcessInstanceRecord, NO_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Activating,
    Activated,
    Completing,
    Completed,
    Terminating,
    Terminated,
}

impl LifecycleState {
    /// Re-entering the current state is allowed for the three states an
    /// incident can hold an element in; resolving the incident re-drives it.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Activating, Activating)
                | (Activating, Activated)
                | (Activating, Terminating)
                | (Activated, Activated)
                | (Activated, Completing)
                | (Activated, Terminating)
                | (Completing, Completing)
                | (Completing, Completed)
                | (Completing, Terminating)
                | (Terminating, Terminated)
        )
    }

    pub fn is_final(self) -> bool {
        matches!(self, LifecycleState::Completed | LifecycleState::Terminated)
    }

    pub fn from_intent(intent: ProcessInstanceIntent) -> Option<Self> {
        match intent {
            ProcessInstanceIntent::ElementActivating => Some(LifecycleState::Activating),
            ProcessInstanceIntent::ElementActivated => Some(LifecycleState::Activated),
            ProcessInstanceIntent::ElementCompleting => Some(LifecycleState::Completing),
            ProcessInstanceIntent::ElementCompleted => Some(LifecycleState::Completed),
            ProcessInstanceIntent::ElementTerminating => Some(LifecycleState::Terminating),
            ProcessInstanceIntent::ElementTerminated => Some(LifecycleState::Terminated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementInstance {
    pub key: i64,
    pub element: ElementIndex,
    pub state: LifecycleState,
    pub record: ProcessInstanceRecord,
    pub active_tokens: u32,
    pub job_key: i64,
    /// Boundary event to activate once this instance is terminated.
    pub interrupting_event: Option<ElementIndex>,
    /// Flows chosen by a gateway, taken on completion.
    pub taken_flows: Vec<FlowIndex>,
}

impl ElementInstance {
    pub fn new(key: i64, element: ElementIndex, record: ProcessInstanceRecord) -> Self {
        Self {
            key,
            element,
            state: LifecycleState::Activating,
            record,
            active_tokens: 0,
            job_key: NO_KEY,
            interrupting_event: None,
            taken_flows: Vec::new(),
        }
    }

    pub fn flow_scope_key(&self) -> Option<i64> {
        (self.record.flow_scope_key != NO_KEY).then_some(self.record.flow_scope_key)
    }

    pub fn process_instance_key(&self) -> i64 {
        self.record.process_instance_key
    }
}

/// An event that fired for an element instance and waits to be applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTrigger {
    /// The element whose event fired: the instance's own element, a target
    /// of an event-based gateway, or an attached boundary event.
    pub element: ElementIndex,
    pub variables: Document,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementInstanceState {
    instances: TxMap<i64, ElementInstance>,
    children: TxSet<(i64, i64)>,
    triggers: TxMap<i64, EventTrigger>,
    /// (scope, gateway, incoming flow) -> tokens waiting on that flow
    joins: TxMap<(i64, u32, u32), u32>,
}

impl ElementInstanceState {
    pub fn get(&self, key: i64) -> Option<&ElementInstance> {
        self.instances.get(&key)
    }

    pub fn get_mut(&mut self, key: i64) -> Option<&mut ElementInstance> {
        self.instances.get_mut(&key)
    }

    pub fn contains(&self, key: i64) -> bool {
        self.instances.contains_key(&key)
    }

    pub fn insert(&mut self, instance: ElementInstance) {
        if let Some(scope) = instance.flow_scope_key() {
            self.children.add((scope, instance.key));
        }
        self.instances.insert(instance.key, instance);
    }

    /// Removes the instance with its trigger and join bookkeeping.
    pub fn remove(&mut self, key: i64) -> Option<ElementInstance> {
        let instance = self.instances.remove(&key)?;
        if let Some(scope) = instance.flow_scope_key() {
            self.children.remove(&(scope, key));
        }
        self.triggers.remove(&key);
        self.clear_joins(key);
        Some(instance)
    }

    pub fn set_state(&mut self, key: i64, state: LifecycleState) {
        if let Some(instance) = self.instances.get_mut(&key) {
            instance.state = state;
        }
    }

    pub fn children(&self, scope: i64) -> Vec<i64> {
        self.children
            .range((scope, i64::MIN)..=(scope, i64::MAX))
            .map(|((_, child), _)| *child)
            .collect()
    }

    pub fn spawn_tokens(&mut self, scope: i64, count: u32) {
        if let Some(instance) = self.instances.get_mut(&scope) {
            instance.active_tokens += count;
        }
    }

    /// Returns the remaining token count of the scope.
    pub fn consume_tokens(&mut self, scope: i64, count: u32) -> Option<u32> {
        let instance = self.instances.get_mut(&scope)?;
        instance.active_tokens = instance.active_tokens.saturating_sub(count);
        Some(instance.active_tokens)
    }

    pub fn set_trigger(&mut self, key: i64, trigger: EventTrigger) {
        self.triggers.insert(key, trigger);
    }

    pub fn trigger(&self, key: i64) -> Option<&EventTrigger> {
        self.triggers.get(&key)
    }

    pub fn take_trigger(&mut self, key: i64) -> Option<EventTrigger> {
        self.triggers.remove(&key)
    }

    /// Records a token arriving at a joining gateway over `flow`. Returns
    /// true once every incoming flow holds a token; those tokens are then
    /// taken off the join.
    pub fn arrive_at_join(&mut self, scope: i64, gateway: ElementIndex, flow: FlowIndex, incoming: &[FlowIndex]) -> bool {
        self.wait_at_join(scope, gateway, flow);
        let complete = self.join_is_full(scope, gateway, incoming);
        if complete {
            self.take_join_tokens(scope, gateway, incoming);
        }
        complete
    }

    /// Parks a token at a joining gateway without checking the join.
    pub fn wait_at_join(&mut self, scope: i64, gateway: ElementIndex, flow: FlowIndex) {
        let slot = (scope, gateway.0, flow.0);
        let count = self.joins.get(&slot).copied().unwrap_or(0);
        self.joins.insert(slot, count + 1);
    }

    pub fn join_is_full(&self, scope: i64, gateway: ElementIndex, incoming: &[FlowIndex]) -> bool {
        incoming
            .iter()
            .all(|f| self.joins.get(&(scope, gateway.0, f.0)).is_some_and(|c| *c > 0))
    }

    /// Takes one token off every incoming flow that holds one; returns how
    /// many were taken.
    pub fn take_join_tokens(&mut self, scope: i64, gateway: ElementIndex, incoming: &[FlowIndex]) -> u32 {
        let mut taken = 0;
        for f in incoming {
            let slot = (scope, gateway.0, f.0);
            match self.joins.get(&slot).copied() {
                Some(c) if c > 1 => {
                    self.joins.insert(slot, c - 1);
                }
                Some(_) => {
                    self.joins.remove(&slot);
                }
                None => continue,
            }
            taken += 1;
        }
        taken
    }

    /// Gateways of `scope` with tokens waiting, and how many wait at each.
    pub fn waiting_joins(&self, scope: i64) -> Vec<(ElementIndex, u32)> {
        let mut waiting: Vec<(ElementIndex, u32)> = Vec::new();
        for ((_, gateway, _), count) in self.joins.range((scope, 0, 0)..=(scope, u32::MAX, u32::MAX)) {
            match waiting.last_mut() {
                Some((last, total)) if last.0 == *gateway => *total += count,
                _ => waiting.push((ElementIndex(*gateway), *count)),
            }
        }
        waiting
    }

    /// Drops every token waiting at joins of `scope`; returns how many.
    pub fn clear_joins(&mut self, scope: i64) -> u32 {
        let slots: Vec<((i64, u32, u32), u32)> = self
            .joins
            .range((scope, 0, 0)..=(scope, u32::MAX, u32::MAX))
            .map(|(k, v)| (*k, *v))
            .collect();
        let mut tokens = 0;
        for (slot, count) in slots {
            self.joins.remove(&slot);
            tokens += count;
        }
        tokens
    }

    pub fn iter(&self) -> impl Iterator<Item = &ElementInstance> {
        self.instances.values()
    }

    /// Root instances, i.e. process instances.
    pub fn process_instances(&self) -> impl Iterator<Item = &ElementInstance> {
        self.instances.values().filter(|i| i.flow_scope_key().is_none())
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn commit(&mut self) {
        self.instances.commit();
        self.children.commit();
        self.triggers.commit();
        self.joins.commit();
    }

    pub fn rollback(&mut self) {
        self.instances.rollback();
        self.children.rollback();
        self.triggers.rollback();
        self.joins.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::BpmnElementType;

    fn record(flow_scope_key: i64) -> ProcessInstanceRecord {
        ProcessInstanceRecord {
            bpmn_process_id: "p".into(),
            version: 1,
            process_definition_key: 1,
            process_instance_key: 10,
            element_id: "e".into(),
            flow_scope_key,
            bpmn_element_type: BpmnElementType::ServiceTask,
        }
    }

    #[test]
    fn test_transitions() {
        use LifecycleState::*;
        assert!(Activating.can_transition_to(Activated));
        assert!(Activated.can_transition_to(Terminating));
        assert!(Completing.can_transition_to(Completing));
        assert!(!Activating.can_transition_to(Completed));
        assert!(!Terminating.can_transition_to(Completing));
        assert!(!Completed.can_transition_to(Terminating));
        assert!(!Terminated.can_transition_to(Terminated));
    }

    #[test]
    fn test_children_and_tokens() {
        let mut state = ElementInstanceState::default();
        state.insert(ElementInstance::new(10, ElementIndex(0), record(NO_KEY)));
        state.insert(ElementInstance::new(11, ElementIndex(1), record(10)));
        state.insert(ElementInstance::new(12, ElementIndex(2), record(10)));
        assert_eq!(state.children(10), vec![11, 12]);

        state.spawn_tokens(10, 2);
        assert_eq!(state.consume_tokens(10, 1), Some(1));
        state.remove(11);
        assert_eq!(state.children(10), vec![12]);
        assert_eq!(state.consume_tokens(99, 1), None);
    }

    #[test]
    fn test_join_waits_for_every_incoming_flow() {
        let mut state = ElementInstanceState::default();
        let incoming = [FlowIndex(1), FlowIndex(2)];
        let gateway = ElementIndex(5);

        assert!(!state.arrive_at_join(10, gateway, FlowIndex(1), &incoming));
        // a second token on the same flow does not complete the join
        assert!(!state.arrive_at_join(10, gateway, FlowIndex(1), &incoming));
        assert!(state.arrive_at_join(10, gateway, FlowIndex(2), &incoming));
        // one token is left on flow 1
        assert_eq!(state.clear_joins(10), 1);
    }

    #[test]
    fn test_partial_join_takes_only_waiting_tokens() {
        let mut state = ElementInstanceState::default();
        let incoming = [FlowIndex(1), FlowIndex(2), FlowIndex(3)];
        let gateway = ElementIndex(5);

        state.wait_at_join(10, gateway, FlowIndex(3));
        state.wait_at_join(10, gateway, FlowIndex(3));
        state.wait_at_join(10, ElementIndex(7), FlowIndex(4));
        assert!(!state.join_is_full(10, gateway, &incoming));
        assert_eq!(state.waiting_joins(10), vec![(gateway, 2), (ElementIndex(7), 1)]);

        assert_eq!(state.take_join_tokens(10, gateway, &incoming), 1);
        assert_eq!(state.waiting_joins(10), vec![(gateway, 1), (ElementIndex(7), 1)]);
    }
}
