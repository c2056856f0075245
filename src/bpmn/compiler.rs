// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Turns a [`ProcessModel`] into an [`ExecutableProcess`].
//!
//! Compilation runs in two passes. The first flattens the nested model and
//! hands out arena indices; the second resolves every id reference to an
//! index and validates the structure.

use rustc_hash::FxHashMap;

use super::duration::parse_duration_ms;
use super::executable::*;
use super::model::*;
use super::DeploymentError;
use crate::expr::{CompiledMapping, Condition, JsonPath, Mapping};

struct Flat<'a> {
    elements: Vec<(&'a ElementModel, ElementIndex)>,
    flows: Vec<(&'a FlowModel, ElementIndex)>,
}

fn flatten<'a>(
    elements: &'a [ElementModel],
    flows: &'a [FlowModel],
    scope: ElementIndex,
    flat: &mut Flat<'a>,
) {
    for element in elements {
        flat.elements.push((element, scope));
        if let ElementKindModel::SubProcess { elements, flows } = &element.kind {
            // +1: index 0 is the process
            let index = ElementIndex(flat.elements.len() as u32);
            flatten(elements, flows, index, flat);
        }
    }
    for flow in flows {
        flat.flows.push((flow, scope));
    }
}

fn mappings(id: &str, mappings: &[Mapping]) -> Result<Vec<CompiledMapping>, DeploymentError> {
    mappings
        .iter()
        .map(|m| {
            CompiledMapping::compile(m).map_err(|e| DeploymentError::InvalidMapping {
                id: id.to_string(),
                reason: e.0,
            })
        })
        .collect()
}

fn timer(id: &str, definition: &TimerDefinition) -> Result<i64, DeploymentError> {
    parse_duration_ms(&definition.duration).map_err(|reason| DeploymentError::InvalidTimer {
        id: id.to_string(),
        reason,
    })
}

fn message(id: &str, definition: &MessageDefinition) -> Result<MessageEvent, DeploymentError> {
    if definition.name.is_empty() {
        return Err(DeploymentError::InvalidEventDefinition {
            id: id.to_string(),
            reason: "message name must not be empty".into(),
        });
    }
    let correlation_key = JsonPath::parse(&definition.correlation_key).map_err(|e| {
        DeploymentError::InvalidEventDefinition {
            id: id.to_string(),
            reason: e.0,
        }
    })?;
    Ok(MessageEvent {
        name: definition.name.clone(),
        correlation_key,
    })
}

fn event(
    id: &str,
    timer_def: &Option<TimerDefinition>,
    message_def: &Option<MessageDefinition>,
) -> Result<EventDefinition, DeploymentError> {
    match (timer_def, message_def) {
        (Some(t), None) => Ok(EventDefinition::Timer {
            duration_ms: timer(id, t)?,
        }),
        (None, Some(m)) => Ok(EventDefinition::Message(message(id, m)?)),
        _ => Err(DeploymentError::InvalidEventDefinition {
            id: id.to_string(),
            reason: "expected exactly one of timer or message".into(),
        }),
    }
}

pub fn compile(model: &ProcessModel) -> Result<ExecutableProcess, DeploymentError> {
    if model.process_id.trim().is_empty() {
        return Err(DeploymentError::EmptyProcessId);
    }

    let mut flat = Flat {
        elements: Vec::new(),
        flows: Vec::new(),
    };
    flatten(&model.elements, &model.flows, ElementIndex::PROCESS, &mut flat);

    // Pass 1: ids
    let mut ids: FxHashMap<String, ElementIndex> = FxHashMap::default();
    ids.insert(model.process_id.clone(), ElementIndex::PROCESS);
    for (i, (element, _)) in flat.elements.iter().enumerate() {
        if ids.insert(element.id.clone(), ElementIndex(i as u32 + 1)).is_some() {
            return Err(DeploymentError::DuplicateId(element.id.clone()));
        }
    }
    let mut flow_ids: FxHashMap<&str, FlowIndex> = FxHashMap::default();
    for (i, (flow, _)) in flat.flows.iter().enumerate() {
        if ids.contains_key(&flow.id) || flow_ids.insert(&flow.id, FlowIndex(i as u32)).is_some() {
            return Err(DeploymentError::DuplicateId(flow.id.clone()));
        }
    }

    // Pass 2: elements, with kinds that reference only other elements
    let mut elements = Vec::with_capacity(flat.elements.len() + 1);
    elements.push(ExecutableElement {
        id: model.process_id.clone(),
        index: ElementIndex::PROCESS,
        kind: ElementKind::Process,
        flow_scope: None,
        incoming: Vec::new(),
        outgoing: Vec::new(),
        input_mappings: Vec::new(),
        output_mappings: Vec::new(),
        none_start: None,
        boundary_events: Vec::new(),
    });

    for (i, (model_element, scope)) in flat.elements.iter().enumerate() {
        let id = model_element.id.as_str();
        let index = ElementIndex(i as u32 + 1);
        let kind = match &model_element.kind {
            ElementKindModel::StartEvent { timer: t, message: m } => {
                if t.is_some() && m.is_some() {
                    return Err(DeploymentError::InvalidEventDefinition {
                        id: id.to_string(),
                        reason: "expected at most one of timer or message".into(),
                    });
                }
                if m.as_ref().is_some_and(|m| m.name.is_empty()) {
                    return Err(DeploymentError::InvalidEventDefinition {
                        id: id.to_string(),
                        reason: "message name must not be empty".into(),
                    });
                }
                ElementKind::StartEvent {
                    timer: t.as_ref().map(|t| timer(id, t)).transpose()?,
                    message: m.as_ref().map(|m| m.name.clone()),
                }
            }
            ElementKindModel::EndEvent => ElementKind::EndEvent,
            ElementKindModel::ServiceTask { job_type, retries } => {
                if job_type.is_empty() {
                    return Err(DeploymentError::InvalidEventDefinition {
                        id: id.to_string(),
                        reason: "job type must not be empty".into(),
                    });
                }
                ElementKind::ServiceTask {
                    job_type: job_type.clone(),
                    retries: *retries,
                }
            }
            ElementKindModel::ReceiveTask { message: m } => ElementKind::ReceiveTask {
                message: message(id, m)?,
            },
            // resolved once flows exist
            ElementKindModel::ExclusiveGateway { .. } => ElementKind::ExclusiveGateway { default_flow: None },
            ElementKindModel::ParallelGateway => ElementKind::ParallelGateway,
            ElementKindModel::InclusiveGateway { .. } => ElementKind::InclusiveGateway { default_flow: None },
            ElementKindModel::EventBasedGateway => ElementKind::EventBasedGateway,
            ElementKindModel::IntermediateCatchEvent { timer: t, message: m } => {
                ElementKind::IntermediateCatchEvent { event: event(id, t, m)? }
            }
            ElementKindModel::BoundaryEvent {
                attached_to,
                cancel_activity,
                timer: t,
                message: m,
            } => {
                let target = ids.get(attached_to).copied().ok_or_else(|| {
                    DeploymentError::InvalidBoundaryEvent {
                        id: id.to_string(),
                        reason: format!("unknown element '{attached_to}'"),
                    }
                })?;
                ElementKind::BoundaryEvent {
                    attached_to: target,
                    cancel_activity: *cancel_activity,
                    event: event(id, t, m)?,
                }
            }
            ElementKindModel::SubProcess { .. } => ElementKind::SubProcess,
        };

        elements.push(ExecutableElement {
            id: id.to_string(),
            index,
            kind,
            flow_scope: Some(*scope),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            input_mappings: mappings(id, &model_element.input_mappings)?,
            output_mappings: mappings(id, &model_element.output_mappings)?,
            none_start: None,
            boundary_events: Vec::new(),
        });
    }

    // Flows
    let mut flows = Vec::with_capacity(flat.flows.len());
    for (i, (model_flow, scope)) in flat.flows.iter().enumerate() {
        let index = FlowIndex(i as u32);
        let resolve = |id: &str| {
            ids.get(id)
                .copied()
                .filter(|e| *e != ElementIndex::PROCESS)
                .ok_or_else(|| DeploymentError::UnknownElement {
                    flow: model_flow.id.clone(),
                    id: id.to_string(),
                })
        };
        let source = resolve(&model_flow.source)?;
        let target = resolve(&model_flow.target)?;
        for end in [source, target] {
            if elements[end.0 as usize].flow_scope != Some(*scope) {
                return Err(DeploymentError::FlowOutsideScope(model_flow.id.clone()));
            }
        }

        let condition = match &model_flow.condition {
            None => None,
            Some(text) => {
                if !matches!(
                    elements[source.0 as usize].kind,
                    ElementKind::ExclusiveGateway { .. } | ElementKind::InclusiveGateway { .. }
                ) {
                    return Err(DeploymentError::InvalidCondition(format!(
                        "flow '{}' has a condition but does not leave an exclusive or inclusive gateway",
                        model_flow.id
                    )));
                }
                Some(Condition::parse(text).map_err(|e| DeploymentError::InvalidCondition(e.to_string()))?)
            }
        };

        elements[source.0 as usize].outgoing.push(index);
        elements[target.0 as usize].incoming.push(index);
        flows.push(ExecutableFlow {
            id: model_flow.id.clone(),
            index,
            source,
            target,
            condition,
        });
    }

    // References that need flows, plus structural checks
    for (i, (model_element, _)) in flat.elements.iter().enumerate() {
        let index = ElementIndex(i as u32 + 1);
        let id = &model_element.id;
        match &model_element.kind {
            ElementKindModel::ExclusiveGateway {
                default_flow: Some(flow_id),
            }
            | ElementKindModel::InclusiveGateway {
                default_flow: Some(flow_id),
            } => {
                let flow = flow_ids
                    .get(flow_id.as_str())
                    .copied()
                    .filter(|f| flows[f.0 as usize].source == index)
                    .ok_or_else(|| DeploymentError::InvalidDefaultFlow {
                        gateway: id.clone(),
                        flow: flow_id.clone(),
                    })?;
                if flows[flow.0 as usize].condition.is_some() {
                    return Err(DeploymentError::InvalidDefaultFlow {
                        gateway: id.clone(),
                        flow: flow_id.clone(),
                    });
                }
                elements[index.0 as usize].kind = match elements[index.0 as usize].kind {
                    ElementKind::InclusiveGateway { .. } => ElementKind::InclusiveGateway {
                        default_flow: Some(flow),
                    },
                    _ => ElementKind::ExclusiveGateway {
                        default_flow: Some(flow),
                    },
                };
            }
            ElementKindModel::BoundaryEvent { .. } => {
                let ElementKind::BoundaryEvent { attached_to, .. } = elements[index.0 as usize].kind else {
                    continue;
                };
                let activity = &elements[attached_to.0 as usize];
                if !activity.kind.is_activity() || activity.flow_scope != elements[index.0 as usize].flow_scope {
                    return Err(DeploymentError::InvalidBoundaryEvent {
                        id: id.clone(),
                        reason: format!("'{}' is not an activity in the same scope", activity.id),
                    });
                }
                if !elements[index.0 as usize].incoming.is_empty() {
                    return Err(DeploymentError::InvalidBoundaryEvent {
                        id: id.clone(),
                        reason: "boundary events cannot have incoming flows".into(),
                    });
                }
                elements[attached_to.0 as usize].boundary_events.push(index);
            }
            ElementKindModel::EventBasedGateway => {
                let gateway = &elements[index.0 as usize];
                if gateway.outgoing.len() < 2 {
                    return Err(DeploymentError::InvalidEventBasedGateway {
                        id: id.clone(),
                        reason: "expected at least two outgoing flows".into(),
                    });
                }
                for flow in &gateway.outgoing {
                    let target = &elements[flows[flow.0 as usize].target.0 as usize];
                    if !matches!(target.kind, ElementKind::IntermediateCatchEvent { .. }) || target.incoming.len() != 1 {
                        return Err(DeploymentError::InvalidEventBasedGateway {
                            id: id.clone(),
                            reason: format!("'{}' is not a catch event reachable only from the gateway", target.id),
                        });
                    }
                }
            }
            ElementKindModel::StartEvent { .. } if !elements[index.0 as usize].incoming.is_empty() => {
                return Err(DeploymentError::StartEvents {
                    scope: id.clone(),
                    reason: "start events cannot have incoming flows".into(),
                });
            }
            _ => {}
        }
    }

    // Start events per scope
    let mut timer_start_events = Vec::new();
    let mut message_start_events = Vec::new();
    let scopes: Vec<ElementIndex> = elements
        .iter()
        .filter(|e| e.kind.is_scope())
        .map(|e| e.index)
        .collect();
    for scope in scopes {
        let mut none_starts = Vec::new();
        let mut timer_starts = Vec::new();
        let mut message_starts: Vec<(ElementIndex, &str)> = Vec::new();
        for element in elements.iter().filter(|e| e.flow_scope == Some(scope)) {
            match &element.kind {
                ElementKind::StartEvent { timer: Some(_), .. } => timer_starts.push(element.index),
                ElementKind::StartEvent { message: Some(name), .. } => message_starts.push((element.index, name.as_str())),
                ElementKind::StartEvent { .. } => none_starts.push(element.index),
                _ => {}
            }
        }

        let scope_element = &elements[scope.0 as usize];
        let event_starts = timer_starts.len() + message_starts.len();
        let valid = if scope == ElementIndex::PROCESS {
            none_starts.len() == 1 || (none_starts.is_empty() && event_starts > 0)
        } else {
            none_starts.len() == 1 && event_starts == 0
        };
        if !valid {
            return Err(DeploymentError::StartEvents {
                scope: scope_element.id.clone(),
                reason: format!(
                    "found {} none start events and {} timer or message start events",
                    none_starts.len(),
                    event_starts
                ),
            });
        }
        for (i, (_, name)) in message_starts.iter().enumerate() {
            if message_starts[..i].iter().any(|(_, other)| other == name) {
                return Err(DeploymentError::StartEvents {
                    scope: scope_element.id.clone(),
                    reason: format!("message '{name}' starts the process more than once"),
                });
            }
        }

        let message_starts: Vec<ElementIndex> = message_starts.into_iter().map(|(index, _)| index).collect();
        elements[scope.0 as usize].none_start = none_starts.first().copied();
        if scope == ElementIndex::PROCESS {
            timer_start_events = timer_starts;
            message_start_events = message_starts;
        }
    }

    Ok(ExecutableProcess {
        bpmn_process_id: model.process_id.clone(),
        name: model.name.clone(),
        elements,
        flows,
        timer_start_events,
        message_start_events,
        ids,
    })
}
