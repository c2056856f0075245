// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Compiled, immutable processes.
//!
//! # Architecture
//! A process is an arena: every element lives in `elements`, every flow in
//! `flows`, and all references between them are indices. The process itself
//! is element 0. Compiled processes are shared behind `Arc` and never change.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::expr::{CompiledMapping, Condition, JsonPath};
use crate::record::BpmnElementType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementIndex(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlowIndex(pub u32);

impl ElementIndex {
    pub const PROCESS: ElementIndex = ElementIndex(0);
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub name: String,
    pub correlation_key: JsonPath,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventDefinition {
    Timer { duration_ms: i64 },
    Message(MessageEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementKind {
    Process,
    StartEvent {
        timer: Option<i64>,
        /// Name of the message that starts the process.
        message: Option<String>,
    },
    EndEvent,
    ServiceTask {
        job_type: String,
        retries: i32,
    },
    ReceiveTask {
        message: MessageEvent,
    },
    ExclusiveGateway {
        default_flow: Option<FlowIndex>,
    },
    ParallelGateway,
    InclusiveGateway {
        default_flow: Option<FlowIndex>,
    },
    EventBasedGateway,
    IntermediateCatchEvent {
        event: EventDefinition,
    },
    BoundaryEvent {
        attached_to: ElementIndex,
        cancel_activity: bool,
        event: EventDefinition,
    },
    SubProcess,
}

impl ElementKind {
    pub fn element_type(&self) -> BpmnElementType {
        match self {
            ElementKind::Process => BpmnElementType::Process,
            ElementKind::StartEvent { .. } => BpmnElementType::StartEvent,
            ElementKind::EndEvent => BpmnElementType::EndEvent,
            ElementKind::ServiceTask { .. } => BpmnElementType::ServiceTask,
            ElementKind::ReceiveTask { .. } => BpmnElementType::ReceiveTask,
            ElementKind::ExclusiveGateway { .. } => BpmnElementType::ExclusiveGateway,
            ElementKind::ParallelGateway => BpmnElementType::ParallelGateway,
            ElementKind::InclusiveGateway { .. } => BpmnElementType::InclusiveGateway,
            ElementKind::EventBasedGateway => BpmnElementType::EventBasedGateway,
            ElementKind::IntermediateCatchEvent { .. } => BpmnElementType::IntermediateCatchEvent,
            ElementKind::BoundaryEvent { .. } => BpmnElementType::BoundaryEvent,
            ElementKind::SubProcess => BpmnElementType::SubProcess,
        }
    }

    /// Elements that contain other elements.
    pub fn is_scope(&self) -> bool {
        matches!(self, ElementKind::Process | ElementKind::SubProcess)
    }

    /// Elements that may carry boundary events.
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            ElementKind::ServiceTask { .. } | ElementKind::ReceiveTask { .. } | ElementKind::SubProcess
        )
    }
}

#[derive(Debug, Clone)]
pub struct ExecutableElement {
    pub id: String,
    pub index: ElementIndex,
    pub kind: ElementKind,
    /// `None` only for the process.
    pub flow_scope: Option<ElementIndex>,
    pub incoming: Vec<FlowIndex>,
    pub outgoing: Vec<FlowIndex>,
    pub input_mappings: Vec<CompiledMapping>,
    pub output_mappings: Vec<CompiledMapping>,
    /// The none start event of a scope.
    pub none_start: Option<ElementIndex>,
    pub boundary_events: Vec<ElementIndex>,
}

impl ExecutableElement {
    pub fn element_type(&self) -> BpmnElementType {
        self.kind.element_type()
    }

    /// A parallel or inclusive gateway with more than one incoming flow joins.
    pub fn is_joining(&self) -> bool {
        matches!(self.kind, ElementKind::ParallelGateway | ElementKind::InclusiveGateway { .. })
            && self.incoming.len() > 1
    }
}

#[derive(Debug, Clone)]
pub struct ExecutableFlow {
    pub id: String,
    pub index: FlowIndex,
    pub source: ElementIndex,
    pub target: ElementIndex,
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone)]
pub struct ExecutableProcess {
    pub bpmn_process_id: String,
    pub name: Option<String>,
    pub elements: Vec<ExecutableElement>,
    pub flows: Vec<ExecutableFlow>,
    pub timer_start_events: Vec<ElementIndex>,
    pub message_start_events: Vec<ElementIndex>,
    pub(crate) ids: FxHashMap<String, ElementIndex>,
}

impl ExecutableProcess {
    pub fn process(&self) -> &ExecutableElement {
        &self.elements[0]
    }

    /// Indices come from this process's own compiler; out-of-range indices
    /// are a programming error.
    pub fn element(&self, index: ElementIndex) -> &ExecutableElement {
        &self.elements[index.0 as usize]
    }

    pub fn flow(&self, index: FlowIndex) -> &ExecutableFlow {
        &self.flows[index.0 as usize]
    }

    pub fn lookup(&self, id: &str) -> Option<ElementIndex> {
        self.ids.get(id).copied()
    }

    pub fn element_by_id(&self, id: &str) -> Option<&ExecutableElement> {
        self.lookup(id).map(|index| self.element(index))
    }

    pub fn outgoing(&self, index: ElementIndex) -> impl Iterator<Item = &ExecutableFlow> {
        self.element(index).outgoing.iter().map(|f| self.flow(*f))
    }
}
