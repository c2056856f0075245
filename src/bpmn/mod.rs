// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Process models and their compiled form.

pub mod builder;
pub mod compiler;
pub mod duration;
pub mod executable;
pub mod model;

use thiserror::Error;

pub use builder::ProcessBuilder;
pub use compiler::compile;
pub use executable::{
    ElementIndex, ElementKind, EventDefinition, ExecutableElement, ExecutableFlow, ExecutableProcess,
    FlowIndex, MessageEvent,
};
pub use model::ProcessModel;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeploymentError {
    #[error("Resource is not a valid process model: {0}")]
    InvalidJson(String),

    #[error("Process id must not be empty")]
    EmptyProcessId,

    #[error("Duplicate id '{0}'")]
    DuplicateId(String),

    #[error("Flow '{flow}' references unknown element '{id}'")]
    UnknownElement { flow: String, id: String },

    #[error("Flow '{0}' connects elements of different scopes")]
    FlowOutsideScope(String),

    #[error("Invalid condition: {0}")]
    InvalidCondition(String),

    #[error("Default flow '{flow}' of gateway '{gateway}' must be an unconditional outgoing flow")]
    InvalidDefaultFlow { gateway: String, flow: String },

    #[error("Invalid boundary event '{id}': {reason}")]
    InvalidBoundaryEvent { id: String, reason: String },

    #[error("Invalid event definition on '{id}': {reason}")]
    InvalidEventDefinition { id: String, reason: String },

    #[error("Invalid timer on '{id}': {reason}")]
    InvalidTimer { id: String, reason: String },

    #[error("Invalid event-based gateway '{id}': {reason}")]
    InvalidEventBasedGateway { id: String, reason: String },

    #[error("Invalid mapping on '{id}': {reason}")]
    InvalidMapping { id: String, reason: String },

    #[error("Invalid start events in scope '{scope}': {reason}")]
    StartEvents { scope: String, reason: String },
}

/// Parses and compiles a JSON model.
pub fn compile_json(text: &str) -> Result<ExecutableProcess, DeploymentError> {
    let model = ProcessModel::from_json(text).map_err(|e| DeploymentError::InvalidJson(e.to_string()))?;
    compile(&model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_process() -> ProcessBuilder {
        ProcessBuilder::new("order")
            .start_event("start")
            .service_task("pay", "payment")
            .exclusive_gateway("split", Some("to-end"))
            .end_event("end")
            .end_event("fast")
            .sequence(&["start", "pay", "split"])
            .named_flow("to-end", "split", "end")
            .conditional_flow("to-fast", "split", "fast", "$.total < 10")
    }

    #[test]
    fn test_compile_arena() {
        let process = compile(&order_process().build()).unwrap();

        assert_eq!(process.process().kind, ElementKind::Process);
        let start = process.lookup("start").unwrap();
        assert_eq!(process.process().none_start, Some(start));

        let split = process.element_by_id("split").unwrap();
        assert_eq!(split.incoming.len(), 1);
        assert_eq!(split.outgoing.len(), 2);
        let ElementKind::ExclusiveGateway { default_flow: Some(default) } = split.kind else {
            panic!("default flow not resolved");
        };
        assert_eq!(process.flow(default).id, "to-end");
        assert_eq!(process.element(process.flow(default).target).id, "end");

        let conditional = process.outgoing(split.index).find(|f| f.id == "to-fast").unwrap();
        assert!(conditional.condition.is_some());
    }

    #[test]
    fn test_duplicate_ids() {
        let model = order_process().service_task("pay", "other").build();
        assert_eq!(compile(&model).unwrap_err(), DeploymentError::DuplicateId("pay".into()));

        let model = order_process().named_flow("pay", "start", "end").build();
        assert!(matches!(compile(&model), Err(DeploymentError::DuplicateId(_))));
    }

    #[test]
    fn test_start_event_rules() {
        let none = ProcessBuilder::new("p").end_event("end").build();
        assert!(matches!(compile(&none), Err(DeploymentError::StartEvents { .. })));

        let two = ProcessBuilder::new("p").start_event("a").start_event("b").build();
        assert!(matches!(compile(&two), Err(DeploymentError::StartEvents { .. })));

        let timer_only = ProcessBuilder::new("p")
            .timer_start_event("tick", "PT1M")
            .end_event("end")
            .flow("tick", "end")
            .build();
        let process = compile(&timer_only).unwrap();
        assert_eq!(process.timer_start_events.len(), 1);
        assert_eq!(process.process().none_start, None);
    }

    #[test]
    fn test_message_start_events() {
        let model = ProcessBuilder::new("p")
            .message_start_event("on-order", "order-placed")
            .start_event("start")
            .end_event("end")
            .flow("on-order", "end")
            .flow("start", "end")
            .build();
        let process = compile(&model).unwrap();
        assert_eq!(process.message_start_events, vec![process.lookup("on-order").unwrap()]);
        assert_eq!(process.process().none_start, process.lookup("start"));

        let twice = ProcessBuilder::new("p")
            .message_start_event("a", "order-placed")
            .message_start_event("b", "order-placed")
            .end_event("end")
            .flow("a", "end")
            .flow("b", "end")
            .build();
        assert!(matches!(compile(&twice), Err(DeploymentError::StartEvents { .. })));

        let nested = ProcessBuilder::new("p")
            .start_event("start")
            .sub_process(
                "sub",
                ProcessBuilder::new("x")
                    .message_start_event("s", "order-placed")
                    .end_event("e")
                    .flow("s", "e"),
            )
            .flow("start", "sub")
            .build();
        assert!(matches!(compile(&nested), Err(DeploymentError::StartEvents { .. })));
    }

    #[test]
    fn test_inclusive_gateway_default_flow() {
        let model = ProcessBuilder::new("p")
            .start_event("start")
            .inclusive_gateway("fork", Some("otherwise"))
            .end_event("a")
            .end_event("b")
            .flow("start", "fork")
            .conditional_flow("to-a", "fork", "a", "$.x > 1")
            .named_flow("otherwise", "fork", "b")
            .build();
        let process = compile(&model).unwrap();
        let fork = process.element_by_id("fork").unwrap();
        let ElementKind::InclusiveGateway { default_flow: Some(default) } = fork.kind else {
            panic!("default flow not resolved");
        };
        assert_eq!(process.flow(default).id, "otherwise");
        assert!(!fork.is_joining());
    }

    #[test]
    fn test_default_flow_must_leave_gateway() {
        let model = ProcessBuilder::new("p")
            .start_event("start")
            .exclusive_gateway("gw", Some("start-gw"))
            .end_event("end")
            .sequence(&["start", "gw", "end"])
            .build();
        assert!(matches!(compile(&model), Err(DeploymentError::InvalidDefaultFlow { .. })));
    }

    #[test]
    fn test_conditions_only_after_exclusive_gateway() {
        let model = ProcessBuilder::new("p")
            .start_event("start")
            .end_event("end")
            .conditional_flow("f", "start", "end", "$.x == 1")
            .build();
        assert!(matches!(compile(&model), Err(DeploymentError::InvalidCondition(_))));

        let model = order_process()
            .conditional_flow("bad", "split", "end", "$.x ==")
            .build();
        assert!(matches!(compile(&model), Err(DeploymentError::InvalidCondition(_))));
    }

    #[test]
    fn test_sub_process_scopes() {
        let inner = ProcessBuilder::new("ignored")
            .start_event("sub-start")
            .service_task("work", "w")
            .end_event("sub-end")
            .sequence(&["sub-start", "work", "sub-end"]);
        let model = ProcessBuilder::new("p")
            .start_event("start")
            .sub_process("sub", inner)
            .end_event("end")
            .timer_boundary_event("timeout", "sub", "PT10S", true)
            .sequence(&["start", "sub", "end"])
            .flow("timeout", "end")
            .build();

        let process = compile(&model).unwrap();
        let sub = process.element_by_id("sub").unwrap();
        let work = process.element_by_id("work").unwrap();
        assert_eq!(work.flow_scope, Some(sub.index));
        assert_eq!(sub.none_start, process.lookup("sub-start"));
        assert_eq!(sub.boundary_events, vec![process.lookup("timeout").unwrap()]);

        // a flow may not cross the sub-process border
        let crossing = ProcessBuilder::new("p")
            .start_event("start")
            .sub_process(
                "sub",
                ProcessBuilder::new("x").start_event("s").end_event("e").flow("s", "e"),
            )
            .flow("start", "e")
            .build();
        assert!(matches!(compile(&crossing), Err(DeploymentError::FlowOutsideScope(_))));
    }

    #[test]
    fn test_boundary_event_must_attach_to_activity() {
        let model = ProcessBuilder::new("p")
            .start_event("start")
            .end_event("end")
            .timer_boundary_event("b", "start", "PT1S", true)
            .flow("start", "end")
            .build();
        assert!(matches!(compile(&model), Err(DeploymentError::InvalidBoundaryEvent { .. })));
    }

    #[test]
    fn test_event_based_gateway_targets() {
        let model = ProcessBuilder::new("p")
            .start_event("start")
            .event_based_gateway("race")
            .message_catch_event("paid", "payment", "$.orderId")
            .end_event("end")
            .sequence(&["start", "race"])
            .flow("race", "paid")
            .flow("race", "end")
            .build();
        assert!(matches!(compile(&model), Err(DeploymentError::InvalidEventBasedGateway { .. })));
    }

    #[test]
    fn test_compile_json_reports_parse_errors() {
        assert!(matches!(compile_json("{"), Err(DeploymentError::InvalidJson(_))));
    }
}
