//! 单次任务执行的外部协作者：审批门、事件出口、执行控制

use std::sync::Arc;

use crate::core::{ApprovalGate, AutoApprove, EventSink, ExecutionControl};

#[derive(Clone)]
pub struct TaskSession {
    pub approval: Arc<dyn ApprovalGate>,
    pub events: EventSink,
    pub control: ExecutionControl,
}

impl Default for TaskSession {
    fn default() -> Self {
        Self {
            approval: Arc::new(AutoApprove),
            events: EventSink::default(),
            control: ExecutionControl::new(),
        }
    }
}

impl TaskSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_approval(mut self, gate: impl ApprovalGate + 'static) -> Self {
        self.approval = Arc::new(gate);
        self
    }

    pub fn with_approval_arc(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval = gate;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_control(mut self, control: ExecutionControl) -> Self {
        self.control = control;
        self
    }
}
