use crate::value::Value;

/// A unit of work submitted to a [`super::TaskQueue`]: a named type plus an
/// opaque payload, optionally tagged with a caller-chosen id for correlation.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub kind: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// The terminal outcome of one task, broadcast to completion subscribers.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub id: String,
    pub kind: String,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
}

/// A message a handler emits mid-execution, before the task completes.
#[derive(Debug, Clone)]
pub struct TaskMessage {
    pub id: String,
    pub kind: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Default)]
pub struct QueueStatus {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}
