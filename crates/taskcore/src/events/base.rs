use crate::{TaskState, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Events emitted during a flow run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    RunStarted {
        execution_id: ExecutionId,
        tasks: usize,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        execution_id: ExecutionId,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    TaskStarted {
        execution_id: ExecutionId,
        task: String,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        execution_id: ExecutionId,
        task: String,
        status_code: i64,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    TaskFailed {
        execution_id: ExecutionId,
        task: String,
        status_code: i64,
        error: Option<String>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    TaskPanicked {
        execution_id: ExecutionId,
        task: String,
        message: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    TaskSkipped {
        execution_id: ExecutionId,
        task: String,
        timestamp: DateTime<Utc>,
    },
    TaskMessage {
        execution_id: ExecutionId,
        task: String,
        message: TaskMessage,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::RunStarted { execution_id, .. }
            | ExecutionEvent::RunCompleted { execution_id, .. }
            | ExecutionEvent::TaskStarted { execution_id, .. }
            | ExecutionEvent::TaskCompleted { execution_id, .. }
            | ExecutionEvent::TaskFailed { execution_id, .. }
            | ExecutionEvent::TaskPanicked { execution_id, .. }
            | ExecutionEvent::TaskSkipped { execution_id, .. }
            | ExecutionEvent::TaskMessage { execution_id, .. } => *execution_id,
        }
    }

    /// Task name for task-scoped events.
    pub fn task(&self) -> Option<&str> {
        match self {
            ExecutionEvent::TaskStarted { task, .. }
            | ExecutionEvent::TaskCompleted { task, .. }
            | ExecutionEvent::TaskFailed { task, .. }
            | ExecutionEvent::TaskPanicked { task, .. }
            | ExecutionEvent::TaskSkipped { task, .. }
            | ExecutionEvent::TaskMessage { task, .. } => Some(task),
            _ => None,
        }
    }

    /// Terminal state carried by a task's final event, if this is one.
    pub fn terminal_state(&self) -> Option<TaskState> {
        match self {
            ExecutionEvent::TaskCompleted { .. } => Some(TaskState::Completed),
            ExecutionEvent::TaskFailed { .. } => Some(TaskState::Failed),
            ExecutionEvent::TaskPanicked { .. } => Some(TaskState::Panicked),
            ExecutionEvent::TaskSkipped { .. } => Some(TaskState::Skipped),
            _ => None,
        }
    }
}

/// Messages a task body sends while it runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum TaskMessage {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
    Data { key: String, value: Value },
}

/// Event emitter handed to task bodies
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    task: String,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        execution_id: ExecutionId,
        task: impl Into<String>,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            execution_id,
            task: task.into(),
            sender,
        }
    }

    pub fn emit(&self, message: TaskMessage) {
        let _ = self.sender.send(ExecutionEvent::TaskMessage {
            execution_id: self.execution_id,
            task: self.task.clone(),
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(TaskMessage::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(TaskMessage::Warning {
            message: message.into(),
        });
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(TaskMessage::Progress { percent, message });
    }

    pub fn data(&self, key: impl Into<String>, value: Value) {
        self.emit(TaskMessage::Data {
            key: key.into(),
            value,
        });
    }
}

/// Broadcast bus for execution events. Sending with no subscriber is a no-op.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, execution_id: ExecutionId, task: impl Into<String>) -> EventEmitter {
        EventEmitter::new(execution_id, task, self.sender.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_tags_messages_with_task_and_run() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let id = ExecutionId::new_v4();

        bus.create_emitter(id, "fetch").info("hello");

        match rx.recv().await.unwrap() {
            ExecutionEvent::TaskMessage {
                execution_id,
                task,
                message: TaskMessage::Info { message },
                ..
            } => {
                assert_eq!(execution_id, id);
                assert_eq!(task, "fetch");
                assert_eq!(message, "hello");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn emitting_without_subscribers_is_silent() {
        let bus = EventBus::new(0);
        bus.emit(ExecutionEvent::RunStarted {
            execution_id: ExecutionId::new_v4(),
            tasks: 0,
            timestamp: Utc::now(),
        });
    }
}
