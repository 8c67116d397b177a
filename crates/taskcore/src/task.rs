use crate::{events::EventEmitter, ExecutionId, TaskError, Value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Status code recorded for a task whose body panicked.
pub const PANIC_STATUS_CODE: i64 = 102_420_484_096;

/// Status code of a task that returned normally.
pub const NORMAL_STATUS_CODE: i64 = 0;

/// Body of a task.
///
/// Closures of the shape `Fn(TaskContext<C>, TaskInputs) -> impl Future<Output = TaskOutcome>`
/// implement this trait automatically; implement it on a struct when a task
/// carries its own configuration.
#[async_trait]
pub trait TaskFn<C>: Send + Sync {
    async fn run(&self, ctx: TaskContext<C>, inputs: TaskInputs) -> TaskOutcome;
}

#[async_trait]
impl<C, F, Fut> TaskFn<C> for F
where
    C: Send + Sync + 'static,
    F: Fn(TaskContext<C>, TaskInputs) -> Fut + Send + Sync,
    Fut: Future<Output = TaskOutcome> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext<C>, inputs: TaskInputs) -> TaskOutcome {
        (self)(ctx, inputs).await
    }
}

/// Execution context passed to each task body
pub struct TaskContext<C> {
    /// Name of the running task
    pub task: String,

    pub execution_id: ExecutionId,

    /// Caller-supplied context shared by every task of the run
    pub data: Arc<C>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Caller-owned cancellation signal. The executor never cancels it.
    pub cancellation: CancellationToken,
}

impl<C> TaskContext<C> {
    pub fn data(&self) -> &C {
        &self.data
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl<C> Clone for TaskContext<C> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
            execution_id: self.execution_id,
            data: Arc::clone(&self.data),
            events: self.events.clone(),
            cancellation: self.cancellation.clone(),
        }
    }
}

/// Outputs of a task's dependencies, keyed by dependency name.
///
/// A dependency that finished without publishing (skipped, or panicked) shows
/// up as `Value::Null` and reports `was_published == false`.
#[derive(Debug, Clone, Default)]
pub struct TaskInputs {
    values: HashMap<String, Value>,
    unpublished: HashSet<String>,
}

impl TaskInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record what a dependency delivered; `None` means its slot closed empty.
    pub fn insert(&mut self, name: impl Into<String>, value: Option<Value>) {
        let name = name.into();
        match value {
            Some(value) => {
                self.unpublished.remove(&name);
                self.values.insert(name, value);
            }
            None => {
                self.values.insert(name.clone(), Value::Null);
                self.unpublished.insert(name);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Get a published dependency output or return error
    pub fn require(&self, name: &str) -> Result<&Value, TaskError> {
        if self.unpublished.contains(name) {
            return Err(TaskError::MissingInput(name.to_string()));
        }
        self.values
            .get(name)
            .ok_or_else(|| TaskError::MissingInput(name.to_string()))
    }

    pub fn require_str(&self, name: &str) -> Result<&str, TaskError> {
        let value = self.require(name)?;
        value.as_str().ok_or_else(|| TaskError::InvalidInput {
            field: name.to_string(),
            expected: "string".to_string(),
            actual: value.type_name().to_string(),
        })
    }

    pub fn was_published(&self, name: &str) -> bool {
        self.values.contains_key(name) && !self.unpublished.contains(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn into_values(self) -> HashMap<String, Value> {
        self.values
    }
}

/// What a task body hands back: its output plus a status code and an
/// optional error. Non-zero codes are caller-defined.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub output: Value,
    pub status_code: i64,
    pub error: Option<TaskError>,
}

impl TaskOutcome {
    pub fn ok(output: impl Into<Value>) -> Self {
        Self {
            output: output.into(),
            status_code: NORMAL_STATUS_CODE,
            error: None,
        }
    }

    pub fn err(output: impl Into<Value>, error: impl Into<TaskError>) -> Self {
        Self {
            output: output.into(),
            status_code: NORMAL_STATUS_CODE,
            error: Some(error.into()),
        }
    }

    pub fn with_status(mut self, status_code: i64) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status_code == NORMAL_STATUS_CODE
    }
}

impl<T: Into<Value>> From<Result<T, TaskError>> for TaskOutcome {
    fn from(result: Result<T, TaskError>) -> Self {
        match result {
            Ok(output) => TaskOutcome::ok(output),
            Err(error) => TaskOutcome::err(Value::Null, error),
        }
    }
}

/// Lifecycle of a task within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Pending,
    Waiting,
    Running,
    Completed,
    Failed,
    Panicked,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Panicked | Self::Skipped
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Waiting => write!(f, "waiting"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Panicked => write!(f, "panicked"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Per-task bookkeeping, owned by the task's worker during a run and
/// readable afterwards.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub name: String,
    pub dependencies: Vec<String>,
    pub fail_through: bool,
    /// Receivers of this task's output: one per dependent listing plus the
    /// final collector.
    pub pending_consumers: usize,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub status_code: i64,
    pub error: Option<TaskError>,
}

impl TaskRecord {
    pub fn new(
        name: impl Into<String>,
        dependencies: Vec<String>,
        fail_through: bool,
        pending_consumers: usize,
    ) -> Self {
        Self {
            name: name.into(),
            dependencies,
            fail_through,
            pending_consumers,
            state: TaskState::Pending,
            started_at: None,
            duration_ms: 0,
            status_code: NORMAL_STATUS_CODE,
            error: None,
        }
    }

    pub fn panicked(&self) -> bool {
        self.status_code == PANIC_STATUS_CODE
    }

    pub fn succeeded(&self) -> bool {
        self.state == TaskState::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpublished_dependency_reads_as_null_but_is_not_required() {
        let mut inputs = TaskInputs::new();
        inputs.insert("ran", Some(Value::from("x")));
        inputs.insert("skipped", None);

        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs.get("skipped"), Some(&Value::Null));
        assert!(inputs.was_published("ran"));
        assert!(!inputs.was_published("skipped"));
        assert!(!inputs.was_published("absent"));
        assert_eq!(
            inputs.require("skipped"),
            Err(TaskError::MissingInput("skipped".to_string()))
        );
        assert_eq!(inputs.require_str("ran"), Ok("x"));
    }

    #[test]
    fn require_str_reports_actual_type() {
        let mut inputs = TaskInputs::new();
        inputs.insert("n", Some(Value::from(3)));

        assert_eq!(
            inputs.require_str("n"),
            Err(TaskError::InvalidInput {
                field: "n".to_string(),
                expected: "string".to_string(),
                actual: "int".to_string(),
            })
        );
    }

    #[test]
    fn only_finished_states_are_terminal() {
        for state in [TaskState::Pending, TaskState::Waiting, TaskState::Running] {
            assert!(!state.is_terminal(), "{state}");
        }
        for state in [
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Panicked,
            TaskState::Skipped,
        ] {
            assert!(state.is_terminal(), "{state}");
        }
    }

    #[test]
    fn fresh_record_is_pending() {
        let record = TaskRecord::new("a", vec!["b".to_string()], true, 2);
        assert_eq!(record.state, TaskState::Pending);
        assert!(!record.succeeded());
        assert!(!record.panicked());
        assert!(!TaskError::failed("x").is_panic());
    }

    #[test]
    fn outcome_success_needs_no_error_and_zero_code() {
        assert!(TaskOutcome::ok("done").is_success());
        assert!(!TaskOutcome::ok("done").with_status(7).is_success());
        assert!(!TaskOutcome::err("partial", "boom").is_success());

        let from_err: TaskOutcome = Err::<Value, _>(TaskError::Cancelled).into();
        assert_eq!(from_err.output, Value::Null);
        assert_eq!(from_err.error, Some(TaskError::Cancelled));
    }
}
