use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// At least one fail-stop task failed or panicked. Per-task detail lives
    /// on the task records.
    #[error("execution failed, check task records")]
    Halted,

    #[error("Execution error: {0}")]
    Execution(String),
}

/// Problems with the shape of a task graph, found before any task runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("task \"{0}\" depends on itself")]
    SelfDependency(String),

    #[error("task \"{dependency}\" required by \"{task}\" does not exist")]
    MissingDependency { task: String, dependency: String },

    #[error("cyclic dependency detected at task \"{0}\"")]
    CyclicDependency(String),

    #[error("task \"{0}\" registered more than once")]
    DuplicateTask(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task failed: {0}")]
    Failed(String),

    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInput {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("task \"{task}\" panicked: {message}\n{backtrace}")]
    Panicked {
        task: String,
        message: String,
        backtrace: String,
    },
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, TaskError::Panicked { .. })
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        TaskError::Failed(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        TaskError::Failed(message.to_string())
    }
}
