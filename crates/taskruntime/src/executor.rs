use crate::registry::Flow;
use crate::slot::{OutputSlot, SlotReceiver};
use crate::trace::{self, TracePanics};
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use taskcore::{
    EventBus, ExecutionEvent, ExecutionId, FlowError, TaskContext, TaskError, TaskFn, TaskInputs,
    TaskOutcome, TaskRecord, TaskState, Value, NORMAL_STATUS_CODE, PANIC_STATUS_CODE,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Result of running a flow
#[derive(Debug)]
pub struct Execution {
    pub execution_id: ExecutionId,
    /// One entry per task. Tasks that published nothing map to `Value::Null`.
    pub results: HashMap<String, Value>,
    pub records: HashMap<String, TaskRecord>,
    /// `Some(FlowError::Halted)` when a fail-stop task failed or panicked
    pub error: Option<FlowError>,
    pub duration_ms: u64,
}

impl Execution {
    pub fn result(&self, task: &str) -> Option<&Value> {
        self.results.get(task)
    }

    pub fn record(&self, task: &str) -> Option<&TaskRecord> {
        self.records.get(task)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Drop the records and turn a halted run into an error.
    pub fn into_result(self) -> Result<HashMap<String, Value>, FlowError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.results),
        }
    }
}

impl<C: Send + Sync + 'static> Flow<C> {
    /// Run every task once and collect the results.
    ///
    /// Graph errors are returned before any task starts. Task failures never
    /// make this return `Err`; they show up in [`Execution::error`] and on
    /// the task records.
    pub async fn execute(self, data: impl Into<Arc<C>>) -> Result<Execution, FlowError> {
        self.execute_with_cancellation(data, CancellationToken::new())
            .await
    }

    /// Like [`Flow::execute`], handing `cancellation` to every task body.
    pub async fn execute_with_cancellation(
        mut self,
        data: impl Into<Arc<C>>,
        cancellation: CancellationToken,
    ) -> Result<Execution, FlowError> {
        let execution_id = ExecutionId::new_v4();
        let start_time = Instant::now();

        self.validate()?;

        let data = data.into();
        let halted = Arc::new(AtomicBool::new(false));
        let task_count = self.tasks.len();

        self.event_bus.emit(ExecutionEvent::RunStarted {
            execution_id,
            tasks: task_count,
            timestamp: Utc::now(),
        });
        tracing::info!("Starting flow execution {} ({} tasks)", execution_id, task_count);

        // Every receiver exists before any worker runs.
        let mut slots = Vec::with_capacity(task_count);
        let mut receivers: HashMap<String, Vec<SlotReceiver>> = HashMap::with_capacity(task_count);
        for node in self.tasks.values() {
            let (slot, rxs) = OutputSlot::new(node.name.as_str(), node.pending_consumers);
            slots.push(slot);
            receivers.insert(node.name.clone(), rxs);
        }

        let mut collectors = Vec::with_capacity(task_count);
        for name in self.tasks.keys() {
            collectors.push(take_receiver(&mut receivers, name)?);
        }

        let mut workers = Vec::with_capacity(task_count);
        for (node, slot) in self.tasks.values().zip(slots) {
            let inputs = node
                .dependencies
                .iter()
                .map(|dep| take_receiver(&mut receivers, dep))
                .collect::<Result<Vec<_>, _>>()?;

            workers.push(Worker {
                task: Arc::clone(&node.task),
                inputs,
                slot,
                record: TaskRecord::new(
                    node.name.as_str(),
                    node.dependencies.clone(),
                    node.fail_through,
                    node.pending_consumers,
                ),
                halted: Arc::clone(&halted),
                ctx: TaskContext {
                    task: node.name.clone(),
                    execution_id,
                    data: Arc::clone(&data),
                    events: self.event_bus.create_emitter(execution_id, node.name.as_str()),
                    cancellation: cancellation.clone(),
                },
                event_bus: Arc::clone(&self.event_bus),
            });
        }

        // Launch everything before waiting on anything.
        let handles: Vec<(TaskRecord, JoinHandle<TaskRecord>)> = workers
            .into_iter()
            .map(|worker| {
                let template = worker.record.clone();
                (template, tokio::spawn(worker.run()))
            })
            .collect();

        let mut results = HashMap::with_capacity(task_count);
        for rx in collectors {
            let name = rx.task().to_string();
            results.insert(name, rx.recv().await.unwrap_or_default());
        }

        let mut records = HashMap::with_capacity(task_count);
        for (template, handle) in handles {
            let record = match handle.await {
                Ok(record) => record,
                Err(e) => lost_worker(template, e.to_string(), &halted),
            };
            records.insert(record.name.clone(), record);
        }

        let error = halted.load(Ordering::Acquire).then_some(FlowError::Halted);
        let duration_ms = start_time.elapsed().as_millis() as u64;

        self.event_bus.emit(ExecutionEvent::RunCompleted {
            execution_id,
            success: error.is_none(),
            duration_ms,
            timestamp: Utc::now(),
        });
        if error.is_some() {
            tracing::warn!("Flow execution {} halted after {}ms", execution_id, duration_ms);
        } else {
            tracing::info!("Flow execution {} completed in {}ms", execution_id, duration_ms);
        }

        Ok(Execution {
            execution_id,
            results,
            records,
            error,
            duration_ms,
        })
    }
}

fn take_receiver(
    receivers: &mut HashMap<String, Vec<SlotReceiver>>,
    task: &str,
) -> Result<SlotReceiver, FlowError> {
    receivers
        .get_mut(task)
        .and_then(Vec::pop)
        .ok_or_else(|| FlowError::Execution(format!("no output receiver left for task {}", task)))
}

/// A worker that died outside the task's own panic boundary.
fn lost_worker(mut record: TaskRecord, reason: String, halted: &AtomicBool) -> TaskRecord {
    tracing::error!("Worker for task {} was lost: {}", record.name, reason);
    record.state = TaskState::Panicked;
    record.status_code = PANIC_STATUS_CODE;
    record.error = Some(TaskError::Panicked {
        task: record.name.clone(),
        message: reason,
        backtrace: String::new(),
    });
    if !record.fail_through {
        halted.store(true, Ordering::Release);
    }
    record
}

/// Everything one task needs to run on its own tokio task
struct Worker<C> {
    task: Arc<dyn TaskFn<C>>,
    inputs: Vec<SlotReceiver>,
    slot: OutputSlot,
    record: TaskRecord,
    halted: Arc<AtomicBool>,
    ctx: TaskContext<C>,
    event_bus: Arc<EventBus>,
}

impl<C: Send + Sync + 'static> Worker<C> {
    async fn run(mut self) -> TaskRecord {
        self.record.state = TaskState::Waiting;
        let mut inputs = TaskInputs::new();
        for rx in std::mem::take(&mut self.inputs) {
            let dep = rx.task().to_string();
            inputs.insert(dep, rx.recv().await);
        }

        self.record.started_at = Some(Utc::now());
        let started = Instant::now();

        if self.halted.load(Ordering::Acquire) && !self.record.fail_through {
            tracing::debug!("Skipping task {}: flow halted", self.record.name);
            self.record.state = TaskState::Skipped;
        } else {
            self.record.state = TaskState::Running;
            self.event_bus.emit(ExecutionEvent::TaskStarted {
                execution_id: self.ctx.execution_id,
                task: self.record.name.clone(),
                timestamp: Utc::now(),
            });
            tracing::debug!("Starting task {}", self.record.name);

            let task = Arc::clone(&self.task);
            let body = TracePanics::new(task.run(self.ctx.clone(), inputs));
            let result = AssertUnwindSafe(body)
                .catch_unwind()
                .await;
            match result {
                Ok(outcome) => self.finish(outcome),
                Err(payload) => self.recover(payload),
            }
        }

        self.slot.close();
        self.record.duration_ms = started.elapsed().as_millis() as u64;
        self.report();
        self.record
    }

    fn finish(&mut self, outcome: TaskOutcome) {
        let TaskOutcome {
            output,
            status_code,
            error,
        } = outcome;
        let failed = error.is_some() || status_code != NORMAL_STATUS_CODE;
        self.record.status_code = status_code;
        self.record.error = error;
        self.record.state = if failed {
            TaskState::Failed
        } else {
            TaskState::Completed
        };

        if failed && !self.record.fail_through {
            tracing::warn!(
                "Task {} failed with status {}, halting fail-stop tasks",
                self.record.name,
                status_code
            );
            self.halted.store(true, Ordering::Release);
        }
        self.slot.publish(output);
    }

    /// A panicking body publishes nothing. Runs in the same poll that caught
    /// the panic, so the trace recorded at the panic site is still on this
    /// thread.
    fn recover(&mut self, payload: Box<dyn Any + Send>) {
        let message = panic_message(&*payload);
        let backtrace =
            trace::take().unwrap_or_else(|| Backtrace::force_capture().to_string());
        tracing::error!("Task {} panicked: {}", self.record.name, message);

        self.record.state = TaskState::Panicked;
        self.record.status_code = PANIC_STATUS_CODE;
        self.record.error = Some(TaskError::Panicked {
            task: self.record.name.clone(),
            message,
            backtrace,
        });
        if !self.record.fail_through {
            self.halted.store(true, Ordering::Release);
        }
    }

    fn report(&self) {
        let execution_id = self.ctx.execution_id;
        let task = self.record.name.clone();
        let timestamp = Utc::now();
        let duration_ms = self.record.duration_ms;

        let event = match (&self.record.state, &self.record.error) {
            (TaskState::Completed, _) => ExecutionEvent::TaskCompleted {
                execution_id,
                task,
                status_code: self.record.status_code,
                duration_ms,
                timestamp,
            },
            (TaskState::Failed, error) => ExecutionEvent::TaskFailed {
                execution_id,
                task,
                status_code: self.record.status_code,
                error: error.as_ref().map(ToString::to_string),
                duration_ms,
                timestamp,
            },
            (TaskState::Panicked, Some(TaskError::Panicked { message, .. })) => {
                ExecutionEvent::TaskPanicked {
                    execution_id,
                    task,
                    message: message.clone(),
                    duration_ms,
                    timestamp,
                }
            }
            (TaskState::Skipped, _) => ExecutionEvent::TaskSkipped {
                execution_id,
                task,
                timestamp,
            },
            _ => return,
        };
        tracing::debug!(
            "Task {} finished as {} in {}ms",
            self.record.name,
            self.record.state,
            duration_ms
        );
        self.event_bus.emit(event);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
