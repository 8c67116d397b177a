use crate::RuntimeConfig;
use indexmap::IndexMap;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use taskcore::{EventBus, ExecutionEvent, GraphError, TaskContext, TaskFn, TaskInputs, TaskOutcome};

/// A registered unit of work
pub(crate) struct TaskNode<C> {
    pub(crate) name: String,
    pub(crate) dependencies: Vec<String>,
    pub(crate) fail_through: bool,
    pub(crate) task: Arc<dyn TaskFn<C>>,
    /// Final collector plus one per dependent listing; set by `validate`
    pub(crate) pending_consumers: usize,
}

/// Builder and registry of a task graph, run once with `execute`.
///
/// Tasks are kept in registration order, so validation reports the first
/// offending task deterministically.
pub struct Flow<C> {
    pub(crate) tasks: IndexMap<String, TaskNode<C>>,
    duplicates: Vec<String>,
    pub(crate) config: RuntimeConfig,
    pub(crate) event_bus: Arc<EventBus>,
}

impl<C: Send + Sync + 'static> Flow<C> {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        Self::with_event_bus(config, event_bus)
    }

    pub(crate) fn with_event_bus(config: RuntimeConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            tasks: IndexMap::new(),
            duplicates: Vec::new(),
            config,
            event_bus,
        }
    }

    /// Register a task body given as a closure.
    ///
    /// Nothing is checked here; a name that is already registered is
    /// replaced.
    pub fn register<F, Fut>(
        self,
        name: impl Into<String>,
        fail_through: bool,
        dependencies: &[&str],
        body: F,
    ) -> Self
    where
        F: Fn(TaskContext<C>, TaskInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        self.register_task(name, fail_through, dependencies, body)
    }

    /// Register a task implemented as a [`TaskFn`].
    pub fn register_task(
        mut self,
        name: impl Into<String>,
        fail_through: bool,
        dependencies: &[&str],
        task: impl TaskFn<C> + 'static,
    ) -> Self {
        let name = name.into();
        let node = TaskNode {
            name: name.clone(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            fail_through,
            task: Arc::new(task),
            pending_consumers: 1,
        };

        if self.tasks.insert(name.clone(), node).is_some() {
            tracing::warn!("Task {} registered twice, keeping the last registration", name);
            self.duplicates.push(name);
        } else {
            tracing::debug!("Registered task: {}", name);
        }
        self
    }

    /// Check the graph and size every task's fan-out.
    ///
    /// One pass over all tasks and their dependencies rejects self
    /// dependencies and unknown names, counting one consumer per dependency
    /// listing on top of the final collector. A cycle check follows. Calling
    /// this again recomputes the counts from scratch.
    pub fn validate(&mut self) -> Result<(), GraphError> {
        if self.config.reject_duplicate_tasks {
            if let Some(name) = self.duplicates.first() {
                return Err(GraphError::DuplicateTask(name.clone()));
            }
        }

        let mut consumers = vec![1usize; self.tasks.len()];
        for (name, node) in &self.tasks {
            for dep in &node.dependencies {
                if dep == name {
                    return Err(GraphError::SelfDependency(name.clone()));
                }
                let Some(index) = self.tasks.get_index_of(dep) else {
                    return Err(GraphError::MissingDependency {
                        task: name.clone(),
                        dependency: dep.clone(),
                    });
                };
                consumers[index] += 1;
            }
        }

        self.check_cycles()?;

        for (node, count) in self.tasks.values_mut().zip(consumers) {
            node.pending_consumers = count;
        }
        tracing::debug!("Validated flow with {} tasks", self.tasks.len());
        Ok(())
    }

    /// Dependencies are known to exist here.
    fn check_cycles(&self) -> Result<(), GraphError> {
        let mut graph = DiGraph::<&str, ()>::with_capacity(self.tasks.len(), 0);
        let indices: Vec<_> = self
            .tasks
            .keys()
            .map(|name| graph.add_node(name.as_str()))
            .collect();

        for (to, node) in self.tasks.values().enumerate() {
            for dep in &node.dependencies {
                if let Some(from) = self.tasks.get_index_of(dep) {
                    graph.add_edge(indices[from], indices[to], ());
                }
            }
        }

        toposort(&graph, None)
            .map(|_| ())
            .map_err(|cycle| GraphError::CyclicDependency(graph[cycle.node_id()].to_string()))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Task names in registration order
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn dependencies_of(&self, name: &str) -> Option<&[String]> {
        self.tasks.get(name).map(|node| node.dependencies.as_slice())
    }

    /// Consumers of a task's output; meaningful after `validate`.
    pub fn pending_consumers(&self, name: &str) -> Option<usize> {
        self.tasks.get(name).map(|node| node.pending_consumers)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Subscribe to this flow's execution events; call before `execute`.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }
}

impl<C: Send + Sync + 'static> Default for Flow<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for Flow<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: TaskContext<()>, _: TaskInputs) -> impl Future<Output = TaskOutcome> {
        async { TaskOutcome::ok("done") }
    }

    #[test]
    fn consumers_count_collector_and_every_listing() {
        let mut flow = Flow::<()>::new()
            .register("root", false, &[], noop)
            .register("left", false, &["root"], noop)
            .register("right", false, &["root"], noop)
            .register("join", false, &["left", "right", "root"], noop);

        flow.validate().unwrap();

        assert_eq!(flow.pending_consumers("root"), Some(4));
        assert_eq!(flow.pending_consumers("left"), Some(2));
        assert_eq!(flow.pending_consumers("right"), Some(2));
        assert_eq!(flow.pending_consumers("join"), Some(1));

        // Re-validating must not double count.
        flow.validate().unwrap();
        assert_eq!(flow.pending_consumers("root"), Some(4));
    }

    #[test]
    fn self_dependency_names_the_task() {
        let mut flow = Flow::<()>::new().register("test", false, &["test"], noop);
        assert_eq!(
            flow.validate(),
            Err(GraphError::SelfDependency("test".to_string()))
        );
    }

    #[test]
    fn missing_dependency_names_the_dependency() {
        let mut flow = Flow::<()>::new().register("test", false, &["dep1"], noop);
        let err = flow.validate().unwrap_err();
        assert_eq!(
            err,
            GraphError::MissingDependency {
                task: "test".to_string(),
                dependency: "dep1".to_string(),
            }
        );
        assert!(err.to_string().contains("\"dep1\""));
    }

    #[test]
    fn cycles_are_rejected() {
        let mut flow = Flow::<()>::new()
            .register("a", false, &["c"], noop)
            .register("b", false, &["a"], noop)
            .register("c", false, &["b"], noop);

        assert!(matches!(
            flow.validate(),
            Err(GraphError::CyclicDependency(_))
        ));
    }

    #[test]
    fn duplicate_registration_keeps_the_last() {
        let mut flow = Flow::<()>::new()
            .register("a", false, &[], noop)
            .register("b", false, &[], noop)
            .register("a", true, &["b"], noop);

        assert_eq!(flow.len(), 2);
        assert_eq!(flow.dependencies_of("a"), Some(&["b".to_string()][..]));
        assert_eq!(flow.task_names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(flow.validate().is_ok());
    }

    #[test]
    fn duplicate_registration_rejected_when_configured() {
        let config = RuntimeConfig {
            reject_duplicate_tasks: true,
            ..RuntimeConfig::default()
        };
        let mut flow = Flow::<()>::with_config(config)
            .register("a", false, &[], noop)
            .register("a", false, &[], noop);

        assert_eq!(
            flow.validate(),
            Err(GraphError::DuplicateTask("a".to_string()))
        );
    }
}
