use crate::Flow;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use taskcore::{EventBus, ExecutionEvent};

/// Shared home for flows: one configuration and one event bus that every
/// flow created here reports to.
pub struct FlowRuntime {
    config: RuntimeConfig,
    event_bus: Arc<EventBus>,
}

impl FlowRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        Self { config, event_bus }
    }

    /// Start building a flow that reports to this runtime's event bus
    pub fn flow<C: Send + Sync + 'static>(&self) -> Flow<C> {
        Flow::with_event_bus(self.config.clone(), Arc::clone(&self.event_bus))
    }

    /// Subscribe to execution events of every flow built from this runtime
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for flows and the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity of the execution event channel
    pub event_buffer_size: usize,
    /// Report a name registered twice as a graph error instead of letting the
    /// last registration win
    pub reject_duplicate_tasks: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            reject_duplicate_tasks: false,
        }
    }
}
