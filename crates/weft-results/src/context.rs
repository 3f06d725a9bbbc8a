//! Ambient run contexts and the result-relevant slices of flow/task config.
//!
//! The engine that schedules flows and tasks lives outside this crate; these
//! types are its interface to result persistence. Contexts are task-local so
//! concurrent runs on one worker never observe each other's factories.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::factory::{ResultFactory, ResultStorage, SerializerChoice};
use crate::ResultError;

tokio::task_local! {
    static FLOW_RUN: FlowRunContext;
    static TASK_RUN: TaskRunContext;
}

/// Ambient context of a running flow.
#[derive(Clone)]
pub struct FlowRunContext {
    /// Identifier of the flow run.
    pub flow_run_id: Uuid,
    /// Factory resolved for this flow run.
    pub result_factory: ResultFactory,
}

impl FlowRunContext {
    /// Build a context for a fresh flow run.
    pub fn new(result_factory: ResultFactory) -> Self {
        Self {
            flow_run_id: Uuid::new_v4(),
            result_factory,
        }
    }

    /// The ambient flow-run context, if code is running inside one.
    pub fn current() -> Option<Self> {
        FLOW_RUN.try_with(|ctx| ctx.clone()).ok()
    }

    /// Run `fut` with this context as the ambient flow run.
    pub async fn scope<F: std::future::Future>(self, fut: F) -> F::Output {
        FLOW_RUN.scope(self, fut).await
    }
}

/// Ambient context of a running task.
#[derive(Clone)]
pub struct TaskRunContext {
    /// Identifier of the task run.
    pub task_run_id: Uuid,
    /// Parameters the task was invoked with.
    pub parameters: Map<String, Value>,
    /// Factory resolved for this task run.
    pub result_factory: ResultFactory,
}

impl TaskRunContext {
    /// Build a context for a fresh task run.
    pub fn new(result_factory: ResultFactory, parameters: Map<String, Value>) -> Self {
        Self {
            task_run_id: Uuid::new_v4(),
            parameters,
            result_factory,
        }
    }

    /// The ambient task-run context, if code is running inside one.
    pub fn current() -> Option<Self> {
        TASK_RUN.try_with(|ctx| ctx.clone()).ok()
    }

    /// Run `fut` with this context as the ambient task run.
    pub async fn scope<F: std::future::Future>(self, fut: F) -> F::Output {
        TASK_RUN.scope(self, fut).await
    }

    /// Resolve one `{placeholder}` of a storage-key template.
    ///
    /// Supported placeholders: `task_run_id`, `flow_run_id` and
    /// `parameters.<name>`.
    pub(crate) fn storage_key_variable(&self, name: &str) -> Result<String, ResultError> {
        if name == "task_run_id" {
            return Ok(self.task_run_id.simple().to_string());
        }
        if name == "flow_run_id" {
            return FlowRunContext::current()
                .map(|ctx| ctx.flow_run_id.simple().to_string())
                .ok_or_else(|| {
                    ResultError::StorageKey(
                        "storage key template references flow_run_id outside a flow run".to_string(),
                    )
                });
        }
        if let Some(parameter) = name.strip_prefix("parameters.") {
            return match self.parameters.get(parameter) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(other) => Ok(other.to_string()),
                None => Err(ResultError::StorageKey(format!(
                    "storage key template references unknown parameter {parameter:?}"
                ))),
            };
        }
        Err(ResultError::StorageKey(format!(
            "storage key template references unknown variable {name:?}"
        )))
    }
}

//─────────────────────────────
//  Flow / task option carriers
//─────────────────────────────

/// Result-relevant configuration of a flow.
#[derive(Clone)]
pub struct Flow {
    /// Storage override; unset inherits the parent run, then the defaults.
    pub result_storage: Option<ResultStorage>,
    /// Serializer override.
    pub result_serializer: Option<SerializerChoice>,
    /// Persistence override; unset falls back to the ambient default.
    pub persist_result: Option<bool>,
    /// Whether resolved results stay cached in memory.
    pub cache_result_in_memory: bool,
}

impl Default for Flow {
    fn default() -> Self {
        Self {
            result_storage: None,
            result_serializer: None,
            persist_result: None,
            cache_result_in_memory: true,
        }
    }
}

impl Flow {
    /// A flow with every result option left to the defaults.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Result-relevant configuration of a task.
#[derive(Clone)]
pub struct Task {
    /// Storage override; unset inherits the flow run, then the defaults.
    pub result_storage: Option<ResultStorage>,
    /// Serializer override.
    pub result_serializer: Option<SerializerChoice>,
    /// Persistence override.
    pub persist_result: Option<bool>,
    /// Whether resolved results stay cached in memory.
    pub cache_result_in_memory: bool,
    /// Storage-key template, formatted against ambient task-run variables at
    /// call time.
    pub result_storage_key: Option<String>,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            result_storage: None,
            result_serializer: None,
            persist_result: None,
            cache_result_in_memory: true,
            result_storage_key: None,
        }
    }
}

impl Task {
    /// A task with every result option left to the defaults.
    pub fn new() -> Self {
        Self::default()
    }
}
