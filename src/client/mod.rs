//! Client API: starting, signalling and observing workflow instances.
//!
//! The client talks only to the shared backend, never to a runtime, so it
//! can run in any process — including one without workers.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::providers::{Backend, BackendError, InstanceRef, InstanceTreeNode};
use crate::{
    Codec, EventAttributes, HistoryEvent, Json, WorkflowError, WorkflowInstance, CANCEL_SIGNAL,
};

// Polling behavior of wait_for_workflow.
const INITIAL_POLL_DELAY: Duration = Duration::from_millis(5);
const MAX_POLL_DELAY: Duration = Duration::from_millis(100);

/// Terminal and non-terminal instance states derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { error: WorkflowError },
}

/// Client-side failure classification.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("workflow instance {0} not found")]
    InstanceNotFound(String),
    #[error("workflow instance {0} is still running")]
    StillRunning(String),
    #[error("workflow failed: {error}")]
    WorkflowFailed { error: WorkflowError },
    #[error("timed out waiting for workflow")]
    Timeout,
    #[error("serialization failure: {0}")]
    Serialization(String),
    #[error("backend does not expose diagnostics")]
    DiagnosticsNotAvailable,
}

/// Handle for control-plane operations against one backend.
#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn Backend>,
}

impl Client {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Create a workflow instance and enqueue its first task. The execution
    /// id is generated; the returned identity names this exact execution.
    pub async fn start_workflow<I: Serialize>(
        &self,
        instance_id: impl Into<String>,
        workflow_name: &str,
        input: I,
    ) -> Result<WorkflowInstance, ClientError> {
        let input = Json::encode(&input).map_err(ClientError::Serialization)?;
        let instance = WorkflowInstance::new(instance_id, uuid::Uuid::new_v4().to_string());
        let started = HistoryEvent::pending(
            None,
            EventAttributes::WorkflowExecutionStarted {
                name: workflow_name.to_string(),
                input,
                parent_instance_id: None,
                parent_execution_id: None,
                parent_schedule_event_id: None,
            },
        );
        self.backend
            .create_workflow_instance(instance.clone(), started)
            .await?;
        debug!(
            instance_id = %instance.instance_id,
            execution_id = %instance.execution_id,
            workflow_name,
            "workflow instance created"
        );
        Ok(instance)
    }

    /// Deliver a signal to the latest execution of `instance_id`.
    pub async fn signal_workflow<I: Serialize>(
        &self,
        instance_id: &str,
        signal_name: &str,
        payload: I,
    ) -> Result<(), ClientError> {
        let input = Json::encode(&payload).map_err(ClientError::Serialization)?;
        let event = HistoryEvent::pending(
            None,
            EventAttributes::SignalReceived {
                name: signal_name.to_string(),
                input,
            },
        );
        self.backend.signal_workflow(instance_id, event).await?;
        Ok(())
    }

    /// Request cancellation. Delivered on the reserved cancel channel; the
    /// workflow observes it at its next suspension point and decides how to
    /// wind down.
    pub async fn cancel_workflow_instance(&self, instance_id: &str) -> Result<(), ClientError> {
        self.signal_workflow(instance_id, CANCEL_SIGNAL, "canceled")
            .await
    }

    /// Status of the latest execution, derived from its history.
    pub async fn get_workflow_status(
        &self,
        instance_id: &str,
    ) -> Result<WorkflowStatus, ClientError> {
        let Some(instance) = self.backend.latest_execution(instance_id).await? else {
            return Ok(WorkflowStatus::NotFound);
        };
        let history = match self.backend.read_history(&instance).await {
            Ok(history) => history,
            Err(BackendError::InstanceNotFound(_)) => return Ok(WorkflowStatus::NotFound),
            Err(e) => return Err(e.into()),
        };
        for event in history.iter().rev() {
            if let EventAttributes::WorkflowExecutionFinished { result, error } = &event.attributes
            {
                return Ok(match error {
                    Some(error) => WorkflowStatus::Failed {
                        error: error.clone(),
                    },
                    None => WorkflowStatus::Completed {
                        output: result.clone().unwrap_or_default(),
                    },
                });
            }
        }
        Ok(WorkflowStatus::Running)
    }

    /// Decoded result of a finished workflow.
    pub async fn get_workflow_result<T: DeserializeOwned>(
        &self,
        instance_id: &str,
    ) -> Result<T, ClientError> {
        match self.get_workflow_status(instance_id).await? {
            WorkflowStatus::NotFound => {
                Err(ClientError::InstanceNotFound(instance_id.to_string()))
            }
            WorkflowStatus::Running => Err(ClientError::StillRunning(instance_id.to_string())),
            WorkflowStatus::Failed { error } => Err(ClientError::WorkflowFailed { error }),
            WorkflowStatus::Completed { output } => {
                Json::decode(&output).map_err(ClientError::Serialization)
            }
        }
    }

    /// Poll with backoff until the workflow finishes; decode its result.
    pub async fn wait_for_workflow<T: DeserializeOwned>(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<T, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = INITIAL_POLL_DELAY;
        loop {
            match self.get_workflow_status(instance_id).await? {
                WorkflowStatus::Completed { output } => {
                    return Json::decode(&output).map_err(ClientError::Serialization);
                }
                WorkflowStatus::Failed { error } => {
                    return Err(ClientError::WorkflowFailed { error });
                }
                WorkflowStatus::NotFound | WorkflowStatus::Running => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_POLL_DELAY);
        }
    }

    /// Delete a finished instance after retention.
    pub async fn remove_workflow_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<(), ClientError> {
        self.backend.remove_workflow_instance(instance).await?;
        Ok(())
    }

    /// Full history of one execution.
    pub async fn read_history(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<Vec<HistoryEvent>, ClientError> {
        Ok(self.backend.read_history(instance).await?)
    }

    /// Latest execution identity of an instance id.
    pub async fn latest_execution(
        &self,
        instance_id: &str,
    ) -> Result<Option<WorkflowInstance>, ClientError> {
        Ok(self.backend.latest_execution(instance_id).await?)
    }

    // ===== Diagnostics =====

    /// Page instances by descending creation time.
    pub async fn list_instances(
        &self,
        after: Option<&WorkflowInstance>,
        count: usize,
    ) -> Result<Vec<InstanceRef>, ClientError> {
        let diagnostics = self
            .backend
            .as_diagnostics()
            .ok_or(ClientError::DiagnosticsNotAvailable)?;
        Ok(diagnostics.list_instances(after, count).await?)
    }

    /// Diagnostics view of the latest execution of one instance.
    pub async fn get_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceRef>, ClientError> {
        let diagnostics = self
            .backend
            .as_diagnostics()
            .ok_or(ClientError::DiagnosticsNotAvailable)?;
        Ok(diagnostics.get_instance(instance_id).await?)
    }

    /// Sub-workflow tree rooted at `instance_id`.
    pub async fn get_instance_tree(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceTreeNode>, ClientError> {
        let diagnostics = self
            .backend
            .as_diagnostics()
            .ok_or(ClientError::DiagnosticsNotAvailable)?;
        Ok(diagnostics.get_instance_tree(instance_id).await?)
    }
}
