//! Follow-up tasks in an external task system.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::EscalationError;
use crate::escalation::rules::Priority;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRequest {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait TaskSink: Send + Sync {
    /// False for placeholder implementations; the escalator skips them.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Create a task and return its id.
    async fn create_task(&self, task: &TaskRequest) -> Result<String, EscalationError>;
}

pub struct NoopTaskSink;

#[async_trait]
impl TaskSink for NoopTaskSink {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn create_task(&self, _task: &TaskRequest) -> Result<String, EscalationError> {
        Ok(String::new())
    }
}

/// POSTs the task as JSON and reads `id` from the response.
pub struct HttpTaskSink {
    url: String,
    client: reqwest::Client,
}

impl HttpTaskSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TaskSink for HttpTaskSink {
    async fn create_task(&self, task: &TaskRequest) -> Result<String, EscalationError> {
        let resp = self
            .client
            .post(&self.url)
            .json(task)
            .send()
            .await
            .map_err(|e| EscalationError::Task(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EscalationError::Task(format!(
                "task API returned {status}"
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EscalationError::Task(format!("invalid task API response: {e}")))?;
        let id = match &body["id"] {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => String::new(),
        };
        Ok(id)
    }
}
