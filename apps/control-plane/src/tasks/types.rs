use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatch::types::{FunctionTarget, InvocationOptions};

pub const TASK_CATEGORY: &str = "task";
pub const NOT_BEFORE_HEADER: &str = "fx-task-not-before";
pub const TASK_ID_HEADER: &str = "fx-task-id";
pub const TASK_ROUTE_HEADER: &str = "fx-task-route";
pub const TASK_SCHEDULED_AT_HEADER: &str = "fx-task-scheduled-at";

pub const STATUS_TTL_SECONDS: i64 = 24 * 60 * 60;
pub const MAX_QUEUE_DELAY_SECONDS: u32 = 900;
pub const MAX_NOT_BEFORE_AHEAD_SECONDS: i64 = 24 * 60 * 60;
pub const DEFAULT_MAX_RUNNING: u32 = 10;

pub const FIFO_MESSAGE_TYPE: &str = "task";
pub const DELAYED_MESSAGE_TYPE: &str = "delayed-task";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// The persisted status record of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    #[serde(flatten)]
    pub target: FunctionTarget,
    pub task_id: String,
    pub status: TaskState,
    #[serde(default)]
    pub transitions: BTreeMap<TaskState, DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// Fields a writer contributes; `None` keeps whatever was stored before.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatusUpdate {
    pub target: FunctionTarget,
    pub task_id: String,
    pub status: TaskState,
    pub not_before: Option<DateTime<Utc>>,
    pub error: Option<Value>,
    pub output: Option<Value>,
}

impl TaskStatusUpdate {
    #[must_use]
    pub fn new(target: FunctionTarget, task_id: impl Into<String>, status: TaskState) -> Self {
        Self {
            target,
            task_id: task_id.into(),
            status,
            not_before: None,
            error: None,
            output: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfiguration {
    pub url: String,
    pub delayed_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_running: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pending: Option<u32>,
    pub queue: QueueConfiguration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub matching_route_path: String,
    pub ctx: InvocationOptions,
}

/// Queue message body: the task plus the kind of queue it was routed to.
#[derive(Debug, Serialize)]
pub struct TaskMessage<'a> {
    #[serde(flatten)]
    pub task: &'a Task,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatistics {
    pub available_count: u64,
    pub delayed_count: u64,
    pub pending_count: u64,
}
