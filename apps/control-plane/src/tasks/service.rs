use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rand::Rng;
use tracing::{info, warn};

use super::queue::{QueueBackend, QueueError, QueueMessage};
use super::stats::TaskStatisticsCache;
use super::store::{KeyValueStore, StoreError};
use super::types::{
    DELAYED_MESSAGE_TYPE, FIFO_MESSAGE_TYPE, MAX_NOT_BEFORE_AHEAD_SECONDS, MAX_QUEUE_DELAY_SECONDS,
    NOT_BEFORE_HEADER, QueueConfiguration, STATUS_TTL_SECONDS, TASK_CATEGORY, Task,
    TaskConfiguration, TaskMessage, TaskState, TaskStatistics, TaskStatus, TaskStatusUpdate,
};
use crate::dispatch::types::FunctionTarget;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(
        "the value of the 'fx-task-not-before' header must be epoch time no more than 24 hours in the future"
    )]
    InvalidScheduling,
    #[error("too many pending tasks")]
    TooManyPendingTasks,
    #[error("task {task_id} not found")]
    NotFound { task_id: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("task serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TaskError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidScheduling => "invalid_scheduling",
            Self::TooManyPendingTasks => "too_many_pending_tasks",
            Self::NotFound { .. } => "not_found",
            Self::Store(_) => "task_store_unavailable",
            Self::Queue(_) => "task_queue_unavailable",
            Self::Serialization(_) => "task_serialization_failed",
        }
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidScheduling => 400,
            Self::TooManyPendingTasks => 429,
            Self::NotFound { .. } => 404,
            Self::Store(_) | Self::Queue(_) | Self::Serialization(_) => 500,
        }
    }
}

#[must_use]
pub fn create_task_id() -> String {
    format!("tsk-{}", hex::encode(rand::random::<[u8; 8]>()))
}

#[must_use]
pub fn task_key(target: &FunctionTarget, task_id: &str) -> String {
    format!(
        "{}/{}/{}/{}/{}",
        target.account_id, target.subscription_id, target.boundary_id, target.function_id, task_id
    )
}

fn not_before_seconds(headers: &BTreeMap<String, String>) -> Option<f64> {
    headers
        .get(NOT_BEFORE_HEADER)
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

/// Rejects a not-before header that is not a number or lies more than 24 hours ahead.
pub fn check_not_before(
    headers: &BTreeMap<String, String>,
    now: DateTime<Utc>,
) -> Result<(), TaskError> {
    let Some(raw) = headers.get(NOT_BEFORE_HEADER) else {
        return Ok(());
    };
    let Some(seconds) = raw
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
    else {
        return Err(TaskError::InvalidScheduling);
    };
    let horizon = now.timestamp_millis() + MAX_NOT_BEFORE_AHEAD_SECONDS * 1000;
    if seconds * 1000.0 > horizon as f64 {
        return Err(TaskError::InvalidScheduling);
    }
    Ok(())
}

/// Whole seconds until the not-before time, capped at the queue's maximum delay.
/// `None` when the header is absent or already in the past.
#[must_use]
pub fn get_delay(headers: &BTreeMap<String, String>, now: DateTime<Utc>) -> Option<u32> {
    let not_before_ms = not_before_seconds(headers)? * 1000.0;
    let now_ms = now.timestamp_millis() as f64;
    if now_ms >= not_before_ms {
        return None;
    }
    let delta = ((not_before_ms - now_ms) / 1000.0).floor() as u64;
    Some(delta.min(u64::from(MAX_QUEUE_DELAY_SECONDS)) as u32)
}

fn not_before_time(headers: &BTreeMap<String, String>) -> Option<DateTime<Utc>> {
    let millis = (not_before_seconds(headers)? * 1000.0) as i64;
    Utc.timestamp_millis_opt(millis).single()
}

pub struct TaskScheduler {
    store: Arc<dyn KeyValueStore>,
    queues: Arc<dyn QueueBackend>,
    stats: Arc<TaskStatisticsCache>,
    default_max_running: u32,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        queues: Arc<dyn QueueBackend>,
        stats: Arc<TaskStatisticsCache>,
        default_max_running: u32,
    ) -> Self {
        Self {
            store,
            queues,
            stats,
            default_max_running: default_max_running.max(1),
        }
    }

    pub fn statistics_cache(&self) -> &Arc<TaskStatisticsCache> {
        &self.stats
    }

    /// Records the task as `pending`, then enqueues it. A failed status write
    /// enqueues nothing; a failed enqueue leaves the pending record behind and
    /// a retry with the same task id is deduplicated by the queue.
    pub async fn schedule(
        &self,
        config: &TaskConfiguration,
        task: &Task,
    ) -> Result<TaskStatus, TaskError> {
        let delay_seconds = get_delay(&task.ctx.headers, Utc::now()).filter(|delay| *delay > 0);
        let message = self.build_message(config, task, delay_seconds)?;

        let mut update = TaskStatusUpdate::new(
            task.ctx.target.clone(),
            task.task_id.clone(),
            TaskState::Pending,
        );
        if delay_seconds.is_some() {
            update.not_before = not_before_time(&task.ctx.headers);
        }
        let status = self.update_task_status(update).await?;

        let queue_url = message.queue_url.clone();
        let sent = match self.queues.send_message(message).await {
            Ok(sent) => sent,
            Err(error) => {
                warn!(
                    reason_code = "task_enqueue_failed",
                    account_id = %task.ctx.target.account_id,
                    function_id = %task.ctx.target.function_id,
                    task_id = %task.task_id,
                    error = %error,
                    "task recorded as pending but not enqueued"
                );
                return Err(error.into());
            }
        };
        // A deduplicated send left the queue unchanged.
        if !sent.deduplicated {
            self.stats
                .record_enqueued(&queue_url, delay_seconds.is_some());
        }

        info!(
            account_id = %task.ctx.target.account_id,
            function_id = %task.ctx.target.function_id,
            task_id = %task.task_id,
            route = %task.matching_route_path,
            delay_seconds = delay_seconds.unwrap_or(0),
            "task scheduled"
        );
        Ok(status)
    }

    fn build_message(
        &self,
        config: &TaskConfiguration,
        task: &Task,
        delay_seconds: Option<u32>,
    ) -> Result<QueueMessage, TaskError> {
        if let Some(delay_seconds) = delay_seconds {
            let body = serde_json::to_string(&TaskMessage {
                task,
                kind: DELAYED_MESSAGE_TYPE,
            })?;
            return Ok(QueueMessage {
                queue_url: config.queue.delayed_url.clone(),
                body,
                delay_seconds: Some(delay_seconds),
                deduplication_id: None,
                group_id: None,
            });
        }

        let body = serde_json::to_string(&TaskMessage {
            task,
            kind: FIFO_MESSAGE_TYPE,
        })?;
        let group_id = match config.max_running {
            Some(0) => task.task_id.clone(),
            lanes => {
                let lanes = lanes.unwrap_or(self.default_max_running);
                rand::rng().random_range(0..lanes).to_string()
            }
        };
        Ok(QueueMessage {
            queue_url: config.queue.url.clone(),
            body,
            delay_seconds: None,
            deduplication_id: Some(task.task_id.clone()),
            group_id: Some(group_id),
        })
    }

    /// Fails with `TooManyPendingTasks` once the route's pending count reaches `maxPending`.
    pub async fn admit(&self, config: &TaskConfiguration) -> Result<(), TaskError> {
        let Some(max_pending) = config.max_pending.filter(|max| *max > 0) else {
            return Ok(());
        };
        let stats = self.get_task_statistics(&config.queue).await?;
        if stats.pending_count >= u64::from(max_pending) {
            warn!(
                reason_code = "too_many_pending_tasks",
                queue_url = %config.queue.url,
                max_pending,
                "task admission denied"
            );
            return Err(TaskError::TooManyPendingTasks);
        }
        Ok(())
    }

    pub async fn get_task_statistics(
        &self,
        queue: &QueueConfiguration,
    ) -> Result<TaskStatistics, TaskError> {
        Ok(self.stats.task_statistics(queue).await?)
    }

    pub async fn get_task(
        &self,
        target: &FunctionTarget,
        task_id: &str,
    ) -> Result<Option<TaskStatus>, TaskError> {
        let key = task_key(target, task_id);
        let Some(value) = self.store.get_item(TASK_CATEGORY, &key).await? else {
            return Ok(None);
        };
        let status = serde_json::from_value(value).map_err(|error| StoreError::Corrupt {
            key,
            message: error.to_string(),
        })?;
        Ok(Some(status))
    }

    /// Read-modify-write merge of a status record. The first timestamp seen for a
    /// state is kept, a stored `notBefore` is never replaced, and the TTL is
    /// refreshed on every write.
    pub async fn update_task_status(
        &self,
        update: TaskStatusUpdate,
    ) -> Result<TaskStatus, TaskError> {
        let previous = self.get_task(&update.target, &update.task_id).await?;
        let now = Utc::now();
        let merged = merge_status(previous, update, now);

        let key = task_key(&merged.target, &merged.task_id);
        let ttl = (now + ChronoDuration::seconds(STATUS_TTL_SECONDS)).timestamp();
        self.store
            .put_item(TASK_CATEGORY, &key, serde_json::to_value(&merged)?, Some(ttl))
            .await?;
        Ok(merged)
    }
}

fn merge_status(
    previous: Option<TaskStatus>,
    update: TaskStatusUpdate,
    now: DateTime<Utc>,
) -> TaskStatus {
    let (mut transitions, old_not_before, old_error, old_output) = match previous {
        Some(previous) => (
            previous.transitions,
            previous.not_before,
            previous.error,
            previous.output,
        ),
        None => (BTreeMap::new(), None, None, None),
    };
    transitions.entry(update.status).or_insert(now);
    TaskStatus {
        target: update.target,
        task_id: update.task_id,
        status: update.status,
        transitions,
        not_before: old_not_before.or(update.not_before),
        error: update.error.or(old_error),
        output: update.output.or(old_output),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{Duration, TimeZone, Utc};

    use super::*;

    fn headers(not_before: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(NOT_BEFORE_HEADER.to_string(), not_before.to_string())])
    }

    #[test]
    fn task_ids_are_prefixed_hex() {
        let id = create_task_id();
        let hex = id.strip_prefix("tsk-").unwrap_or_default();
        assert_eq!(hex.len(), 16);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(create_task_id(), id);
    }

    #[test]
    fn delay_is_capped_and_absent_for_past_times() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_default();
        assert_eq!(get_delay(&headers("1700000010"), now), Some(10));
        assert_eq!(get_delay(&headers("1700003600"), now), Some(900));
        assert_eq!(get_delay(&headers("1699999990"), now), None);
        assert_eq!(get_delay(&headers("1700000000"), now), None);
        assert_eq!(get_delay(&BTreeMap::new(), now), None);
    }

    #[test]
    fn not_before_must_be_numeric_and_within_a_day() {
        let now = Utc::now();
        let in_an_hour = (now + Duration::hours(1)).timestamp().to_string();
        let in_two_days = (now + Duration::days(2)).timestamp().to_string();
        assert!(check_not_before(&BTreeMap::new(), now).is_ok());
        assert!(check_not_before(&headers(&in_an_hour), now).is_ok());
        assert!(check_not_before(&headers("1"), now).is_ok());
        assert!(matches!(
            check_not_before(&headers(&in_two_days), now),
            Err(TaskError::InvalidScheduling)
        ));
        assert!(matches!(
            check_not_before(&headers("soon"), now),
            Err(TaskError::InvalidScheduling)
        ));
    }

    #[test]
    fn merge_keeps_first_transition_and_original_not_before() {
        let target = FunctionTarget::new("acc", "sub", "bnd", "fn");
        let first = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_default();
        let later = first + Duration::seconds(30);
        let original_not_before = first + Duration::seconds(60);

        let mut pending = TaskStatusUpdate::new(target.clone(), "tsk-1", TaskState::Pending);
        pending.not_before = Some(original_not_before);
        let stored = merge_status(None, pending, first);

        let mut retried = TaskStatusUpdate::new(target.clone(), "tsk-1", TaskState::Pending);
        retried.not_before = Some(later);
        let stored = merge_status(Some(stored), retried, later);
        assert_eq!(stored.transitions.get(&TaskState::Pending), Some(&first));
        assert_eq!(stored.not_before, Some(original_not_before));

        let mut failed = TaskStatusUpdate::new(target, "tsk-1", TaskState::Failed);
        failed.error = Some(serde_json::json!({"message": "boom"}));
        let stored = merge_status(Some(stored), failed, later);
        assert_eq!(stored.status, TaskState::Failed);
        assert_eq!(stored.transitions.len(), 2);
        assert_eq!(stored.error, Some(serde_json::json!({"message": "boom"})));
    }
}
