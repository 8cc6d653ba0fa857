use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use super::queue::{self, MemoryQueueBackend};
use super::store::{self, KeyValueStore, StoreError};
use super::types::NOT_BEFORE_HEADER;
use super::{
    QueueConfiguration, QueueError, Task, TaskConfiguration, TaskError, TaskScheduler, TaskState,
    TaskStatisticsCache, TaskStatusUpdate, create_task_id,
};
use crate::dispatch::types::{
    CallerContext, FunctionTarget, InvocationOptions, PlatformContext,
};

struct Harness {
    queues: Arc<MemoryQueueBackend>,
    scheduler: TaskScheduler,
}

fn harness() -> Harness {
    harness_with_store(store::memory())
}

fn harness_with_store(store: Arc<dyn KeyValueStore>) -> Harness {
    let queues = queue::memory();
    let stats = Arc::new(TaskStatisticsCache::new(
        queues.clone(),
        Duration::from_secs(2),
    ));
    let scheduler = TaskScheduler::new(store, queues.clone(), stats, 10);
    Harness { queues, scheduler }
}

fn target() -> FunctionTarget {
    FunctionTarget::new("acc-1", "sub-1", "bnd-1", "fn-1")
}

fn config(max_running: Option<u32>, max_pending: Option<u32>) -> TaskConfiguration {
    TaskConfiguration {
        max_running,
        max_pending,
        queue: QueueConfiguration {
            url: "https://queues.local/tasks.fifo".to_string(),
            delayed_url: "https://queues.local/tasks-delayed".to_string(),
        },
    }
}

fn task(task_id: &str, headers: BTreeMap<String, String>) -> Task {
    Task {
        task_id: task_id.to_string(),
        scheduled_at: Utc::now(),
        matching_route_path: "/work".to_string(),
        ctx: InvocationOptions {
            target: target(),
            path: "/work".to_string(),
            method: "POST".to_string(),
            body: json!({"job": 1}),
            headers,
            query: BTreeMap::new(),
            platform: PlatformContext {
                function_access_token: None,
                endpoint: "http://127.0.0.1:4200".to_string(),
            },
            caller: CallerContext::default(),
        },
    }
}

#[tokio::test]
async fn ready_task_is_recorded_then_enqueued_on_fifo() -> Result<()> {
    let harness = harness();
    let config = config(Some(4), None);
    let task_id = create_task_id();

    let status = harness
        .scheduler
        .schedule(&config, &task(&task_id, BTreeMap::new()))
        .await?;
    assert_eq!(status.status, TaskState::Pending);
    assert!(status.transitions.contains_key(&TaskState::Pending));
    assert!(status.not_before.is_none());

    let messages = harness.queues.messages(&config.queue.url).await;
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert_eq!(message.deduplication_id.as_deref(), Some(task_id.as_str()));
    let lane: u32 = message.group_id.as_deref().unwrap_or_default().parse()?;
    assert!(lane < 4);
    assert!(message.delay_seconds.is_none());

    let body: Value = serde_json::from_str(&message.body)?;
    assert_eq!(body["type"], "task");
    assert_eq!(body["taskId"], task_id.as_str());
    assert_eq!(body["matchingRoutePath"], "/work");
    assert_eq!(body["ctx"]["accountId"], "acc-1");

    let stored = harness.scheduler.get_task(&target(), &task_id).await?;
    assert_eq!(stored, Some(status));
    Ok(())
}

#[tokio::test]
async fn unlimited_concurrency_uses_task_id_as_group() -> Result<()> {
    let harness = harness();
    let config = config(Some(0), None);
    harness
        .scheduler
        .schedule(&config, &task("tsk-0000000000000001", BTreeMap::new()))
        .await?;
    let messages = harness.queues.messages(&config.queue.url).await;
    assert_eq!(
        messages[0].group_id.as_deref(),
        Some("tsk-0000000000000001")
    );
    Ok(())
}

#[tokio::test]
async fn rescheduling_the_same_task_enqueues_once() -> Result<()> {
    let harness = harness();
    let config = config(None, None);
    let empty = harness
        .scheduler
        .get_task_statistics(&config.queue)
        .await?;
    assert_eq!(empty.pending_count, 0);

    let first = harness
        .scheduler
        .schedule(&config, &task("tsk-00000000000000aa", BTreeMap::new()))
        .await?;
    let second = harness
        .scheduler
        .schedule(&config, &task("tsk-00000000000000aa", BTreeMap::new()))
        .await?;

    assert_eq!(harness.queues.messages(&config.queue.url).await.len(), 1);
    assert_eq!(
        first.transitions.get(&TaskState::Pending),
        second.transitions.get(&TaskState::Pending)
    );

    // Served from the still-fresh cache entry primed above.
    let stats = harness
        .scheduler
        .get_task_statistics(&config.queue)
        .await?;
    assert_eq!(stats.available_count, 1);
    assert_eq!(stats.pending_count, 1);
    Ok(())
}

#[tokio::test]
async fn future_not_before_routes_to_delayed_queue() -> Result<()> {
    let harness = harness();
    let config = config(Some(2), None);
    let not_before = Utc::now().timestamp() + 10;
    let headers = BTreeMap::from([(NOT_BEFORE_HEADER.to_string(), not_before.to_string())]);

    let status = harness
        .scheduler
        .schedule(&config, &task("tsk-00000000000000bb", headers))
        .await?;
    assert_eq!(
        status.not_before.map(|time| time.timestamp()),
        Some(not_before)
    );

    assert!(harness.queues.messages(&config.queue.url).await.is_empty());
    let delayed = harness.queues.messages(&config.queue.delayed_url).await;
    assert_eq!(delayed.len(), 1);
    let delay = delayed[0].delay_seconds.unwrap_or_default();
    assert!((9..=10).contains(&delay), "delay was {delay}");
    assert!(delayed[0].deduplication_id.is_none());
    assert!(delayed[0].group_id.is_none());
    let body: Value = serde_json::from_str(&delayed[0].body)?;
    assert_eq!(body["type"], "delayed-task");
    Ok(())
}

#[tokio::test]
async fn past_not_before_routes_to_fifo() -> Result<()> {
    let harness = harness();
    let config = config(None, None);
    let headers = BTreeMap::from([(
        NOT_BEFORE_HEADER.to_string(),
        (Utc::now().timestamp() - 30).to_string(),
    )]);
    let status = harness
        .scheduler
        .schedule(&config, &task("tsk-00000000000000cc", headers))
        .await?;
    assert!(status.not_before.is_none());
    assert_eq!(harness.queues.messages(&config.queue.url).await.len(), 1);
    assert!(
        harness
            .queues
            .messages(&config.queue.delayed_url)
            .await
            .is_empty()
    );
    Ok(())
}

#[tokio::test]
async fn admission_rejects_once_max_pending_is_reached() -> Result<()> {
    let harness = harness();
    let config = config(None, Some(1));

    harness.scheduler.admit(&config).await?;
    harness
        .scheduler
        .schedule(&config, &task(&create_task_id(), BTreeMap::new()))
        .await?;

    let denied = harness.scheduler.admit(&config).await;
    assert!(matches!(denied, Err(TaskError::TooManyPendingTasks)));
    if let Err(error) = denied {
        assert_eq!(error.status(), 429);
        assert!(!error.to_string().contains('1'));
    }

    let unlimited = super::TaskConfiguration {
        max_pending: Some(0),
        ..config.clone()
    };
    harness.scheduler.admit(&unlimited).await?;
    Ok(())
}

#[tokio::test]
async fn statistics_count_both_queues() -> Result<()> {
    let harness = harness();
    let config = config(None, None);
    let delayed_headers = BTreeMap::from([(
        NOT_BEFORE_HEADER.to_string(),
        (Utc::now().timestamp() + 120).to_string(),
    )]);
    harness
        .scheduler
        .schedule(&config, &task(&create_task_id(), BTreeMap::new()))
        .await?;
    harness
        .scheduler
        .schedule(&config, &task(&create_task_id(), delayed_headers))
        .await?;

    let stats = harness
        .scheduler
        .get_task_statistics(&config.queue)
        .await?;
    assert_eq!(stats.available_count, 1);
    assert_eq!(stats.delayed_count, 1);
    assert_eq!(stats.pending_count, 2);
    Ok(())
}

#[tokio::test]
async fn executor_updates_merge_into_the_record() -> Result<()> {
    let harness = harness();
    let config = config(None, None);
    let task_id = create_task_id();
    harness
        .scheduler
        .schedule(&config, &task(&task_id, BTreeMap::new()))
        .await?;

    harness
        .scheduler
        .update_task_status(TaskStatusUpdate::new(
            target(),
            task_id.clone(),
            TaskState::Running,
        ))
        .await?;
    let mut success = TaskStatusUpdate::new(target(), task_id.clone(), TaskState::Success);
    success.output = Some(json!({"status": 200, "body": "done"}));
    let status = harness.scheduler.update_task_status(success).await?;

    assert_eq!(status.status, TaskState::Success);
    assert_eq!(status.transitions.len(), 3);
    assert_eq!(status.output, Some(json!({"status": 200, "body": "done"})));
    assert!(
        status.transitions[&TaskState::Pending] <= status.transitions[&TaskState::Running]
    );

    let missing = harness
        .scheduler
        .get_task(&target(), "tsk-ffffffffffffffff")
        .await?;
    assert!(missing.is_none());
    Ok(())
}

struct UnavailableStore;

#[async_trait]
impl KeyValueStore for UnavailableStore {
    async fn get_item(&self, _category: &str, _key: &str) -> Result<Option<Value>, StoreError> {
        Ok(None)
    }

    async fn put_item(
        &self,
        _category: &str,
        _key: &str,
        _value: Value,
        _ttl: Option<i64>,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("table offline".to_string()))
    }
}

#[tokio::test]
async fn failed_status_write_enqueues_nothing() -> Result<()> {
    let harness = harness_with_store(Arc::new(UnavailableStore));
    let config = config(None, None);
    let result = harness
        .scheduler
        .schedule(&config, &task(&create_task_id(), BTreeMap::new()))
        .await;
    assert!(matches!(result, Err(TaskError::Store(_))));
    assert!(harness.queues.messages(&config.queue.url).await.is_empty());
    Ok(())
}

struct RejectingQueues;

#[async_trait]
impl super::QueueBackend for RejectingQueues {
    async fn send_message(
        &self,
        message: super::QueueMessage,
    ) -> Result<super::SentMessage, QueueError> {
        Err(QueueError::NoSuchQueue {
            url: message.queue_url,
        })
    }

    async fn queue_attributes(
        &self,
        _queue_url: &str,
    ) -> Result<super::QueueAttributes, QueueError> {
        Ok(super::QueueAttributes::default())
    }
}

#[tokio::test]
async fn failed_enqueue_leaves_pending_record() -> Result<()> {
    let queues: Arc<dyn super::QueueBackend> = Arc::new(RejectingQueues);
    let stats = Arc::new(TaskStatisticsCache::new(
        queues.clone(),
        Duration::from_secs(2),
    ));
    let scheduler = TaskScheduler::new(store::memory(), queues, stats, 10);
    let task_id = create_task_id();

    let result = scheduler
        .schedule(&config(None, None), &task(&task_id, BTreeMap::new()))
        .await;
    assert!(matches!(result, Err(TaskError::Queue(_))));

    let orphan = scheduler.get_task(&target(), &task_id).await?;
    assert_eq!(orphan.map(|status| status.status), Some(TaskState::Pending));
    Ok(())
}
