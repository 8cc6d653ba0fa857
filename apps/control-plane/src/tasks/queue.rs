use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Window within which a repeated deduplication id is dropped.
pub const DEDUPLICATION_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue {url} does not exist")]
    NoSuchQueue { url: String },
    #[error("queue backend failure: {0}")]
    Backend(String),
    #[error("statistics query for {url} was abandoned")]
    Abandoned { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub queue_url: String,
    pub body: String,
    pub delay_seconds: Option<u32>,
    pub deduplication_id: Option<String>,
    pub group_id: Option<String>,
}

/// Outcome of a send. A deduplicated send carries the original message id and
/// adds nothing to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: String,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueAttributes {
    pub approximate_number_of_messages: u64,
    pub approximate_number_of_messages_delayed: u64,
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn send_message(&self, message: QueueMessage) -> Result<SentMessage, QueueError>;

    async fn queue_attributes(&self, queue_url: &str) -> Result<QueueAttributes, QueueError>;
}

pub fn memory() -> Arc<MemoryQueueBackend> {
    Arc::new(MemoryQueueBackend::default())
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message: QueueMessage,
    visible_at: Instant,
}

#[derive(Default)]
struct MemoryQueueInner {
    queues: HashMap<String, Vec<StoredMessage>>,
    deduplication: HashMap<(String, String), (String, Instant)>,
}

/// Process-local queue pair used when no external queue service is configured.
#[derive(Default)]
pub struct MemoryQueueBackend {
    inner: Mutex<MemoryQueueInner>,
}

impl MemoryQueueBackend {
    pub async fn messages(&self, queue_url: &str) -> Vec<QueueMessage> {
        let inner = self.inner.lock().await;
        inner
            .queues
            .get(queue_url)
            .map(|messages| {
                messages
                    .iter()
                    .map(|stored| stored.message.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Removes and returns the oldest visible message, as an executor would.
    pub async fn receive(&self, queue_url: &str) -> Option<QueueMessage> {
        let mut inner = self.inner.lock().await;
        let messages = inner.queues.get_mut(queue_url)?;
        let now = Instant::now();
        let index = messages
            .iter()
            .position(|stored| stored.visible_at <= now)?;
        Some(messages.remove(index).message)
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn send_message(&self, message: QueueMessage) -> Result<SentMessage, QueueError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner
            .deduplication
            .retain(|_, (_, sent_at)| now.duration_since(*sent_at) < DEDUPLICATION_WINDOW);

        if let Some(deduplication_id) = message.deduplication_id.as_ref() {
            let key = (message.queue_url.clone(), deduplication_id.clone());
            if let Some((message_id, _)) = inner.deduplication.get(&key) {
                return Ok(SentMessage {
                    message_id: message_id.clone(),
                    deduplicated: true,
                });
            }
        }

        let message_id = uuid::Uuid::new_v4().to_string();
        if let Some(deduplication_id) = message.deduplication_id.as_ref() {
            inner.deduplication.insert(
                (message.queue_url.clone(), deduplication_id.clone()),
                (message_id.clone(), now),
            );
        }
        let delay = Duration::from_secs(u64::from(message.delay_seconds.unwrap_or(0)));
        inner
            .queues
            .entry(message.queue_url.clone())
            .or_default()
            .push(StoredMessage {
                message,
                visible_at: now + delay,
            });
        Ok(SentMessage {
            message_id,
            deduplicated: false,
        })
    }

    async fn queue_attributes(&self, queue_url: &str) -> Result<QueueAttributes, QueueError> {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        let mut attributes = QueueAttributes::default();
        for stored in inner.queues.get(queue_url).into_iter().flatten() {
            if stored.visible_at <= now {
                attributes.approximate_number_of_messages += 1;
            } else {
                attributes.approximate_number_of_messages_delayed += 1;
            }
        }
        Ok(attributes)
    }
}
