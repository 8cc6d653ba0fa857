//! Short-lived cache of queue depths used for admission control.
//!
//! Each queue URL has at most one depth query in flight per process. Callers that
//! arrive while a query is running park on a oneshot channel and receive the
//! leader's result, success or failure. Only successes are cached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use super::queue::{QueueAttributes, QueueBackend, QueueError};
use super::types::{QueueConfiguration, TaskStatistics};

type Waiter = oneshot::Sender<Result<QueueAttributes, QueueError>>;

enum Slot {
    Ready {
        attributes: QueueAttributes,
        expires_at: Instant,
    },
    InFlight(Vec<Waiter>),
}

pub struct TaskStatisticsCache {
    queues: Arc<dyn QueueBackend>,
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl TaskStatisticsCache {
    pub fn new(queues: Arc<dyn QueueBackend>, ttl: Duration) -> Self {
        Self {
            queues,
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Depths of both queues of a task route, combined the way admission control counts them.
    pub async fn task_statistics(
        &self,
        queue: &QueueConfiguration,
    ) -> Result<TaskStatistics, QueueError> {
        let (fifo, delayed) = tokio::try_join!(
            self.queue_attributes(&queue.url),
            self.queue_attributes(&queue.delayed_url)
        )?;
        let available_count = fifo.approximate_number_of_messages
            + delayed.approximate_number_of_messages;
        let delayed_count = delayed.approximate_number_of_messages_delayed;
        Ok(TaskStatistics {
            available_count,
            delayed_count,
            pending_count: available_count + delayed_count,
        })
    }

    pub async fn queue_attributes(&self, queue_url: &str) -> Result<QueueAttributes, QueueError> {
        let follower = {
            let mut slots = self.lock_slots();
            match slots.get_mut(queue_url) {
                Some(Slot::Ready {
                    attributes,
                    expires_at,
                }) if *expires_at > Instant::now() => return Ok(*attributes),
                Some(Slot::InFlight(waiters)) => {
                    let (sender, receiver) = oneshot::channel();
                    waiters.push(sender);
                    Some(receiver)
                }
                _ => {
                    slots.insert(queue_url.to_string(), Slot::InFlight(Vec::new()));
                    None
                }
            }
        };

        if let Some(receiver) = follower {
            return receiver.await.unwrap_or_else(|_| {
                Err(QueueError::Abandoned {
                    url: queue_url.to_string(),
                })
            });
        }

        let query = InFlightQuery {
            cache: self,
            queue_url,
            settled: false,
        };
        debug!(queue_url, "querying queue depth");
        let result = self.queues.queue_attributes(queue_url).await;
        query.settle(&result);
        result
    }

    /// Counts a message this process just enqueued against a still-fresh entry, so a
    /// burst of schedules inside one TTL window sees its own writes.
    pub fn record_enqueued(&self, queue_url: &str, delayed: bool) {
        let mut slots = self.lock_slots();
        if let Some(Slot::Ready {
            attributes,
            expires_at,
        }) = slots.get_mut(queue_url)
        {
            if *expires_at <= Instant::now() {
                return;
            }
            if delayed {
                attributes.approximate_number_of_messages_delayed += 1;
            } else {
                attributes.approximate_number_of_messages += 1;
            }
        }
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.lock_slots();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Ready { expires_at, .. } => *expires_at > now,
            Slot::InFlight(_) => true,
        });
        before - slots.len()
    }

    pub fn cached_urls(&self) -> usize {
        self.lock_slots().len()
    }

    /// Purges expired entries every `interval` until the cache is dropped.
    pub fn spawn_sweeper(cache: Weak<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(purged, "purged expired queue statistics");
                }
            }
        })
    }
}

/// Held by the caller that issued the upstream query. Dropping it unsettled
/// (the leader was cancelled) releases every follower with `Abandoned`.
struct InFlightQuery<'a> {
    cache: &'a TaskStatisticsCache,
    queue_url: &'a str,
    settled: bool,
}

impl InFlightQuery<'_> {
    fn settle(mut self, result: &Result<QueueAttributes, QueueError>) {
        self.settled = true;
        let previous = {
            let mut slots = self.cache.lock_slots();
            match result {
                Ok(attributes) => slots.insert(
                    self.queue_url.to_string(),
                    Slot::Ready {
                        attributes: *attributes,
                        expires_at: Instant::now() + self.cache.ttl,
                    },
                ),
                Err(_) => slots.remove(self.queue_url),
            }
        };
        if let Some(Slot::InFlight(waiters)) = previous {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }
}

impl Drop for InFlightQuery<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let previous = self.cache.lock_slots().remove(self.queue_url);
        if let Some(Slot::InFlight(waiters)) = previous {
            for waiter in waiters {
                let _ = waiter.send(Err(QueueError::Abandoned {
                    url: self.queue_url.to_string(),
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;

    use super::TaskStatisticsCache;
    use crate::tasks::queue::{
        QueueAttributes, QueueBackend, QueueError, QueueMessage, SentMessage,
    };
    use crate::tasks::types::QueueConfiguration;

    #[derive(Default)]
    struct SlowQueues {
        queries: AtomicUsize,
        failing: AtomicBool,
    }

    #[async_trait]
    impl QueueBackend for SlowQueues {
        async fn send_message(&self, _message: QueueMessage) -> Result<SentMessage, QueueError> {
            Ok(SentMessage {
                message_id: "msg".to_string(),
                deduplicated: false,
            })
        }

        async fn queue_attributes(&self, queue_url: &str) -> Result<QueueAttributes, QueueError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.failing.load(Ordering::SeqCst) {
                return Err(QueueError::Backend(format!("throttled on {queue_url}")));
            }
            Ok(QueueAttributes {
                approximate_number_of_messages: 2,
                approximate_number_of_messages_delayed: 3,
            })
        }
    }

    fn queue_pair() -> QueueConfiguration {
        QueueConfiguration {
            url: "fifo".to_string(),
            delayed_url: "delayed".to_string(),
        }
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_query_per_url() -> Result<()> {
        let queues = Arc::new(SlowQueues::default());
        let cache = Arc::new(TaskStatisticsCache::new(
            queues.clone(),
            Duration::from_secs(2),
        ));
        let queue = queue_pair();

        let callers = (0..8).map(|_| cache.task_statistics(&queue));
        let results = futures::future::join_all(callers).await;

        assert_eq!(queues.queries.load(Ordering::SeqCst), 2);
        for result in results {
            let stats = result?;
            assert_eq!(stats.available_count, 4);
            assert_eq!(stats.delayed_count, 3);
            assert_eq!(stats.pending_count, 7);
        }

        cache.task_statistics(&queue).await?;
        assert_eq!(queues.queries.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn failures_reach_every_caller_and_are_not_cached() -> Result<()> {
        let queues = Arc::new(SlowQueues::default());
        queues.failing.store(true, Ordering::SeqCst);
        let cache = TaskStatisticsCache::new(queues.clone(), Duration::from_secs(2));

        let (first, second) = tokio::join!(
            cache.queue_attributes("fifo"),
            cache.queue_attributes("fifo")
        );
        assert!(matches!(first, Err(QueueError::Backend(_))));
        assert!(matches!(second, Err(QueueError::Backend(_))));
        assert_eq!(queues.queries.load(Ordering::SeqCst), 1);
        assert_eq!(cache.cached_urls(), 0);

        queues.failing.store(false, Ordering::SeqCst);
        cache.queue_attributes("fifo").await?;
        assert_eq!(queues.queries.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn expired_entries_are_requeried_and_purged() -> Result<()> {
        let queues = Arc::new(SlowQueues::default());
        let cache = Arc::new(TaskStatisticsCache::new(
            queues.clone(),
            Duration::from_millis(20),
        ));

        cache.queue_attributes("fifo").await?;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.purge_expired(), 1);
        cache.queue_attributes("fifo").await?;
        assert_eq!(queues.queries.load(Ordering::SeqCst), 2);

        let sweeper =
            TaskStatisticsCache::spawn_sweeper(Arc::downgrade(&cache), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.cached_urls(), 0);
        sweeper.abort();
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_leader_releases_followers() -> Result<()> {
        let queues = Arc::new(SlowQueues::default());
        let cache = Arc::new(TaskStatisticsCache::new(queues, Duration::from_secs(2)));

        let leader = tokio::spawn({
            let cache = cache.clone();
            async move { cache.queue_attributes("fifo").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = tokio::spawn({
            let cache = cache.clone();
            async move { cache.queue_attributes("fifo").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        let result = follower.await?;
        assert!(matches!(result, Err(QueueError::Abandoned { .. })));
        assert_eq!(cache.cached_urls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn enqueued_messages_bump_fresh_entries() -> Result<()> {
        let queues = Arc::new(SlowQueues::default());
        let cache = TaskStatisticsCache::new(queues, Duration::from_secs(2));
        let queue = queue_pair();

        let before = cache.task_statistics(&queue).await?;
        cache.record_enqueued("fifo", false);
        cache.record_enqueued("delayed", true);
        let after = cache.task_statistics(&queue).await?;
        assert_eq!(after.available_count, before.available_count + 1);
        assert_eq!(after.delayed_count, before.delayed_count + 1);
        Ok(())
    }
}
