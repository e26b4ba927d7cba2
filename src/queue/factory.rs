use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::memory::InMemoryQueue;
use super::{Queue, Result};

/// Creates and caches one [`Queue`] per logical queue id.
///
/// All producers and consumers of a queue id share the same instance for the
/// process lifetime.
#[async_trait]
pub trait QueueFactory: Send + Sync {
    async fn get_or_create(&self, queue_id: &str) -> Result<Arc<dyn Queue>>;
}

/// [`QueueFactory`] backed by [`InMemoryQueue`] instances.
pub struct MemoryQueueFactory {
    queues: Mutex<HashMap<String, Arc<InMemoryQueue>>>,
    sweep_interval: Option<Duration>,
}

impl MemoryQueueFactory {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            sweep_interval: None,
        }
    }

    /// Use a custom lease sweep cadence for every created queue.
    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            sweep_interval: Some(sweep_interval),
        }
    }

    /// Close every cached queue, draining their sweep loops.
    pub async fn close_all(&self) {
        let queues: Vec<Arc<InMemoryQueue>> = {
            let mut guard = self.queues.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain().map(|(_, q)| q).collect()
        };
        for queue in queues {
            queue.close().await;
        }
    }
}

impl Default for MemoryQueueFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueFactory for MemoryQueueFactory {
    async fn get_or_create(&self, queue_id: &str) -> Result<Arc<dyn Queue>> {
        let mut guard = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let queue: Arc<dyn Queue> = guard
            .entry(queue_id.to_string())
            .or_insert_with(|| {
                info!(queue = %queue_id, "Creating in-memory queue");
                match self.sweep_interval {
                    Some(interval) => {
                        Arc::new(InMemoryQueue::with_sweep_interval(queue_id, interval))
                    }
                    None => Arc::new(InMemoryQueue::new(queue_id)),
                }
            })
            .clone();
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let factory = MemoryQueueFactory::new();
        let a = factory.get_or_create("jobs").await.unwrap();
        let b = factory.get_or_create("jobs").await.unwrap();
        let other = factory.get_or_create("other").await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
        factory.close_all().await;
    }
}
