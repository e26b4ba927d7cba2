use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Queue, QueueError, QueueMessage, Result};

/// Default cadence of the lease-expiry sweep.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on a single blocking wait inside `get_messages`, so a missed
/// wakeup can never stall a receiver past this.
const POLL_SLICE: Duration = Duration::from_millis(25);

struct Lease {
    message: QueueMessage,
    visible_at: Instant,
}

#[derive(Default)]
struct State {
    visible: VecDeque<QueueMessage>,
    delayed: Vec<Lease>,
    leases: HashMap<String, Lease>,
}

impl State {
    /// Move due delayed messages into the visible set. Returns how many moved.
    fn promote_delayed(&mut self, now: Instant) -> usize {
        let mut moved = 0;
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].visible_at <= now {
                let lease = self.delayed.swap_remove(i);
                self.visible.push_back(lease.message);
                moved += 1;
            } else {
                i += 1;
            }
        }
        moved
    }

    /// Return expired leases to the tail of the visible set.
    fn expire_leases(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.visible_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let moved = expired.len();
        for id in expired {
            if let Some(lease) = self.leases.remove(&id) {
                self.visible.push_back(lease.message);
            }
        }
        moved
    }
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

/// In-memory reference implementation of the [`Queue`] contract.
///
/// Holds no persistence across restarts. A background sweep runs for the
/// lifetime of the queue, returning expired leases to the visible set; that
/// sweep is the sole at-least-once redelivery mechanism after a consumer
/// crash or an unacknowledged timeout.
pub struct InMemoryQueue {
    id: String,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryQueue {
    /// Create a queue with the default 1s lease sweep cadence.
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self::with_sweep_interval(id, DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a queue with a custom sweep cadence.
    pub fn with_sweep_interval<S: Into<String>>(id: S, sweep_interval: Duration) -> Self {
        let id = id.into();
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        });
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(Self::run_sweep(
            id.clone(),
            Arc::clone(&shared),
            sweep_interval,
            shutdown.clone(),
        ));

        Self {
            id,
            shared,
            shutdown,
            sweep_handle: Mutex::new(Some(handle)),
        }
    }

    /// Run the lease sweep until shutdown is signaled.
    async fn run_sweep(
        id: String,
        shared: Arc<Shared>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        debug!(queue = %id, "Lease sweep started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(queue = %id, "Lease sweep shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let moved = {
                let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                state.promote_delayed(now) + state.expire_leases(now)
            };

            if moved > 0 {
                debug!(queue = %id, count = moved, "Returned messages to visible set");
                shared.notify.notify_waiters();
            }
        }
    }

    /// Signal the sweep loop and wait for it to finish.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = {
            let mut guard = self
                .sweep_handle
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(queue = %self.id, "Queue closed");
    }

    fn take_visible(
        &self,
        count: usize,
        visibility_timeout: Option<Duration>,
    ) -> Vec<QueueMessage> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let now = Instant::now();
        // Promote inline as well, so short visibility delays are honored with
        // better precision than the sweep cadence.
        state.promote_delayed(now);

        let mut batch = Vec::new();
        while batch.len() < count {
            let Some(message) = state.visible.pop_front() else {
                break;
            };
            if let Some(timeout) = visibility_timeout {
                state.leases.insert(
                    message.id.clone(),
                    Lease {
                        message: message.clone(),
                        visible_at: now + timeout,
                    },
                );
            }
            batch.push(message);
        }
        batch
    }
}

impl Drop for InMemoryQueue {
    /// Stops the sweep loop even when `close` was never called.
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait::async_trait]
impl Queue for InMemoryQueue {
    fn id(&self) -> &str {
        &self.id
    }

    async fn add_message(
        &self,
        content: Vec<u8>,
        initial_visibility_delay: Option<Duration>,
    ) -> Result<QueueMessage> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::Closed);
        }

        let message = QueueMessage::new(content);
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match initial_visibility_delay {
                Some(delay) => state.delayed.push(Lease {
                    message: message.clone(),
                    visible_at: Instant::now() + delay,
                }),
                None => state.visible.push_back(message.clone()),
            }
        }

        if initial_visibility_delay.is_none() {
            self.shared.notify.notify_waiters();
        }

        debug!(queue = %self.id, message_id = %message.id, "Message added");
        Ok(message)
    }

    async fn get_messages(
        &self,
        count: usize,
        visibility_timeout: Option<Duration>,
        poll_timeout: Duration,
    ) -> Result<Vec<QueueMessage>> {
        let deadline = Instant::now() + poll_timeout;

        loop {
            let batch = self.take_visible(count, visibility_timeout);
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let wait = (deadline - now).min(POLL_SLICE);
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(Vec::new()),
                _ = self.shared.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn delete_message(&self, message: &QueueMessage) -> Result<()> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if state.leases.remove(&message.id).is_some() {
            return Ok(());
        }
        if let Some(pos) = state.visible.iter().position(|m| m.id == message.id) {
            state.visible.remove(pos);
            return Ok(());
        }
        if let Some(pos) = state.delayed.iter().position(|l| l.message.id == message.id) {
            state.delayed.swap_remove(pos);
            return Ok(());
        }

        Err(QueueError::MessageNotFound(message.id.clone()))
    }

    async fn update_message(
        &self,
        message: &QueueMessage,
        update_content: bool,
        visibility_timeout: Duration,
    ) -> Result<()> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let lease = state
            .leases
            .get_mut(&message.id)
            .ok_or_else(|| QueueError::MessageNotFound(message.id.clone()))?;

        if update_content {
            lease.message.content = message.content.clone();
        }
        lease.visible_at = Instant::now() + visibility_timeout;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> InMemoryQueue {
        InMemoryQueue::with_sweep_interval("test", Duration::from_millis(50))
    }

    #[tokio::test]
    async fn message_is_immediately_visible() {
        let q = queue();
        let added = q.add_message(b"a".to_vec(), None).await.unwrap();

        let got = q
            .get_messages(5, Some(Duration::from_secs(60)), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, added.id);
        q.close().await;
    }

    #[tokio::test]
    async fn initial_visibility_delay_defers_delivery() {
        let q = queue();
        q.add_message(b"a".to_vec(), Some(Duration::from_millis(300)))
            .await
            .unwrap();

        let got = q
            .get_messages(1, None, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(got.is_empty());

        let got = q
            .get_messages(1, None, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        q.close().await;
    }

    #[tokio::test]
    async fn leased_message_is_invisible_until_expiry() {
        let q = queue();
        q.add_message(b"a".to_vec(), None).await.unwrap();

        let first = q
            .get_messages(1, Some(Duration::from_millis(200)), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // Lease outstanding: nothing to receive.
        let none = q
            .get_messages(1, Some(Duration::from_secs(60)), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(none.is_empty());

        // After expiry the sweep returns the message.
        let redelivered = q
            .get_messages(1, Some(Duration::from_secs(60)), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].id, first[0].id);
        q.close().await;
    }

    #[tokio::test]
    async fn delete_prevents_redelivery() {
        let q = queue();
        q.add_message(b"a".to_vec(), None).await.unwrap();

        let got = q
            .get_messages(1, Some(Duration::from_millis(100)), Duration::from_millis(500))
            .await
            .unwrap();
        q.delete_message(&got[0]).await.unwrap();

        let none = q
            .get_messages(1, None, Duration::from_millis(400))
            .await
            .unwrap();
        assert!(none.is_empty());
        q.close().await;
    }

    #[tokio::test]
    async fn no_visibility_timeout_means_fire_and_forget() {
        let q = queue();
        q.add_message(b"a".to_vec(), None).await.unwrap();

        let got = q
            .get_messages(1, None, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);

        // Never redelivered, and deleting it reports not-found.
        let none = q
            .get_messages(1, None, Duration::from_millis(300))
            .await
            .unwrap();
        assert!(none.is_empty());
        assert!(matches!(
            q.delete_message(&got[0]).await,
            Err(QueueError::MessageNotFound(_))
        ));
        q.close().await;
    }

    #[tokio::test]
    async fn update_replaces_content_and_extends_lease() {
        let q = queue();
        q.add_message(b"old".to_vec(), None).await.unwrap();

        let mut got = q
            .get_messages(1, Some(Duration::from_millis(150)), Duration::from_millis(500))
            .await
            .unwrap()
            .remove(0);

        got.content = b"new".to_vec();
        q.update_message(&got, true, Duration::from_millis(300))
            .await
            .unwrap();

        let redelivered = q
            .get_messages(1, None, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].content, b"new".to_vec());
        q.close().await;
    }

    #[tokio::test]
    async fn dropping_a_queue_stops_its_sweep() {
        let q = queue();
        let shutdown = q.shutdown.clone();

        drop(q);
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn concurrent_receivers_never_share_a_message() {
        let q = Arc::new(queue());
        for i in 0..20u8 {
            q.add_message(vec![i], None).await.unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&q);
            tasks.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                loop {
                    let got = q
                        .get_messages(3, Some(Duration::from_secs(60)), Duration::from_millis(200))
                        .await
                        .unwrap();
                    if got.is_empty() {
                        break;
                    }
                    seen.extend(got.into_iter().map(|m| m.id));
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        all.sort();
        let before = all.len();
        all.dedup();
        assert_eq!(before, 20);
        assert_eq!(all.len(), 20);
        q.close().await;
    }
}
