use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::payload::Envelope;
use crate::queue::{Queue, QueueError, QueueMessage};

/// A delivered message bound to its decoded payload.
///
/// Jobs are created per delivery and live until the dispatch engine acks or
/// drops the underlying message. Handlers see a read-only view plus
/// [`Job::extend_visibility`] for long-running work.
pub struct Job<T> {
    queue: Arc<dyn Queue>,
    message: QueueMessage,
    visibility_timeout: Duration,
    envelope: Envelope,
    payload: T,
}

impl<T> Job<T> {
    pub(crate) fn new(
        queue: Arc<dyn Queue>,
        message: QueueMessage,
        visibility_timeout: Duration,
        envelope: Envelope,
        payload: T,
    ) -> Self {
        Self {
            queue,
            message,
            visibility_timeout,
            envelope,
            payload,
        }
    }

    /// Queue message id.
    pub fn id(&self) -> &str {
        &self.message.id
    }

    /// The lease duration this job was delivered under.
    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// When the job was first enqueued.
    pub fn created(&self) -> DateTime<Utc> {
        self.envelope.created
    }

    /// How many handling attempts have already failed.
    pub fn retries(&self) -> u32 {
        self.envelope.retries
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Push the lease expiry out to now + `visibility_timeout`, without
    /// rewriting the message content. For handlers that outlive the original
    /// lease.
    pub async fn extend_visibility(
        &self,
        visibility_timeout: Duration,
    ) -> Result<(), QueueError> {
        self.queue
            .update_message(&self.message, false, visibility_timeout)
            .await
    }
}
