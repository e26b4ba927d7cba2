use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::payload::{Envelope, JobPayloadOptions, PayloadError, PayloadRegistry};
use crate::queue::{Queue, QueueError};

/// Error type for the enqueue side
#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Enqueue-side API: wraps a payload and its policy options into a persisted
/// envelope on the queue.
///
/// The payload type must be registered (with its tag) in the shared
/// [`PayloadRegistry`] before jobs are added.
pub struct JobQueueProducer {
    queue: Arc<dyn Queue>,
    registry: Arc<PayloadRegistry>,
}

impl JobQueueProducer {
    pub fn new(queue: Arc<dyn Queue>, registry: Arc<PayloadRegistry>) -> Self {
        Self { queue, registry }
    }

    /// Serialize `payload` into an envelope and enqueue it. Returns the
    /// queue message id.
    pub async fn add_job<T>(
        &self,
        payload: &T,
        options: Option<JobPayloadOptions>,
    ) -> Result<String, ProducerError>
    where
        T: Serialize + 'static,
    {
        let (tag, body) = self.registry.serialize(payload)?;
        let delay = options
            .as_ref()
            .and_then(|o| o.initial_visibility_delay);
        let envelope = Envelope::new(tag, body, options);

        let message = self
            .queue
            .add_message(envelope.to_bytes()?, delay)
            .await?;

        debug!(
            queue = %self.queue.id(),
            message_id = %message.id,
            tag = %envelope.tag_type,
            "Job enqueued"
        );
        Ok(message.id)
    }
}
