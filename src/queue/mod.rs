pub mod factory;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

pub use factory::{MemoryQueueFactory, QueueFactory};
pub use memory::InMemoryQueue;

/// Error type for queue operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Queue is closed")]
    Closed,

    #[error("Queue backend unavailable: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// A raw message held by a queue.
///
/// The queue owns the message while it is leased; callers reference it by id
/// when deleting or updating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub content: Vec<u8>,
}

impl QueueMessage {
    pub(crate) fn new(content: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content,
        }
    }
}

/// Visibility-timeout message queue contract.
///
/// Any backend (the in-memory reference implementation or a durable cloud
/// queue) must provide these four operations with lease semantics: a message
/// delivered with a visibility timeout is hidden from other receivers until
/// the lease expires, is deleted, or is explicitly updated.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Logical queue id this instance was created for.
    fn id(&self) -> &str;

    /// Append a message. With `initial_visibility_delay` the message only
    /// becomes visible after the delay elapses.
    async fn add_message(
        &self,
        content: Vec<u8>,
        initial_visibility_delay: Option<Duration>,
    ) -> Result<QueueMessage>;

    /// Receive up to `count` visible messages, blocking up to `poll_timeout`.
    ///
    /// Each delivered message is atomically removed from the visible set.
    /// With `visibility_timeout` set the message becomes a lease that expires
    /// at now + timeout; without it the message is gone on receipt and can
    /// never be redelivered. A timeout with nothing available returns an
    /// empty vec, not an error.
    async fn get_messages(
        &self,
        count: usize,
        visibility_timeout: Option<Duration>,
        poll_timeout: Duration,
    ) -> Result<Vec<QueueMessage>>;

    /// Permanently remove a message (acknowledgement).
    async fn delete_message(&self, message: &QueueMessage) -> Result<()>;

    /// While leased, replace the message content (if `update_content`) and
    /// reset the lease expiry to now + `visibility_timeout`.
    async fn update_message(
        &self,
        message: &QueueMessage,
        update_content: bool,
        visibility_timeout: Duration,
    ) -> Result<()>;
}
