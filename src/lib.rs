//! Reliable in-process job queue framework.
//!
//! A visibility-timeout queue abstraction with an in-memory reference
//! implementation, a producer that turns queue polling into a continuous
//! stream, and a type-routed consumer that dispatches deserialized payloads
//! to registered handlers under timeout, retry and expiry policy. Delivery
//! is at-least-once: handlers must be idempotent.

mod consumer;
mod handler;
mod job;
mod message_producer;
mod metrics;
mod payload;
mod producer;
pub mod queue;

pub use consumer::{ConsumerError, JobQueueConsumer, POISON_TAG};
pub use handler::{HandlerError, HandlerResult, JobHandler, JobHandlerOptions};
pub use job::Job;
pub use message_producer::{QueueMessageProducer, QueueMessageProducerSettings};
pub use metrics::{percentile, JobHandlerMetrics, MetricsRegistry};
pub use payload::{BoxPayload, Envelope, JobPayloadOptions, PayloadError, PayloadRegistry};
pub use producer::{JobQueueProducer, ProducerError};
pub use queue::{
    InMemoryQueue, MemoryQueueFactory, Queue, QueueError, QueueFactory, QueueMessage,
};
