use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handler::{FnJobHandler, HandlerResult, JobHandler, JobHandlerOptions};
use crate::job::Job;
use crate::message_producer::{QueueMessageProducer, QueueMessageProducerSettings};
use crate::metrics::{JobHandlerMetrics, MetricsRegistry};
use crate::payload::{BoxPayload, Envelope, PayloadError, PayloadRegistry};
use crate::queue::{Queue, QueueError, QueueMessage};

/// Metrics tag under which undecodable (poison) messages are recorded.
pub const POISON_TAG: &str = "job_payload_error";

/// Error type for consumer configuration
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Handler already registered for tag '{0}'")]
    HandlerAlreadyRegistered(String),

    #[error("Consumer already started")]
    AlreadyStarted,

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// A decoded delivery on its way to a handler pipeline.
struct DecodedJob {
    message: QueueMessage,
    visibility_timeout: Duration,
    envelope: Envelope,
    payload: BoxPayload,
}

struct PipelineHandle {
    sender: UnboundedSender<DecodedJob>,
    depth: Arc<AtomicUsize>,
}

/// Type-routed dispatch engine.
///
/// Deserializes envelopes from a [`QueueMessageProducer`] stream, fans each
/// job out to the single handler pipeline registered for its payload tag,
/// and applies timeout/retry/expiry policy per dispatch. Handler failures
/// never escape the per-job boundary; queue backend failures fault the
/// producer loop and surface through [`fault`](Self::fault) and the return
/// value of [`shutdown`](Self::shutdown).
pub struct JobQueueConsumer {
    queue: Arc<dyn Queue>,
    registry: Arc<PayloadRegistry>,
    metrics: Arc<MetricsRegistry>,
    pipelines: Arc<Mutex<HashMap<String, PipelineHandle>>>,
    shutdown: CancellationToken,
    producer: Mutex<Option<Arc<QueueMessageProducer>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueueConsumer {
    pub fn new(queue: Arc<dyn Queue>, registry: Arc<PayloadRegistry>) -> Self {
        Self {
            queue,
            registry,
            metrics: Arc::new(MetricsRegistry::new()),
            pipelines: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            producer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler pipeline for payload type `T` under `tag`.
    ///
    /// Exactly one pipeline may exist per tag; a colliding registration is a
    /// configuration error.
    pub fn register_job_handler<T, H>(&self, tag: &str, handler: H) -> Result<(), ConsumerError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        H: JobHandler<T>,
    {
        self.registry.register::<T>(tag)?;

        let options = handler.options();
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));

        {
            let mut pipelines = self
                .pipelines
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if pipelines.contains_key(tag) {
                return Err(ConsumerError::HandlerAlreadyRegistered(tag.to_string()));
            }
            pipelines.insert(
                tag.to_string(),
                PipelineHandle {
                    sender,
                    depth: Arc::clone(&depth),
                },
            );
        }

        let context = DispatchContext {
            tag: tag.to_string(),
            handler: Arc::new(handler) as Arc<dyn JobHandler<T>>,
            options,
            queue: Arc::clone(&self.queue),
            metrics: Arc::clone(&self.metrics),
            depth,
            shutdown: self.shutdown.clone(),
        };

        let task = tokio::spawn(run_pipeline(context, receiver));
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);

        info!(tag = %tag, queue = %self.queue.id(), "Job handler registered");
        Ok(())
    }

    /// Closure form of [`register_job_handler`](Self::register_job_handler):
    /// the handler receives the decoded payload and the cancellation token.
    pub fn register_job_handler_fn<T, F, Fut>(
        &self,
        tag: &str,
        options: JobHandlerOptions,
        handler: F,
    ) -> Result<(), ConsumerError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_job_handler(tag, FnJobHandler::new(handler, options))
    }

    /// Start polling the queue and dispatching jobs.
    pub fn start(&self, settings: QueueMessageProducerSettings) -> Result<(), ConsumerError> {
        let producer = {
            let mut guard = self.producer.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_some() {
                return Err(ConsumerError::AlreadyStarted);
            }
            let producer = Arc::new(QueueMessageProducer::new(
                Arc::clone(&self.queue),
                settings,
            ));
            *guard = Some(Arc::clone(&producer));
            producer
        };

        producer.start(&self.shutdown);
        let stream = producer
            .messages()
            .expect("fresh producer always yields its stream");

        let task = tokio::spawn(run_decode(
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
            Arc::clone(&self.pipelines),
            stream,
            self.shutdown.clone(),
        ));
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);

        info!(queue = %self.queue.id(), "Job queue consumer started");
        Ok(())
    }

    /// Destructively snapshot the per-tag metrics accumulated since the
    /// previous call.
    pub fn get_metrics(&self) -> HashMap<String, JobHandlerMetrics> {
        self.metrics.snapshot()
    }

    /// The backend error that stopped the polling loop, if any.
    ///
    /// While a fault is set the consumer is no longer receiving messages;
    /// the owner decides whether to restart against a fresh consumer.
    pub fn fault(&self) -> Option<QueueError> {
        let guard = self.producer.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().and_then(|p| p.fault())
    }

    /// Signal every background loop, wait for them to drain, and report the
    /// backend error that faulted the polling loop, if any.
    pub async fn shutdown(&self) -> Option<QueueError> {
        self.shutdown.cancel();

        let producer = {
            let mut guard = self.producer.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        let fault = match producer {
            Some(producer) => producer.close().await,
            None => None,
        };

        // Dropping the senders lets pipeline loops run off the end of their
        // channels.
        self.pipelines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }

        info!(queue = %self.queue.id(), "Job queue consumer stopped");
        fault
    }
}

/// Decode stage: envelope parse + payload type resolution, then fan-out.
async fn run_decode(
    queue: Arc<dyn Queue>,
    registry: Arc<PayloadRegistry>,
    metrics: Arc<MetricsRegistry>,
    pipelines: Arc<Mutex<HashMap<String, PipelineHandle>>>,
    mut stream: UnboundedReceiver<(QueueMessage, Duration)>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.recv() => next,
        };
        let Some((message, visibility_timeout)) = next else {
            break;
        };

        let decoded = Envelope::from_bytes(&message.content)
            .map_err(|e| (e, None))
            .and_then(|envelope| {
                match registry.deserialize(&envelope.tag_type, &envelope.payload) {
                    Ok(payload) => Ok((envelope, payload)),
                    Err(e) => Err((e, Some(envelope.tag_type))),
                }
            });

        let (envelope, payload) = match decoded {
            Ok(decoded) => decoded,
            Err((e, tag)) => {
                drop_poison(&queue, &metrics, &message, &e, tag.as_deref()).await;
                continue;
            }
        };

        let target = {
            let guard = pipelines.lock().unwrap_or_else(|e| e.into_inner());
            guard
                .get(&envelope.tag_type)
                .map(|p| (p.sender.clone(), Arc::clone(&p.depth)))
        };

        match target {
            Some((sender, depth)) => {
                depth.fetch_add(1, Ordering::Relaxed);
                let job = DecodedJob {
                    message,
                    visibility_timeout,
                    envelope,
                    payload,
                };
                if sender.send(job).is_err() {
                    // Pipeline already gone; lease expiry redelivers.
                    depth.fetch_sub(1, Ordering::Relaxed);
                }
            }
            None => {
                let e = PayloadError::UnregisteredTag(envelope.tag_type.clone());
                drop_poison(&queue, &metrics, &message, &e, Some(&envelope.tag_type)).await;
            }
        }
    }

    debug!("Decode stage stopped");
}

/// Poison messages are acknowledged immediately so they never loop through
/// redelivery.
async fn drop_poison(
    queue: &Arc<dyn Queue>,
    metrics: &Arc<MetricsRegistry>,
    message: &QueueMessage,
    error: &(dyn std::error::Error + Send + Sync),
    tag: Option<&str>,
) {
    warn!(
        message_id = %message.id,
        tag = tag.unwrap_or("<unknown>"),
        error = %error,
        "Dropping poison message"
    );
    if let Err(e) = queue.delete_message(message).await {
        warn!(message_id = %message.id, error = %e, "Failed to delete poison message");
    }
    metrics.record_dropped(POISON_TAG, 0, false);
}

struct DispatchContext<T> {
    tag: String,
    handler: Arc<dyn JobHandler<T>>,
    options: JobHandlerOptions,
    queue: Arc<dyn Queue>,
    metrics: Arc<MetricsRegistry>,
    depth: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl<T> Clone for DispatchContext<T> {
    fn clone(&self) -> Self {
        Self {
            tag: self.tag.clone(),
            handler: Arc::clone(&self.handler),
            options: self.options.clone(),
            queue: Arc::clone(&self.queue),
            metrics: Arc::clone(&self.metrics),
            depth: Arc::clone(&self.depth),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// One pipeline per payload type: a worker pool bounded by a semaphore,
/// dispatching each job on its own task.
async fn run_pipeline<T>(context: DispatchContext<T>, mut receiver: UnboundedReceiver<DecodedJob>)
where
    T: Send + Sync + 'static,
{
    let permits = context
        .options
        .max_concurrency
        .unwrap_or_else(default_concurrency)
        .max(1);
    let semaphore = Arc::new(Semaphore::new(permits));

    info!(tag = %context.tag, max_concurrency = permits, "Handler pipeline started");

    loop {
        let decoded = tokio::select! {
            _ = context.shutdown.cancelled() => break,
            next = receiver.recv() => match next {
                Some(decoded) => decoded,
                None => break,
            },
        };
        context.depth.fetch_sub(1, Ordering::Relaxed);

        let permit = tokio::select! {
            _ = context.shutdown.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        tokio::spawn(dispatch(context.clone(), decoded, permit));
    }

    // Wait for in-flight dispatches before reporting the pipeline stopped.
    let _ = semaphore.acquire_many(permits as u32).await;
    debug!(tag = %context.tag, "Handler pipeline stopped");
}

enum Outcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// Handler-level options take precedence over the envelope's payload
/// options.
fn effective_options(
    handler: &JobHandlerOptions,
    payload: Option<&crate::payload::JobPayloadOptions>,
) -> JobHandlerOptions {
    JobHandlerOptions {
        max_concurrency: handler.max_concurrency,
        handler_timeout: handler
            .handler_timeout
            .or_else(|| payload.and_then(|p| p.handler_timeout)),
        max_handler_retries: handler
            .max_handler_retries
            .or_else(|| payload.and_then(|p| p.max_handler_retries)),
        expire_timeout: handler
            .expire_timeout
            .or_else(|| payload.and_then(|p| p.expire_timeout)),
    }
}

/// Run one job through the dispatch state machine:
/// expired -> delete; success -> delete; failure -> requeue with an
/// incremented retry count, or delete once retries are exhausted.
async fn dispatch<T>(
    context: DispatchContext<T>,
    decoded: DecodedJob,
    _permit: OwnedSemaphorePermit,
) where
    T: Send + Sync + 'static,
{
    let DecodedJob {
        message,
        visibility_timeout,
        mut envelope,
        payload,
    } = decoded;

    let payload = match payload.downcast::<T>() {
        Ok(payload) => *payload,
        Err(_) => {
            // The registry keys decoders by tag, so this cannot happen for a
            // well-formed registration; drop rather than loop.
            error!(tag = %context.tag, message_id = %message.id, "Payload type mismatch");
            ack(&context, &message).await;
            context
                .metrics
                .record_dropped(&context.tag, context.depth.load(Ordering::Relaxed), false);
            return;
        }
    };

    let effective = effective_options(&context.options, envelope.payload_options.as_ref());

    if let Some(expire) = effective.expire_timeout {
        let age = Utc::now().signed_duration_since(envelope.created);
        let expired = chrono::Duration::from_std(expire)
            .map(|limit| age > limit)
            .unwrap_or(false);
        if expired {
            debug!(tag = %context.tag, message_id = %message.id, "Job expired before dispatch");
            ack(&context, &message).await;
            context
                .metrics
                .record_expired(&context.tag, context.depth.load(Ordering::Relaxed));
            return;
        }
    }

    let job = Job::new(
        Arc::clone(&context.queue),
        message.clone(),
        visibility_timeout,
        envelope.clone(),
        payload,
    );

    // Linked cancellation: consumer shutdown propagates into the handler
    // token, and the handler timeout arms it independently.
    let cancellation = context.shutdown.child_token();
    let handler = Arc::clone(&context.handler);
    let handler_token = cancellation.clone();
    let started = Instant::now();
    let mut invocation =
        tokio::spawn(async move { handler.handle(&job, handler_token).await });

    let outcome = match effective.handler_timeout {
        Some(timeout) => tokio::select! {
            result = &mut invocation => classify(&context.tag, &message.id, result, &cancellation),
            _ = tokio::time::sleep(timeout) => {
                debug!(tag = %context.tag, message_id = %message.id, "Job handler timed out");
                cancellation.cancel();
                invocation.abort();
                Outcome::Cancelled
            }
        },
        None => classify(&context.tag, &message.id, invocation.await, &cancellation),
    };

    let elapsed = started.elapsed();
    let depth = context.depth.load(Ordering::Relaxed);

    match outcome {
        Outcome::Succeeded => {
            debug!(tag = %context.tag, message_id = %message.id, "Job succeeded");
            ack(&context, &message).await;
            context.metrics.record_processed(&context.tag, depth, elapsed);
        }
        Outcome::Failed | Outcome::Cancelled => {
            let cancelled = matches!(outcome, Outcome::Cancelled);
            envelope.retries += 1;

            let exhausted = effective
                .max_handler_retries
                .is_some_and(|max| envelope.retries > max);
            if exhausted {
                warn!(
                    tag = %context.tag,
                    message_id = %message.id,
                    retries = envelope.retries,
                    "Job dropped, retries exhausted"
                );
                ack(&context, &message).await;
                context.metrics.record_dropped(&context.tag, depth, cancelled);
            } else {
                requeue(&context, &message, &envelope, visibility_timeout).await;
                context.metrics.record_retry(&context.tag, depth, cancelled);
            }
        }
    }
}

fn classify(
    tag: &str,
    message_id: &str,
    result: Result<HandlerResult, JoinError>,
    cancellation: &CancellationToken,
) -> Outcome {
    match result {
        Ok(Ok(())) => Outcome::Succeeded,
        Ok(Err(e)) => {
            if cancellation.is_cancelled() {
                debug!(tag = %tag, message_id = %message_id, "Job handler cancelled");
                Outcome::Cancelled
            } else {
                warn!(tag = %tag, message_id = %message_id, error = %e, "Job handler failed");
                Outcome::Failed
            }
        }
        Err(join) if join.is_panic() => {
            warn!(tag = %tag, message_id = %message_id, "Job handler panicked");
            Outcome::Failed
        }
        Err(_) => Outcome::Cancelled,
    }
}

async fn ack<T>(context: &DispatchContext<T>, message: &QueueMessage) {
    if let Err(e) = context.queue.delete_message(message).await {
        warn!(
            tag = %context.tag,
            message_id = %message.id,
            error = %e,
            "Failed to delete message"
        );
    }
}

/// Requeue in place: persist the incremented retry count and reset the lease
/// to the original duration. The message re-enters the pipeline via the
/// queue's lease-expiry redelivery, never by direct re-submission.
async fn requeue<T>(
    context: &DispatchContext<T>,
    message: &QueueMessage,
    envelope: &Envelope,
    visibility_timeout: Duration,
) {
    let content = match envelope.to_bytes() {
        Ok(content) => content,
        Err(e) => {
            warn!(
                tag = %context.tag,
                message_id = %message.id,
                error = %e,
                "Failed to re-serialize envelope, lease expiry will redeliver"
            );
            return;
        }
    };

    let mut updated = message.clone();
    updated.content = content;
    if let Err(e) = context
        .queue
        .update_message(&updated, true, visibility_timeout)
        .await
    {
        warn!(
            tag = %context.tag,
            message_id = %message.id,
            error = %e,
            "Failed to persist retry, lease expiry will redeliver"
        );
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
