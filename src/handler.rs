use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::job::Job;

/// Error returned by a job handler. Any failure is treated the same way by
/// the dispatch engine: retry until exhausted, then drop.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<(), HandlerError>;

/// Per-registration policy for a handler pipeline.
///
/// Unset fields fall back to the envelope's `PayloadOptions`, then to
/// unlimited.
#[derive(Debug, Clone, Default)]
pub struct JobHandlerOptions {
    /// Worker-pool bound for this payload type. Defaults to the number of
    /// available processors.
    pub max_concurrency: Option<usize>,
    pub handler_timeout: Option<Duration>,
    pub max_handler_retries: Option<u32>,
    pub expire_timeout: Option<Duration>,
}

/// Processes jobs of one payload type.
///
/// The cancellation token fires when the handler timeout elapses or the
/// consumer shuts down; handlers should honor it at their await points.
#[async_trait]
pub trait JobHandler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    fn options(&self) -> JobHandlerOptions {
        JobHandlerOptions::default()
    }

    async fn handle(&self, job: &Job<T>, cancellation: CancellationToken) -> HandlerResult;
}

/// Adapts a plain async closure into a [`JobHandler`].
pub(crate) struct FnJobHandler<F> {
    handler: F,
    options: JobHandlerOptions,
}

impl<F> FnJobHandler<F> {
    pub(crate) fn new(handler: F, options: JobHandlerOptions) -> Self {
        Self { handler, options }
    }
}

#[async_trait]
impl<T, F, Fut> JobHandler<T> for FnJobHandler<F>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn options(&self) -> JobHandlerOptions {
        self.options.clone()
    }

    async fn handle(&self, job: &Job<T>, cancellation: CancellationToken) -> HandlerResult {
        (self.handler)(job.payload().clone(), cancellation).await
    }
}
