use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::queue::{Queue, QueueError, QueueMessage};

/// Fixed polling settings for a [`QueueMessageProducer`].
#[derive(Debug, Clone)]
pub struct QueueMessageProducerSettings {
    /// Batch size per `get_messages` call.
    pub message_count: usize,
    /// Lease duration requested for every delivered message.
    pub visibility_timeout: Duration,
    /// How long a single poll blocks when the queue is empty.
    pub poll_timeout: Duration,
}

impl Default for QueueMessageProducerSettings {
    fn default() -> Self {
        Self {
            message_count: 5,
            visibility_timeout: Duration::from_secs(5 * 60),
            poll_timeout: Duration::from_millis(100),
        }
    }
}

/// Turns queue polling into a continuous stream of leased messages.
///
/// Every received message is republished as `(message, visibility_timeout)`
/// on an unbounded channel. There is no backpressure: a slow downstream
/// consumer buffers without limit. A queue backend failure faults the poll
/// loop and closes the stream; the terminal error is retained and surfaced
/// through [`fault`](Self::fault) and [`close`](Self::close) so the owner
/// can restart.
pub struct QueueMessageProducer {
    queue: Arc<dyn Queue>,
    settings: QueueMessageProducerSettings,
    sender: Mutex<Option<UnboundedSender<(QueueMessage, Duration)>>>,
    receiver: Mutex<Option<UnboundedReceiver<(QueueMessage, Duration)>>>,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    fault: Arc<Mutex<Option<QueueError>>>,
}

impl QueueMessageProducer {
    pub fn new(queue: Arc<dyn Queue>, settings: QueueMessageProducerSettings) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            queue,
            settings,
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
            fault: Arc::new(Mutex::new(None)),
        }
    }

    /// Take the output stream. Yields `None` once per producer.
    pub fn messages(&self) -> Option<UnboundedReceiver<(QueueMessage, Duration)>> {
        let mut guard = self.receiver.lock().unwrap_or_else(|e| e.into_inner());
        guard.take()
    }

    /// Spawn the poll loop. The loop runs until `close` is called, the
    /// parent token is cancelled, or the queue backend fails.
    pub fn start(&self, parent: &CancellationToken) {
        let sender = {
            let mut guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        let Some(sender) = sender else {
            return;
        };

        let queue = Arc::clone(&self.queue);
        let settings = self.settings.clone();
        let shutdown = self.shutdown.clone();
        let parent = parent.clone();
        let fault = Arc::clone(&self.fault);

        let task = tokio::spawn(async move {
            info!(queue = %queue.id(), "Message producer started");

            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = parent.cancelled() => break,
                    result = queue.get_messages(
                        settings.message_count,
                        Some(settings.visibility_timeout),
                        settings.poll_timeout,
                    ) => result,
                };

                let messages = match received {
                    Ok(messages) => messages,
                    Err(e) => {
                        error!(queue = %queue.id(), error = %e, "Message producer faulted");
                        *fault.lock().unwrap_or_else(|e| e.into_inner()) = Some(e);
                        break;
                    }
                };

                for message in messages {
                    debug!(queue = %queue.id(), message_id = %message.id, "Message leased");
                    if sender.send((message, settings.visibility_timeout)).is_err() {
                        // Downstream gone; nothing left to publish to.
                        return;
                    }
                }
            }

            info!(queue = %queue.id(), "Message producer stopped");
        });

        let mut guard = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(task);
    }

    /// The backend error that terminated the poll loop, if any.
    pub fn fault(&self) -> Option<QueueError> {
        self.fault.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Signal the poll loop, wait for it to finish and report the backend
    /// error that faulted it, if any.
    pub async fn close(&self) -> Option<QueueError> {
        self.shutdown.cancel();
        let handle = {
            let mut guard = self.handle.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.fault()
    }
}
