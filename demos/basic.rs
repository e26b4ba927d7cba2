use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use jobq::{
    JobHandlerOptions, JobPayloadOptions, JobQueueConsumer, JobQueueProducer, MemoryQueueFactory,
    PayloadRegistry, QueueFactory, QueueMessageProducerSettings,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SendEmail {
    to: String,
    subject: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProcessPayment {
    order_id: String,
    amount: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let factory = MemoryQueueFactory::new();
    let queue = factory.get_or_create("jobs").await?;
    let registry = Arc::new(PayloadRegistry::new());

    let producer = JobQueueProducer::new(Arc::clone(&queue), Arc::clone(&registry));
    let consumer = JobQueueConsumer::new(Arc::clone(&queue), Arc::clone(&registry));

    consumer.register_job_handler_fn(
        "send-email",
        JobHandlerOptions::default(),
        |email: SendEmail, _cancel: CancellationToken| async move {
            println!("Sending email to {}: {}", email.to, email.subject);
            Ok(())
        },
    )?;
    consumer.register_job_handler_fn(
        "process-payment",
        JobHandlerOptions {
            handler_timeout: Some(Duration::from_secs(30)),
            max_handler_retries: Some(5),
            ..Default::default()
        },
        |payment: ProcessPayment, _cancel: CancellationToken| async move {
            println!(
                "Processing ${} for order {}",
                payment.amount, payment.order_id
            );
            if payment.amount > 1000.0 {
                return Err("Requires manual review".into());
            }
            Ok(())
        },
    )?;

    consumer.start(QueueMessageProducerSettings::default())?;

    producer
        .add_job(
            &SendEmail {
                to: "user@example.com".to_string(),
                subject: "Welcome".to_string(),
            },
            None,
        )
        .await?;
    producer
        .add_job(
            &ProcessPayment {
                order_id: "ord-1".to_string(),
                amount: 42.0,
            },
            Some(JobPayloadOptions {
                initial_visibility_delay: Some(Duration::from_millis(250)),
                ..Default::default()
            }),
        )
        .await?;

    tokio::time::sleep(Duration::from_secs(2)).await;

    for (tag, metrics) in consumer.get_metrics() {
        println!(
            "{tag}: processed={} failures={} retries={}",
            metrics.processed, metrics.failures, metrics.retries
        );
    }

    consumer.shutdown().await;
    factory.close_all().await;
    Ok(())
}
