//! Producer process: enqueues a few jobs and polls their status.
//!
//! Run with: cargo run --example producer (with a worker running)

use std::time::Duration;

use jobwire::{logging, EnqueueOptions, JobState, Producer, QueueConfig};
use tracing::info;

mod jobs;
use jobs::{ProcessPaymentArgs, SendEmailArgs};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();

    let producer = Producer::connect(&QueueConfig::from_env()).await?;

    // Fire-and-forget
    let welcome = producer
        .enqueue(
            jobs::SEND_EMAIL,
            &SendEmailArgs {
                to: "user@example.com".to_string(),
                subject: "Welcome!".to_string(),
            },
            EnqueueOptions::new(),
        )
        .await?;

    // Delayed job (runs after 30 seconds)
    producer
        .enqueue(
            jobs::SEND_EMAIL,
            &SendEmailArgs {
                to: "user@example.com".to_string(),
                subject: "Reminder".to_string(),
            },
            EnqueueOptions::new().delay(Duration::from_secs(30)),
        )
        .await?;

    // Limited retries and a per-attempt deadline
    let payment = producer
        .enqueue(
            jobs::PROCESS_PAYMENT,
            &ProcessPaymentArgs {
                order_id: "ORD-123".to_string(),
                amount: 99.99,
            },
            EnqueueOptions::new()
                .max_tries(3)
                .timeout(Duration::from_secs(30)),
        )
        .await?;

    // Recurring job (cron: every hour)
    producer
        .schedule_recurring(
            "hourly-cleanup",
            "0 0 * * * *",
            jobs::CLEANUP,
            &(),
            EnqueueOptions::new().max_tries(1),
        )
        .await?;

    for id in [&welcome, &payment] {
        loop {
            let status = producer.get_status(id).await?;
            if status.state.is_terminal() {
                info!(job_id = %id, state = %status.state, result = ?status.result, "Job finished");
                if status.state == JobState::FailedTerminal {
                    let retry = producer.resubmit(id).await?;
                    info!(job_id = %retry, resubmitted_from = %id, "Resubmitted failed job");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    info!(depth = ?producer.depth().await?, "Queue depth");
    Ok(())
}
