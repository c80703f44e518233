//! Job types shared by the demo worker and producer.
#![allow(dead_code)]

use serde::{Deserialize, Serialize};

use jobwire::HandlerError;

pub const SEND_EMAIL: &str = "send_email";
pub const PROCESS_PAYMENT: &str = "process_payment";
pub const CLEANUP: &str = "cleanup";

#[derive(Debug, Serialize, Deserialize)]
pub struct SendEmailArgs {
    pub to: String,
    pub subject: String,
}

pub async fn send_email(args: SendEmailArgs) -> Result<(), HandlerError> {
    tracing::info!(to = %args.to, subject = %args.subject, "Sending email");
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessPaymentArgs {
    pub order_id: String,
    pub amount: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Receipt {
    pub order_id: String,
    pub charged: f64,
}

pub async fn process_payment(args: ProcessPaymentArgs) -> Result<Receipt, HandlerError> {
    if args.amount <= 0.0 {
        return Err(HandlerError::fatal(format!("invalid amount {}", args.amount)));
    }
    if args.amount > 1000.0 {
        return Err(HandlerError::retryable("payment provider asked for manual review"));
    }
    Ok(Receipt {
        order_id: args.order_id,
        charged: args.amount,
    })
}

pub async fn cleanup(_: ()) -> Result<(), HandlerError> {
    tracing::info!("Running cleanup");
    Ok(())
}
