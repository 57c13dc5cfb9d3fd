use crate::domain::Payment;
use crate::services::events::PaymentEventType;
use async_trait::async_trait;
use tracing::{info, warn};

/// Delivery is someone else's job (email/SMS/push); the engine only says what happened.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: PaymentEventType, payment: &Payment) -> anyhow::Result<()>;
}

/// Writes notifications to the log. Used when no delivery service is wired in.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: PaymentEventType, payment: &Payment) -> anyhow::Result<()> {
        match event {
            PaymentEventType::PaymentFailed | PaymentEventType::PaymentRejected => {
                warn!(
                    payment_id = %payment.id,
                    merchant_reference = %payment.merchant_reference,
                    patient_id = %payment.patient_id,
                    reason = payment.failure_reason.as_deref().unwrap_or("-"),
                    "🔔 NOTIFICATION: {}", event
                );
            }
            _ => {
                info!(
                    payment_id = %payment.id,
                    merchant_reference = %payment.merchant_reference,
                    patient_id = %payment.patient_id,
                    amount = %payment.amount,
                    currency = %payment.currency,
                    "🔔 NOTIFICATION: {}", event
                );
            }
        }
        Ok(())
    }
}
