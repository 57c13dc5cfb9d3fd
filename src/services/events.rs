//! Domain events and the fire-and-forget side effects that follow a committed
//! state change. A failing publisher or notifier is logged and never reaches
//! the caller.

use crate::domain::Payment;
use crate::services::notification::{LogNotifier, Notifier};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentEventType {
    PaymentInitiated,
    PaymentConfirmed,
    PaymentFailed,
    PaymentCancelled,
    PaymentRejected,
    PaymentRefunded,
    PaymentPartiallyRefunded,
}

impl PaymentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentEventType::PaymentInitiated => "payment_initiated",
            PaymentEventType::PaymentConfirmed => "payment_confirmed",
            PaymentEventType::PaymentFailed => "payment_failed",
            PaymentEventType::PaymentCancelled => "payment_cancelled",
            PaymentEventType::PaymentRejected => "payment_rejected",
            PaymentEventType::PaymentRefunded => "payment_refunded",
            PaymentEventType::PaymentPartiallyRefunded => "payment_partially_refunded",
        }
    }
}

impl fmt::Display for PaymentEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: PaymentEventType, payment: &Payment) -> anyhow::Result<()>;
}

/// Emits events as structured log lines
#[derive(Debug, Default, Clone)]
pub struct TracingEventPublisher;

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, event: PaymentEventType, payment: &Payment) -> anyhow::Result<()> {
        info!(
            event = %event,
            payment_id = %payment.id,
            merchant_reference = %payment.merchant_reference,
            status = %payment.status,
            provider = %payment.provider,
            "payment event"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct EventEnvelope<'a> {
    event: PaymentEventType,
    payment: &'a Payment,
    occurred_at: chrono::DateTime<chrono::Utc>,
}

/// POSTs events as JSON to a downstream collector
pub struct HttpEventPublisher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEventPublisher {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build event HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// `EVENTS_ENDPOINT_URL` when set
    pub fn from_env() -> anyhow::Result<Option<Self>> {
        match std::env::var("EVENTS_ENDPOINT_URL") {
            Ok(url) if !url.trim().is_empty() => {
                Ok(Some(Self::new(url.trim(), Duration::from_secs(5))?))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl EventPublisher for HttpEventPublisher {
    async fn publish(&self, event: PaymentEventType, payment: &Payment) -> anyhow::Result<()> {
        let envelope = EventEnvelope {
            event,
            payment,
            occurred_at: chrono::Utc::now(),
        };
        self.client
            .post(&self.endpoint)
            .json(&envelope)
            .send()
            .await
            .with_context(|| format!("failed to deliver {} event", event))?
            .error_for_status()
            .with_context(|| format!("event collector rejected {} event", event))?;
        debug!(event = %event, payment_id = %payment.id, "event delivered");
        Ok(())
    }
}

/// Event publisher and notifier, run off the request path
#[derive(Clone)]
pub struct SideEffects {
    events: Arc<dyn EventPublisher>,
    notifier: Arc<dyn Notifier>,
}

impl Default for SideEffects {
    fn default() -> Self {
        Self::new(Arc::new(TracingEventPublisher), Arc::new(LogNotifier::new()))
    }
}

impl SideEffects {
    pub fn new(events: Arc<dyn EventPublisher>, notifier: Arc<dyn Notifier>) -> Self {
        Self { events, notifier }
    }

    /// Publish and notify in the background. Call only after the change committed.
    pub fn emit(&self, event: PaymentEventType, payment: &Payment) {
        let events = self.events.clone();
        let notifier = self.notifier.clone();
        let payment = payment.clone();

        tokio::spawn(async move {
            if let Err(e) = events.publish(event, &payment).await {
                warn!(event = %event, payment_id = %payment.id, error = %e, "event publish failed");
            }
            if let Err(e) = notifier.notify(event, &payment).await {
                warn!(event = %event, payment_id = %payment.id, error = %e, "notification failed");
            }
        });
    }
}
