//! Refund process: request → approve → process (through the provider) →
//! complete. Completing a refund moves the payment to PARTIALLY_REFUNDED or
//! REFUNDED.
//!
//! A refund request reserves its amount while the payment row is locked, so
//! concurrent requests can never reserve more than the payment's amount.

use crate::config::GatewayConfig;
use crate::database::repository::{Stores, UnitOfWork};
use crate::domain::refund::refundable_balance;
use crate::domain::{Payment, PaymentStatus, Refund, RefundStatus, RefundUpdate, StatusUpdate};
use crate::payments::error::PaymentError;
use crate::payments::registry::ProviderRegistry;
use crate::payments::types::SettlementState;
use crate::services::error::{GatewayError, GatewayResult};
use crate::services::events::{PaymentEventType, SideEffects};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub amount: Decimal,
    pub reason: String,
}

/// A refund about to be staged
pub(crate) struct RefundDraft<'a> {
    pub payment_id: Uuid,
    pub amount: Decimal,
    pub reason: &'a str,
    pub requested_by: &'a str,
    /// Set when a reconciliation resolution spawns the refund
    pub reconciliation_id: Option<Uuid>,
}

/// Stage a refund inside `uow` after checking the payment can take it.
///
/// Shared with reconciliation, which spawns refunds from a resolution.
pub(crate) async fn stage_refund(
    uow: &mut dyn UnitOfWork,
    registry: &ProviderRegistry,
    draft: RefundDraft<'_>,
    now: DateTime<Utc>,
) -> GatewayResult<Refund> {
    let RefundDraft {
        payment_id,
        amount,
        reason,
        requested_by,
        reconciliation_id,
    } = draft;
    if amount <= Decimal::ZERO {
        return Err(GatewayError::validation("amount", "must be greater than zero"));
    }
    if amount.normalize().scale() > 2 {
        return Err(GatewayError::validation(
            "amount",
            "must have at most 2 decimal places",
        ));
    }
    if reason.trim().is_empty() {
        return Err(GatewayError::validation("reason", "is required"));
    }

    let payment = uow.lock_payment(payment_id).await?;
    if !matches!(
        payment.status,
        PaymentStatus::Confirmed | PaymentStatus::PartiallyRefunded
    ) {
        return Err(GatewayError::InvalidStateTransition {
            from: payment.status.to_string(),
            to: PaymentStatus::Refunded.to_string(),
        });
    }

    let provider = registry.get(&payment.provider)?;
    let config = provider.config();
    if !config.supports_refunds {
        return Err(PaymentError::unsupported(&config.name, "refunds").into());
    }

    let existing = uow.refunds_for_payment(payment.id).await?;
    let refundable = refundable_balance(payment.amount, &existing);
    if amount > refundable {
        return Err(GatewayError::RefundExceedsPayment {
            requested: amount.to_string(),
            refundable: refundable.to_string(),
        });
    }
    if amount < payment.amount && !config.supports_partial_refunds {
        return Err(PaymentError::unsupported(&config.name, "partial refunds").into());
    }

    let refund = Refund::request(
        payment.id,
        amount,
        &payment.currency,
        reason.trim(),
        requested_by,
        reconciliation_id,
        now,
    );
    uow.insert_refund(&refund).await?;
    Ok(refund)
}

/// Commit `uow` when `result` is Ok, roll it back otherwise
pub(crate) async fn finish<T>(
    uow: Box<dyn UnitOfWork>,
    result: GatewayResult<T>,
) -> GatewayResult<T> {
    match result {
        Ok(value) => {
            uow.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = uow.rollback().await {
                error!(error = %rollback_err, "rollback failed");
            }
            Err(e)
        }
    }
}

#[derive(Clone)]
pub struct RefundService {
    registry: ProviderRegistry,
    stores: Stores,
    side_effects: SideEffects,
    provider_timeout: Duration,
}

impl RefundService {
    pub fn new(
        registry: ProviderRegistry,
        stores: Stores,
        config: &GatewayConfig,
        side_effects: SideEffects,
    ) -> Self {
        Self {
            registry,
            stores,
            side_effects,
            provider_timeout: config.provider_timeout,
        }
    }

    pub async fn get(&self, refund_id: Uuid) -> GatewayResult<Refund> {
        self.stores
            .refunds
            .find_refund(refund_id)
            .await?
            .ok_or_else(|| GatewayError::not_found("Refund", refund_id))
    }

    pub async fn list_for_payment(&self, payment_id: Uuid) -> GatewayResult<Vec<Refund>> {
        Ok(self.stores.refunds.list_for_payment(payment_id).await?)
    }

    pub async fn request(
        &self,
        payment_id: Uuid,
        request: RefundRequest,
        actor: &str,
    ) -> GatewayResult<Refund> {
        let mut uow = self.stores.payments.begin().await?;
        let draft = RefundDraft {
            payment_id,
            amount: request.amount,
            reason: &request.reason,
            requested_by: actor,
            reconciliation_id: None,
        };
        let staged = stage_refund(uow.as_mut(), &self.registry, draft, Utc::now()).await;
        let refund = finish(uow, staged).await?;

        info!(
            refund_id = %refund.id,
            payment_id = %refund.payment_id,
            amount = %refund.amount,
            actor = %actor,
            "refund requested"
        );
        Ok(refund)
    }

    pub async fn approve(&self, refund_id: Uuid, actor: &str) -> GatewayResult<Refund> {
        let update = RefundUpdate {
            actor: Some(actor.to_string()),
            ..Default::default()
        };
        self.transition(refund_id, RefundStatus::Requested, RefundStatus::Approved, update)
            .await
    }

    pub async fn reject(&self, refund_id: Uuid, actor: &str, reason: &str) -> GatewayResult<Refund> {
        let update = RefundUpdate {
            actor: Some(actor.to_string()),
            failure_reason: Some(reason.to_string()),
            ..Default::default()
        };
        self.transition(refund_id, RefundStatus::Requested, RefundStatus::Rejected, update)
            .await
    }

    /// Send an approved refund to the provider.
    ///
    /// A provider error fails the refund (releasing its reserved amount)
    /// instead of surfacing as an error.
    pub async fn process(&self, refund_id: Uuid, actor: &str) -> GatewayResult<Refund> {
        let refund = self.get(refund_id).await?;
        if refund.status != RefundStatus::Approved {
            return Err(GatewayError::InvalidStateTransition {
                from: refund.status.to_string(),
                to: RefundStatus::Processed.to_string(),
            });
        }
        let payment = self
            .stores
            .payments
            .find_payment(refund.payment_id)
            .await?
            .ok_or_else(|| GatewayError::not_found("Payment", refund.payment_id))?;
        let provider = self.registry.get(&payment.provider)?;

        let response = match tokio::time::timeout(
            self.provider_timeout,
            provider.refund_payment(&payment, refund.amount, &refund.reason),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PaymentError::Timeout {
                provider: provider.name().to_string(),
                timeout_secs: self.provider_timeout.as_secs(),
            }),
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    refund_id = %refund.id,
                    provider = %payment.provider,
                    error = %e,
                    "refund failed at provider"
                );
                let update = RefundUpdate {
                    actor: Some(actor.to_string()),
                    failure_reason: Some(e.to_string()),
                    ..Default::default()
                };
                return self
                    .transition(refund.id, RefundStatus::Approved, RefundStatus::Failed, update)
                    .await;
            }
        };

        let update = RefundUpdate {
            actor: Some(actor.to_string()),
            external_refund_id: response.external_refund_id.clone(),
            ..Default::default()
        };
        let processed = self
            .transition(refund.id, RefundStatus::Approved, RefundStatus::Processed, update)
            .await?;

        match response.settlement_state {
            SettlementState::Completed => self.complete(processed.id, actor).await.map(|(r, _)| r),
            SettlementState::Failed | SettlementState::Cancelled => {
                let update = RefundUpdate {
                    actor: Some(actor.to_string()),
                    failure_reason: Some("provider reported the refund as failed".to_string()),
                    ..Default::default()
                };
                self.transition(processed.id, RefundStatus::Processed, RefundStatus::Failed, update)
                    .await
            }
            _ => Ok(processed),
        }
    }

    /// Mark a processed refund completed and move the payment accordingly
    pub async fn complete(&self, refund_id: Uuid, actor: &str) -> GatewayResult<(Refund, Payment)> {
        let now = Utc::now();
        let mut uow = self.stores.payments.begin().await?;

        let staged = async {
            let update = RefundUpdate {
                actor: Some(actor.to_string()),
                ..Default::default()
            };
            let refund = uow
                .transition_refund(
                    refund_id,
                    RefundStatus::Processed,
                    RefundStatus::Completed,
                    &update,
                    now,
                )
                .await?;
            let payment = uow.lock_payment(refund.payment_id).await?;
            let completed: Decimal = uow
                .refunds_for_payment(payment.id)
                .await?
                .iter()
                .filter(|r| r.status == RefundStatus::Completed)
                .map(|r| r.amount)
                .sum();

            let target = if completed >= payment.amount {
                PaymentStatus::Refunded
            } else {
                PaymentStatus::PartiallyRefunded
            };
            let payment = if payment.status == target {
                payment
            } else {
                uow.transition_status(
                    payment.id,
                    payment.status,
                    target,
                    &StatusUpdate::default(),
                    now,
                )
                .await?
            };
            Ok::<_, GatewayError>((refund, payment))
        }
        .await;

        let (refund, payment) = finish(uow, staged).await?;

        info!(
            refund_id = %refund.id,
            payment_id = %payment.id,
            to_state = %payment.status,
            "refund completed"
        );
        let event = if payment.status == PaymentStatus::Refunded {
            PaymentEventType::PaymentRefunded
        } else {
            PaymentEventType::PaymentPartiallyRefunded
        };
        self.side_effects.emit(event, &payment);
        Ok((refund, payment))
    }

    async fn transition(
        &self,
        refund_id: Uuid,
        expected: RefundStatus,
        target: RefundStatus,
        update: RefundUpdate,
    ) -> GatewayResult<Refund> {
        let mut uow = self.stores.payments.begin().await?;
        let result = uow
            .transition_refund(refund_id, expected, target, &update, Utc::now())
            .await
            .map_err(GatewayError::from);
        let refund = finish(uow, result).await?;

        info!(
            refund_id = %refund.id,
            from_state = %expected,
            to_state = %refund.status,
            "refund status changed"
        );
        Ok(refund)
    }
}
