//! Payment Orchestrator Service
//!
//! Drives a payment from initiation to the provider's answer, applies
//! cancellations, and turns verified provider webhooks into lifecycle
//! transitions. Every status write is a compare-and-swap against the status
//! the orchestrator read, so a racing webhook or verifier never gets
//! overwritten.

use crate::config::GatewayConfig;
use crate::database::error::DatabaseErrorKind;
use crate::database::repository::Stores;
use crate::domain::{
    NewPayment, Payment, PaymentStatus, Provenance, StatusUpdate, VerificationMethod,
    VerificationStamp,
};
use crate::logging::mask_phone;
use crate::payments::error::PaymentError;
use crate::payments::provider::PaymentProvider;
use crate::payments::registry::ProviderRegistry;
use crate::payments::types::{
    PaymentRequest, ProcessPaymentResponse, SettlementState, WebhookNotification,
};
use crate::services::confirmation::confirm_and_mark_paid;
use crate::services::error::{GatewayError, GatewayResult};
use crate::services::events::{PaymentEventType, SideEffects};
use crate::services::fee_calculation::{FeeBreakdown, FeeCalculationService};
use crate::services::risk::{RiskAssessment, RiskRecommendation, RiskService};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ============================================================================
// Request / Response Types
// ============================================================================

/// Payment initiation request as received from the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiatePaymentRequest {
    pub invoice_id: String,
    pub patient_id: String,
    pub facility_id: String,
    pub provider: String,
    pub amount: Decimal,
    /// Defaults to the gateway's local currency
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    /// Channel-specific details (cheque number/bank, cash denominations, transfer reference)
    #[serde(default)]
    pub details: Option<JsonValue>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

/// What the caller gets back after initiation
#[derive(Debug, Clone, Serialize)]
pub struct InitiatedPayment {
    pub payment: Payment,
    pub redirect_url: Option<String>,
    pub qr_payload: Option<String>,
    pub requires_manual_verification: bool,
    pub message: Option<String>,
    pub provider_data: Option<JsonValue>,
    pub fees: FeeBreakdown,
    pub risk: RiskAssessment,
}

/// Result of ingesting one provider webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// The payment moved to `status`
    Applied { payment_id: Uuid, status: PaymentStatus },
    /// The payment already reflected the reported state
    Duplicate { payment_id: Uuid, status: PaymentStatus },
    /// Provider reported settlement on a payment that still needs a verifier;
    /// the report is kept on the payment and the status is unchanged
    PendingVerification { payment_id: Uuid },
    /// Not a settlement update, unknown transaction, or nothing to do
    Ignored,
}

/// Produces merchant references; swapped out in tests to force collisions
pub type ReferenceGenerator = Arc<dyn Fn(&str, DateTime<Utc>) -> String + Send + Sync>;

/// `{prefix}-{yyyyMMddHHmmss}-{8 random}`
pub fn generate_merchant_reference(prefix: &str, at: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("{}-{}-{}", prefix, at.format("%Y%m%d%H%M%S"), &random[..8])
}

// ============================================================================
// Payment Orchestrator
// ============================================================================

#[derive(Clone)]
pub struct PaymentOrchestrator {
    registry: ProviderRegistry,
    stores: Stores,
    fees: FeeCalculationService,
    risk: RiskService,
    config: GatewayConfig,
    side_effects: SideEffects,
    reference_generator: ReferenceGenerator,
}

impl PaymentOrchestrator {
    pub fn new(
        registry: ProviderRegistry,
        stores: Stores,
        fees: FeeCalculationService,
        risk: RiskService,
        config: GatewayConfig,
        side_effects: SideEffects,
    ) -> Self {
        Self {
            registry,
            stores,
            fees,
            risk,
            config,
            side_effects,
            reference_generator: Arc::new(generate_merchant_reference),
        }
    }

    pub fn with_reference_generator(mut self, generator: ReferenceGenerator) -> Self {
        self.reference_generator = generator;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub async fn get(&self, payment_id: Uuid) -> GatewayResult<Payment> {
        self.stores
            .payments
            .find_payment(payment_id)
            .await?
            .ok_or_else(|| GatewayError::not_found("Payment", payment_id))
    }

    // =========================================================================
    // Initiation
    // =========================================================================

    /// Validate, price and persist a payment, then hand it to the provider.
    ///
    /// A provider that times out, errors or declines leaves the payment in
    /// FAILED; that is returned as a normal outcome, not an error.
    pub async fn initiate(
        &self,
        request: InitiatePaymentRequest,
        provenance: Provenance,
    ) -> GatewayResult<InitiatedPayment> {
        let now = Utc::now();
        let provider = self.registry.get(&request.provider)?;
        let provider_config = provider.config().clone();

        let currency = request
            .currency
            .as_deref()
            .map(|c| c.trim().to_uppercase())
            .unwrap_or_else(|| self.config.default_currency.clone());
        let amount = request.amount;

        let merchant_reference =
            (self.reference_generator)(&self.config.merchant_reference_prefix, now);
        let payment_request = PaymentRequest {
            merchant_reference: merchant_reference.clone(),
            invoice_id: request.invoice_id.trim().to_string(),
            patient_id: request.patient_id.trim().to_string(),
            facility_id: request.facility_id.trim().to_string(),
            amount,
            currency: currency.clone(),
            phone_number: request.phone_number.clone(),
            details: request
                .details
                .clone()
                .unwrap_or_else(|| JsonValue::Object(Default::default())),
        };
        provider.validate_request(&payment_request)?;

        self.check_provider_limits(provider.as_ref(), amount, &currency, now)
            .await?;

        if !self
            .stores
            .invoices
            .is_open_for_payment(&payment_request.invoice_id)
            .await?
        {
            return Err(GatewayError::InvoiceNotPayable {
                invoice_id: payment_request.invoice_id.clone(),
            });
        }

        let fees = self.fees.calculate_fees(amount, &currency, &provider_config);
        let conversion = self
            .fees
            .convert_to_settlement(amount, &currency)
            .map_err(|e| GatewayError::validation("currency", e.to_string()))?;

        let risk_config = self.risk.config();
        let history = self
            .stores
            .payments
            .payer_history(
                &payment_request.patient_id,
                now - risk_config.velocity_window,
                now - risk_config.negative_history_window,
            )
            .await?;
        let risk = self.risk.assess(conversion.amount, &history, now);
        if risk.recommendation == RiskRecommendation::Decline {
            warn!(
                merchant_reference = %merchant_reference,
                patient_id = %payment_request.patient_id,
                risk_score = risk.score,
                flags = ?risk.tags(),
                "high-risk payment accepted for review"
            );
        }

        if self
            .stores
            .payments
            .merchant_reference_exists(&merchant_reference)
            .await?
        {
            error!(merchant_reference = %merchant_reference, "merchant reference collision");
            return Err(GatewayError::DuplicateReference {
                reference: merchant_reference,
            });
        }

        let payment = Payment::new(
            NewPayment {
                merchant_reference: merchant_reference.clone(),
                invoice_id: payment_request.invoice_id.clone(),
                patient_id: payment_request.patient_id.clone(),
                facility_id: payment_request.facility_id.clone(),
                provider: provider.name().to_string(),
                amount,
                currency: currency.clone(),
                fx_rate: conversion.rate,
                amount_in_settlement_currency: conversion.amount,
                provider_fee: fees.provider.calculated,
                platform_fee: fees.platform.calculated,
                risk_score: risk.score,
                fraud_flags: risk.tags(),
                is_suspicious: risk.is_suspicious(),
                provenance,
                metadata: merge_metadata(request.details.as_ref(), request.metadata.as_ref()),
            },
            now,
        );

        if let Err(e) = self.stores.payments.insert_payment(&payment).await {
            if matches!(e.kind, DatabaseErrorKind::UniqueViolation { .. }) {
                return Err(GatewayError::DuplicateReference {
                    reference: merchant_reference,
                });
            }
            return Err(e.into());
        }

        let masked_phone = request
            .phone_number
            .as_deref()
            .map(mask_phone)
            .unwrap_or_else(|| "-".to_string());
        info!(
            payment_id = %payment.id,
            merchant_reference = %payment.merchant_reference,
            provider = %payment.provider,
            amount = %payment.amount,
            currency = %payment.currency,
            phone = %masked_phone,
            risk_score = payment.risk_score,
            "payment initiated"
        );

        let response = self.call_provider(provider.as_ref(), payment_request).await;
        let (payment, response) = self.apply_provider_response(payment, response).await?;

        self.side_effects
            .emit(PaymentEventType::PaymentInitiated, &payment);
        if payment.status == PaymentStatus::Failed {
            self.side_effects.emit(PaymentEventType::PaymentFailed, &payment);
        }

        Ok(InitiatedPayment {
            requires_manual_verification: payment.status == PaymentStatus::AwaitingVerification,
            redirect_url: response.redirect_url,
            qr_payload: response.qr_payload,
            message: response.message,
            provider_data: response.provider_data,
            payment,
            fees,
            risk,
        })
    }

    async fn check_provider_limits(
        &self,
        provider: &dyn PaymentProvider,
        amount: Decimal,
        currency: &str,
        now: DateTime<Utc>,
    ) -> GatewayResult<()> {
        let config = provider.config();
        let limit = |reason: String| GatewayError::ProviderLimit {
            provider: config.name.clone(),
            reason,
        };

        if !config.supports_currency(currency) {
            return Err(limit(format!("currency {} is not supported", currency)));
        }
        if let Some(min) = config.min_amount {
            if amount < min {
                return Err(limit(format!("amount is below the minimum of {}", min)));
            }
        }
        if let Some(max) = config.max_amount {
            if amount > max {
                return Err(limit(format!("amount is above the maximum of {}", max)));
            }
        }
        if let Some(daily_limit) = config.daily_limit {
            let start_of_day = now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|t| t.and_utc())
                .unwrap_or(now);
            let used = self
                .stores
                .payments
                .provider_volume_since(&config.name, start_of_day)
                .await?;
            if used + amount > daily_limit {
                return Err(limit(format!(
                    "daily limit of {} would be exceeded ({} already used today)",
                    daily_limit, used
                )));
            }
        }
        Ok(())
    }

    async fn call_provider(
        &self,
        provider: &dyn PaymentProvider,
        request: PaymentRequest,
    ) -> Result<ProcessPaymentResponse, PaymentError> {
        let timeout = self.config.provider_timeout;
        match tokio::time::timeout(timeout, provider.process_payment(request)).await {
            Ok(result) => result,
            Err(_) => Err(PaymentError::Timeout {
                provider: provider.name().to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    /// Moves the PENDING payment to where the provider's answer puts it
    async fn apply_provider_response(
        &self,
        payment: Payment,
        response: Result<ProcessPaymentResponse, PaymentError>,
    ) -> GatewayResult<(Payment, ProcessPaymentResponse)> {
        let now = Utc::now();
        let manual_approval = self
            .registry
            .get(&payment.provider)
            .map(|p| p.config().manual_approval_required)
            .unwrap_or(false);

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    payment_id = %payment.id,
                    provider = %payment.provider,
                    error = %e,
                    "provider call failed"
                );
                ProcessPaymentResponse::declined(e.to_string())
            }
        };

        let (target, update) = if !response.accepted
            || matches!(
                response.settlement_state,
                SettlementState::Failed | SettlementState::Cancelled
            ) {
            let reason = response
                .message
                .clone()
                .unwrap_or_else(|| "declined by provider".to_string());
            (PaymentStatus::Failed, StatusUpdate::failed(reason))
        } else if response.requires_manual_verification || manual_approval {
            (PaymentStatus::AwaitingVerification, StatusUpdate::default())
        } else {
            (PaymentStatus::Processing, StatusUpdate::default())
        };
        let update = StatusUpdate {
            external_transaction_id: response.external_transaction_id.clone(),
            ..update
        };

        let updated = self
            .stores
            .payments
            .transition_status(payment.id, payment.status, target, &update, now)
            .await?;

        info!(
            payment_id = %updated.id,
            from_state = %payment.status,
            to_state = %updated.status,
            external_transaction_id = updated.external_transaction_id.as_deref().unwrap_or("-"),
            "provider answered"
        );

        // Synchronous settlement (e.g. a card charged in-line) confirms right away
        if updated.status == PaymentStatus::Processing
            && response.settlement_state == SettlementState::Completed
        {
            let stamp = VerificationStamp {
                method: VerificationMethod::Automatic,
                verified_by: updated.provider.clone(),
                notes: None,
                evidence: Vec::new(),
            };
            let confirmed = confirm_and_mark_paid(
                self.stores.payments.as_ref(),
                &self.side_effects,
                &updated,
                &StatusUpdate::verified(stamp),
                now,
            )
            .await?;
            return Ok((confirmed, response));
        }

        Ok((updated, response))
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Only legal while PENDING or PROCESSING
    pub async fn cancel(&self, payment_id: Uuid, reason: &str, actor: &str) -> GatewayResult<Payment> {
        let payment = self.get(payment_id).await?;
        if !matches!(
            payment.status,
            PaymentStatus::Pending | PaymentStatus::Processing
        ) {
            return Err(GatewayError::InvalidStateTransition {
                from: payment.status.to_string(),
                to: PaymentStatus::Cancelled.to_string(),
            });
        }

        let update = StatusUpdate {
            cancellation_reason: Some(reason.to_string()),
            ..Default::default()
        };
        let cancelled = self
            .stores
            .payments
            .transition_status(
                payment.id,
                payment.status,
                PaymentStatus::Cancelled,
                &update,
                Utc::now(),
            )
            .await?;

        info!(
            payment_id = %cancelled.id,
            from_state = %payment.status,
            to_state = %cancelled.status,
            actor = %actor,
            "payment cancelled"
        );
        self.side_effects
            .emit(PaymentEventType::PaymentCancelled, &cancelled);
        Ok(cancelled)
    }

    // =========================================================================
    // Webhooks
    // =========================================================================

    /// Verify and apply a provider webhook.
    ///
    /// The payment is located by the provider's own transaction id only.
    /// Signature failures are rejected before the payload is interpreted.
    pub async fn handle_webhook(
        &self,
        provider_name: &str,
        payload: &[u8],
        signature: Option<&str>,
    ) -> GatewayResult<WebhookOutcome> {
        let provider = self
            .registry
            .get(provider_name)
            .map_err(|_| GatewayError::not_found("Provider", provider_name))?;

        let verification = provider.verify_webhook(payload, signature)?;
        if !verification.valid {
            warn!(
                provider = %provider.name(),
                reason = verification.reason.as_deref().unwrap_or("-"),
                "webhook signature rejected"
            );
            return Err(GatewayError::SignatureVerification {
                provider: provider.name().to_string(),
            });
        }

        let notification = match provider.handle_webhook(payload)? {
            Some(notification) => notification,
            None => {
                debug!(provider = %provider.name(), "webhook carries no settlement update");
                return Ok(WebhookOutcome::Ignored);
            }
        };

        let payment = match self
            .stores
            .payments
            .find_by_provider_transaction(provider.name(), &notification.external_transaction_id)
            .await?
        {
            Some(payment) => payment,
            None => {
                info!(
                    provider = %provider.name(),
                    external_transaction_id = %notification.external_transaction_id,
                    "webhook for unknown transaction ignored"
                );
                return Ok(WebhookOutcome::Ignored);
            }
        };

        let manual_approval = provider.config().manual_approval_required;
        match self
            .apply_notification(&payment, &notification, manual_approval)
            .await
        {
            Err(GatewayError::InvalidStateTransition { .. }) => {
                // Lost a race with another delivery or a verifier
                let current = self.get(payment.id).await?;
                Ok(settled_outcome(&current, notification.settlement_state)
                    .unwrap_or(WebhookOutcome::Ignored))
            }
            other => other,
        }
    }

    async fn apply_notification(
        &self,
        payment: &Payment,
        notification: &WebhookNotification,
        manual_approval: bool,
    ) -> GatewayResult<WebhookOutcome> {
        if let Some(outcome) = settled_outcome(payment, notification.settlement_state) {
            debug!(payment_id = %payment.id, status = %payment.status, "duplicate webhook");
            return Ok(outcome);
        }

        let now = Utc::now();
        match notification.settlement_state {
            SettlementState::Completed => {
                let needs_verifier = manual_approval
                    || payment.status == PaymentStatus::AwaitingVerification;
                if needs_verifier && payment.status.is_unsettled() {
                    let report = serde_json::json!({
                        "source": "webhook",
                        "state": notification.settlement_state,
                        "external_transaction_id": notification.external_transaction_id,
                        "received_at": notification.received_at,
                    });
                    self.stores
                        .payments
                        .record_provider_report(payment.id, payment.status, &report, now)
                        .await?;
                    info!(
                        payment_id = %payment.id,
                        status = %payment.status,
                        "provider reported settlement; left for manual verification"
                    );
                    return Ok(WebhookOutcome::PendingVerification {
                        payment_id: payment.id,
                    });
                }
                if !matches!(
                    payment.status,
                    PaymentStatus::Pending | PaymentStatus::Processing
                ) {
                    return Ok(WebhookOutcome::Ignored);
                }

                let stamp = VerificationStamp {
                    method: VerificationMethod::Webhook,
                    verified_by: payment.provider.clone(),
                    notes: None,
                    evidence: Vec::new(),
                };
                let confirmed = confirm_and_mark_paid(
                    self.stores.payments.as_ref(),
                    &self.side_effects,
                    payment,
                    &StatusUpdate::verified(stamp),
                    now,
                )
                .await?;
                Ok(WebhookOutcome::Applied {
                    payment_id: confirmed.id,
                    status: confirmed.status,
                })
            }
            SettlementState::Failed | SettlementState::Cancelled => {
                let (target, event) = match payment.status {
                    PaymentStatus::Pending | PaymentStatus::Processing => {
                        (PaymentStatus::Failed, PaymentEventType::PaymentFailed)
                    }
                    PaymentStatus::AwaitingVerification => {
                        (PaymentStatus::Rejected, PaymentEventType::PaymentRejected)
                    }
                    _ => return Ok(WebhookOutcome::Ignored),
                };
                let reason = notification
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "reported failed by provider".to_string());
                let failed = self
                    .stores
                    .payments
                    .transition_status(
                        payment.id,
                        payment.status,
                        target,
                        &StatusUpdate::failed(reason),
                        now,
                    )
                    .await?;

                info!(
                    payment_id = %failed.id,
                    from_state = %payment.status,
                    to_state = %failed.status,
                    "payment failed by webhook"
                );
                self.side_effects.emit(event, &failed);
                Ok(WebhookOutcome::Applied {
                    payment_id: failed.id,
                    status: failed.status,
                })
            }
            SettlementState::Pending | SettlementState::Processing | SettlementState::Unknown => {
                Ok(WebhookOutcome::Ignored)
            }
        }
    }
}

/// `Some(Duplicate)` when the payment already reflects the reported state
fn settled_outcome(payment: &Payment, reported: SettlementState) -> Option<WebhookOutcome> {
    let already = match reported {
        SettlementState::Completed => matches!(
            payment.status,
            PaymentStatus::Confirmed | PaymentStatus::PartiallyRefunded | PaymentStatus::Refunded
        ),
        SettlementState::Failed | SettlementState::Cancelled => matches!(
            payment.status,
            PaymentStatus::Failed | PaymentStatus::Rejected | PaymentStatus::Cancelled
        ),
        _ => false,
    };
    already.then_some(WebhookOutcome::Duplicate {
        payment_id: payment.id,
        status: payment.status,
    })
}

/// Channel details first, caller metadata on top
fn merge_metadata(details: Option<&JsonValue>, metadata: Option<&JsonValue>) -> JsonValue {
    let mut merged = serde_json::Map::new();
    for source in [details, metadata].into_iter().flatten() {
        if let JsonValue::Object(map) = source {
            merged.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
    JsonValue::Object(merged)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_merchant_reference_format() {
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 9, 5, 7).unwrap();
        let reference = generate_merchant_reference("PAY", at);
        let parts: Vec<&str> = reference.split('-').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "PAY");
        assert_eq!(parts[1], "20261018090507");
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_merchant_references_differ() {
        let at = Utc::now();
        assert_ne!(
            generate_merchant_reference("PAY", at),
            generate_merchant_reference("PAY", at)
        );
    }

    #[test]
    fn test_metadata_merge_prefers_caller_metadata() {
        let merged = merge_metadata(
            Some(&json!({"cheque_number": "000123", "bank": "First"})),
            Some(&json!({"bank": "Zenith", "cashier": "c-7"})),
        );
        assert_eq!(merged["cheque_number"], "000123");
        assert_eq!(merged["bank"], "Zenith");
        assert_eq!(merged["cashier"], "c-7");
        assert_eq!(merge_metadata(None, Some(&json!("scalar"))), json!({}));
    }

    #[test]
    fn test_duplicate_detection_for_settled_payments() {
        let mut payment = crate::domain::payment::tests::sample_payment();
        assert!(settled_outcome(&payment, SettlementState::Completed).is_none());

        payment.status = PaymentStatus::Confirmed;
        assert!(matches!(
            settled_outcome(&payment, SettlementState::Completed),
            Some(WebhookOutcome::Duplicate { .. })
        ));
        assert!(settled_outcome(&payment, SettlementState::Failed).is_none());
    }
}
