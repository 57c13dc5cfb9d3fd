//! Verification workflow
//!
//! Manual, bulk and automated confirmation of payments. Confirmation always
//! goes through [`confirm_and_mark_paid`] so the payment and its invoice change
//! in one unit of work. A provider that cannot be reached leaves the payment
//! exactly as it was.

use crate::config::GatewayConfig;
use crate::database::repository::Stores;
use crate::domain::{
    EvidenceAttachment, Payment, PaymentStatus, StatusUpdate, VerificationMethod,
    VerificationStamp,
};
use crate::payments::error::PaymentError;
use crate::payments::provider::PaymentProvider;
use crate::payments::registry::ProviderRegistry;
use crate::payments::types::{SettlementState, VerificationResult};
use crate::services::confirmation::confirm_and_mark_paid;
use crate::services::error::{GatewayError, GatewayResult};
use crate::services::events::{PaymentEventType, SideEffects};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Identity used for automated confirmations
pub const SYSTEM_VERIFIER: &str = "system";

fn default_approved() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceInput {
    pub file_name: String,
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyPaymentRequest {
    /// `false` rejects the payment without asking the provider
    #[serde(default = "default_approved")]
    pub approved: bool,
    /// Proof typed in by the verifier (cheque number, receipt code)
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub evidence: Vec<EvidenceInput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkVerificationItem {
    pub payment_id: Uuid,
    pub success: bool,
    pub status: Option<PaymentStatus>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkVerificationReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<BulkVerificationItem>,
}

#[derive(Clone)]
pub struct VerificationService {
    registry: ProviderRegistry,
    stores: Stores,
    side_effects: SideEffects,
    provider_timeout: Duration,
    bulk_concurrency: usize,
}

impl VerificationService {
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
            bulk_concurrency: config.bulk_verify_concurrency.max(1),
        }
    }

    /// Confirm or reject a payment awaiting verification
    pub async fn verify(
        &self,
        payment_id: Uuid,
        request: VerifyPaymentRequest,
        verifier: &str,
    ) -> GatewayResult<Payment> {
        self.verify_with_method(payment_id, request, verifier, VerificationMethod::Manual)
            .await
    }

    async fn verify_with_method(
        &self,
        payment_id: Uuid,
        request: VerifyPaymentRequest,
        verifier: &str,
        method: VerificationMethod,
    ) -> GatewayResult<Payment> {
        let payment = self
            .stores
            .payments
            .find_payment(payment_id)
            .await?
            .ok_or_else(|| GatewayError::not_found("Payment", payment_id))?;

        if payment.status != PaymentStatus::AwaitingVerification {
            return Err(GatewayError::InvalidStateTransition {
                from: payment.status.to_string(),
                to: PaymentStatus::Confirmed.to_string(),
            });
        }

        let now = Utc::now();
        let stamp = VerificationStamp {
            method,
            verified_by: verifier.to_string(),
            notes: request.notes.clone(),
            evidence: request
                .evidence
                .into_iter()
                .map(|e| EvidenceAttachment {
                    file_name: e.file_name,
                    url: e.url,
                    content_type: e.content_type,
                    uploaded_at: now,
                })
                .collect(),
        };

        if !request.approved {
            return self
                .reject(&payment, stamp, "rejected by verifier".to_string())
                .await;
        }

        let provider = self.registry.get(&payment.provider)?;
        let result = self
            .call_verify(provider.as_ref(), &payment, request.code.as_deref())
            .await?;

        if result.verified {
            confirm_and_mark_paid(
                self.stores.payments.as_ref(),
                &self.side_effects,
                &payment,
                &StatusUpdate::verified(stamp),
                now,
            )
            .await
        } else {
            let reason = result
                .message
                .unwrap_or_else(|| "provider could not verify the payment".to_string());
            self.reject(&payment, stamp, reason).await
        }
    }

    async fn call_verify(
        &self,
        provider: &dyn PaymentProvider,
        payment: &Payment,
        code: Option<&str>,
    ) -> GatewayResult<VerificationResult> {
        match tokio::time::timeout(self.provider_timeout, provider.verify_payment(payment, code))
            .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(PaymentError::Timeout {
                provider: provider.name().to_string(),
                timeout_secs: self.provider_timeout.as_secs(),
            }
            .into()),
        }
    }

    async fn reject(
        &self,
        payment: &Payment,
        stamp: VerificationStamp,
        reason: String,
    ) -> GatewayResult<Payment> {
        let update = StatusUpdate {
            failure_reason: Some(reason),
            verification: Some(stamp),
            ..Default::default()
        };
        let rejected = self
            .stores
            .payments
            .transition_status(
                payment.id,
                payment.status,
                PaymentStatus::Rejected,
                &update,
                Utc::now(),
            )
            .await?;

        info!(
            payment_id = %rejected.id,
            from_state = %payment.status,
            to_state = %rejected.status,
            reason = rejected.failure_reason.as_deref().unwrap_or("-"),
            "payment rejected"
        );
        self.side_effects
            .emit(PaymentEventType::PaymentRejected, &rejected);
        Ok(rejected)
    }

    /// Verify each payment independently; one failure never aborts the batch
    pub async fn bulk_verify(
        &self,
        payment_ids: Vec<Uuid>,
        verifier: &str,
        notes: Option<String>,
    ) -> BulkVerificationReport {
        let results: Vec<BulkVerificationItem> = stream::iter(payment_ids)
            .map(|payment_id| {
                let request = VerifyPaymentRequest {
                    approved: true,
                    code: None,
                    notes: notes.clone(),
                    evidence: Vec::new(),
                };
                async move {
                    match self
                        .verify_with_method(payment_id, request, verifier, VerificationMethod::Bulk)
                        .await
                    {
                        Ok(payment) if payment.status == PaymentStatus::Confirmed => {
                            BulkVerificationItem {
                                payment_id,
                                success: true,
                                status: Some(payment.status),
                                error: None,
                            }
                        }
                        Ok(payment) => BulkVerificationItem {
                            payment_id,
                            success: false,
                            status: Some(payment.status),
                            error: payment.failure_reason,
                        },
                        Err(e) => {
                            warn!(payment_id = %payment_id, error = %e, "bulk verification item failed");
                            BulkVerificationItem {
                                payment_id,
                                success: false,
                                status: None,
                                error: Some(e.to_string()),
                            }
                        }
                    }
                }
            })
            .buffered(self.bulk_concurrency)
            .collect()
            .await;

        let succeeded = results.iter().filter(|r| r.success).count();
        info!(
            total = results.len(),
            succeeded,
            verifier = %verifier,
            "bulk verification finished"
        );

        BulkVerificationReport {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            results,
        }
    }

    /// Poll the provider for a payment and settle it when the provider says so.
    ///
    /// Unsettled reports and unreachable providers leave the payment unchanged.
    /// A payment that needs a verifier only gets the report recorded.
    pub async fn auto_verify(&self, external_transaction_id: &str) -> GatewayResult<Payment> {
        let payment = self
            .stores
            .payments
            .find_by_external_transaction_id(external_transaction_id)
            .await?
            .ok_or_else(|| GatewayError::not_found("Payment", external_transaction_id))?;

        let provider = self.registry.get(&payment.provider)?;
        let state = match tokio::time::timeout(
            self.provider_timeout,
            provider.get_payment_status(external_transaction_id),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(PaymentError::Timeout {
                    provider: provider.name().to_string(),
                    timeout_secs: self.provider_timeout.as_secs(),
                }
                .into())
            }
        };

        let now = Utc::now();
        let needs_verifier = provider.config().manual_approval_required
            || payment.status == PaymentStatus::AwaitingVerification;
        match (state, payment.status) {
            (Some(SettlementState::Completed), status) if needs_verifier && status.is_unsettled() => {
                let report = serde_json::json!({
                    "source": "status_check",
                    "state": SettlementState::Completed,
                    "external_transaction_id": external_transaction_id,
                    "received_at": now,
                });
                let noted = self
                    .stores
                    .payments
                    .record_provider_report(payment.id, payment.status, &report, now)
                    .await?;
                info!(
                    payment_id = %noted.id,
                    status = %noted.status,
                    "provider reported settlement; left for manual verification"
                );
                Ok(noted)
            }
            (Some(SettlementState::Completed), PaymentStatus::Processing) => {
                let stamp = VerificationStamp {
                    method: VerificationMethod::Automatic,
                    verified_by: SYSTEM_VERIFIER.to_string(),
                    notes: None,
                    evidence: Vec::new(),
                };
                confirm_and_mark_paid(
                    self.stores.payments.as_ref(),
                    &self.side_effects,
                    &payment,
                    &StatusUpdate::verified(stamp),
                    now,
                )
                .await
            }
            (
                Some(SettlementState::Failed | SettlementState::Cancelled),
                PaymentStatus::Processing | PaymentStatus::AwaitingVerification,
            ) => {
                let (target, event) = if payment.status == PaymentStatus::Processing {
                    (PaymentStatus::Failed, PaymentEventType::PaymentFailed)
                } else {
                    (PaymentStatus::Rejected, PaymentEventType::PaymentRejected)
                };
                let failed = self
                    .stores
                    .payments
                    .transition_status(
                        payment.id,
                        payment.status,
                        target,
                        &StatusUpdate::failed("reported failed by provider status check"),
                        now,
                    )
                    .await?;
                info!(
                    payment_id = %failed.id,
                    from_state = %payment.status,
                    to_state = %failed.status,
                    "payment failed by status check"
                );
                self.side_effects.emit(event, &failed);
                Ok(failed)
            }
            _ => Ok(payment),
        }
    }
}
