use crate::domain::Payment;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::{validate_common, PaymentProvider};
use crate::payments::types::{
    ChannelType, FeeStructure, PaymentRequest, ProcessPaymentResponse, ProviderConfig,
    SettlementState, VerificationResult, VerificationType, WebhookNotification,
    WebhookVerificationResult,
};
use crate::payments::utils::{check_webhook_signature, PaymentHttpClient};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{debug, info};

pub const BANK_TRANSFER: &str = "bank_transfer";
pub const LOCAL_BANK: &str = "local_bank";

pub fn default_config() -> ProviderConfig {
    let mut config =
        ProviderConfig::new(BANK_TRANSFER, ChannelType::BankTransfer, VerificationType::Webhook);
    config.display_name = "Bank transfer".to_string();
    config.supports_refunds = false;
    config.fees = FeeStructure {
        percentage: Decimal::ZERO,
        fixed: Decimal::new(50, 0),
        min_fee: None,
        max_fee: None,
    };
    config.expected_processing_secs = 1800;
    config.max_processing_secs = 86_400;
    config.transaction_prefix = "BTRF".to_string();
    config
}

/// Same adapter, configured for in-branch deposits at the facility's bank
pub fn local_bank_config() -> ProviderConfig {
    let mut config = ProviderConfig::new(LOCAL_BANK, ChannelType::LocalBank, VerificationType::Hybrid);
    config.display_name = "Local bank deposit".to_string();
    config.fees = FeeStructure::flat(Decimal::ZERO);
    config.manual_approval_required = true;
    config.expected_processing_secs = 3600;
    config.max_processing_secs = 3 * 86_400;
    config.transaction_prefix = "LBNK".to_string();
    config
}

/// Dedicated virtual account per payment, settled by transfer
pub struct BankTransferProvider {
    config: ProviderConfig,
    http: PaymentHttpClient,
}

impl BankTransferProvider {
    pub fn new(config: ProviderConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(&config.name, Duration::from_secs(30), 2)?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(default_config().with_env_overrides())
    }

    pub fn local_bank_from_env() -> PaymentResult<Self> {
        Self::new(local_bank_config().with_env_overrides())
    }

    fn endpoint(&self, path: &str) -> Option<String> {
        self.config
            .base_url
            .as_deref()
            .map(|base| format!("{}{}", base.trim_end_matches('/'), path))
    }

    /// Validates a payer-supplied source account when both parts are present
    fn validate_source_account(request: &PaymentRequest) -> PaymentResult<()> {
        let account: Option<String> = request.detail("source_account_number");
        let bank_code: Option<String> = request.detail("source_bank_code");

        match (account, bank_code) {
            (None, None) => Ok(()),
            (Some(account), Some(bank_code)) => {
                if account.len() != 10 || !account.chars().all(|c| c.is_ascii_digit()) {
                    return Err(PaymentError::validation(
                        "source_account_number must be 10 digits",
                        "source_account_number",
                    ));
                }
                if nuban::Nuban::new(&bank_code, &account).is_err() {
                    return Err(PaymentError::validation(
                        "source account failed NUBAN check",
                        "source_account_number",
                    ));
                }
                Ok(())
            }
            _ => Err(PaymentError::validation(
                "source_account_number and source_bank_code must be supplied together",
                "source_bank_code",
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VirtualAccountResponse {
    transaction_id: String,
    account_number: String,
    bank_name: String,
    #[serde(default)]
    expires_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransferStatus {
    status: String,
}

#[derive(Debug, Deserialize)]
struct TransferWebhook {
    event: String,
    transaction_id: String,
    status: String,
    #[serde(default)]
    narration: Option<String>,
}

#[async_trait]
impl PaymentProvider for BankTransferProvider {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn signature_header(&self) -> &'static str {
        "x-bank-signature"
    }

    fn validate_request(&self, request: &PaymentRequest) -> PaymentResult<()> {
        validate_common(request)?;
        Self::validate_source_account(request)
    }

    async fn process_payment(&self, request: PaymentRequest) -> PaymentResult<ProcessPaymentResponse> {
        self.validate_request(&request)?;

        let Some(url) = self.endpoint("/v1/virtual-accounts") else {
            // No bank API: hand out a transfer reference the payer quotes in the narration
            let transfer_reference = self.config.generate_transaction_id();
            debug!(
                merchant_reference = %request.merchant_reference,
                transfer_reference = %transfer_reference,
                "issued offline transfer reference"
            );
            return Ok(ProcessPaymentResponse {
                accepted: true,
                external_transaction_id: Some(transfer_reference.clone()),
                settlement_state: SettlementState::Pending,
                redirect_url: None,
                qr_payload: None,
                requires_manual_verification: true,
                message: Some("quote the transfer reference in the narration".to_string()),
                provider_data: Some(serde_json::json!({ "transfer_reference": transfer_reference })),
            });
        };

        let payload = serde_json::json!({
            "reference": request.merchant_reference,
            "amount": request.amount,
            "currency": request.currency,
        });
        let raw: VirtualAccountResponse = self
            .http
            .request_json(
                reqwest::Method::POST,
                &url,
                self.config.api_key.as_deref(),
                Some(&payload),
            )
            .await?;

        info!(
            merchant_reference = %request.merchant_reference,
            external_transaction_id = %raw.transaction_id,
            "virtual account issued"
        );

        Ok(ProcessPaymentResponse {
            accepted: true,
            external_transaction_id: Some(raw.transaction_id),
            settlement_state: SettlementState::Processing,
            redirect_url: None,
            qr_payload: None,
            requires_manual_verification: false,
            message: None,
            provider_data: Some(serde_json::json!({
                "account_number": raw.account_number,
                "bank_name": raw.bank_name,
                "expires_at": raw.expires_at,
            })),
        })
    }

    /// With a bank API the transfer status decides; without one the verifier's
    /// code must equal the issued transfer reference.
    async fn verify_payment(
        &self,
        payment: &Payment,
        code: Option<&str>,
    ) -> PaymentResult<VerificationResult> {
        let external_id = payment.external_transaction_id.as_deref().ok_or_else(|| {
            PaymentError::validation("payment has no transfer reference", "external_transaction_id")
        })?;

        if self.config.base_url.is_none() {
            let verified = code.map(|c| c.trim() == external_id).unwrap_or(false);
            return Ok(VerificationResult {
                verified,
                message: (!verified).then(|| "transfer reference does not match".to_string()),
            });
        }

        let state = self
            .get_payment_status(external_id)
            .await?
            .unwrap_or(SettlementState::Unknown);
        Ok(VerificationResult {
            verified: state == SettlementState::Completed,
            message: None,
        })
    }

    async fn get_payment_status(
        &self,
        external_transaction_id: &str,
    ) -> PaymentResult<Option<SettlementState>> {
        let Some(url) = self.endpoint(&format!("/v1/transfers/{}", external_transaction_id)) else {
            return Err(PaymentError::unsupported(&self.config.name, "status polling"));
        };
        let raw: TransferStatus = self
            .http
            .request_json(reqwest::Method::GET, &url, self.config.api_key.as_deref(), None)
            .await?;
        Ok(Some(SettlementState::from_provider_status(&raw.status)))
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> PaymentResult<WebhookVerificationResult> {
        Ok(check_webhook_signature(
            &self.config.name,
            self.config.webhook_secret.as_deref(),
            payload,
            signature,
        ))
    }

    fn handle_webhook(&self, payload: &[u8]) -> PaymentResult<Option<WebhookNotification>> {
        let raw: JsonValue = serde_json::from_slice(payload).map_err(|e| {
            PaymentError::WebhookVerificationError {
                message: format!("invalid transfer webhook JSON: {}", e),
            }
        })?;
        let event: TransferWebhook = serde_json::from_value(raw.clone()).map_err(|e| {
            PaymentError::WebhookVerificationError {
                message: format!("unexpected transfer webhook shape: {}", e),
            }
        })?;
        if event.event != "transfer.update" {
            return Ok(None);
        }

        Ok(Some(WebhookNotification {
            external_transaction_id: event.transaction_id,
            settlement_state: SettlementState::from_provider_status(&event.status),
            failure_reason: event.narration,
            raw,
            received_at: Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payment::tests::sample_payment;

    fn request(details: JsonValue) -> PaymentRequest {
        PaymentRequest {
            merchant_reference: "PAY-1".to_string(),
            invoice_id: "INV-1".to_string(),
            patient_id: "PAT-1".to_string(),
            facility_id: "FAC-1".to_string(),
            amount: Decimal::new(1_000_000, 2),
            currency: "NGN".to_string(),
            phone_number: None,
            details,
        }
    }

    #[test]
    fn source_account_parts_must_come_together() {
        let provider = BankTransferProvider::new(default_config()).unwrap();
        let err = provider
            .validate_request(&request(serde_json::json!({ "source_account_number": "0123456789" })))
            .unwrap_err();
        assert!(matches!(err, PaymentError::ValidationError { .. }));

        let err = provider
            .validate_request(&request(serde_json::json!({
                "source_account_number": "12345",
                "source_bank_code": "058"
            })))
            .unwrap_err();
        assert!(matches!(err, PaymentError::ValidationError { .. }));
    }

    #[tokio::test]
    async fn offline_mode_issues_transfer_reference() {
        let provider = BankTransferProvider::new(default_config()).unwrap();
        let response = provider.process_payment(request(serde_json::json!({}))).await.unwrap();

        assert!(response.accepted);
        assert!(response.requires_manual_verification);
        let reference = response.external_transaction_id.unwrap();
        assert!(reference.starts_with("BTRF-"));
    }

    #[tokio::test]
    async fn offline_verification_compares_reference() {
        let provider = BankTransferProvider::new(default_config()).unwrap();
        let mut payment = sample_payment();
        payment.external_transaction_id = Some("BTRF-0a1b2c3d4e5f".to_string());

        assert!(provider.verify_payment(&payment, Some("BTRF-0a1b2c3d4e5f")).await.unwrap().verified);
        assert!(!provider.verify_payment(&payment, Some("BTRF-ffffffffffff")).await.unwrap().verified);
        assert!(!provider.verify_payment(&payment, None).await.unwrap().verified);
    }

    #[test]
    fn only_transfer_updates_are_notifications() {
        let provider = BankTransferProvider::new(default_config()).unwrap();
        let body = br#"{"event":"transfer.update","transaction_id":"BTRF-1","status":"completed"}"#;
        let notification = provider.handle_webhook(body).unwrap().unwrap();
        assert_eq!(notification.settlement_state, SettlementState::Completed);

        let body = br#"{"event":"account.created","transaction_id":"BTRF-1","status":"ok"}"#;
        assert!(provider.handle_webhook(body).unwrap().is_none());
    }
}
