use crate::domain::Payment;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{
    ChannelType, FeeStructure, PaymentRequest, ProcessPaymentResponse, ProviderConfig,
    RefundResponse, SettlementState, VerificationResult, VerificationType, WebhookNotification,
    WebhookVerificationResult,
};
use crate::payments::utils::{check_webhook_signature, PaymentHttpClient};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::info;

pub const CARD_GATEWAY: &str = "card_gateway";

pub fn default_config() -> ProviderConfig {
    let mut config = ProviderConfig::new(CARD_GATEWAY, ChannelType::BankCard, VerificationType::Hybrid);
    config.display_name = "Card payments".to_string();
    config.supported_currencies = vec!["NGN".to_string(), "USD".to_string()];
    config.supports_refunds = true;
    config.supports_partial_refunds = true;
    config.fees = FeeStructure {
        percentage: Decimal::new(15, 1),
        fixed: Decimal::ONE_HUNDRED,
        min_fee: None,
        max_fee: Some(Decimal::new(2000, 0)),
    };
    config.expected_processing_secs = 120;
    config.max_processing_secs = 1800;
    config.transaction_prefix = "CARD".to_string();
    config
}

/// Hosted-checkout card acquirer
pub struct CardGatewayProvider {
    config: ProviderConfig,
    http: PaymentHttpClient,
}

impl CardGatewayProvider {
    pub fn new(config: ProviderConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(&config.name, Duration::from_secs(30), 2)?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(default_config().with_env_overrides())
    }

    fn endpoint(&self, path: &str) -> PaymentResult<String> {
        let base = self
            .config
            .base_url
            .as_deref()
            .ok_or_else(|| PaymentError::ProviderError {
                provider: self.config.name.clone(),
                message: "base url not configured".to_string(),
                provider_code: None,
                retryable: false,
            })?;
        Ok(format!("{}{}", base.trim_end_matches('/'), path))
    }

    async fn fetch_state(&self, external_id: &str) -> PaymentResult<SettlementState> {
        let raw: Envelope<TransactionData> = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.endpoint(&format!("/v1/transactions/{}", external_id))?,
                self.config.api_key.as_deref(),
                None,
            )
            .await?;
        Ok(raw
            .data
            .map(|d| SettlementState::from_provider_status(&d.status))
            .unwrap_or(SettlementState::Unknown))
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct CheckoutData {
    transaction_id: String,
    checkout_url: String,
}

#[derive(Debug, Deserialize)]
struct TransactionData {
    status: String,
}

#[derive(Debug, Deserialize)]
struct RefundData {
    refund_id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct CardWebhook {
    event: String,
    data: CardWebhookData,
}

#[derive(Debug, Deserialize)]
struct CardWebhookData {
    transaction_id: String,
    status: String,
    #[serde(default)]
    gateway_response: Option<String>,
}

#[async_trait]
impl PaymentProvider for CardGatewayProvider {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn signature_header(&self) -> &'static str {
        "x-gateway-signature"
    }

    async fn process_payment(&self, request: PaymentRequest) -> PaymentResult<ProcessPaymentResponse> {
        self.validate_request(&request)?;

        let payload = serde_json::json!({
            "reference": request.merchant_reference,
            "amount": request.amount,
            "currency": request.currency,
            "metadata": {
                "invoice_id": request.invoice_id,
                "patient_id": request.patient_id,
                "facility_id": request.facility_id,
            },
        });

        let raw: Envelope<CheckoutData> = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/v1/checkout")?,
                self.config.api_key.as_deref(),
                Some(&payload),
            )
            .await?;

        let data = match (raw.status, raw.data) {
            (true, Some(data)) => data,
            (_, _) => {
                return Ok(ProcessPaymentResponse::declined(
                    raw.message.unwrap_or_else(|| "checkout rejected".to_string()),
                ))
            }
        };

        info!(
            merchant_reference = %request.merchant_reference,
            external_transaction_id = %data.transaction_id,
            "card checkout session created"
        );

        Ok(ProcessPaymentResponse {
            accepted: true,
            external_transaction_id: Some(data.transaction_id),
            settlement_state: SettlementState::Processing,
            redirect_url: Some(data.checkout_url),
            qr_payload: None,
            requires_manual_verification: false,
            message: raw.message,
            provider_data: None,
        })
    }

    async fn verify_payment(
        &self,
        payment: &Payment,
        _code: Option<&str>,
    ) -> PaymentResult<VerificationResult> {
        let external_id = payment.external_transaction_id.as_deref().ok_or_else(|| {
            PaymentError::validation("payment has no card transaction id", "external_transaction_id")
        })?;
        let state = self.fetch_state(external_id).await?;
        Ok(VerificationResult {
            verified: state == SettlementState::Completed,
            message: Some(format!("gateway reports {:?}", state).to_lowercase()),
        })
    }

    async fn refund_payment(
        &self,
        payment: &Payment,
        amount: Decimal,
        reason: &str,
    ) -> PaymentResult<RefundResponse> {
        let external_id = payment.external_transaction_id.as_deref().ok_or_else(|| {
            PaymentError::validation("payment has no card transaction id", "external_transaction_id")
        })?;
        let payload = serde_json::json!({
            "transaction_id": external_id,
            "amount": amount,
            "reason": reason,
        });
        let raw: Envelope<RefundData> = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/v1/refunds")?,
                self.config.api_key.as_deref(),
                Some(&payload),
            )
            .await?;
        let data = raw.data.ok_or_else(|| PaymentError::ProviderError {
            provider: self.config.name.clone(),
            message: raw.message.unwrap_or_else(|| "refund rejected".to_string()),
            provider_code: None,
            retryable: false,
        })?;
        Ok(RefundResponse {
            external_refund_id: Some(data.refund_id),
            settlement_state: SettlementState::from_provider_status(&data.status),
        })
    }

    async fn get_payment_status(
        &self,
        external_transaction_id: &str,
    ) -> PaymentResult<Option<SettlementState>> {
        self.fetch_state(external_transaction_id).await.map(Some)
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
                message: format!("invalid card webhook JSON: {}", e),
            }
        })?;
        let event: CardWebhook = serde_json::from_value(raw.clone()).map_err(|e| {
            PaymentError::WebhookVerificationError {
                message: format!("unexpected card webhook shape: {}", e),
            }
        })?;

        if !event.event.starts_with("charge.") {
            return Ok(None);
        }

        let settlement_state = SettlementState::from_provider_status(&event.data.status);
        let failure_reason = match settlement_state {
            SettlementState::Failed | SettlementState::Cancelled => event.data.gateway_response,
            _ => None,
        };

        Ok(Some(WebhookNotification {
            external_transaction_id: event.data.transaction_id,
            settlement_state,
            failure_reason,
            raw,
            received_at: Utc::now(),
        }))
    }
}
