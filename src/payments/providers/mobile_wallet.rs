use crate::domain::Payment;
use crate::logging::mask_phone;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::{validate_common, PaymentProvider};
use crate::payments::types::{
    ChannelType, FeeStructure, PaymentRequest, ProcessPaymentResponse, ProviderConfig,
    SettlementState, VerificationResult, VerificationType, WebhookNotification,
    WebhookVerificationResult,
};
use crate::payments::utils::{check_webhook_signature, PaymentHttpClient};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use regex::Regex;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::info;

pub const MOBILE_WALLET: &str = "mobile_wallet";

/// `+234` or `0` followed by a 10-digit Nigerian mobile number
const NIGERIAN_MOBILE: &str = r"^(?:\+?234|0)([789][01]\d{8})$";

pub fn default_config() -> ProviderConfig {
    let mut config =
        ProviderConfig::new(MOBILE_WALLET, ChannelType::MobileWallet, VerificationType::Hybrid);
    config.display_name = "Mobile wallet".to_string();
    config.fees = FeeStructure {
        percentage: Decimal::ONE,
        fixed: Decimal::ZERO,
        min_fee: Some(Decimal::new(10, 0)),
        max_fee: Some(Decimal::new(1000, 0)),
    };
    config.max_amount = Some(Decimal::new(5_000_000, 0));
    config.expected_processing_secs = 60;
    config.max_processing_secs = 900;
    config.transaction_prefix = "MWAL".to_string();
    config
}

pub struct MobileWalletProvider {
    config: ProviderConfig,
    http: PaymentHttpClient,
    phone_pattern: Regex,
    country_code: String,
}

impl MobileWalletProvider {
    pub fn new(config: ProviderConfig) -> PaymentResult<Self> {
        let phone_pattern = Regex::new(NIGERIAN_MOBILE).map_err(|e| PaymentError::ProviderError {
            provider: config.name.clone(),
            message: format!("invalid phone pattern: {}", e),
            provider_code: None,
            retryable: false,
        })?;
        let http = PaymentHttpClient::new(&config.name, Duration::from_secs(30), 2)?;
        Ok(Self {
            config,
            http,
            phone_pattern,
            country_code: "+234".to_string(),
        })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(default_config().with_env_overrides())
    }

    /// E.164 form of a local or international Nigerian number
    pub fn normalize_phone(&self, raw: &str) -> PaymentResult<String> {
        let compact: String = raw
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect();
        let captures = self.phone_pattern.captures(&compact).ok_or_else(|| {
            PaymentError::validation(
                "phone_number must be a Nigerian mobile number (+234XXXXXXXXXX or 0XXXXXXXXXX)",
                "phone_number",
            )
        })?;
        Ok(format!("{}{}", self.country_code, &captures[1]))
    }

    fn qr_payload(request: &PaymentRequest, phone: &str, external_id: &str) -> String {
        let body = serde_json::json!({
            "ref": request.merchant_reference,
            "txn": external_id,
            "amt": request.amount,
            "cur": request.currency,
            "msisdn": phone,
        });
        STANDARD.encode(body.to_string())
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
}

#[derive(Debug, Deserialize)]
struct CollectionResponse {
    transaction_id: Option<String>,
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct WalletWebhook {
    transaction_id: String,
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

#[async_trait]
impl PaymentProvider for MobileWalletProvider {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn signature_header(&self) -> &'static str {
        "x-wallet-signature"
    }

    fn validate_request(&self, request: &PaymentRequest) -> PaymentResult<()> {
        validate_common(request)?;
        let phone = request
            .phone_number
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                PaymentError::validation("phone_number is required for mobile wallet", "phone_number")
            })?;
        self.normalize_phone(phone).map(|_| ())
    }

    async fn process_payment(&self, request: PaymentRequest) -> PaymentResult<ProcessPaymentResponse> {
        self.validate_request(&request)?;
        let phone = self.normalize_phone(request.phone_number.as_deref().unwrap_or_default())?;

        let payload = serde_json::json!({
            "reference": request.merchant_reference,
            "msisdn": phone,
            "amount": request.amount,
            "currency": request.currency,
        });
        let raw: CollectionResponse = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/v1/collections")?,
                self.config.api_key.as_deref(),
                Some(&payload),
            )
            .await?;

        let state = SettlementState::from_provider_status(&raw.status);
        if matches!(state, SettlementState::Failed | SettlementState::Cancelled) {
            return Ok(ProcessPaymentResponse::declined(
                raw.message.unwrap_or_else(|| "wallet collection rejected".to_string()),
            ));
        }

        let external_id = raw
            .transaction_id
            .unwrap_or_else(|| self.config.generate_transaction_id());

        info!(
            merchant_reference = %request.merchant_reference,
            phone = %mask_phone(&phone),
            "mobile wallet collection requested"
        );

        Ok(ProcessPaymentResponse {
            accepted: true,
            qr_payload: Some(Self::qr_payload(&request, &phone, &external_id)),
            external_transaction_id: Some(external_id),
            settlement_state: match state {
                SettlementState::Completed => SettlementState::Completed,
                _ => SettlementState::Processing,
            },
            redirect_url: None,
            requires_manual_verification: false,
            message: raw.message,
            provider_data: Some(serde_json::json!({ "msisdn": phone })),
        })
    }

    async fn verify_payment(
        &self,
        payment: &Payment,
        _code: Option<&str>,
    ) -> PaymentResult<VerificationResult> {
        let external_id = payment.external_transaction_id.as_deref().ok_or_else(|| {
            PaymentError::validation("payment has no wallet transaction id", "external_transaction_id")
        })?;
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
        let raw: StatusResponse = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.endpoint(&format!("/v1/collections/{}", external_transaction_id))?,
                self.config.api_key.as_deref(),
                None,
            )
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
                message: format!("invalid wallet webhook JSON: {}", e),
            }
        })?;
        let event: WalletWebhook = serde_json::from_value(raw.clone()).map_err(|e| {
            PaymentError::WebhookVerificationError {
                message: format!("unexpected wallet webhook shape: {}", e),
            }
        })?;

        Ok(Some(WebhookNotification {
            external_transaction_id: event.transaction_id,
            settlement_state: SettlementState::from_provider_status(&event.status),
            failure_reason: event.reason,
            raw,
            received_at: Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> MobileWalletProvider {
        MobileWalletProvider::new(default_config()).expect("provider should build")
    }

    fn request(phone: Option<&str>) -> PaymentRequest {
        PaymentRequest {
            merchant_reference: "PAY-1".to_string(),
            invoice_id: "INV-1".to_string(),
            patient_id: "PAT-1".to_string(),
            facility_id: "FAC-1".to_string(),
            amount: Decimal::new(250000, 2),
            currency: "NGN".to_string(),
            phone_number: phone.map(str::to_string),
            details: serde_json::json!({}),
        }
    }

    #[test]
    fn normalizes_local_and_international_numbers() {
        let provider = provider();
        assert_eq!(provider.normalize_phone("08031234567").unwrap(), "+2348031234567");
        assert_eq!(provider.normalize_phone("+234 803 123 4567").unwrap(), "+2348031234567");
        assert_eq!(provider.normalize_phone("2349011112222").unwrap(), "+2349011112222");
    }

    #[test]
    fn rejects_malformed_numbers() {
        let provider = provider();
        assert!(provider.normalize_phone("0803123456").is_err());
        assert!(provider.normalize_phone("+14155550100").is_err());
        assert!(provider.normalize_phone("06031234567").is_err());
    }

    #[test]
    fn phone_is_required() {
        let provider = provider();
        let err = provider.validate_request(&request(None)).unwrap_err();
        assert!(matches!(
            err,
            PaymentError::ValidationError { field: Some(ref f), .. } if f == "phone_number"
        ));
        assert!(provider.validate_request(&request(Some("08031234567"))).is_ok());
    }

    #[test]
    fn qr_payload_is_base64_json() {
        let payload = MobileWalletProvider::qr_payload(&request(None), "+2348031234567", "MWAL-abc");
        let decoded = STANDARD.decode(payload).unwrap();
        let json: JsonValue = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(json["txn"], "MWAL-abc");
        assert_eq!(json["msisdn"], "+2348031234567");
    }

    #[test]
    fn webhook_maps_status() {
        let provider = provider();
        let notification = provider
            .handle_webhook(br#"{"transaction_id":"MWAL-1","status":"SUCCESSFUL"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(notification.settlement_state, SettlementState::Completed);
    }
}
