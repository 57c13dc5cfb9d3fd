use crate::domain::Payment;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::types::{
    PaymentRequest, ProcessPaymentResponse, ProviderConfig, RefundResponse, SettlementState,
    VerificationResult, WebhookNotification, WebhookVerificationResult,
};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Settlement channel adapter.
///
/// Only `process_payment` and `verify_payment` are mandatory; channels that
/// have no refund API, no status endpoint or no webhooks keep the defaults.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn config(&self) -> &ProviderConfig;

    fn name(&self) -> &str {
        &self.config().name
    }

    /// Header carrying the webhook signature for this provider
    fn signature_header(&self) -> &'static str {
        "x-webhook-signature"
    }

    /// Checks shared by every channel. Runs before any network call.
    fn validate_request(&self, request: &PaymentRequest) -> PaymentResult<()> {
        validate_common(request)
    }

    async fn process_payment(&self, request: PaymentRequest)
        -> PaymentResult<ProcessPaymentResponse>;

    /// `code` is whatever proof the verifier typed in (cheque number, receipt code)
    async fn verify_payment(
        &self,
        payment: &Payment,
        code: Option<&str>,
    ) -> PaymentResult<VerificationResult>;

    async fn refund_payment(
        &self,
        _payment: &Payment,
        _amount: Decimal,
        _reason: &str,
    ) -> PaymentResult<RefundResponse> {
        Err(PaymentError::unsupported(self.name(), "refunds"))
    }

    async fn get_payment_status(
        &self,
        _external_transaction_id: &str,
    ) -> PaymentResult<Option<SettlementState>> {
        Err(PaymentError::unsupported(self.name(), "status polling"))
    }

    fn verify_webhook(
        &self,
        _payload: &[u8],
        _signature: Option<&str>,
    ) -> PaymentResult<WebhookVerificationResult> {
        Ok(WebhookVerificationResult {
            valid: false,
            reason: Some(format!("{} does not accept webhooks", self.name())),
        })
    }

    /// `Ok(None)` means the event is not a settlement update
    fn handle_webhook(&self, _payload: &[u8]) -> PaymentResult<Option<WebhookNotification>> {
        Ok(None)
    }
}

pub fn validate_common(request: &PaymentRequest) -> PaymentResult<()> {
    if request.amount <= Decimal::ZERO {
        return Err(PaymentError::validation(
            "amount must be greater than zero",
            "amount",
        ));
    }
    if request.amount.normalize().scale() > 2 {
        return Err(PaymentError::validation(
            "amount must have at most 2 decimal places",
            "amount",
        ));
    }
    if request.currency.trim().len() != 3 {
        return Err(PaymentError::validation(
            "currency must be a 3-letter ISO code",
            "currency",
        ));
    }
    for (field, value) in [
        ("invoice_id", &request.invoice_id),
        ("patient_id", &request.patient_id),
        ("facility_id", &request.facility_id),
    ] {
        if value.trim().is_empty() {
            return Err(PaymentError::validation(
                format!("{} is required", field),
                field,
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::{ChannelType, VerificationType};
    use rust_decimal_macros::dec;

    struct MockProvider {
        config: ProviderConfig,
    }

    #[async_trait]
    impl PaymentProvider for MockProvider {
        fn config(&self) -> &ProviderConfig {
            &self.config
        }

        async fn process_payment(
            &self,
            request: PaymentRequest,
        ) -> PaymentResult<ProcessPaymentResponse> {
            self.validate_request(&request)?;
            Ok(ProcessPaymentResponse {
                accepted: true,
                external_transaction_id: Some(self.config.generate_transaction_id()),
                settlement_state: SettlementState::Processing,
                redirect_url: None,
                qr_payload: None,
                requires_manual_verification: false,
                message: None,
                provider_data: None,
            })
        }

        async fn verify_payment(
            &self,
            _payment: &Payment,
            _code: Option<&str>,
        ) -> PaymentResult<VerificationResult> {
            Ok(VerificationResult {
                verified: true,
                message: None,
            })
        }
    }

    fn request(amount: Decimal) -> PaymentRequest {
        PaymentRequest {
            merchant_reference: "PAY-1".to_string(),
            invoice_id: "INV-1".to_string(),
            patient_id: "PAT-1".to_string(),
            facility_id: "FAC-1".to_string(),
            amount,
            currency: "NGN".to_string(),
            phone_number: None,
            details: serde_json::json!({}),
        }
    }

    fn mock() -> Box<dyn PaymentProvider> {
        Box::new(MockProvider {
            config: ProviderConfig::new("mock", ChannelType::BankCard, VerificationType::Webhook),
        })
    }

    #[tokio::test]
    async fn defaults_reject_optional_capabilities() {
        let provider = mock();
        assert!(matches!(
            provider.get_payment_status("X").await,
            Err(PaymentError::Unsupported { .. })
        ));
        let verification = provider.verify_webhook(b"{}", Some("sig")).unwrap();
        assert!(!verification.valid);
        assert!(provider.handle_webhook(b"{}").unwrap().is_none());
    }

    #[tokio::test]
    async fn common_validation_runs_before_processing() {
        let provider = mock();
        assert!(provider.process_payment(request(dec!(10.50))).await.is_ok());
        assert!(provider.process_payment(request(dec!(0))).await.is_err());
        assert!(provider.process_payment(request(dec!(10.505))).await.is_err());

        let mut missing = request(dec!(5));
        missing.patient_id = " ".to_string();
        let err = provider.process_payment(missing).await.unwrap_err();
        assert!(matches!(
            err,
            PaymentError::ValidationError { field: Some(ref f), .. } if f == "patient_id"
        ));
    }
}
