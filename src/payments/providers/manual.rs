//! Over-the-counter channels. Nothing leaves the building, so every payment
//! waits for a cashier or finance officer to confirm it.

use crate::domain::Payment;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::{validate_common, PaymentProvider};
use crate::payments::types::{
    ChannelType, PaymentRequest, ProcessPaymentResponse, ProviderConfig, SettlementState,
    VerificationResult, VerificationType,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const CASH: &str = "cash";
pub const CHEQUE: &str = "cheque";

pub fn cash_config() -> ProviderConfig {
    let mut config = ProviderConfig::new(CASH, ChannelType::Cash, VerificationType::Manual);
    config.display_name = "Cash at cashier desk".to_string();
    config.manual_approval_required = true;
    config.supports_refunds = true;
    config.supports_partial_refunds = true;
    config.expected_processing_secs = 600;
    config.max_processing_secs = 86_400;
    config.transaction_prefix = "CASH".to_string();
    config
}

pub fn cheque_config() -> ProviderConfig {
    let mut config = ProviderConfig::new(CHEQUE, ChannelType::Cheque, VerificationType::Manual);
    config.display_name = "Cheque".to_string();
    config.manual_approval_required = true;
    config.min_amount = Some(Decimal::new(1000, 0));
    config.expected_processing_secs = 3 * 86_400;
    config.max_processing_secs = 10 * 86_400;
    config.transaction_prefix = "CHQ".to_string();
    config
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashDenomination {
    pub value: Decimal,
    pub count: u32,
}

pub struct ManualProvider {
    config: ProviderConfig,
}

impl ManualProvider {
    pub fn new(config: ProviderConfig) -> PaymentResult<Self> {
        if !config.channel_type.is_manual() {
            return Err(PaymentError::validation(
                format!("{} is not a cash or cheque channel", config.name),
                "channel_type",
            ));
        }
        Ok(Self { config })
    }

    pub fn cash() -> PaymentResult<Self> {
        Self::new(cash_config().with_env_overrides())
    }

    pub fn cheque() -> PaymentResult<Self> {
        Self::new(cheque_config().with_env_overrides())
    }

    fn validate_cheque(request: &PaymentRequest) -> PaymentResult<()> {
        let number: String = request.detail("cheque_number").unwrap_or_default();
        if number.trim().is_empty() || !number.trim().chars().all(|c| c.is_ascii_digit()) {
            return Err(PaymentError::validation(
                "cheque_number is required and must be numeric",
                "cheque_number",
            ));
        }
        let bank: String = request.detail("cheque_bank").unwrap_or_default();
        if bank.trim().is_empty() {
            return Err(PaymentError::validation(
                "cheque_bank is required",
                "cheque_bank",
            ));
        }
        Ok(())
    }

    /// A denomination breakdown is optional, but when given it must add up
    fn validate_cash(request: &PaymentRequest) -> PaymentResult<()> {
        if request.details.get("denominations").is_none() {
            return Ok(());
        }
        let denominations: Vec<CashDenomination> =
            request.detail("denominations").ok_or_else(|| {
                PaymentError::validation(
                    "denominations must be a list of {value, count}",
                    "denominations",
                )
            })?;
        if denominations.iter().any(|d| d.value <= Decimal::ZERO) {
            return Err(PaymentError::validation(
                "denomination values must be positive",
                "denominations",
            ));
        }
        let total: Decimal = denominations
            .iter()
            .map(|d| d.value * Decimal::from(d.count))
            .sum();
        if total != request.amount {
            return Err(PaymentError::validation(
                format!(
                    "denominations add up to {} but the amount is {}",
                    total, request.amount
                ),
                "denominations",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProvider for ManualProvider {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn validate_request(&self, request: &PaymentRequest) -> PaymentResult<()> {
        validate_common(request)?;
        match self.config.channel_type {
            ChannelType::Cheque => Self::validate_cheque(request),
            _ => Self::validate_cash(request),
        }
    }

    async fn process_payment(&self, request: PaymentRequest) -> PaymentResult<ProcessPaymentResponse> {
        self.validate_request(&request)?;

        Ok(ProcessPaymentResponse {
            accepted: true,
            external_transaction_id: Some(self.config.generate_transaction_id()),
            settlement_state: SettlementState::Pending,
            redirect_url: None,
            qr_payload: None,
            requires_manual_verification: true,
            message: Some(format!("awaiting {} confirmation", self.config.channel_type)),
            provider_data: None,
        })
    }

    /// Cheques: a supplied code must be the cheque number on file.
    /// Cash: a supplied code must be the receipt number on file, if one was recorded.
    async fn verify_payment(
        &self,
        payment: &Payment,
        code: Option<&str>,
    ) -> PaymentResult<VerificationResult> {
        let key = match self.config.channel_type {
            ChannelType::Cheque => "cheque_number",
            _ => "receipt_number",
        };
        let on_file = payment.metadata.get(key).and_then(|v| v.as_str());

        let verified = match (code.map(str::trim), on_file) {
            (Some(code), Some(expected)) => code == expected,
            _ => true,
        };

        Ok(VerificationResult {
            verified,
            message: (!verified).then(|| format!("{} does not match the one on file", key)),
        })
    }

    /// Cash goes back over the counter; nothing to call.
    async fn refund_payment(
        &self,
        _payment: &Payment,
        _amount: Decimal,
        _reason: &str,
    ) -> PaymentResult<crate::payments::types::RefundResponse> {
        if !self.config.supports_refunds {
            return Err(PaymentError::unsupported(&self.config.name, "refunds"));
        }
        Ok(crate::payments::types::RefundResponse {
            external_refund_id: Some(self.config.generate_transaction_id()),
            settlement_state: SettlementState::Completed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payment::tests::sample_payment;
    use rust_decimal_macros::dec;

    fn request(amount: Decimal, details: serde_json::Value) -> PaymentRequest {
        PaymentRequest {
            merchant_reference: "PAY-1".to_string(),
            invoice_id: "INV-1".to_string(),
            patient_id: "PAT-1".to_string(),
            facility_id: "FAC-1".to_string(),
            amount,
            currency: "NGN".to_string(),
            phone_number: None,
            details,
        }
    }

    #[tokio::test]
    async fn cash_always_requires_manual_verification() {
        let provider = ManualProvider::new(cash_config()).unwrap();
        let response = provider
            .process_payment(request(dec!(2500), serde_json::json!({})))
            .await
            .unwrap();
        assert!(response.accepted);
        assert!(response.requires_manual_verification);
        assert!(response.external_transaction_id.unwrap().starts_with("CASH-"));
    }

    #[test]
    fn cash_denominations_must_sum_to_amount() {
        let provider = ManualProvider::new(cash_config()).unwrap();
        let ok = serde_json::json!({ "denominations": [
            { "value": "1000", "count": 2 },
            { "value": "500", "count": 1 }
        ]});
        assert!(provider.validate_request(&request(dec!(2500), ok)).is_ok());

        let short = serde_json::json!({ "denominations": [{ "value": "1000", "count": 2 }] });
        assert!(provider.validate_request(&request(dec!(2500), short)).is_err());
    }

    #[test]
    fn cheque_needs_number_and_bank() {
        let provider = ManualProvider::new(cheque_config()).unwrap();
        let missing_bank = serde_json::json!({ "cheque_number": "004512" });
        assert!(provider
            .validate_request(&request(dec!(5000), missing_bank))
            .is_err());

        let complete = serde_json::json!({ "cheque_number": "004512", "cheque_bank": "First Bank" });
        assert!(provider.validate_request(&request(dec!(5000), complete)).is_ok());
    }

    #[tokio::test]
    async fn cheque_verification_checks_number_on_file() {
        let provider = ManualProvider::new(cheque_config()).unwrap();
        let mut payment = sample_payment();
        payment.metadata = serde_json::json!({ "cheque_number": "004512" });

        assert!(provider.verify_payment(&payment, Some("004512")).await.unwrap().verified);
        let rejected = provider.verify_payment(&payment, Some("999999")).await.unwrap();
        assert!(!rejected.verified);
        assert!(rejected.message.is_some());
    }

    #[test]
    fn rejects_non_manual_channel() {
        let config = ProviderConfig::new("card", ChannelType::BankCard, VerificationType::Webhook);
        assert!(ManualProvider::new(config).is_err());
    }
}
