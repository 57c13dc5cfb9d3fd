use crate::payments::error::PaymentError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use uuid::Uuid;

/// How money physically moves for a provider
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    BankCard,
    LocalBank,
    MobileWallet,
    Cash,
    Cheque,
    BankTransfer,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::BankCard => "bank_card",
            ChannelType::LocalBank => "local_bank",
            ChannelType::MobileWallet => "mobile_wallet",
            ChannelType::Cash => "cash",
            ChannelType::Cheque => "cheque",
            ChannelType::BankTransfer => "bank_transfer",
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, ChannelType::Cash | ChannelType::Cheque)
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChannelType {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "bank_card" | "card" => Ok(ChannelType::BankCard),
            "local_bank" => Ok(ChannelType::LocalBank),
            "mobile_wallet" | "wallet" => Ok(ChannelType::MobileWallet),
            "cash" => Ok(ChannelType::Cash),
            "cheque" | "check" => Ok(ChannelType::Cheque),
            "bank_transfer" | "transfer" => Ok(ChannelType::BankTransfer),
            _ => Err(PaymentError::validation(
                format!("unsupported channel type: {}", value),
                "channel_type",
            )),
        }
    }
}

/// How settlement gets confirmed for a provider
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VerificationType {
    Manual,
    AutomaticApi,
    Webhook,
    Hybrid,
}

impl VerificationType {
    /// Whether the provider exposes a status endpoint that can be polled
    pub fn supports_polling(&self) -> bool {
        matches!(self, VerificationType::AutomaticApi | VerificationType::Hybrid)
    }
}

impl FromStr for VerificationType {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "manual" => Ok(VerificationType::Manual),
            "automatic_api" | "api" | "automatic" => Ok(VerificationType::AutomaticApi),
            "webhook" => Ok(VerificationType::Webhook),
            "hybrid" => Ok(VerificationType::Hybrid),
            _ => Err(PaymentError::validation(
                format!("unsupported verification type: {}", value),
                "verification_type",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeStructure {
    /// Percentage of the amount, e.g. `1.5` for 1.5%
    pub percentage: Decimal,
    pub fixed: Decimal,
    pub min_fee: Option<Decimal>,
    pub max_fee: Option<Decimal>,
}

impl FeeStructure {
    pub fn flat(fixed: Decimal) -> Self {
        Self {
            percentage: Decimal::ZERO,
            fixed,
            min_fee: None,
            max_fee: None,
        }
    }
}

/// Static settings for one registered provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub display_name: String,
    pub channel_type: ChannelType,
    pub verification_type: VerificationType,
    /// Force AWAITING_VERIFICATION regardless of verification type
    pub manual_approval_required: bool,
    pub supported_currencies: Vec<String>,
    pub supports_refunds: bool,
    pub supports_partial_refunds: bool,
    pub fees: FeeStructure,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    pub daily_limit: Option<Decimal>,
    pub expected_processing_secs: u64,
    pub max_processing_secs: u64,
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub transaction_prefix: String,
}

impl ProviderConfig {
    pub fn new(name: &str, channel_type: ChannelType, verification_type: VerificationType) -> Self {
        Self {
            name: name.to_string(),
            display_name: name.replace('_', " "),
            channel_type,
            verification_type,
            manual_approval_required: false,
            supported_currencies: vec!["NGN".to_string()],
            supports_refunds: false,
            supports_partial_refunds: false,
            fees: FeeStructure::flat(Decimal::ZERO),
            min_amount: None,
            max_amount: None,
            daily_limit: None,
            expected_processing_secs: 300,
            max_processing_secs: 3600,
            webhook_secret: None,
            base_url: None,
            api_key: None,
            transaction_prefix: name
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .take(4)
                .collect::<String>()
                .to_uppercase(),
        }
    }

    /// Apply `{NAME}_*` environment overrides on top of `self`
    pub fn with_env_overrides(mut self) -> Self {
        let key = |suffix: &str| format!("{}_{}", self.name.to_uppercase(), suffix);
        let decimal = |suffix: &str| {
            std::env::var(key(suffix))
                .ok()
                .and_then(|v| Decimal::from_str(v.trim()).ok())
        };
        let number = |suffix: &str| {
            std::env::var(key(suffix))
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
        };
        let flag = |suffix: &str| {
            std::env::var(key(suffix))
                .ok()
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
        };

        let fee_percent = decimal("FEE_PERCENT");
        let fee_fixed = decimal("FEE_FIXED");
        let fee_min = decimal("FEE_MIN");
        let fee_max = decimal("FEE_MAX");
        let min_amount = decimal("MIN_AMOUNT");
        let max_amount = decimal("MAX_AMOUNT");
        let daily_limit = decimal("DAILY_LIMIT");
        let expected = number("EXPECTED_PROCESSING_SECS");
        let max_processing = number("MAX_PROCESSING_SECS");
        let manual_approval = flag("MANUAL_APPROVAL_REQUIRED");
        let webhook_secret = std::env::var(key("WEBHOOK_SECRET")).ok();
        let base_url = std::env::var(key("BASE_URL")).ok();
        let api_key = std::env::var(key("API_KEY")).ok();
        let currencies = std::env::var(key("CURRENCIES")).ok();
        let verification = std::env::var(key("VERIFICATION_TYPE"))
            .ok()
            .and_then(|v| v.parse::<VerificationType>().ok());

        if let Some(v) = fee_percent {
            self.fees.percentage = v;
        }
        if let Some(v) = fee_fixed {
            self.fees.fixed = v;
        }
        if fee_min.is_some() {
            self.fees.min_fee = fee_min;
        }
        if fee_max.is_some() {
            self.fees.max_fee = fee_max;
        }
        if min_amount.is_some() {
            self.min_amount = min_amount;
        }
        if max_amount.is_some() {
            self.max_amount = max_amount;
        }
        if daily_limit.is_some() {
            self.daily_limit = daily_limit;
        }
        if let Some(v) = expected {
            self.expected_processing_secs = v;
        }
        if let Some(v) = max_processing {
            self.max_processing_secs = v;
        }
        if let Some(v) = manual_approval {
            self.manual_approval_required = v;
        }
        if let Some(v) = verification {
            self.verification_type = v;
        }
        if webhook_secret.is_some() {
            self.webhook_secret = webhook_secret;
        }
        if base_url.is_some() {
            self.base_url = base_url;
        }
        if api_key.is_some() {
            self.api_key = api_key;
        }
        if let Some(list) = currencies {
            self.supported_currencies = list
                .split(',')
                .map(|c| c.trim().to_uppercase())
                .filter(|c| !c.is_empty())
                .collect();
        }
        self
    }

    pub fn supports_currency(&self, currency: &str) -> bool {
        self.supported_currencies
            .iter()
            .any(|c| c.eq_ignore_ascii_case(currency))
    }

    /// `{PREFIX}-{12 hex}` id for providers that don't assign one
    pub fn generate_transaction_id(&self) -> String {
        let hex = Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.transaction_prefix, &hex[..12])
    }
}

/// Provider-side view of a settlement
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SettlementState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl SettlementState {
    /// Maps free-form provider status strings
    pub fn from_provider_status(status: &str) -> Self {
        match status.trim().to_lowercase().as_str() {
            "pending" | "initiated" | "created" => SettlementState::Pending,
            "processing" | "ongoing" | "in_progress" => SettlementState::Processing,
            "success" | "successful" | "completed" | "paid" | "settled" => {
                SettlementState::Completed
            }
            "failed" | "declined" | "error" | "expired" => SettlementState::Failed,
            "cancelled" | "canceled" | "abandoned" | "reversed" => SettlementState::Cancelled,
            _ => SettlementState::Unknown,
        }
    }
}

/// What an adapter receives when asked to move money
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub merchant_reference: String,
    pub invoice_id: String,
    pub patient_id: String,
    pub facility_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub phone_number: Option<String>,
    /// Channel-specific detail bag (cheque number, cash denominations, ...)
    pub details: JsonValue,
}

impl PaymentRequest {
    /// Typed view of one key of the detail bag
    pub fn detail<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.details
            .get(key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessPaymentResponse {
    pub accepted: bool,
    pub external_transaction_id: Option<String>,
    pub settlement_state: SettlementState,
    pub redirect_url: Option<String>,
    pub qr_payload: Option<String>,
    pub requires_manual_verification: bool,
    pub message: Option<String>,
    /// Extra channel output worth keeping on the payment (virtual account, normalised phone)
    pub provider_data: Option<JsonValue>,
}

impl ProcessPaymentResponse {
    pub fn declined(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            external_transaction_id: None,
            settlement_state: SettlementState::Failed,
            redirect_url: None,
            qr_payload: None,
            requires_manual_verification: false,
            message: Some(message.into()),
            provider_data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verified: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundResponse {
    pub external_refund_id: Option<String>,
    pub settlement_state: SettlementState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookVerificationResult {
    pub valid: bool,
    pub reason: Option<String>,
}

/// Settlement update carried by a verified webhook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookNotification {
    pub external_transaction_id: String,
    pub settlement_state: SettlementState,
    pub failure_reason: Option<String>,
    pub raw: JsonValue,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn channel_type_parses_aliases() {
        assert_eq!("card".parse::<ChannelType>().unwrap(), ChannelType::BankCard);
        assert_eq!("Cheque".parse::<ChannelType>().unwrap(), ChannelType::Cheque);
        assert!("crypto".parse::<ChannelType>().is_err());
    }

    #[test]
    fn settlement_state_maps_provider_strings() {
        assert_eq!(
            SettlementState::from_provider_status("SUCCESSFUL"),
            SettlementState::Completed
        );
        assert_eq!(
            SettlementState::from_provider_status("declined"),
            SettlementState::Failed
        );
        assert_eq!(
            SettlementState::from_provider_status("weird"),
            SettlementState::Unknown
        );
    }

    #[test]
    fn generated_transaction_id_uses_prefix() {
        let mut config = ProviderConfig::new("card_gateway", ChannelType::BankCard, VerificationType::Webhook);
        config.transaction_prefix = "CARD".to_string();
        let id = config.generate_transaction_id();
        assert!(id.starts_with("CARD-"));
        assert_eq!(id.len(), "CARD-".len() + 12);
    }

    #[test]
    fn detail_bag_is_typed() {
        let request = PaymentRequest {
            merchant_reference: "PAY-1".to_string(),
            invoice_id: "INV-1".to_string(),
            patient_id: "PAT-1".to_string(),
            facility_id: "FAC-1".to_string(),
            amount: dec!(10),
            currency: "NGN".to_string(),
            phone_number: None,
            details: serde_json::json!({ "cheque_number": "000123" }),
        };
        assert_eq!(request.detail::<String>("cheque_number").as_deref(), Some("000123"));
        assert_eq!(request.detail::<String>("bank"), None);
    }
}
