//! Error handling for the payment gateway HTTP edge
//!
//! Every layer keeps its own `thiserror` enum; at the API boundary they all
//! convert into [`AppError`], which knows its HTTP status, machine-readable
//! [`ErrorCode`] and a user-facing message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling by clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "PAYMENT_NOT_FOUND")]
    PaymentNotFound,
    #[serde(rename = "RESOURCE_NOT_FOUND")]
    ResourceNotFound,
    #[serde(rename = "INVALID_STATE_TRANSITION")]
    InvalidStateTransition,
    #[serde(rename = "DUPLICATE_REFERENCE")]
    DuplicateReference,
    #[serde(rename = "INVOICE_NOT_PAYABLE")]
    InvoiceNotPayable,
    #[serde(rename = "PROVIDER_LIMIT_EXCEEDED")]
    ProviderLimitExceeded,
    #[serde(rename = "REFUND_EXCEEDS_PAYMENT")]
    RefundExceedsPayment,
    #[serde(rename = "INVALID_SIGNATURE")]
    InvalidSignature,
    #[serde(rename = "INVALID_CURRENCY")]
    InvalidCurrency,
    #[serde(rename = "INVALID_AMOUNT")]
    InvalidAmount,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 503, 504)
    #[serde(rename = "PAYMENT_PROVIDER_ERROR")]
    PaymentProviderError,
    #[serde(rename = "RATE_LIMIT_ERROR")]
    RateLimitError,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Business rule violations
#[derive(Debug, Clone)]
pub enum DomainError {
    /// Payment with given ID doesn't exist
    PaymentNotFound { payment_id: String },
    /// Any other entity (refund, reconciliation record) doesn't exist
    NotFound { entity: String, id: String },
    /// Lifecycle edge not allowed
    InvalidStateTransition { from: String, to: String },
    /// Merchant reference already taken
    DuplicateReference { reference: String },
    /// Invoice is closed, already paid or unknown
    InvoiceNotPayable { invoice_id: String },
    /// Provider min/max/daily limit would be exceeded
    ProviderLimitExceeded { provider: String, reason: String },
    /// Refund would push refunded total above the payment amount
    RefundExceedsPayment { requested: String, refundable: String },
    /// Webhook or callback signature did not verify
    InvalidSignature { provider: String },
}

/// Infrastructure-level errors (database, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    /// Database connection or query failure
    Database { message: String, is_retryable: bool },
    /// Missing or invalid configuration
    Configuration { message: String },
}

/// External service errors (payment providers)
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// Settlement provider returned an error
    PaymentProvider {
        provider: String,
        message: String,
        is_retryable: bool,
    },
    /// Rate limit exceeded
    RateLimit {
        service: String,
        retry_after: Option<u64>,
    },
    /// External service timeout
    Timeout { service: String, timeout_secs: u64 },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    /// Unsupported or invalid currency
    InvalidCurrency { currency: String, reason: String },
    /// Invalid amount (format or value)
    InvalidAmount { amount: String, reason: String },
    /// Required field missing
    MissingField { field: String },
    /// Anything else that failed validation on a named field
    InvalidField { field: String, reason: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { .. } => 404,
                DomainError::NotFound { .. } => 404,
                DomainError::InvalidStateTransition { .. } => 409, // Conflict
                DomainError::DuplicateReference { .. } => 409,
                DomainError::InvoiceNotPayable { .. } => 422, // Unprocessable Entity
                DomainError::ProviderLimitExceeded { .. } => 422,
                DomainError::RefundExceedsPayment { .. } => 422,
                DomainError::InvalidSignature { .. } => 401,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => 502, // Bad Gateway
                ExternalError::RateLimit { .. } => 429,
                ExternalError::Timeout { .. } => 504,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { .. } => ErrorCode::PaymentNotFound,
                DomainError::NotFound { .. } => ErrorCode::ResourceNotFound,
                DomainError::InvalidStateTransition { .. } => ErrorCode::InvalidStateTransition,
                DomainError::DuplicateReference { .. } => ErrorCode::DuplicateReference,
                DomainError::InvoiceNotPayable { .. } => ErrorCode::InvoiceNotPayable,
                DomainError::ProviderLimitExceeded { .. } => ErrorCode::ProviderLimitExceeded,
                DomainError::RefundExceedsPayment { .. } => ErrorCode::RefundExceedsPayment,
                DomainError::InvalidSignature { .. } => ErrorCode::InvalidSignature,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => ErrorCode::PaymentProviderError,
                ExternalError::RateLimit { .. } => ErrorCode::RateLimitError,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidCurrency { .. } => ErrorCode::InvalidCurrency,
                ValidationError::InvalidAmount { .. } => ErrorCode::InvalidAmount,
                _ => ErrorCode::ValidationError,
            },
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { payment_id } => {
                    format!("Payment '{}' not found", payment_id)
                }
                DomainError::NotFound { entity, id } => format!("{} '{}' not found", entity, id),
                DomainError::InvalidStateTransition { from, to } => {
                    format!("Cannot move from {} to {}", from, to)
                }
                DomainError::DuplicateReference { reference } => {
                    format!("Merchant reference '{}' already exists", reference)
                }
                DomainError::InvoiceNotPayable { invoice_id } => {
                    format!("Invoice '{}' is not open for payment", invoice_id)
                }
                DomainError::ProviderLimitExceeded { provider, reason } => {
                    format!("Provider '{}' cannot accept this payment: {}", provider, reason)
                }
                DomainError::RefundExceedsPayment {
                    requested,
                    refundable,
                } => format!(
                    "Refund of {} exceeds the refundable balance of {}",
                    requested, refundable
                ),
                DomainError::InvalidSignature { .. } => "Invalid webhook signature".to_string(),
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider {
                    provider,
                    is_retryable,
                    ..
                } => {
                    if *is_retryable {
                        format!(
                            "Payment provider ({}) is temporarily unavailable. Please try again",
                            provider
                        )
                    } else {
                        "Payment processing failed. Please contact support".to_string()
                    }
                }
                ExternalError::RateLimit {
                    service,
                    retry_after,
                } => match retry_after {
                    Some(secs) => format!(
                        "Rate limit exceeded for {}. Please try again in {} seconds",
                        service, secs
                    ),
                    None => format!("Rate limit exceeded for {}. Please try again later", service),
                },
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => format!(
                    "{} request timed out after {} seconds. Please try again",
                    service, timeout_secs
                ),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidCurrency { currency, reason } => {
                    format!("Invalid currency '{}': {}", currency, reason)
                }
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { is_retryable, .. } => *is_retryable,
                ExternalError::RateLimit { .. } => true,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// From<DatabaseError> lives in database/error.rs, From<GatewayError> in services/error.rs

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_error() {
        let error = AppError::new(AppErrorKind::Domain(DomainError::InvalidStateTransition {
            from: "CONFIRMED".to_string(),
            to: "PENDING".to_string(),
        }));

        assert_eq!(error.status_code(), 409);
        assert_eq!(error.error_code(), ErrorCode::InvalidStateTransition);
        assert!(error.user_message().contains("CONFIRMED"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_signature_error_is_unauthorized() {
        let error = AppError::new(AppErrorKind::Domain(DomainError::InvalidSignature {
            provider: "card_gateway".to_string(),
        }));

        assert_eq!(error.status_code(), 401);
        assert_eq!(error.error_code(), ErrorCode::InvalidSignature);
    }

    #[test]
    fn test_provider_timeout_is_retryable() {
        let error = AppError::new(AppErrorKind::External(ExternalError::Timeout {
            service: "mobile_wallet".to_string(),
            timeout_secs: 30,
        }));

        assert_eq!(error.status_code(), 504);
        assert_eq!(error.error_code(), ErrorCode::ExternalServiceTimeout);
        assert!(error.is_retryable());
    }

    #[test]
    fn test_validation_error() {
        let error = AppError::new(AppErrorKind::Validation(ValidationError::InvalidAmount {
            amount: "-100".to_string(),
            reason: "Amount must be positive".to_string(),
        }));

        assert_eq!(error.status_code(), 400);
        assert_eq!(error.error_code(), ErrorCode::InvalidAmount);
        assert!(!error.is_retryable());
    }
}
