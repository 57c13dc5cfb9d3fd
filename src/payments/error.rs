use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Payment declined: {message}")]
    PaymentDeclinedError {
        message: String,
        provider_code: Option<String>,
    },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimitError {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Provider {provider} did not answer within {timeout_secs}s")]
    Timeout { provider: String, timeout_secs: u64 },

    #[error("Webhook verification failed: {message}")]
    WebhookVerificationError { message: String },

    #[error("Operation {operation} is not supported by {provider}")]
    Unsupported { provider: String, operation: String },

    #[error("Provider error: provider={provider}, message={message}")]
    ProviderError {
        provider: String,
        message: String,
        provider_code: Option<String>,
        retryable: bool,
    },
}

impl PaymentError {
    pub fn validation(message: impl Into<String>, field: &str) -> Self {
        PaymentError::ValidationError {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }

    pub fn unsupported(provider: &str, operation: &str) -> Self {
        PaymentError::Unsupported {
            provider: provider.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::PaymentDeclinedError { .. } => false,
            PaymentError::NetworkError { .. } => true,
            PaymentError::RateLimitError { .. } => true,
            PaymentError::Timeout { .. } => true,
            PaymentError::WebhookVerificationError { .. } => false,
            PaymentError::Unsupported { .. } => false,
            PaymentError::ProviderError { retryable, .. } => *retryable,
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::ValidationError { .. } => 400,
            PaymentError::PaymentDeclinedError { .. } => 402,
            PaymentError::NetworkError { .. } => 503,
            PaymentError::RateLimitError { .. } => 429,
            PaymentError::Timeout { .. } => 504,
            PaymentError::WebhookVerificationError { .. } => 401,
            PaymentError::Unsupported { .. } => 422,
            PaymentError::ProviderError { .. } => 502,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::PaymentDeclinedError { .. } => {
                "Payment was declined by the provider".to_string()
            }
            PaymentError::NetworkError { .. } | PaymentError::Timeout { .. } => {
                "Payment provider is temporarily unavailable".to_string()
            }
            PaymentError::RateLimitError { .. } => {
                "Too many requests to payment provider. Please retry shortly".to_string()
            }
            PaymentError::WebhookVerificationError { .. } => {
                "Invalid webhook signature".to_string()
            }
            PaymentError::Unsupported { operation, .. } => {
                format!("This payment method does not support {}", operation)
            }
            PaymentError::ProviderError { .. } => "Payment provider returned an error".to_string(),
        }
    }
}

impl From<PaymentError> for crate::error::AppError {
    fn from(err: PaymentError) -> Self {
        use crate::error::{AppError, AppErrorKind, ExternalError, ValidationError};

        let kind = match &err {
            PaymentError::ValidationError { message, field } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: field.clone().unwrap_or_else(|| "request".to_string()),
                    reason: message.clone(),
                })
            }
            PaymentError::Timeout {
                provider,
                timeout_secs,
            } => AppErrorKind::External(ExternalError::Timeout {
                service: provider.clone(),
                timeout_secs: *timeout_secs,
            }),
            PaymentError::RateLimitError {
                retry_after_seconds,
                ..
            } => AppErrorKind::External(ExternalError::RateLimit {
                service: "payment provider".to_string(),
                retry_after: *retry_after_seconds,
            }),
            PaymentError::ProviderError { provider, .. } => {
                AppErrorKind::External(ExternalError::PaymentProvider {
                    provider: provider.clone(),
                    message: err.to_string(),
                    is_retryable: err.is_retryable(),
                })
            }
            _ => AppErrorKind::External(ExternalError::PaymentProvider {
                provider: "payments".to_string(),
                message: err.to_string(),
                is_retryable: err.is_retryable(),
            }),
        };

        AppError::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_http_status_mapping_is_correct() {
        assert_eq!(
            PaymentError::validation("bad", "amount").http_status_code(),
            400
        );
        assert_eq!(
            PaymentError::Timeout {
                provider: "card_gateway".to_string(),
                timeout_secs: 30
            }
            .http_status_code(),
            504
        );
        assert_eq!(
            PaymentError::unsupported("cash", "refunds").http_status_code(),
            422
        );
    }

    #[test]
    fn retryable_flags_are_set() {
        assert!(PaymentError::NetworkError {
            message: "connection reset".to_string()
        }
        .is_retryable());
        assert!(!PaymentError::PaymentDeclinedError {
            message: "declined".to_string(),
            provider_code: None
        }
        .is_retryable());
    }

    #[test]
    fn timeout_converts_to_gateway_timeout() {
        let app: crate::error::AppError = PaymentError::Timeout {
            provider: "mobile_wallet".to_string(),
            timeout_secs: 30,
        }
        .into();
        assert_eq!(app.status_code(), 504);
    }
}
