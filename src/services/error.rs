use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::domain::InvalidTransition;
use crate::error::{AppError, AppErrorKind, DomainError, ValidationError};
use crate::payments::error::PaymentError;
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors raised by the payment workflows
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("validation failed on {field}: {message}")]
    Validation { field: String, message: String },

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error(transparent)]
    Provider(#[from] PaymentError),

    #[error("webhook signature rejected for {provider}")]
    SignatureVerification { provider: String },

    #[error("merchant reference {reference} already exists")]
    DuplicateReference { reference: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    #[error("invoice {invoice_id} is not open for payment")]
    InvoiceNotPayable { invoice_id: String },

    #[error("{provider} cannot take this payment: {reason}")]
    ProviderLimit { provider: String, reason: String },

    #[error("refund of {requested} exceeds refundable balance {refundable}")]
    RefundExceedsPayment { requested: String, refundable: String },

    #[error("database error: {0}")]
    Database(DatabaseError),
}

impl GatewayError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        GatewayError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        GatewayError::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }
}

impl From<InvalidTransition> for GatewayError {
    fn from(err: InvalidTransition) -> Self {
        GatewayError::InvalidStateTransition {
            from: err.from,
            to: err.to,
        }
    }
}

impl From<DatabaseError> for GatewayError {
    fn from(err: DatabaseError) -> Self {
        match err.kind {
            DatabaseErrorKind::NotFound { entity, id } => GatewayError::NotFound { entity, id },
            DatabaseErrorKind::StaleState {
                expected, actual, ..
            } => GatewayError::InvalidStateTransition {
                from: actual,
                to: expected,
            },
            DatabaseErrorKind::InvalidTransition(inner) => inner.into(),
            kind => GatewayError::Database(DatabaseError::new(kind)),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let kind = match err {
            GatewayError::Validation { field, message } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field,
                    reason: message,
                })
            }
            GatewayError::InvalidStateTransition { from, to } => {
                AppErrorKind::Domain(DomainError::InvalidStateTransition { from, to })
            }
            GatewayError::Provider(inner) => return inner.into(),
            GatewayError::SignatureVerification { provider } => {
                AppErrorKind::Domain(DomainError::InvalidSignature { provider })
            }
            GatewayError::DuplicateReference { reference } => {
                AppErrorKind::Domain(DomainError::DuplicateReference { reference })
            }
            GatewayError::NotFound { entity, id } if entity == "Payment" => {
                AppErrorKind::Domain(DomainError::PaymentNotFound { payment_id: id })
            }
            GatewayError::NotFound { entity, id } => {
                AppErrorKind::Domain(DomainError::NotFound { entity, id })
            }
            GatewayError::InvoiceNotPayable { invoice_id } => {
                AppErrorKind::Domain(DomainError::InvoiceNotPayable { invoice_id })
            }
            GatewayError::ProviderLimit { provider, reason } => {
                AppErrorKind::Domain(DomainError::ProviderLimitExceeded { provider, reason })
            }
            GatewayError::RefundExceedsPayment {
                requested,
                refundable,
            } => AppErrorKind::Domain(DomainError::RefundExceedsPayment {
                requested,
                refundable,
            }),
            GatewayError::Database(inner) => return inner.into(),
        };
        AppError::new(kind)
    }
}
