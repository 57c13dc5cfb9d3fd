use crate::domain::InvalidTransition;
use crate::error::{AppError, AppErrorKind, DomainError, InfrastructureError};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    /// Pool exhausted, connection refused or dropped
    Connection { message: String },
    Query { message: String },
    NotFound { entity: String, id: String },
    UniqueViolation { constraint: String },
    /// Compare-and-swap lost: the row is no longer in the expected state
    StaleState {
        entity: String,
        id: String,
        expected: String,
        actual: String,
    },
    InvalidTransition(InvalidTransition),
    /// Row could not be mapped back into a domain value
    InvalidData { message: String },
    Unknown { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn not_found(entity: &str, id: impl fmt::Display) -> Self {
        Self::new(DatabaseErrorKind::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        })
    }

    pub fn stale(
        entity: &str,
        id: impl fmt::Display,
        expected: impl fmt::Display,
        actual: impl fmt::Display,
    ) -> Self {
        Self::new(DatabaseErrorKind::StaleState {
            entity: entity.to_string(),
            id: id.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::InvalidData {
            message: message.into(),
        })
    }

    #[cfg(feature = "database")]
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound {
                entity: "row".to_string(),
                id: String::new(),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseErrorKind::Connection {
                    message: err.to_string(),
                }
            }
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                DatabaseErrorKind::UniqueViolation {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                }
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                DatabaseErrorKind::InvalidData {
                    message: err.to_string(),
                }
            }
            _ => DatabaseErrorKind::Query {
                message: err.to_string(),
            },
        };
        Self { kind }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::Connection { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::NotFound { .. })
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DatabaseErrorKind::Connection { message } => write!(f, "connection error: {}", message),
            DatabaseErrorKind::Query { message } => write!(f, "query error: {}", message),
            DatabaseErrorKind::NotFound { entity, id } => write!(f, "{} not found: {}", entity, id),
            DatabaseErrorKind::UniqueViolation { constraint } => {
                write!(f, "unique constraint violated: {}", constraint)
            }
            DatabaseErrorKind::StaleState {
                entity,
                id,
                expected,
                actual,
            } => write!(
                f,
                "{} {} expected in {} but found {}",
                entity, id, expected, actual
            ),
            DatabaseErrorKind::InvalidTransition(inner) => write!(f, "{}", inner),
            DatabaseErrorKind::InvalidData { message } => write!(f, "invalid data: {}", message),
            DatabaseErrorKind::Unknown { message } => write!(f, "database error: {}", message),
        }
    }
}

impl std::error::Error for DatabaseError {}

impl From<InvalidTransition> for DatabaseError {
    fn from(err: InvalidTransition) -> Self {
        Self::new(DatabaseErrorKind::InvalidTransition(err))
    }
}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        let kind = match err.kind {
            DatabaseErrorKind::NotFound { entity, id } if entity == "Payment" => {
                AppErrorKind::Domain(DomainError::PaymentNotFound { payment_id: id })
            }
            DatabaseErrorKind::NotFound { entity, id } => {
                AppErrorKind::Domain(DomainError::NotFound { entity, id })
            }
            DatabaseErrorKind::StaleState {
                expected, actual, ..
            } => AppErrorKind::Domain(DomainError::InvalidStateTransition {
                from: actual,
                to: expected,
            }),
            DatabaseErrorKind::InvalidTransition(inner) => {
                AppErrorKind::Domain(DomainError::InvalidStateTransition {
                    from: inner.from,
                    to: inner.to,
                })
            }
            DatabaseErrorKind::UniqueViolation { constraint } => {
                AppErrorKind::Domain(DomainError::DuplicateReference {
                    reference: constraint,
                })
            }
            DatabaseErrorKind::Connection { message } => {
                AppErrorKind::Infrastructure(InfrastructureError::Database {
                    message,
                    is_retryable: true,
                })
            }
            DatabaseErrorKind::Query { message }
            | DatabaseErrorKind::InvalidData { message }
            | DatabaseErrorKind::Unknown { message } => {
                AppErrorKind::Infrastructure(InfrastructureError::Database {
                    message,
                    is_retryable: false,
                })
            }
        };
        AppError::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_404() {
        let app: AppError = DatabaseError::not_found("Payment", "abc").into();
        assert_eq!(app.status_code(), 404);
    }

    #[test]
    fn test_stale_state_maps_to_conflict() {
        let app: AppError = DatabaseError::stale("Payment", "abc", "PROCESSING", "CONFIRMED").into();
        assert_eq!(app.status_code(), 409);
    }

    #[test]
    fn test_connection_errors_are_retryable() {
        let err = DatabaseError::new(DatabaseErrorKind::Connection {
            message: "refused".to_string(),
        });
        assert!(err.is_retryable());
        assert!(AppError::from(err).is_retryable());
    }
}
