//! HTTP surface of the gateway
//!
//! Handlers stay thin: pull the actor and request id from the headers, call
//! a service, wrap the result with [`success_response`] or convert the
//! error into an [`AppError`].
//!
//! [`success_response`]: crate::middleware::error::success_response

pub mod payments;
pub mod reconciliation;
pub mod refunds;
pub mod webhooks;

use crate::error::{AppError, AppErrorKind, ValidationError};
use crate::health::{HealthChecker, HealthState, HealthStatus};
use crate::middleware::error::get_request_id_from_headers;
use crate::services::{
    GatewayError, PaymentOrchestrator, ReconciliationService, RefundService, VerificationService,
};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tracing::{error, info};

/// Header set by the upstream auth service
pub const ACTOR_HEADER: &str = "x-actor-id";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub verification: Arc<VerificationService>,
    pub reconciliation: Arc<ReconciliationService>,
    pub refunds: Arc<RefundService>,
    pub health_checker: HealthChecker,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/payments", post(payments::initiate_payment))
        .route("/api/payments/{id}", get(payments::get_payment))
        .route("/api/payments/{id}/cancel", post(payments::cancel_payment))
        .route("/api/payments/{id}/verify", post(payments::verify_payment))
        .route("/api/payments/verify/bulk", post(payments::bulk_verify))
        .route(
            "/api/payments/verify/auto/{external_id}",
            post(payments::auto_verify),
        )
        .route(
            "/api/payments/{id}/refunds",
            post(refunds::request_refund).get(refunds::list_refunds),
        )
        .route("/api/refunds/{id}", get(refunds::get_refund))
        .route("/api/refunds/{id}/approve", post(refunds::approve_refund))
        .route("/api/refunds/{id}/reject", post(refunds::reject_refund))
        .route("/api/refunds/{id}/process", post(refunds::process_refund))
        .route("/api/refunds/{id}/complete", post(refunds::complete_refund))
        .route(
            "/api/reconciliation/batches",
            post(reconciliation::reconcile_batch),
        )
        .route(
            "/api/reconciliation/batches/{id}",
            get(reconciliation::get_batch),
        )
        .route(
            "/api/reconciliation/{id}/resolve",
            post(reconciliation::resolve_discrepancy),
        )
        .route(
            "/api/reconciliation/{id}/notes",
            post(reconciliation::add_note),
        )
        .route("/payments/webhook/{provider}", post(webhooks::handle_webhook))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let health_status: HealthStatus = state.health_checker.check_health().await;

    if matches!(health_status.status, HealthState::Unhealthy) {
        error!("Health check failed - service unhealthy");
        (StatusCode::SERVICE_UNAVAILABLE, Json(health_status))
    } else {
        info!("Health check passed");
        (StatusCode::OK, Json(health_status))
    }
}

/// Identity of the caller; every mutating endpoint needs one
pub(crate) fn actor_from_headers(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            with_request_id(
                AppError::new(AppErrorKind::Validation(ValidationError::MissingField {
                    field: ACTOR_HEADER.to_string(),
                })),
                headers,
            )
        })
}

pub(crate) fn with_request_id(error: AppError, headers: &HeaderMap) -> AppError {
    match get_request_id_from_headers(headers) {
        Some(request_id) => error.with_request_id(request_id),
        None => error,
    }
}

/// `map_err` adapter for service calls
pub(crate) fn app_error(headers: &HeaderMap) -> impl Fn(GatewayError) -> AppError + '_ {
    move |err| with_request_id(AppError::from(err), headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_header_is_required() {
        let mut headers = HeaderMap::new();
        assert_eq!(actor_from_headers(&headers).unwrap_err().status_code(), 400);

        headers.insert(ACTOR_HEADER, "  ".parse().unwrap());
        assert!(actor_from_headers(&headers).is_err());

        headers.insert(ACTOR_HEADER, "cashier-7".parse().unwrap());
        assert_eq!(actor_from_headers(&headers).unwrap(), "cashier-7");
    }

    #[test]
    fn test_errors_carry_request_id() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", "req-42".parse().unwrap());
        let err = app_error(&headers)(GatewayError::not_found("Refund", "r-1"));
        assert_eq!(err.request_id.as_deref(), Some("req-42"));
        assert_eq!(err.status_code(), 404);
    }
}
