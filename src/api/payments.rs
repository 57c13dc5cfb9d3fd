//! Payment endpoints: initiation, lookup, cancellation and verification

use super::{actor_from_headers, app_error, with_request_id, AppState};
use crate::domain::Provenance;
use crate::error::{AppError, AppErrorKind, ValidationError};
use crate::middleware::error::success_response;
use crate::services::payment_orchestrator::InitiatePaymentRequest;
use crate::services::verification::VerifyPaymentRequest;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

const MAX_BULK_VERIFY: usize = 100;

#[derive(Debug, Deserialize)]
pub struct CancelPaymentRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct BulkVerifyRequest {
    pub payment_ids: Vec<Uuid>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn provenance(headers: &HeaderMap, actor: String) -> Provenance {
    Provenance {
        created_by: actor,
        client_ip: header(headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string())),
        user_agent: header(headers, "user-agent"),
        device_fingerprint: header(headers, "x-device-fingerprint"),
    }
}

/// POST /api/payments
pub async fn initiate_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InitiatePaymentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let actor = actor_from_headers(&headers)?;
    info!(
        invoice_id = %request.invoice_id,
        provider = %request.provider,
        actor = %actor,
        "payment initiation requested"
    );

    let initiated = state
        .orchestrator
        .initiate(request, provenance(&headers, actor))
        .await
        .map_err(app_error(&headers))?;

    Ok((StatusCode::CREATED, success_response(initiated)))
}

/// GET /api/payments/{id}
pub async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let payment = state
        .orchestrator
        .get(id)
        .await
        .map_err(app_error(&headers))?;
    Ok(success_response(payment))
}

/// POST /api/payments/{id}/cancel
pub async fn cancel_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<CancelPaymentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let actor = actor_from_headers(&headers)?;
    if request.reason.trim().is_empty() {
        return Err(with_request_id(
            AppError::new(AppErrorKind::Validation(ValidationError::MissingField {
                field: "reason".to_string(),
            })),
            &headers,
        ));
    }

    let payment = state
        .orchestrator
        .cancel(id, request.reason.trim(), &actor)
        .await
        .map_err(app_error(&headers))?;
    Ok(success_response(payment))
}

/// POST /api/payments/{id}/verify
pub async fn verify_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<VerifyPaymentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let verifier = actor_from_headers(&headers)?;
    let payment = state
        .verification
        .verify(id, request, &verifier)
        .await
        .map_err(app_error(&headers))?;
    Ok(success_response(payment))
}

/// POST /api/payments/verify/bulk
pub async fn bulk_verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BulkVerifyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let verifier = actor_from_headers(&headers)?;
    if request.payment_ids.is_empty() || request.payment_ids.len() > MAX_BULK_VERIFY {
        return Err(with_request_id(
            AppError::new(AppErrorKind::Validation(ValidationError::InvalidField {
                field: "payment_ids".to_string(),
                reason: format!("must contain between 1 and {} ids", MAX_BULK_VERIFY),
            })),
            &headers,
        ));
    }

    let report = state
        .verification
        .bulk_verify(request.payment_ids, &verifier, request.notes)
        .await;
    Ok(success_response(report))
}

/// POST /api/payments/verify/auto/{external_id}
pub async fn auto_verify(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let payment = state
        .verification
        .auto_verify(&external_id)
        .await
        .map_err(app_error(&headers))?;
    Ok(success_response(payment))
}
