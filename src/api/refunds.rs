//! Refund endpoints

use super::{actor_from_headers, app_error, AppState};
use crate::error::AppError;
use crate::middleware::error::success_response;
use crate::services::refunds::RefundRequest;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct RejectRefundRequest {
    pub reason: String,
}

#[derive(Debug, Serialize)]
struct CompletedRefund {
    refund: crate::domain::Refund,
    payment: crate::domain::Payment,
}

/// POST /api/payments/{id}/refunds
pub async fn request_refund(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<RefundRequest>,
) -> Result<impl IntoResponse, AppError> {
    let actor = actor_from_headers(&headers)?;
    let refund = state
        .refunds
        .request(payment_id, request, &actor)
        .await
        .map_err(app_error(&headers))?;
    Ok((StatusCode::CREATED, success_response(refund)))
}

/// GET /api/payments/{id}/refunds
pub async fn list_refunds(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let refunds = state
        .refunds
        .list_for_payment(payment_id)
        .await
        .map_err(app_error(&headers))?;
    Ok(success_response(refunds))
}

/// GET /api/refunds/{id}
pub async fn get_refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let refund = state.refunds.get(id).await.map_err(app_error(&headers))?;
    Ok(success_response(refund))
}

/// POST /api/refunds/{id}/approve
pub async fn approve_refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let actor = actor_from_headers(&headers)?;
    let refund = state
        .refunds
        .approve(id, &actor)
        .await
        .map_err(app_error(&headers))?;
    Ok(success_response(refund))
}

/// POST /api/refunds/{id}/reject
pub async fn reject_refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<RejectRefundRequest>,
) -> Result<impl IntoResponse, AppError> {
    let actor = actor_from_headers(&headers)?;
    let refund = state
        .refunds
        .reject(id, &actor, &request.reason)
        .await
        .map_err(app_error(&headers))?;
    Ok(success_response(refund))
}

/// POST /api/refunds/{id}/process
pub async fn process_refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let actor = actor_from_headers(&headers)?;
    let refund = state
        .refunds
        .process(id, &actor)
        .await
        .map_err(app_error(&headers))?;
    Ok(success_response(refund))
}

/// POST /api/refunds/{id}/complete
pub async fn complete_refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let actor = actor_from_headers(&headers)?;
    let (refund, payment) = state
        .refunds
        .complete(id, &actor)
        .await
        .map_err(app_error(&headers))?;
    Ok(success_response(CompletedRefund { refund, payment }))
}
