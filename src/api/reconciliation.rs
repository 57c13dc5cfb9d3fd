//! Reconciliation endpoints

use super::{actor_from_headers, app_error, AppState};
use crate::domain::ExternalTransaction;
use crate::error::AppError;
use crate::middleware::error::success_response;
use crate::services::reconciliation::ResolveDiscrepancyRequest;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ReconcileBatchRequest {
    pub records: Vec<ExternalTransaction>,
}

#[derive(Debug, Deserialize)]
pub struct AddNoteRequest {
    pub note: String,
}

/// POST /api/reconciliation/batches
pub async fn reconcile_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ReconcileBatchRequest>,
) -> Result<impl IntoResponse, AppError> {
    let actor = actor_from_headers(&headers)?;
    info!(records = request.records.len(), actor = %actor, "reconciliation batch submitted");

    let report = state
        .reconciliation
        .reconcile(request.records)
        .await
        .map_err(app_error(&headers))?;
    Ok((StatusCode::CREATED, success_response(report)))
}

/// GET /api/reconciliation/batches/{id}
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let records = state
        .reconciliation
        .batch(batch_id)
        .await
        .map_err(app_error(&headers))?;
    Ok(success_response(records))
}

/// POST /api/reconciliation/{id}/resolve
pub async fn resolve_discrepancy(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<ResolveDiscrepancyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let resolver = actor_from_headers(&headers)?;
    let outcome = state
        .reconciliation
        .resolve_discrepancy(record_id, request, &resolver)
        .await
        .map_err(app_error(&headers))?;
    Ok(success_response(outcome))
}

/// POST /api/reconciliation/{id}/notes
pub async fn add_note(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<AddNoteRequest>,
) -> Result<impl IntoResponse, AppError> {
    let author = actor_from_headers(&headers)?;
    let record = state
        .reconciliation
        .annotate(record_id, &author, &request.note)
        .await
        .map_err(app_error(&headers))?;
    Ok(success_response(record))
}
