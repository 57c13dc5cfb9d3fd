use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, info, warn};

use super::{app_error, AppState};
use crate::services::{GatewayError, WebhookOutcome};

fn ok() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
}

/// POST /payments/webhook/{provider}
///
/// Anything that is not a signature failure or an infrastructure failure is
/// acknowledged with 200 so the response never reveals whether a
/// transaction exists.
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    info!(provider = %provider, bytes = body.len(), "Received webhook");

    let adapter = match state.orchestrator.registry().get(&provider) {
        Ok(adapter) => adapter,
        Err(_) => {
            warn!(provider = %provider, "Webhook for unknown provider");
            return app_error(&headers)(GatewayError::not_found("Provider", &provider))
                .into_response();
        }
    };

    let signature = headers
        .get(adapter.signature_header())
        .and_then(|v| v.to_str().ok());

    match state
        .orchestrator
        .handle_webhook(&provider, &body, signature)
        .await
    {
        Ok(WebhookOutcome::Applied { payment_id, status }) => {
            info!(provider = %provider, payment_id = %payment_id, to_state = %status, "Webhook applied");
            ok()
        }
        Ok(WebhookOutcome::Duplicate { payment_id, .. }) => {
            info!(provider = %provider, payment_id = %payment_id, "Webhook already processed");
            ok()
        }
        Ok(WebhookOutcome::PendingVerification { payment_id }) => {
            info!(provider = %provider, payment_id = %payment_id, "Webhook noted, awaiting verifier");
            ok()
        }
        Ok(WebhookOutcome::Ignored) => ok(),
        Err(e @ GatewayError::SignatureVerification { .. }) => {
            warn!(provider = %provider, "Invalid webhook signature");
            app_error(&headers)(e).into_response()
        }
        Err(e @ GatewayError::Database(_)) => {
            // 5xx so the provider redelivers
            error!(provider = %provider, error = %e, "Webhook processing failed");
            app_error(&headers)(e).into_response()
        }
        Err(e) => {
            warn!(provider = %provider, error = %e, "Webhook could not be applied");
            ok()
        }
    }
}
