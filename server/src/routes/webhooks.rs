use std::sync::Arc;

use api_core::error::AppApiError;
use axum::{
    body::Bytes,
    extract::{Path, State},
};
use http::{HeaderMap, StatusCode};
use webhooks::IngestOutcome;

use crate::state::AppState;

const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// `POST /webhook/:provider` — signature-verified, not gated by C9.
///
/// Replays (a previously `completed` event redelivered) and fresh
/// dispatches both return `200 OK`: the provider's own retry policy expects
/// a non-2xx only when it should actually retry, and a replay is, by
/// definition, something we've already handled.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppApiError::validation("missing webhook signature header"))?;

    let provider_adapter = state.provider(&provider)?;
    let webhook_secret = state.webhook_secret(&provider)?;

    let outcome = webhooks::ingest(
        &state.pool,
        provider_adapter,
        &provider,
        webhook_secret,
        &body,
        signature,
    )
    .await?;

    match outcome {
        IngestOutcome::Processed | IngestOutcome::AlreadyCompleted => Ok(StatusCode::OK),
    }
}
