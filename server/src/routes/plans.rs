use std::sync::Arc;

use api::server::LxJson;
use api_core::error::AppApiError;
use axum::extract::State;
use db::models::PaymentPlan;

use crate::state::AppState;

/// `GET /api/v1/plans` — public, no auth gate.
pub async fn list_plans(
    State(state): State<Arc<AppState>>,
) -> Result<LxJson<Vec<PaymentPlan>>, AppApiError> {
    let plans: Vec<PaymentPlan> = sqlx::query_as(
        "SELECT * FROM payment_plan WHERE is_active ORDER BY sort_order, display_name",
    )
    .fetch_all(&state.pool)
    .await
    .map_err(|e| AppApiError::transient(format!("list plans: {e}")))?;

    Ok(LxJson(plans))
}
