//! `/api/v1/subscriptions*` routes. The actual `subscription` row is only
//! ever created by the webhook-driven C8 lifecycle (`subscription.created`);
//! this route's job is only to kick off the provider-side checkout/payment
//! flow and let the client complete it.

use std::sync::Arc;

use api::server::LxJson;
use api_core::error::AppApiError;
use axum::extract::{Extension, Path, State};
use db::models::Subscription;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::state::AppState;
use api::auth::AuthContext;

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub plan_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CreateSubscriptionResponse {
    pub provider: String,
    pub provider_intent_id: String,
    pub client_secret: Option<String>,
}

/// `POST /api/v1/subscriptions` — initiates a checkout for `plan_id` against
/// that plan's provider. `payment_plan` rows don't cache a price amount (the
/// provider is authoritative for price via `provider_price_id`), so the
/// amount passed to `initialize_payment` is a placeholder the provider is
/// expected to ignore in favor of the `provider_price_id` carried in
/// `metadata` — see DESIGN.md.
pub async fn create_subscription(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    LxJson(req): LxJson<CreateSubscriptionRequest>,
) -> Result<LxJson<CreateSubscriptionResponse>, AppApiError> {
    let plan: db::models::PaymentPlan = sqlx::query_as(
        "SELECT * FROM payment_plan WHERE id = $1 AND is_active",
    )
    .bind(req.plan_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| AppApiError::transient(format!("load plan: {e}")))?
    .ok_or_else(|| AppApiError::not_found(format!("no active plan {}", req.plan_id)))?;

    let provider = state.provider(&plan.provider)?;
    let order_id = Uuid::new_v4().to_string();
    let metadata = json!({
        "provider_price_id": plan.provider_price_id,
        "workspace_id": ctx.universal_id,
        "plan_id": plan.id,
    });

    let intent = provider
        .initialize_payment(&order_id, Decimal::ZERO, &plan.currency, metadata)
        .await
        .map_err(|e| AppApiError::provider(format!("{}: {}", e.code, e.message)))?;

    sqlx::query(
        "INSERT INTO payment \
         (id, workspace_id, provider, provider_payment_id, amount_minor, currency, status, plan_id) \
         VALUES ($1, $2, $3, $4, 0, $5, 'pending', $6)",
    )
    .bind(Uuid::new_v4())
    .bind(ctx.universal_id)
    .bind(&plan.provider)
    .bind(&intent.provider_intent_id)
    .bind(&plan.currency)
    .bind(plan.id)
    .execute(&state.pool)
    .await
    .map_err(|e| AppApiError::transient(format!("insert pending payment: {e}")))?;

    Ok(LxJson(CreateSubscriptionResponse {
        provider: plan.provider,
        provider_intent_id: intent.provider_intent_id,
        client_secret: intent.client_secret,
    }))
}

/// `GET /api/v1/subscriptions/current` — the workspace's active or past-due
/// subscription, if any.
pub async fn current_subscription(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<LxJson<Option<Subscription>>, AppApiError> {
    let subscription: Option<Subscription> = sqlx::query_as(
        "SELECT * FROM subscription \
         WHERE workspace_id = $1 AND status IN ('active', 'past_due') \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(ctx.universal_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| AppApiError::transient(format!("load current subscription: {e}")))?;

    Ok(LxJson(subscription))
}

/// `DELETE /api/v1/subscriptions/:id` — marks the workspace's active
/// subscription to cancel at period end. `:id` is accepted for REST
/// symmetry but the mutation is scoped by workspace, matching
/// `subscriptions::cancel_at_period_end`'s single-active-subscription
/// assumption.
pub async fn cancel_subscription(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(_subscription_id): Path<Uuid>,
) -> Result<LxJson<serde_json::Value>, AppApiError> {
    subscriptions::cancel_at_period_end(&state.pool, ctx.universal_id).await?;
    Ok(LxJson(json!({ "cancel_at_period_end": true })))
}
