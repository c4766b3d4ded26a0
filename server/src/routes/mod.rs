//! Router assembly: public routes are mounted bare, everything else goes
//! through the C9 auth gate. Webhook ingestion is neither public-trusted nor
//! gated by the bearer-auth middleware — it authenticates itself via the
//! provider's own signature scheme.

mod health;
mod plans;
mod subscriptions;
mod tasks;
mod webhooks;

use std::sync::Arc;

use api::auth::AuthGateState;
use axum::{
    middleware,
    routing::{delete, get, patch, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::state::AppState;

pub fn build_router(state: Arc<AppState>, auth: AuthGateState) -> Router<()> {
    let gated = Router::new()
        .route(
            "/api/v1/subscriptions",
            post(subscriptions::create_subscription),
        )
        .route(
            "/api/v1/subscriptions/current",
            get(subscriptions::current_subscription),
        )
        .route(
            "/api/v1/subscriptions/{id}",
            delete(subscriptions::cancel_subscription),
        )
        .route("/api/v1/tasks/{id}/run", post(tasks::run_task))
        .route("/api/v1/tasks/{id}/reorder", patch(tasks::reorder_task))
        .layer(middleware::from_fn_with_state(auth, api::auth::auth_gate));

    let public = Router::new()
        .route("/health", get(health::health))
        .route("/api/v1/plans", get(plans::list_plans))
        .route("/webhook/{provider}", post(webhooks::ingest));

    public
        .merge(gated)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
