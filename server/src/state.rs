//! Process-wide shared state (C12), constructed once in `main` and threaded
//! through axum's `State` extractor. No global `static`/`OnceCell` pool or
//! config anywhere in this tree.

use std::{sync::Arc, time::Duration};

use api_core::error::AppApiError;
use llm_orchestrator::RunnerConfig;
use payments::{create_provider, PaymentProvider, ProviderConfig, ProviderKind};
use sqlx::PgPool;

use crate::config::Config;

pub struct AppState {
    pub pool: PgPool,
    pub runner: RunnerConfig,
    pub sse_heartbeat_interval: Duration,
    stripe: Arc<dyn PaymentProvider>,
    toss: Arc<dyn PaymentProvider>,
    stripe_config: ProviderConfig,
    toss_config: ProviderConfig,
}

impl AppState {
    pub fn new(pool: PgPool, config: &Config) -> Self {
        let stripe = create_provider(ProviderKind::Stripe, config.stripe.clone(), "server");
        let toss = create_provider(ProviderKind::Toss, config.toss.clone(), "server");
        Self {
            pool,
            runner: config.llm_runner.clone(),
            sse_heartbeat_interval: config.sse_heartbeat_interval,
            stripe,
            toss,
            stripe_config: config.stripe.clone(),
            toss_config: config.toss.clone(),
        }
    }

    /// Looks up the provider adapter matching a `payment_plan.provider` /
    /// `webhook_event.provider` string column value.
    pub fn provider(&self, name: &str) -> Result<Arc<dyn PaymentProvider>, AppApiError> {
        match name {
            "stripe" => Ok(self.stripe.clone()),
            "toss" => Ok(self.toss.clone()),
            other => Err(AppApiError::validation(format!("unknown payment provider {other:?}"))),
        }
    }

    pub fn webhook_secret(&self, name: &str) -> Result<&str, AppApiError> {
        match name {
            "stripe" => Ok(&self.stripe_config.webhook_secret),
            "toss" => Ok(&self.toss_config.webhook_secret),
            other => Err(AppApiError::validation(format!("unknown payment provider {other:?}"))),
        }
    }
}
