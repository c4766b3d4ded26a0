//! Exactly-once webhook ingestion (C7): verify signature, upsert a
//! `webhook_event` row keyed by `(provider, provider_event_id)`, dispatch to
//! the matching domain handler, and record the outcome.
//!
//! Delivery semantics: the provider may redeliver the same event any number
//! of times. The upsert below is the idempotence boundary — a second
//! delivery of a `completed` event short-circuits before touching any
//! domain table.

use std::sync::Arc;

use api_core::error::AppApiError;
use db::models::WebhookStatus;
use payments::PaymentProvider;
use sqlx::PgPool;
use uuid::Uuid;

/// Outcome of [`ingest`], distinguishing a fresh dispatch from a replay the
/// idempotence check already resolved.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IngestOutcome {
    Processed,
    AlreadyCompleted,
}

/// Verifies `signature` over `body` using the provider adapter, upserts the
/// `webhook_event` row, and — unless this event already completed — dispatches
/// it to the domain handler inside its own advisory-locked transaction.
pub async fn ingest(
    pool: &PgPool,
    provider: Arc<dyn PaymentProvider>,
    provider_name: &str,
    webhook_secret: &str,
    body: &[u8],
    signature: &str,
) -> Result<IngestOutcome, AppApiError> {
    let event = provider
        .verify_webhook(body, signature, webhook_secret)
        .map_err(|e| AppApiError::validation(format!("webhook signature verification failed: {e}")))?;

    let existing_status: Option<WebhookStatus> = sqlx::query_scalar(
        "SELECT status FROM webhook_event WHERE provider = $1 AND provider_event_id = $2",
    )
    .bind(provider_name)
    .bind(&event.provider_event_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| AppApiError::transient(format!("load webhook_event: {e}")))?;

    if existing_status == Some(WebhookStatus::Completed) {
        return Ok(IngestOutcome::AlreadyCompleted);
    }

    let webhook_id: Uuid = sqlx::query_scalar(
        "INSERT INTO webhook_event \
         (id, provider, provider_event_id, payload, signature_verified, status) \
         VALUES ($1, $2, $3, $4, true, 'pending') \
         ON CONFLICT (provider, provider_event_id) DO UPDATE \
         SET payload = EXCLUDED.payload, updated_at = now() \
         RETURNING id",
    )
    .bind(Uuid::new_v4())
    .bind(provider_name)
    .bind(&event.provider_event_id)
    .bind(&event.payload)
    .fetch_one(pool)
    .await
    .map_err(|e| AppApiError::transient(format!("upsert webhook_event: {e}")))?;

    sqlx::query("UPDATE webhook_event SET status = 'processing', updated_at = now() WHERE id = $1")
        .bind(webhook_id)
        .execute(pool)
        .await
        .map_err(|e| AppApiError::transient(format!("mark webhook_event processing: {e}")))?;

    match subscriptions::handle_webhook_event(pool, provider_name, &event).await {
        Ok(()) => {
            sqlx::query(
                "UPDATE webhook_event SET status = 'completed', updated_at = now() WHERE id = $1",
            )
            .bind(webhook_id)
            .execute(pool)
            .await
            .map_err(|e| AppApiError::transient(format!("mark webhook_event completed: {e}")))?;
            Ok(IngestOutcome::Processed)
        }
        Err(err) => {
            sqlx::query(
                "UPDATE webhook_event \
                 SET status = 'failed', attempts = attempts + 1, last_error = $2, updated_at = now() \
                 WHERE id = $1",
            )
            .bind(webhook_id)
            .bind(err.to_string())
            .execute(pool)
            .await
            .map_err(|e| AppApiError::transient(format!("mark webhook_event failed: {e}")))?;
            Err(err)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn already_completed_is_distinct_from_processed() {
        assert_ne!(IngestOutcome::Processed, IngestOutcome::AlreadyCompleted);
    }
}
