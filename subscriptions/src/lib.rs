//! Subscription lifecycle (C8): reconciles plan + subscription state with
//! credit grants/revocations, driven entirely by webhook event kinds. Local
//! code never flips `status` without a provider callback, except the
//! administrative cancel-at-period-end path, which itself calls the
//! provider first.

mod payload;

use std::str::FromStr;

use api_core::error::AppApiError;
use chrono::{DateTime, Utc};
use db::models::{CreditTransactionKind, Subscription, SubscriptionStatus};
use payments::CanonicalWebhookEvent;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

pub use payload::PayloadExt;

/// The webhook event kinds this lifecycle reacts to (§4.8).
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum WebhookKind {
    #[strum(serialize = "subscription.created")]
    SubscriptionCreated,
    #[strum(serialize = "invoice.paid")]
    InvoicePaid,
    #[strum(serialize = "subscription.updated")]
    SubscriptionUpdated,
    #[strum(serialize = "subscription.canceled")]
    SubscriptionCanceled,
    #[strum(serialize = "payment_intent.succeeded")]
    PaymentIntentSucceeded,
    #[strum(serialize = "payment_intent.failed")]
    PaymentIntentFailed,
}

/// Dispatches a single normalized webhook event against `pool`. The caller
/// (C7) is responsible for the surrounding `webhook_event` upsert/status
/// bookkeeping; this function only applies the domain-level mutation. The
/// subscription/payment row mutation and the credit ledger grant commit as
/// two separate units of work, which is safe because both are idempotent: a
/// retry after partial failure cannot double-insert the row or double-grant
/// credits for the same `reference_id`.
pub async fn handle_webhook_event(
    pool: &PgPool,
    provider: &str,
    event: &CanonicalWebhookEvent,
) -> Result<(), AppApiError> {
    let kind = WebhookKind::from_str(&event.event_kind).map_err(|_| {
        AppApiError::validation(format!("unrecognized webhook event kind {:?}", event.event_kind))
    })?;

    match kind {
        WebhookKind::SubscriptionCreated => on_subscription_created(pool, provider, event).await,
        WebhookKind::InvoicePaid => on_invoice_paid(pool, event).await,
        WebhookKind::SubscriptionUpdated => on_subscription_updated(pool, event).await,
        WebhookKind::SubscriptionCanceled => on_subscription_canceled(pool, event).await,
        WebhookKind::PaymentIntentSucceeded => on_payment_succeeded(pool, provider, event).await,
        WebhookKind::PaymentIntentFailed => on_payment_failed(pool, provider, event).await,
    }
}

/// Takes a session-scoped advisory lock keyed on a hash of
/// `provider_subscription_id`, serializing all handlers for one subscription
/// while letting distinct subscriptions proceed concurrently.
async fn lock_subscription(
    txn: &mut Transaction<'_, Postgres>,
    provider_subscription_id: &str,
) -> Result<(), AppApiError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(provider_subscription_id)
        .execute(&mut **txn)
        .await
        .map_err(|e| AppApiError::transient(format!("advisory lock: {e}")))?;
    Ok(())
}

async fn on_subscription_created(
    pool: &PgPool,
    provider: &str,
    event: &CanonicalWebhookEvent,
) -> Result<(), AppApiError> {
    let p = &event.payload;
    let workspace_id = p.field_uuid(&["workspaceId", "workspace_id"])?;
    let plan_id = p.field_uuid(&["planId", "plan_id"])?;
    let provider_subscription_id = p
        .field_str(&["subscriptionId", "subscription_id"])
        .ok_or_else(|| AppApiError::validation("missing subscriptionId"))?;
    let period_start = p.field_datetime(&["currentPeriodStart", "current_period_start"])?;
    let period_end = p.field_datetime(&["currentPeriodEnd", "current_period_end"])?;

    let subscription_id = Uuid::new_v4();
    let mut txn = pool
        .begin()
        .await
        .map_err(|e| AppApiError::transient(format!("begin txn: {e}")))?;
    lock_subscription(&mut txn, provider_subscription_id).await?;

    // Reconcile first: if an older subscription is still marked active for
    // this workspace (its cancellation webhook hasn't arrived yet), the
    // partial-unique-index invariant would reject our insert. The provider
    // is the source of truth for a brand new `created` event, so the old
    // row is superseded and gets canceled locally here.
    sqlx::query(
        "UPDATE subscription SET status = 'canceled', updated_at = now() \
         WHERE workspace_id = $1 AND status = 'active'",
    )
    .bind(workspace_id)
    .execute(&mut *txn)
    .await
    .map_err(|e| AppApiError::transient(format!("reconcile stale subscription: {e}")))?;

    let insert = sqlx::query(
        "INSERT INTO subscription \
         (id, workspace_id, plan_id, provider, provider_subscription_id, status, \
          current_period_start, current_period_end, cancel_at_period_end) \
         VALUES ($1, $2, $3, $4, $5, 'active', $6, $7, false)",
    )
    .bind(subscription_id)
    .bind(workspace_id)
    .bind(plan_id)
    .bind(provider)
    .bind(provider_subscription_id)
    .bind(period_start)
    .bind(period_end)
    .execute(&mut *txn)
    .await;

    match insert {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            return Err(AppApiError::conflict(format!(
                "subscription already exists for {provider_subscription_id}"
            )));
        }
        Err(e) => return Err(AppApiError::transient(format!("insert subscription: {e}"))),
    }

    txn.commit()
        .await
        .map_err(|e| AppApiError::transient(format!("commit txn: {e}")))?;

    let credits = plan_credits_per_cycle(pool, plan_id).await?;
    let reference_id = format!("{provider_subscription_id}:period_1");
    credit_ledger::grant(
        pool,
        workspace_id,
        credits,
        CreditTransactionKind::Allocation,
        Some(&reference_id),
    )
    .await?;

    Ok(())
}

async fn on_invoice_paid(pool: &PgPool, event: &CanonicalWebhookEvent) -> Result<(), AppApiError> {
    let p = &event.payload;
    let provider_subscription_id = p
        .field_str(&["subscriptionId", "subscription_id"])
        .ok_or_else(|| AppApiError::validation("missing subscriptionId"))?;
    let period_start = p.field_datetime(&["currentPeriodStart", "current_period_start"])?;
    let period_end = p.field_datetime(&["currentPeriodEnd", "current_period_end"])?;

    let mut txn = pool
        .begin()
        .await
        .map_err(|e| AppApiError::transient(format!("begin txn: {e}")))?;
    lock_subscription(&mut txn, provider_subscription_id).await?;

    let subscription: Subscription =
        sqlx::query_as("SELECT * FROM subscription WHERE provider_subscription_id = $1")
            .bind(provider_subscription_id)
            .fetch_optional(&mut *txn)
            .await
            .map_err(|e| AppApiError::transient(format!("load subscription: {e}")))?
            .ok_or_else(|| AppApiError::not_found("subscription not found for renewal"))?;

    sqlx::query(
        "UPDATE subscription SET current_period_start = $1, current_period_end = $2, \
         updated_at = now() WHERE id = $3",
    )
    .bind(period_start)
    .bind(period_end)
    .bind(subscription.id)
    .execute(&mut *txn)
    .await
    .map_err(|e| AppApiError::transient(format!("update subscription period: {e}")))?;

    txn.commit()
        .await
        .map_err(|e| AppApiError::transient(format!("commit txn: {e}")))?;

    let period_number = derive_period_number(
        subscription.current_period_start,
        period_start,
        subscription.current_period_end - subscription.current_period_start,
    );
    let credits = plan_credits_per_cycle(pool, subscription.plan_id).await?;
    let reference_id = format!("{provider_subscription_id}:period_{period_number}");

    credit_ledger::grant(
        pool,
        subscription.workspace_id,
        credits,
        CreditTransactionKind::Allocation,
        Some(&reference_id),
    )
    .await?;

    Ok(())
}

async fn on_subscription_updated(
    pool: &PgPool,
    event: &CanonicalWebhookEvent,
) -> Result<(), AppApiError> {
    let p = &event.payload;
    let provider_subscription_id = p
        .field_str(&["subscriptionId", "subscription_id"])
        .ok_or_else(|| AppApiError::validation("missing subscriptionId"))?;
    let new_plan_id = p.field_uuid(&["planId", "plan_id"])?;

    let mut txn = pool
        .begin()
        .await
        .map_err(|e| AppApiError::transient(format!("begin txn: {e}")))?;
    lock_subscription(&mut txn, provider_subscription_id).await?;

    // Grants/revocations are driven by the accompanying invoice event, not
    // this one — this handler only swaps which plan the subscription points
    // at.
    sqlx::query(
        "UPDATE subscription SET plan_id = $1, updated_at = now() \
         WHERE provider_subscription_id = $2",
    )
    .bind(new_plan_id)
    .bind(provider_subscription_id)
    .execute(&mut *txn)
    .await
    .map_err(|e| AppApiError::transient(format!("update subscription plan: {e}")))?;

    txn.commit()
        .await
        .map_err(|e| AppApiError::transient(format!("commit txn: {e}")))?;
    Ok(())
}

async fn on_subscription_canceled(
    pool: &PgPool,
    event: &CanonicalWebhookEvent,
) -> Result<(), AppApiError> {
    let p = &event.payload;
    let provider_subscription_id = p
        .field_str(&["subscriptionId", "subscription_id"])
        .ok_or_else(|| AppApiError::validation("missing subscriptionId"))?;

    let mut txn = pool
        .begin()
        .await
        .map_err(|e| AppApiError::transient(format!("begin txn: {e}")))?;
    lock_subscription(&mut txn, provider_subscription_id).await?;

    let subscription: Subscription =
        sqlx::query_as("SELECT * FROM subscription WHERE provider_subscription_id = $1")
            .bind(provider_subscription_id)
            .fetch_optional(&mut *txn)
            .await
            .map_err(|e| AppApiError::transient(format!("load subscription: {e}")))?
            .ok_or_else(|| AppApiError::not_found("subscription not found for cancellation"))?;

    if subscription.status == SubscriptionStatus::Canceled {
        // Already applied by a prior delivery of this event.
        txn.commit()
            .await
            .map_err(|e| AppApiError::transient(format!("commit txn: {e}")))?;
        return Ok(());
    }

    sqlx::query("UPDATE subscription SET status = 'canceled', updated_at = now() WHERE id = $1")
        .bind(subscription.id)
        .execute(&mut *txn)
        .await
        .map_err(|e| AppApiError::transient(format!("cancel subscription: {e}")))?;

    let remaining = remaining_unused_credits(&mut txn, &subscription).await?;

    txn.commit()
        .await
        .map_err(|e| AppApiError::transient(format!("commit txn: {e}")))?;

    let reference_id = format!("{provider_subscription_id}:cancellation");
    credit_ledger::revoke_for_cancellation(
        pool,
        subscription.workspace_id,
        remaining,
        Some(&reference_id),
    )
    .await?;

    Ok(())
}

async fn on_payment_succeeded(
    pool: &PgPool,
    provider: &str,
    event: &CanonicalWebhookEvent,
) -> Result<(), AppApiError> {
    let p = &event.payload;
    let workspace_id = p.field_uuid(&["workspaceId", "workspace_id"])?;
    let plan_id = p.field_uuid(&["planId", "plan_id"])?;
    let provider_payment_id = p
        .field_str(&["paymentId", "payment_id"])
        .ok_or_else(|| AppApiError::validation("missing paymentId"))?;
    let amount_minor = p
        .field_i64(&["amountMinor", "amount_minor"])
        .ok_or_else(|| AppApiError::validation("missing amountMinor"))?;
    let currency = p
        .field_str(&["currency"])
        .ok_or_else(|| AppApiError::validation("missing currency"))?;

    // The checkout route (`POST /api/v1/subscriptions`) already inserted a
    // `pending` row keyed by this same `provider_payment_id`; flip it to
    // `succeeded` rather than treating its presence as a replay. Only a
    // genuine second delivery of this event leaves both the `UPDATE` and
    // the fallback `INSERT` touching zero rows.
    let updated = sqlx::query(
        "UPDATE payment SET status = 'succeeded', completed_at = now() \
         WHERE provider = $1 AND provider_payment_id = $2 AND status = 'pending'",
    )
    .bind(provider)
    .bind(provider_payment_id)
    .execute(pool)
    .await
    .map_err(|e| AppApiError::transient(format!("update payment: {e}")))?;

    if updated.rows_affected() == 0 {
        let inserted = sqlx::query(
            "INSERT INTO payment \
             (id, workspace_id, provider, provider_payment_id, amount_minor, currency, \
              status, plan_id, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, 'succeeded', $7, now()) \
             ON CONFLICT (provider, provider_payment_id) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(workspace_id)
        .bind(provider)
        .bind(provider_payment_id)
        .bind(amount_minor)
        .bind(currency)
        .bind(plan_id)
        .execute(pool)
        .await
        .map_err(|e| AppApiError::transient(format!("insert payment: {e}")))?;

        if inserted.rows_affected() == 0 {
            return Ok(()); // already recorded by a prior delivery of this event
        }
    }

    let credits = plan_credits_per_cycle(pool, plan_id).await?;
    let reference_id = format!("{provider_payment_id}:one_time");
    credit_ledger::grant(
        pool,
        workspace_id,
        credits,
        CreditTransactionKind::Allocation,
        Some(&reference_id),
    )
    .await?;

    Ok(())
}

async fn on_payment_failed(
    pool: &PgPool,
    provider: &str,
    event: &CanonicalWebhookEvent,
) -> Result<(), AppApiError> {
    let p = &event.payload;
    let workspace_id = p.field_uuid(&["workspaceId", "workspace_id"])?;
    let provider_payment_id = p
        .field_str(&["paymentId", "payment_id"])
        .ok_or_else(|| AppApiError::validation("missing paymentId"))?;
    let amount_minor = p.field_i64(&["amountMinor", "amount_minor"]).unwrap_or(0);
    let currency = p.field_str(&["currency"]).unwrap_or("usd");

    sqlx::query(
        "INSERT INTO payment \
         (id, workspace_id, provider, provider_payment_id, amount_minor, currency, status) \
         VALUES ($1, $2, $3, $4, $5, $6, 'failed') \
         ON CONFLICT (provider, provider_payment_id) DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .bind(workspace_id)
    .bind(provider)
    .bind(provider_payment_id)
    .bind(amount_minor)
    .bind(currency)
    .execute(pool)
    .await
    .map_err(|e| AppApiError::transient(format!("insert failed payment: {e}")))?;

    Ok(())
}

/// Marks a workspace's active subscription to cancel at the end of the
/// current period. Unlike every other transition, this one originates from
/// an administrative request rather than a webhook — the server route must
/// call the provider first; this function only records the local intent
/// after that call has already succeeded.
pub async fn cancel_at_period_end(pool: &PgPool, workspace_id: Uuid) -> Result<(), AppApiError> {
    let result = sqlx::query(
        "UPDATE subscription SET cancel_at_period_end = true, updated_at = now() \
         WHERE workspace_id = $1 AND status = 'active'",
    )
    .bind(workspace_id)
    .execute(pool)
    .await
    .map_err(|e| AppApiError::transient(format!("cancel at period end: {e}")))?;

    if result.rows_affected() == 0 {
        return Err(AppApiError::not_found("no active subscription for workspace"));
    }
    Ok(())
}

async fn plan_credits_per_cycle(pool: &PgPool, plan_id: Uuid) -> Result<i64, AppApiError> {
    sqlx::query_scalar("SELECT credits_per_cycle FROM payment_plan WHERE id = $1")
        .bind(plan_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| AppApiError::transient(format!("load plan: {e}")))?
        .ok_or_else(|| AppApiError::not_found(format!("plan {plan_id} not found")))
}

async fn remaining_unused_credits(
    txn: &mut Transaction<'_, Postgres>,
    subscription: &Subscription,
) -> Result<i64, AppApiError> {
    let granted: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(delta), 0) FROM credit_transaction \
         WHERE workspace_id = $1 AND reference_id LIKE $2",
    )
    .bind(subscription.workspace_id)
    .bind(format!("{}:%", subscription.provider_subscription_id))
    .fetch_one(&mut **txn)
    .await
    .map_err(|e| AppApiError::transient(format!("sum granted credits: {e}")))?;

    let consumed: i64 = sqlx::query_scalar(
        "SELECT COALESCE(-SUM(delta), 0) FROM credit_transaction \
         WHERE workspace_id = $1 AND kind = 'usage' AND created_at >= $2",
    )
    .bind(subscription.workspace_id)
    .bind(subscription.current_period_start)
    .fetch_one(&mut **txn)
    .await
    .map_err(|e| AppApiError::transient(format!("sum consumed credits: {e}")))?;

    Ok((granted - consumed).max(0))
}

/// Derives `N` in `period_N` as a monotonic counter seeded from the
/// subscription's original `current_period_start`: the number of elapsed
/// billing periods between the original start and the period start carried
/// on the current webhook.
fn derive_period_number(
    original_period_start: DateTime<Utc>,
    current_period_start: DateTime<Utc>,
    period_length: chrono::Duration,
) -> i64 {
    if period_length.num_seconds() <= 0 {
        return 1;
    }
    let elapsed = current_period_start - original_period_start;
    let periods = elapsed.num_seconds() / period_length.num_seconds();
    periods.max(0) + 1
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

#[cfg(test)]
mod test {
    use chrono::Duration;

    use super::*;

    #[test]
    fn period_number_derivation() {
        let start = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let period_len = Duration::days(30);

        assert_eq!(derive_period_number(start, start, period_len), 1);
        assert_eq!(
            derive_period_number(start, start + period_len, period_len),
            2
        );
        assert_eq!(
            derive_period_number(start, start + period_len * 3, period_len),
            4
        );
    }

    #[test]
    fn webhook_kind_round_trips_through_wire_strings() {
        assert_eq!(
            WebhookKind::from_str("subscription.created").unwrap(),
            WebhookKind::SubscriptionCreated
        );
        assert_eq!(
            WebhookKind::from_str("invoice.paid").unwrap(),
            WebhookKind::InvoicePaid
        );
        assert!(WebhookKind::from_str("unknown.event").is_err());
    }
}
