//! Append-only per-workspace credit ledger (C5).
//!
//! `credit_transaction` rows are never updated or deleted; every mutation —
//! grant, consume, refund, adjustment, or cancellation revocation — inserts
//! exactly one row and updates the `user_credit_balance` cache in the same
//! transaction. `Balance` reads the cache; [`reconcile`] recomputes it from
//! the ledger for drift detection.

use api_core::error::AppApiError;
use db::models::CreditTransactionKind;
use sqlx::PgPool;
use uuid::Uuid;

/// A single ledger mutation that has committed.
#[derive(Clone, Debug)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub delta: i64,
    pub kind: CreditTransactionKind,
    pub reference_id: Option<String>,
}

/// A workspace whose cached balance disagrees with the ledger sum, as
/// reported by [`reconcile`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BalanceDrift {
    pub workspace_id: Uuid,
    pub ledger_sum: i64,
    pub cached_balance: i64,
}

/// Inserts one positive ledger row and updates the cached balance. Idempotent
/// on `reference_id`: a second grant with the same `reference_id` is a no-op
/// and returns `Ok(None)`.
pub async fn grant(
    pool: &PgPool,
    workspace_id: Uuid,
    amount: i64,
    kind: CreditTransactionKind,
    reference_id: Option<&str>,
) -> Result<Option<LedgerEntry>, AppApiError> {
    if amount <= 0 {
        return Err(AppApiError::validation(
            "grant amount must be positive",
        ));
    }
    insert_and_update_balance(pool, workspace_id, amount, kind, reference_id).await
}

/// Consumes credits: fails with [`AppApiError::insufficient_credits`] if the
/// workspace's balance is below `amount`. Reads the balance with
/// `SELECT ... FOR UPDATE` so concurrent consumes serialize per workspace.
pub async fn consume(
    pool: &PgPool,
    workspace_id: Uuid,
    amount: i64,
    reference_id: Option<&str>,
) -> Result<LedgerEntry, AppApiError> {
    if amount <= 0 {
        return Err(AppApiError::validation(
            "consume amount must be positive",
        ));
    }

    let mut txn = pool
        .begin()
        .await
        .map_err(|e| AppApiError::transient(format!("begin txn: {e}")))?;

    let balance: i64 = sqlx::query_scalar(
        "SELECT balance FROM user_credit_balance WHERE workspace_id = $1 FOR UPDATE",
    )
    .bind(workspace_id)
    .fetch_optional(&mut *txn)
    .await
    .map_err(|e| AppApiError::transient(format!("read balance: {e}")))?
    .unwrap_or(0);

    if balance < amount {
        return Err(AppApiError::insufficient_credits(format!(
            "workspace {workspace_id} has {balance} credits, needs {amount}"
        )));
    }

    let row_id = Uuid::new_v4();
    let delta = -amount;
    sqlx::query(
        "INSERT INTO credit_transaction (id, workspace_id, delta, kind, reference_id) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(row_id)
    .bind(workspace_id)
    .bind(delta)
    .bind(CreditTransactionKind::Usage)
    .bind(reference_id)
    .execute(&mut *txn)
    .await
    .map_err(|e| map_insert_error(e, reference_id))?;

    upsert_balance_delta(&mut txn, workspace_id, delta).await?;

    txn.commit()
        .await
        .map_err(|e| AppApiError::transient(format!("commit txn: {e}")))?;

    Ok(LedgerEntry {
        id: row_id,
        workspace_id,
        delta,
        kind: CreditTransactionKind::Usage,
        reference_id: reference_id.map(str::to_owned),
    })
}

/// Refunds a prior consume: a positive row of kind `refund`.
pub async fn refund(
    pool: &PgPool,
    workspace_id: Uuid,
    amount: i64,
    reference_id: Option<&str>,
) -> Result<Option<LedgerEntry>, AppApiError> {
    if amount <= 0 {
        return Err(AppApiError::validation(
            "refund amount must be positive",
        ));
    }
    insert_and_update_balance(
        pool,
        workspace_id,
        amount,
        CreditTransactionKind::Refund,
        reference_id,
    )
    .await
}

/// Administrative correction; `amount` may be positive or negative.
pub async fn adjust(
    pool: &PgPool,
    workspace_id: Uuid,
    amount: i64,
    reference_id: Option<&str>,
) -> Result<Option<LedgerEntry>, AppApiError> {
    insert_and_update_balance(
        pool,
        workspace_id,
        amount,
        CreditTransactionKind::Adjustment,
        reference_id,
    )
    .await
}

/// Zeroes the remaining granted-but-unused credits for the current period
/// when a subscription is canceled. `remaining` must be `>= 0`; the inserted
/// row carries `-remaining`.
pub async fn revoke_for_cancellation(
    pool: &PgPool,
    workspace_id: Uuid,
    remaining: i64,
    reference_id: Option<&str>,
) -> Result<Option<LedgerEntry>, AppApiError> {
    if remaining < 0 {
        return Err(AppApiError::validation(
            "revocation amount must be non-negative",
        ));
    }
    if remaining == 0 {
        return Ok(None);
    }
    insert_and_update_balance(
        pool,
        workspace_id,
        -remaining,
        CreditTransactionKind::SubscriptionCancellation,
        reference_id,
    )
    .await
}

/// Reads the cached balance for a workspace (0 if the workspace has never
/// had a ledger row).
pub async fn balance(pool: &PgPool, workspace_id: Uuid) -> Result<i64, AppApiError> {
    let balance: Option<i64> =
        sqlx::query_scalar("SELECT balance FROM user_credit_balance WHERE workspace_id = $1")
            .bind(workspace_id)
            .fetch_optional(pool)
            .await
            .map_err(|e| AppApiError::transient(format!("read balance: {e}")))?;
    Ok(balance.unwrap_or(0))
}

/// Recomputes `SUM(delta)` per workspace from `credit_transaction` and
/// reports any workspace whose `user_credit_balance` disagrees. Never
/// corrects — correction is a deliberate, logged, manual action.
pub async fn reconcile(pool: &PgPool) -> Result<Vec<BalanceDrift>, AppApiError> {
    let rows: Vec<(Uuid, i64, i64)> = sqlx::query_as(
        "SELECT b.workspace_id, \
                COALESCE(SUM(t.delta), 0) AS ledger_sum, \
                b.balance AS cached_balance \
         FROM user_credit_balance b \
         LEFT JOIN credit_transaction t ON t.workspace_id = b.workspace_id \
         GROUP BY b.workspace_id, b.balance \
         HAVING COALESCE(SUM(t.delta), 0) <> b.balance",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| AppApiError::transient(format!("reconcile query: {e}")))?;

    let drifts = rows
        .into_iter()
        .map(|(workspace_id, ledger_sum, cached_balance)| BalanceDrift {
            workspace_id,
            ledger_sum,
            cached_balance,
        })
        .inspect(|drift| {
            tracing::error!(
                workspace_id = %drift.workspace_id,
                ledger_sum = drift.ledger_sum,
                cached_balance = drift.cached_balance,
                "credit ledger drift detected",
            );
        })
        .collect();

    Ok(drifts)
}

async fn insert_and_update_balance(
    pool: &PgPool,
    workspace_id: Uuid,
    delta: i64,
    kind: CreditTransactionKind,
    reference_id: Option<&str>,
) -> Result<Option<LedgerEntry>, AppApiError> {
    let mut txn = pool
        .begin()
        .await
        .map_err(|e| AppApiError::transient(format!("begin txn: {e}")))?;

    if let Some(reference_id) = reference_id {
        let existing: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM credit_transaction WHERE kind = $1 AND reference_id = $2",
        )
        .bind(kind)
        .bind(reference_id)
        .fetch_optional(&mut *txn)
        .await
        .map_err(|e| AppApiError::transient(format!("idempotence check: {e}")))?;
        if existing.is_some() {
            return Ok(None);
        }
    }

    let row_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO credit_transaction (id, workspace_id, delta, kind, reference_id) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(row_id)
    .bind(workspace_id)
    .bind(delta)
    .bind(kind)
    .bind(reference_id)
    .execute(&mut *txn)
    .await
    .map_err(|e| map_insert_error(e, reference_id))?;

    upsert_balance_delta(&mut txn, workspace_id, delta).await?;

    txn.commit()
        .await
        .map_err(|e| AppApiError::transient(format!("commit txn: {e}")))?;

    Ok(Some(LedgerEntry {
        id: row_id,
        workspace_id,
        delta,
        kind,
        reference_id: reference_id.map(str::to_owned),
    }))
}

async fn upsert_balance_delta(
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    workspace_id: Uuid,
    delta: i64,
) -> Result<(), AppApiError> {
    sqlx::query(
        "INSERT INTO user_credit_balance (workspace_id, balance, updated_at) \
         VALUES ($1, $2, now()) \
         ON CONFLICT (workspace_id) DO UPDATE \
         SET balance = user_credit_balance.balance + EXCLUDED.balance, \
             updated_at = now()",
    )
    .bind(workspace_id)
    .bind(delta)
    .execute(txn)
    .await
    .map_err(|e| AppApiError::transient(format!("update balance: {e}")))?;
    Ok(())
}

fn map_insert_error(err: sqlx::Error, reference_id: Option<&str>) -> AppApiError {
    if is_unique_violation(&err) {
        AppApiError::conflict(format!(
            "ledger row already exists for reference_id {reference_id:?}"
        ))
    } else {
        AppApiError::transient(format!("insert ledger row: {err}"))
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

#[cfg(test)]
mod test {
    use db::models::CreditTransactionKind;

    #[test]
    fn negative_delta_kinds_match_spec() {
        assert!(CreditTransactionKind::Usage.allows_negative_delta());
        assert!(CreditTransactionKind::Refund.allows_negative_delta());
        assert!(CreditTransactionKind::SubscriptionCancellation.allows_negative_delta());
        assert!(!CreditTransactionKind::Allocation.allows_negative_delta());
        assert!(!CreditTransactionKind::Adjustment.allows_negative_delta());
    }
}
