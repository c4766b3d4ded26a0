//! Row models mirroring `db/migrations/0001_init.sql`.
//!
//! Enum-shaped columns are modeled as Postgres `text` with a `CHECK`
//! constraint plus a Rust enum tagged `#[sqlx(type_name = "text")]`, per the
//! redesign note against bare string-typed status fields.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum PlanType {
    Subscription,
    OneTime,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
    Canceled,
    PastDue,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum CreditTransactionKind {
    Allocation,
    Usage,
    Refund,
    Adjustment,
    SubscriptionCancellation,
}

impl CreditTransactionKind {
    /// Only these kinds may carry a negative `delta` (§3 invariant).
    pub fn allows_negative_delta(self) -> bool {
        matches!(
            self,
            Self::Usage | Self::Refund | Self::SubscriptionCancellation
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Clone, Debug, FromRow, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, FromRow, Serialize, Deserialize)]
pub struct AppUser {
    pub id: Uuid,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, FromRow, Serialize, Deserialize)]
pub struct WorkspaceMember {
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, FromRow, Serialize, Deserialize)]
pub struct PaymentPlan {
    pub id: Uuid,
    pub provider: String,
    pub provider_price_id: String,
    pub provider_product_id: String,
    pub currency: String,
    pub display_name: String,
    pub plan_type: PlanType,
    pub credits_per_cycle: i64,
    pub features: serde_json::Value,
    pub sort_order: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, FromRow, Serialize, Deserialize)]
pub struct CustomerMapping {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub provider: String,
    pub provider_customer_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, FromRow, Serialize, Deserialize)]
pub struct BillingKey {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub provider: String,
    pub provider_customer_id: String,
    pub billing_key: String,
    pub card_metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub plan_id: Uuid,
    pub provider: String,
    pub provider_subscription_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, FromRow, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub provider: String,
    pub provider_payment_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub plan_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, FromRow, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub delta: i64,
    pub kind: CreditTransactionKind,
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, FromRow, Serialize, Deserialize)]
pub struct UserCreditBalance {
    pub workspace_id: Uuid,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, FromRow, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub provider: String,
    pub provider_event_id: String,
    pub payload: serde_json::Value,
    pub signature_verified: bool,
    pub status: WebhookStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, FromRow, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub workspace_id: Option<Uuid>,
    pub action: String,
    pub table_name: String,
    pub record_id: Uuid,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub ip: Option<String>,
    pub at: DateTime<Utc>,
}

/// A persisted task/subtask row within the LLM orchestrator's (C4) task
/// tree, ordered within its parent by an exact-decimal `position`.
#[derive(Clone, Debug, FromRow, Serialize, Deserialize)]
pub struct LlmTask {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub number: Option<i32>,
    pub title: String,
    pub objective: Option<String>,
    pub deliverable: Option<String>,
    pub position: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
