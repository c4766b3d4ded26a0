//! One-shot plan catalog sync (C10): upserts the card/subscription
//! provider's discoverable products/prices, plus the tokenization
//! provider's YAML-sourced plans, which have no discovery API of their own.
//! Deactivation is always soft (`is_active = false`) — a plan row is never
//! deleted.

use std::path::Path;

use api::rest::RestClient;
use api_core::error::AppApiError;
use chrono::Utc;
use db::models::PlanType;
use payments::ProviderConfig;
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("provider request failed: {0}")]
    Provider(#[from] AppApiError),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("failed to read plan file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse plan YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// How many plan rows a sync call touched. Postgres doesn't distinguish an
/// `ON CONFLICT DO UPDATE` insert from an update in `rows_affected`, so this
/// counts upserts rather than claiming a (possibly wrong) insert/update
/// split.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SyncReport {
    pub upserted: u64,
    /// `provider_price_id`s this call upserted, for a caller that wants to
    /// [`deactivate_missing`] everything else.
    pub price_ids: Vec<String>,
}

impl SyncReport {
    pub fn merge(&mut self, other: SyncReport) {
        self.upserted += other.upserted;
        self.price_ids.extend(other.price_ids);
    }
}

/// One upserted plan, provider-agnostic.
#[derive(Clone, Debug)]
struct PlanEntry {
    provider: String,
    provider_price_id: String,
    provider_product_id: String,
    currency: String,
    display_name: String,
    plan_type: PlanType,
    credits_per_cycle: i64,
    features: Value,
    sort_order: i32,
}

/// YAML shape for tokenization-provider plans.
#[derive(Clone, Debug, Deserialize)]
struct YamlPlanFile {
    plans: Vec<YamlPlan>,
}

#[derive(Clone, Debug, Deserialize)]
struct YamlPlan {
    provider_price_id: String,
    provider_product_id: String,
    currency: String,
    display_name: String,
    plan_type: String,
    credits_per_cycle: i64,
    #[serde(default)]
    features: Value,
    #[serde(default)]
    sort_order: i32,
}

/// Stripe's list-prices response, expanded to include the nested product.
#[derive(Clone, Debug, Deserialize)]
struct StripePriceList {
    data: Vec<StripePrice>,
}

#[derive(Clone, Debug, Deserialize)]
struct StripePrice {
    id: String,
    currency: String,
    product: StripeProduct,
    #[serde(default)]
    metadata: Value,
}

#[derive(Clone, Debug, Deserialize)]
struct StripeProduct {
    id: String,
    name: String,
}

/// Fetches active products/prices from the card/subscription provider and
/// upserts them into `payment_plan`, keyed by `provider_price_id`.
pub async fn sync_provider_catalog(
    pool: &PgPool,
    provider_name: &str,
    config: &ProviderConfig,
) -> Result<SyncReport, SyncError> {
    let rest = RestClient::new("plan-sync", "stripe");
    let url = format!("{}/v1/prices?active=true&expand[]=data.product", config.base_url);
    let req = rest.get(&url, &()).bearer_auth(&config.secret_key);
    let list: StripePriceList = rest.send::<_, AppApiError>(req).await?;

    let entries: Vec<PlanEntry> = list
        .data
        .into_iter()
        .map(|price| {
            let credits_per_cycle = price
                .metadata
                .get("credits_per_cycle")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let sort_order = price
                .metadata
                .get("sort_order")
                .and_then(Value::as_i64)
                .unwrap_or(0) as i32;
            PlanEntry {
                provider: provider_name.to_owned(),
                provider_price_id: price.id,
                provider_product_id: price.product.id,
                currency: price.currency,
                display_name: price.product.name,
                plan_type: PlanType::Subscription,
                credits_per_cycle,
                features: price.metadata,
                sort_order,
            }
        })
        .collect();

    upsert_plans(pool, &entries).await
}

/// Reads `path` as YAML and upserts the tokenization provider's plans.
pub async fn sync_yaml_catalog(
    pool: &PgPool,
    provider_name: &str,
    path: &Path,
) -> Result<SyncReport, SyncError> {
    let raw = std::fs::read_to_string(path).map_err(|source| SyncError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    let file: YamlPlanFile = serde_yaml::from_str(&raw)?;

    let entries: Vec<PlanEntry> = file
        .plans
        .into_iter()
        .map(|p| PlanEntry {
            provider: provider_name.to_owned(),
            provider_price_id: p.provider_price_id,
            provider_product_id: p.provider_product_id,
            currency: p.currency,
            display_name: p.display_name,
            plan_type: if p.plan_type == "one_time" {
                PlanType::OneTime
            } else {
                PlanType::Subscription
            },
            credits_per_cycle: p.credits_per_cycle,
            features: p.features,
            sort_order: p.sort_order,
        })
        .collect();

    upsert_plans(pool, &entries).await
}

/// Marks every active plan for `provider_name` whose `provider_price_id`
/// isn't in `keep_price_ids` inactive. Never deletes a row.
pub async fn deactivate_missing(
    pool: &PgPool,
    provider_name: &str,
    keep_price_ids: &[String],
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE payment_plan SET is_active = false, updated_at = now() \
         WHERE provider = $1 AND is_active AND NOT (provider_price_id = ANY($2))",
    )
    .bind(provider_name)
    .bind(keep_price_ids)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

async fn upsert_plans(pool: &PgPool, entries: &[PlanEntry]) -> Result<SyncReport, SyncError> {
    let now = Utc::now();
    for entry in entries {
        sqlx::query(
            "INSERT INTO payment_plan \
             (id, provider, provider_price_id, provider_product_id, currency, display_name, \
              plan_type, credits_per_cycle, features, sort_order, is_active, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, true, $11, $11) \
             ON CONFLICT (provider_price_id) DO UPDATE SET \
                provider = EXCLUDED.provider, \
                provider_product_id = EXCLUDED.provider_product_id, \
                currency = EXCLUDED.currency, \
                display_name = EXCLUDED.display_name, \
                plan_type = EXCLUDED.plan_type, \
                credits_per_cycle = EXCLUDED.credits_per_cycle, \
                features = EXCLUDED.features, \
                sort_order = EXCLUDED.sort_order, \
                is_active = true, \
                updated_at = EXCLUDED.updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(&entry.provider)
        .bind(&entry.provider_price_id)
        .bind(&entry.provider_product_id)
        .bind(&entry.currency)
        .bind(&entry.display_name)
        .bind(entry.plan_type)
        .bind(entry.credits_per_cycle)
        .bind(&entry.features)
        .bind(entry.sort_order)
        .bind(now)
        .execute(pool)
        .await?;
    }
    Ok(SyncReport {
        upserted: entries.len() as u64,
        price_ids: entries.iter().map(|e| e.provider_price_id.clone()).collect(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn yaml_plan_file_parses_minimal_shape() {
        let raw = "plans:\n  - provider_price_id: tok_basic\n    provider_product_id: prod_basic\n    currency: usd\n    display_name: Basic\n    plan_type: subscription\n    credits_per_cycle: 1000\n";
        let file: YamlPlanFile = serde_yaml::from_str(raw).unwrap();
        assert_eq!(file.plans.len(), 1);
        assert_eq!(file.plans[0].provider_price_id, "tok_basic");
        assert_eq!(file.plans[0].sort_order, 0);
    }

    #[test]
    fn sync_report_merge_sums_upserted_counts() {
        let mut report = SyncReport {
            upserted: 2,
            price_ids: vec!["price_a".to_owned()],
        };
        report.merge(SyncReport {
            upserted: 3,
            price_ids: vec!["price_b".to_owned()],
        });
        assert_eq!(report.upserted, 5);
        assert_eq!(report.price_ids, vec!["price_a", "price_b"]);
    }
}
