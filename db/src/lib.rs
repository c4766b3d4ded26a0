//! Schema-shaped row models and the `PgPool`/migration bootstrap.
//!
//! This crate owns no business logic — only the types that mirror the SQL
//! schema under `db/migrations` and the pool construction used by every
//! domain crate (`credit-ledger`, `payments`, `webhooks`, `subscriptions`,
//! `plan-sync`). Each of those crates issues its own queries against the
//! models defined here, the same separation the workspace's `api-core`
//! (wire types) keeps from `api` (transport).

pub mod models;
pub mod pool;

pub use pool::{connect, DbError};
