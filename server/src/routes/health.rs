use api::server::LxJson;
use serde_json::{json, Value};

/// Liveness probe. Deliberately does not touch the database — a degraded
/// database is surfaced by failing domain routes, not by flapping the
/// liveness check a load balancer uses to decide whether to kill the
/// process.
pub async fn health() -> LxJson<Value> {
    LxJson(json!({ "status": "ok" }))
}
