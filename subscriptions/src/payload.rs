//! Tolerant field access over a webhook's raw JSON payload. Providers don't
//! agree on key casing (`subscriptionId` vs `subscription_id`), so every
//! accessor tries each candidate name in order and returns the first hit.

use api_core::error::AppApiError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

pub trait PayloadExt {
    fn field_str<'a>(&'a self, names: &[&str]) -> Option<&'a str>;
    fn field_i64(&self, names: &[&str]) -> Option<i64>;
    fn field_uuid(&self, names: &[&str]) -> Result<Uuid, AppApiError>;
    fn field_datetime(&self, names: &[&str]) -> Result<DateTime<Utc>, AppApiError>;
}

impl PayloadExt for Value {
    fn field_str<'a>(&'a self, names: &[&str]) -> Option<&'a str> {
        names.iter().find_map(|name| self.get(name).and_then(Value::as_str))
    }

    fn field_i64(&self, names: &[&str]) -> Option<i64> {
        names.iter().find_map(|name| self.get(name).and_then(Value::as_i64))
    }

    fn field_uuid(&self, names: &[&str]) -> Result<Uuid, AppApiError> {
        let raw = self
            .field_str(names)
            .ok_or_else(|| AppApiError::validation(format!("missing field among {names:?}")))?;
        Uuid::parse_str(raw)
            .map_err(|e| AppApiError::validation(format!("invalid uuid in {names:?}: {e}")))
    }

    fn field_datetime(&self, names: &[&str]) -> Result<DateTime<Utc>, AppApiError> {
        // A timestamp may arrive as an RFC3339 string or as epoch seconds,
        // depending on the provider.
        if let Some(raw) = self.field_str(names) {
            return DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| AppApiError::validation(format!("invalid timestamp in {names:?}: {e}")));
        }
        if let Some(epoch) = self.field_i64(names) {
            return DateTime::from_timestamp(epoch, 0)
                .ok_or_else(|| AppApiError::validation(format!("out-of-range epoch in {names:?}")));
        }
        Err(AppApiError::validation(format!("missing field among {names:?}")))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn field_str_tries_each_candidate_in_order() {
        let payload = serde_json::json!({"subscription_id": "sub_1"});
        assert_eq!(
            payload.field_str(&["subscriptionId", "subscription_id"]),
            Some("sub_1")
        );
    }

    #[test]
    fn field_datetime_accepts_rfc3339_and_epoch_seconds() {
        let rfc = serde_json::json!({"at": "2026-01-01T00:00:00Z"});
        assert!(rfc.field_datetime(&["at"]).is_ok());

        let epoch = serde_json::json!({"at": 1_700_000_000});
        assert!(epoch.field_datetime(&["at"]).is_ok());
    }

    #[test]
    fn field_uuid_rejects_malformed_values() {
        let payload = serde_json::json!({"workspaceId": "not-a-uuid"});
        assert!(payload.field_uuid(&["workspaceId"]).is_err());
    }
}
