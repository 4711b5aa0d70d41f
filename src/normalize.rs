use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Settings;

/// One validated purchase, reshaped for the reconciliation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalTransaction {
    pub transaction_id: String,
    pub catalog_item_id: String,
    pub script_id: String,
    /// Username to grant against; starts as the purchase-time username and
    /// may be replaced by the verified platform identity downstream.
    pub username: String,
    pub email: String,
    pub source_user_id: String,
    pub source_username: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub computed_expiry: DateTime<Utc>,
    pub duration_days: i64,
    pub stacking_allowed: bool,
    pub subscription_type: Option<String>,
    pub remarks: String,
}

/// Why a raw record was dropped instead of normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotAnObject,
    MissingTransactionId,
    MissingCatalogItemId,
    StatusFiltered,
    UnknownCatalogItem,
    InvalidCreatedAt,
    MissingUsername,
    MissingEmail,
    MissingUserId,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::NotAnObject => "not_an_object",
            DropReason::MissingTransactionId => "missing_transaction_id",
            DropReason::MissingCatalogItemId => "missing_catalog_item_id",
            DropReason::StatusFiltered => "status_filtered",
            DropReason::UnknownCatalogItem => "unknown_catalog_item",
            DropReason::InvalidCreatedAt => "invalid_created_at",
            DropReason::MissingUsername => "missing_username",
            DropReason::MissingEmail => "missing_email",
            DropReason::MissingUserId => "missing_user_id",
        }
    }
}

/// Parse the timestamp shapes the commerce platform emits: ISO-8601 with or
/// without offset, or `YYYY-MM-DD HH:MM:SS[.ffffff]`. Naive values are
/// assumed UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let candidate = value.trim();
    if candidate.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(candidate) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(candidate, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Expiry used for the grant: the source-provided expiry when it parses and
/// is not earlier than the purchase itself, otherwise purchase time plus the
/// catalog duration.
pub fn compute_expiry(
    created_at: DateTime<Utc>,
    duration_days: i64,
    source_expiry: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    match source_expiry {
        Some(expiry) if expiry >= created_at => expiry,
        _ => created_at + Duration::days(duration_days),
    }
}

/// Normalize a batch of raw records, preserving input order. Invalid records
/// are dropped with a logged reason; this never fails the caller.
pub fn normalize(raw_records: &[Value], settings: &Settings) -> Vec<CanonicalTransaction> {
    let mut normalized = Vec::with_capacity(raw_records.len());
    for raw in raw_records {
        match normalize_record(raw, settings) {
            Ok(txn) => normalized.push(txn),
            Err(DropReason::StatusFiltered) => {
                debug!(
                    transaction_id = field_as_string(raw, "transaction_id").as_deref(),
                    "transaction dropped (status outside filter)"
                );
            }
            Err(reason) => {
                warn!(
                    reason = reason.as_str(),
                    transaction_id = field_as_string(raw, "transaction_id").as_deref(),
                    catalog_item_id = field_as_string(raw, "product_id").as_deref(),
                    "transaction dropped"
                );
            }
        }
    }
    normalized
}

/// Field-by-field construction of one canonical transaction. Each failure
/// class gets its own tagged reason.
pub fn normalize_record(
    raw: &Value,
    settings: &Settings,
) -> Result<CanonicalTransaction, DropReason> {
    if !raw.is_object() {
        return Err(DropReason::NotAnObject);
    }

    let transaction_id =
        field_as_string(raw, "transaction_id").ok_or(DropReason::MissingTransactionId)?;
    let catalog_item_id =
        field_as_string(raw, "product_id").ok_or(DropReason::MissingCatalogItemId)?;

    let status = first_string(raw, &["status", "txn_status"]).unwrap_or_default();
    let allowed = &settings.commerce.status_filter;
    if !allowed.is_empty()
        && !allowed
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&status))
    {
        return Err(DropReason::StatusFiltered);
    }

    let item = settings
        .catalog_item(&catalog_item_id)
        .ok_or(DropReason::UnknownCatalogItem)?;

    let created_at = field_as_string(raw, "created_at")
        .and_then(|value| parse_timestamp(&value))
        .ok_or(DropReason::InvalidCreatedAt)?;
    // An unparseable expires_at falls back to the computed expiry.
    let source_expiry =
        field_as_string(raw, "expires_at").and_then(|value| parse_timestamp(&value));
    let computed_expiry = compute_expiry(created_at, item.duration_days, source_expiry);

    let username = nested_user_field(raw, "username")
        .or_else(|| field_as_string(raw, "user_login"))
        .ok_or(DropReason::MissingUsername)?;
    let email = nested_user_field(raw, "email")
        .or_else(|| field_as_string(raw, "user_email"))
        .ok_or(DropReason::MissingEmail)?;
    let source_user_id = nested_user_field(raw, "id")
        .or_else(|| field_as_string(raw, "user_id"))
        .ok_or(DropReason::MissingUserId)?;

    let display_name = nested_user_field(raw, "display_name")
        .or_else(|| field_as_string(raw, "display_name"))
        .or_else(|| display_name_from_meta(raw));

    let remarks = first_string(raw, &["remarks", "note"]).unwrap_or_else(|| {
        if status.eq_ignore_ascii_case("complete") || status.is_empty() {
            "paid".to_string()
        } else {
            status.clone()
        }
    });

    Ok(CanonicalTransaction {
        transaction_id,
        catalog_item_id,
        script_id: item.script_id.clone(),
        source_username: username.clone(),
        username,
        email,
        source_user_id,
        display_name,
        created_at,
        computed_expiry,
        duration_days: item.duration_days,
        stacking_allowed: item.stacking_allowed,
        subscription_type: item.subscription_type.clone(),
        remarks,
    })
}

/// Read a top-level field as a non-empty string; numeric ids are stringified.
fn field_as_string(raw: &Value, key: &str) -> Option<String> {
    match raw.get(key)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_string(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| field_as_string(raw, key))
}

fn nested_user_field(raw: &Value, key: &str) -> Option<String> {
    field_as_string(raw.get("user")?, key)
}

fn display_name_from_meta(raw: &Value) -> Option<String> {
    let meta = raw.get("user_meta")?;
    let parts: Vec<String> = ["first_name", "last_name"]
        .iter()
        .filter_map(|key| field_as_string(meta, key))
        .collect();
    (!parts.is_empty()).then(|| parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_settings() -> Settings {
        serde_json::from_value(json!({
            "commerce": {
                "base_url": "https://shop.example.com/api",
                "status_filter": ["complete"]
            },
            "licensing": {
                "base_url": "https://licensing.example.com/api",
                "api_key": "k"
            },
            "catalog": {
                "2291": {
                    "script_id": "SCRIPT_2291",
                    "duration_days": 30,
                    "subscription_type": "Monthly"
                }
            }
        }))
        .unwrap()
    }

    fn sample_raw() -> Value {
        json!({
            "transaction_id": "tx-1",
            "user_id": "123",
            "user_email": "user@example.com",
            "user_login": "user1",
            "display_name": "User One",
            "txn_status": "complete",
            "product_id": "2291",
            "created_at": "2025-11-18 11:14:59",
            "expires_at": null
        })
    }

    #[test]
    fn normalizes_flat_record() {
        let settings = sample_settings();
        let txn = normalize_record(&sample_raw(), &settings).unwrap();
        assert_eq!(txn.transaction_id, "tx-1");
        assert_eq!(txn.script_id, "SCRIPT_2291");
        assert_eq!(txn.username, "user1");
        assert_eq!(txn.source_username, "user1");
        assert_eq!(txn.source_user_id, "123");
        assert_eq!(txn.remarks, "paid");
        assert_eq!(txn.duration_days, 30);
        assert_eq!(
            txn.computed_expiry,
            txn.created_at + Duration::days(30),
        );
    }

    #[test]
    fn nested_user_object_takes_priority() {
        let settings = sample_settings();
        let mut raw = sample_raw();
        raw["user"] = json!({
            "id": 999,
            "username": "nested_user",
            "email": "nested@example.com"
        });
        let txn = normalize_record(&raw, &settings).unwrap();
        assert_eq!(txn.username, "nested_user");
        assert_eq!(txn.email, "nested@example.com");
        assert_eq!(txn.source_user_id, "999");
    }

    #[test]
    fn status_outside_filter_is_dropped() {
        let settings = sample_settings();
        let mut raw = sample_raw();
        raw["txn_status"] = json!("refunded");
        assert_eq!(
            normalize_record(&raw, &settings),
            Err(DropReason::StatusFiltered)
        );
    }

    #[test]
    fn unknown_catalog_item_is_dropped() {
        let settings = sample_settings();
        let mut raw = sample_raw();
        raw["product_id"] = json!("9999");
        assert_eq!(
            normalize_record(&raw, &settings),
            Err(DropReason::UnknownCatalogItem)
        );
    }

    #[test]
    fn invalid_created_at_is_dropped() {
        let settings = sample_settings();
        let mut raw = sample_raw();
        raw["created_at"] = json!("not a date");
        assert_eq!(
            normalize_record(&raw, &settings),
            Err(DropReason::InvalidCreatedAt)
        );
    }

    #[test]
    fn missing_required_fields_report_distinct_reasons() {
        let settings = sample_settings();

        let mut raw = sample_raw();
        raw.as_object_mut().unwrap().remove("user_login");
        assert_eq!(
            normalize_record(&raw, &settings),
            Err(DropReason::MissingUsername)
        );

        let mut raw = sample_raw();
        raw.as_object_mut().unwrap().remove("user_email");
        assert_eq!(
            normalize_record(&raw, &settings),
            Err(DropReason::MissingEmail)
        );

        let mut raw = sample_raw();
        raw.as_object_mut().unwrap().remove("user_id");
        assert_eq!(
            normalize_record(&raw, &settings),
            Err(DropReason::MissingUserId)
        );
    }

    #[test]
    fn source_expiry_overrides_duration() {
        let settings = sample_settings();
        let mut raw = sample_raw();
        raw["expires_at"] = json!("2026-06-01T00:00:00Z");
        let txn = normalize_record(&raw, &settings).unwrap();
        assert_eq!(
            txn.computed_expiry,
            "2026-06-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn unparseable_expiry_falls_back_to_duration() {
        let settings = sample_settings();
        let mut raw = sample_raw();
        raw["expires_at"] = json!("soon");
        let txn = normalize_record(&raw, &settings).unwrap();
        assert_eq!(txn.computed_expiry, txn.created_at + Duration::days(30));
    }

    #[test]
    fn expiry_before_purchase_falls_back_to_duration() {
        let created = "2026-01-10T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let stale = "2020-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let expiry = compute_expiry(created, 30, Some(stale));
        assert_eq!(expiry, created + Duration::days(30));
    }

    #[test]
    fn display_name_falls_back_to_meta_parts() {
        let settings = sample_settings();
        let mut raw = sample_raw();
        raw.as_object_mut().unwrap().remove("display_name");
        raw["user_meta"] = json!({ "first_name": "Jo", "last_name": "Trader" });
        let txn = normalize_record(&raw, &settings).unwrap();
        assert_eq!(txn.display_name.as_deref(), Some("Jo Trader"));
    }

    #[test]
    fn parses_supported_timestamp_shapes() {
        for value in [
            "2025-11-18T11:14:59Z",
            "2025-11-18T11:14:59+00:00",
            "2025-11-18T11:14:59",
            "2025-11-18 11:14:59",
            "2025-11-18 11:14:59.123456",
        ] {
            let parsed = parse_timestamp(value).unwrap_or_else(|| panic!("failed on {value}"));
            assert_eq!(parsed.date_naive().to_string(), "2025-11-18");
        }
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("18/11/2025").is_none());
    }

    #[test]
    fn batch_normalize_preserves_order_and_drops_invalid() {
        let settings = sample_settings();
        let mut second = sample_raw();
        second["transaction_id"] = json!("tx-2");
        let mut broken = sample_raw();
        broken["created_at"] = json!("nope");

        let out = normalize(&[sample_raw(), broken, second], &settings);
        let ids: Vec<&str> = out.iter().map(|t| t.transaction_id.as_str()).collect();
        assert_eq!(ids, vec!["tx-1", "tx-2"]);
    }

    #[test]
    fn non_complete_status_in_filter_becomes_remarks() {
        let mut settings = sample_settings();
        settings.commerce.status_filter = vec!["confirmed".into()];
        let mut raw = sample_raw();
        raw["txn_status"] = json!("confirmed");
        let txn = normalize_record(&raw, &settings).unwrap();
        assert_eq!(txn.remarks, "confirmed");
    }
}
