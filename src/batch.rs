use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clients::licensing::{GrantPayload, LicensingApi};
use crate::config::Settings;
use crate::ledger::{AccessRecord, GrantHistoryEntry, Ledger, LedgerStore};
use crate::normalize::parse_timestamp;

pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// One row of an operator-supplied grant file.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchGrantRow {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    pub expiry: String,
    #[serde(default)]
    pub catalog_item_id: Option<String>,
    #[serde(default)]
    pub script_id: Option<String>,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub rows: usize,
    pub granted: u64,
    pub skipped_expired: u64,
    pub invalid_rows: u64,
    pub failed: u64,
    pub dry_run: u64,
}

/// Bulk-grant access from a prepared JSON file, outside the normal
/// transaction flow. Grants run in chunks and every touched ledger is
/// persisted after each chunk, so an interrupted run loses at most one
/// chunk of ledger updates.
pub async fn run_batch_grant(
    settings: &Settings,
    licensing: &dyn LicensingApi,
    store: &LedgerStore,
    file: &Path,
    chunk_size: usize,
    dry_run: bool,
) -> Result<BatchOutcome> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading batch file {}", file.display()))?;
    let rows: Vec<BatchGrantRow> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing batch file {}", file.display()))?;

    let chunk_size = chunk_size.max(1);
    let mut outcome = BatchOutcome {
        rows: rows.len(),
        ..BatchOutcome::default()
    };
    let mut ledgers: HashMap<String, Ledger> = HashMap::new();
    let now = Utc::now();

    for chunk in rows.chunks(chunk_size) {
        for row in chunk {
            let Some(script_id) = resolve_script_id(row, settings) else {
                outcome.invalid_rows += 1;
                warn!(username = %row.username, "batch row has no resolvable script id");
                continue;
            };
            let Some(expiry) = parse_expiry(&row.expiry) else {
                outcome.invalid_rows += 1;
                warn!(username = %row.username, expiry = %row.expiry, "batch row has invalid expiry");
                continue;
            };
            if expiry < now {
                outcome.skipped_expired += 1;
                continue;
            }

            let payload = GrantPayload {
                script_id: script_id.clone(),
                username: row.username.clone(),
                email: row.email.clone().unwrap_or_default(),
                expiry: GrantPayload::expiry_date(expiry),
                subscription_type: String::new(),
                source_username: row.username.clone(),
                remarks: row.remarks.clone().unwrap_or_else(|| "batch grant".into()),
            };

            if dry_run {
                outcome.dry_run += 1;
                info!(username = %row.username, script_id = %script_id, expiry = %payload.expiry, "dry run: batch grant suppressed");
                continue;
            }

            if let Err(err) = licensing.grant_access(&payload).await {
                outcome.failed += 1;
                warn!(username = %row.username, error = %err, "batch grant failed");
                continue;
            }

            let ledger = match ledgers.entry(script_id.clone()) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(store.load(&script_id)?)
                }
            };
            let transaction_id = row
                .transaction_id
                .clone()
                .unwrap_or_else(|| format!("batch-{}", row.username));
            let history = {
                let mut history = ledger
                    .users
                    .get(&row.username)
                    .map(|record| record.history.clone())
                    .unwrap_or_default();
                history.push(GrantHistoryEntry {
                    transaction_id: transaction_id.clone(),
                    action: "grant_new".to_string(),
                    expires_at: expiry,
                    processed_at: now,
                    note: Some("batch grant".to_string()),
                });
                history
            };
            ledger.record_user(
                &row.username,
                AccessRecord {
                    recipient_id: String::new(),
                    username: row.username.clone(),
                    source_username: row.username.clone(),
                    email: row.email.clone().unwrap_or_default(),
                    catalog_item_id: row.catalog_item_id.clone().unwrap_or_default(),
                    script_id: script_id.clone(),
                    expiry,
                    last_transaction_id: transaction_id,
                    last_transaction_at: now,
                    status: "active".to_string(),
                    history,
                },
            );
            ledger.last_synced_at = Some(now);
            outcome.granted += 1;
        }

        // Persist per chunk so large runs survive interruption.
        for ledger in ledgers.values() {
            store.save(ledger)?;
        }
    }

    info!(
        rows = outcome.rows,
        granted = outcome.granted,
        skipped_expired = outcome.skipped_expired,
        invalid_rows = outcome.invalid_rows,
        failed = outcome.failed,
        dry_run = outcome.dry_run,
        "batch grant finished"
    );
    Ok(outcome)
}

fn resolve_script_id(row: &BatchGrantRow, settings: &Settings) -> Option<String> {
    if let Some(script_id) = &row.script_id {
        return Some(script_id.clone());
    }
    if let Some(item_id) = &row.catalog_item_id {
        return settings
            .catalog_item(item_id)
            .map(|item| item.script_id.clone());
    }
    // Single-script catalogs fall back to that script.
    let ids = settings.script_ids();
    match ids.as_slice() {
        [only] => Some(only.clone()),
        _ => None,
    }
}

/// Accept either a bare date or any timestamp shape the normalizer accepts.
fn parse_expiry(value: &str) -> Option<DateTime<Utc>> {
    if let Some(dt) = parse_timestamp(value) {
        return Some(dt);
    }
    let date = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}
