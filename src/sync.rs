use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::clients::commerce::PurchaseSource;
use crate::clients::licensing::{GrantPayload, LicensingApi};
use crate::config::Settings;
use crate::engine::{derive_action, ActionType};
use crate::ledger::{
    AccessRecord, GrantHistoryEntry, Ledger, LedgerStore, ManualReviewEntry, RetryEntry,
};
use crate::normalize::{normalize, CanonicalTransaction};
use crate::notify::{invalid_identity_message, NotificationSink};

/// Outcome counters for one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub transactions_fetched: usize,
    pub transactions_considered: usize,
    pub processed: u64,
    pub stacked: u64,
    pub skipped: u64,
    pub manual_review: u64,
    pub failed: u64,
    pub dry_run: u64,
    pub since: Option<DateTime<Utc>>,
}

/// Run one reconciliation pass: load ledgers, fetch since the watermark,
/// normalize, reconcile each transaction strictly in order, persist every
/// touched ledger, and report what happened.
///
/// Transactions are isolated: a failure on one never aborts the rest of the
/// pass. In dry-run mode no external grant calls are made and no ledger
/// state changes.
pub async fn run_sync(
    settings: &Settings,
    source: &dyn PurchaseSource,
    licensing: &dyn LicensingApi,
    notifications: &dyn NotificationSink,
    store: &LedgerStore,
    dry_run: bool,
) -> Result<RunSummary> {
    let mut ledgers: HashMap<String, Ledger> = HashMap::new();
    for script_id in settings.script_ids() {
        match store.load(&script_id) {
            Ok(ledger) => {
                ledgers.insert(script_id, ledger);
            }
            // A broken ledger takes its script out of this pass but must not
            // poison the others.
            Err(err) => {
                error!(script_id = %script_id, error = %err, "ledger load failed; excluding from pass");
            }
        }
    }

    let since = ledgers.values().filter_map(|l| l.last_processed_at).min();

    let raw_transactions = source
        .fetch_transactions(since)
        .await
        .context("fetching transactions from the purchase source")?;
    let transactions = normalize(&raw_transactions, settings);

    let mut summary = RunSummary {
        transactions_fetched: raw_transactions.len(),
        transactions_considered: transactions.len(),
        since,
        ..RunSummary::default()
    };

    let mut latest_seen: HashMap<String, DateTime<Utc>> = HashMap::new();
    let total = transactions.len();

    for (index, txn) in transactions.iter().enumerate() {
        info!(
            transaction_id = %txn.transaction_id,
            username = %txn.username,
            script_id = %txn.script_id,
            index = index + 1,
            total,
            "reconciling transaction"
        );

        let Some(ledger) = ledgers.get_mut(&txn.script_id) else {
            summary.failed += 1;
            continue;
        };

        latest_seen
            .entry(txn.script_id.clone())
            .and_modify(|seen| {
                if txn.created_at > *seen {
                    *seen = txn.created_at;
                }
            })
            .or_insert(txn.created_at);

        // Pre-engine short circuit for transactions already finalized.
        if ledger.is_processed(&txn.transaction_id) {
            summary.skipped += 1;
            info!(transaction_id = %txn.transaction_id, "already processed, skipping");
            continue;
        }

        let mut existing = ledger.users.get(&txn.username).cloned();
        let action = derive_action(txn, existing.as_ref());

        match action.action {
            ActionType::Skip => {
                ledger.register_processed(&txn.transaction_id);
                summary.skipped += 1;
                info!(
                    transaction_id = %txn.transaction_id,
                    reason = action.reason.unwrap_or("unspecified"),
                    "transaction skipped"
                );
                continue;
            }
            ActionType::ManualReview => {
                ledger.record_manual_review(ManualReviewEntry {
                    transaction_id: txn.transaction_id.clone(),
                    reason: action.reason.unwrap_or("manual_review_required").to_string(),
                    recorded_at: Utc::now(),
                });
                ledger.register_processed(&txn.transaction_id);
                summary.manual_review += 1;
                warn!(
                    transaction_id = %txn.transaction_id,
                    reason = action.reason.unwrap_or("manual_review_required"),
                    "transaction moved to manual review"
                );
                continue;
            }
            ActionType::GrantNew | ActionType::StackExisting => {}
        }

        let Some(expires_at) = action.expires_at else {
            summary.failed += 1;
            error!(transaction_id = %txn.transaction_id, "action has no expiry; cannot grant");
            continue;
        };

        let check = match licensing.validate_identity(&txn.username).await {
            Ok(check) => check,
            Err(err) => {
                // Transport failure: leave unprocessed so a later pass retries.
                summary.failed += 1;
                error!(
                    transaction_id = %txn.transaction_id,
                    username = %txn.username,
                    error = %err,
                    "identity validation failed"
                );
                continue;
            }
        };

        if !check.valid {
            if !ledger.has_manual_review(&txn.transaction_id) {
                let (subject, body) = invalid_identity_message(&txn.username, &check.suggestions);
                notifications.send(&txn.email, &subject, &body).await;
                ledger.record_manual_review(ManualReviewEntry {
                    transaction_id: txn.transaction_id.clone(),
                    reason: "invalid_identity".to_string(),
                    recorded_at: Utc::now(),
                });
            }
            ledger.register_processed(&txn.transaction_id);
            summary.manual_review += 1;
            warn!(
                transaction_id = %txn.transaction_id,
                username = %txn.username,
                "platform reported invalid identity"
            );
            continue;
        }

        let effective_username = check.verified().unwrap_or(&txn.username).to_string();
        if effective_username != txn.username {
            // The verified identity may already hold a record under its own key.
            existing = ledger
                .users
                .get(&effective_username)
                .cloned()
                .or(existing);
        }

        let payload = grant_payload(txn, expires_at, &effective_username);

        if dry_run {
            summary.dry_run += 1;
            info!(
                transaction_id = %txn.transaction_id,
                action = action.action.as_str(),
                username = %effective_username,
                expiry = %payload.expiry,
                "dry run: grant call suppressed"
            );
            continue;
        }

        if let Err(err) = licensing.grant_access(&payload).await {
            summary.failed += 1;
            ledger.record_retry(RetryEntry {
                transaction_id: txn.transaction_id.clone(),
                payload: serde_json::to_value(&payload).unwrap_or(Value::Null),
                error_message: err.to_string(),
                attempts: 0,
                recorded_at: Utc::now(),
            });
            error!(
                transaction_id = %txn.transaction_id,
                username = %effective_username,
                error = %err,
                "grant call failed; queued for retry"
            );
            continue;
        }

        let processed_at = Utc::now();
        let mut history = existing
            .as_ref()
            .map(|record| record.history.clone())
            .unwrap_or_default();
        history.push(GrantHistoryEntry {
            transaction_id: txn.transaction_id.clone(),
            action: action.action.as_str().to_string(),
            expires_at,
            processed_at,
            note: None,
        });

        let record = AccessRecord {
            recipient_id: txn.source_user_id.clone(),
            username: effective_username.clone(),
            source_username: txn.source_username.clone(),
            email: txn.email.clone(),
            catalog_item_id: txn.catalog_item_id.clone(),
            script_id: txn.script_id.clone(),
            expiry: expires_at,
            last_transaction_id: txn.transaction_id.clone(),
            last_transaction_at: txn.created_at,
            status: "active".to_string(),
            history,
        };

        if effective_username != txn.username {
            ledger.remove_user(&txn.username);
        }
        ledger.record_user(&effective_username, record);
        ledger.register_processed(&txn.transaction_id);
        ledger.last_synced_at = Some(processed_at);

        match action.action {
            ActionType::GrantNew => summary.processed += 1,
            _ => summary.stacked += 1,
        }
        info!(
            transaction_id = %txn.transaction_id,
            action = action.action.as_str(),
            expiry = %expires_at,
            "transaction processed"
        );
    }

    if !dry_run {
        for (script_id, ledger) in ledgers.iter_mut() {
            if let Some(&candidate) = latest_seen.get(script_id) {
                ledger.raise_watermark(candidate);
            }
        }
        for ledger in ledgers.values() {
            if let Err(err) = store.save(ledger) {
                error!(script_id = %ledger.script_id, error = %err, "ledger save failed");
            }
        }
    }

    info!(
        fetched = summary.transactions_fetched,
        considered = summary.transactions_considered,
        processed = summary.processed,
        stacked = summary.stacked,
        skipped = summary.skipped,
        manual_review = summary.manual_review,
        failed = summary.failed,
        dry_run = summary.dry_run,
        "sync pass completed"
    );
    Ok(summary)
}

fn grant_payload(
    txn: &CanonicalTransaction,
    expires_at: DateTime<Utc>,
    username: &str,
) -> GrantPayload {
    GrantPayload {
        script_id: txn.script_id.clone(),
        username: username.to_string(),
        email: txn.email.clone(),
        expiry: GrantPayload::expiry_date(expires_at),
        subscription_type: txn.subscription_type.clone().unwrap_or_default(),
        source_username: txn.source_username.clone(),
        remarks: txn.remarks.clone(),
    }
}
