use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// Upper bound on the remembered processed-transaction ids per ledger.
/// Oldest ids are evicted first once the cap is reached.
pub const PROCESSED_CAP: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GrantHistoryEntry {
    pub transaction_id: String,
    pub action: String,
    pub expires_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A failed grant waiting for operator follow-up. The core never replays
/// these on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEntry {
    pub transaction_id: String,
    pub payload: Value,
    pub error_message: String,
    #[serde(default)]
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualReviewEntry {
    pub transaction_id: String,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Current access state for one recipient on one catalog item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessRecord {
    pub recipient_id: String,
    /// Identity on the licensing platform; may diverge from the purchase-time
    /// username after verification.
    pub username: String,
    pub source_username: String,
    pub email: String,
    pub catalog_item_id: String,
    pub script_id: String,
    pub expiry: DateTime<Utc>,
    pub last_transaction_id: String,
    pub last_transaction_at: DateTime<Utc>,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub history: Vec<GrantHistoryEntry>,
}

fn default_status() -> String {
    "active".to_string()
}

/// Durable per-script reconciliation state, persisted as one JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    pub script_id: String,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    /// High-watermark of transaction `created_at` used for incremental fetch.
    #[serde(default)]
    pub last_processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed_transactions: Vec<String>,
    #[serde(default)]
    pub users: IndexMap<String, AccessRecord>,
    #[serde(default)]
    pub retry_queue: Vec<RetryEntry>,
    #[serde(default)]
    pub manual_review: Vec<ManualReviewEntry>,
}

impl Ledger {
    pub fn new(script_id: impl Into<String>) -> Self {
        Self {
            script_id: script_id.into(),
            last_synced_at: None,
            last_processed_at: None,
            processed_transactions: Vec::new(),
            users: IndexMap::new(),
            retry_queue: Vec::new(),
            manual_review: Vec::new(),
        }
    }

    pub fn is_processed(&self, transaction_id: &str) -> bool {
        self.processed_transactions
            .iter()
            .any(|id| id == transaction_id)
    }

    /// Remember a finalized transaction id, keeping only the most recent
    /// `PROCESSED_CAP` entries.
    pub fn register_processed(&mut self, transaction_id: &str) {
        if self.is_processed(transaction_id) {
            return;
        }
        self.processed_transactions.push(transaction_id.to_string());
        if self.processed_transactions.len() > PROCESSED_CAP {
            let drop = self.processed_transactions.len() - PROCESSED_CAP;
            self.processed_transactions.drain(..drop);
        }
    }

    /// Upsert an access record under its current platform username. When the
    /// verified identity differs from an earlier key, the caller removes the
    /// old key first so no orphaned duplicate survives.
    pub fn record_user(&mut self, username: &str, record: AccessRecord) {
        self.users.insert(username.to_string(), record);
    }

    pub fn remove_user(&mut self, username: &str) -> Option<AccessRecord> {
        self.users.shift_remove(username)
    }

    pub fn record_retry(&mut self, entry: RetryEntry) {
        self.retry_queue.push(entry);
    }

    pub fn record_manual_review(&mut self, entry: ManualReviewEntry) {
        self.manual_review.push(entry);
    }

    pub fn has_manual_review(&self, transaction_id: &str) -> bool {
        self.manual_review
            .iter()
            .any(|entry| entry.transaction_id == transaction_id)
    }

    /// Raise the fetch watermark; never lowers an existing one.
    pub fn raise_watermark(&mut self, candidate: DateTime<Utc>) {
        match self.last_processed_at {
            Some(current) if candidate <= current => {}
            _ => self.last_processed_at = Some(candidate),
        }
    }
}

/// Loads and persists ledger documents, one file per script id.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    dir: PathBuf,
}

impl LedgerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, script_id: &str) -> PathBuf {
        self.dir.join(format!("{script_id}.json"))
    }

    /// Load the ledger for a script id, synthesizing an empty one when no
    /// file has been persisted yet.
    pub fn load(&self, script_id: &str) -> Result<Ledger> {
        let path = self.path_for(script_id);
        if !path.exists() {
            info!(script_id, path = %path.display(), "initializing empty ledger");
            return Ok(Ledger::new(script_id));
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading ledger {}", path.display()))?;
        let ledger: Ledger = serde_json::from_str(&raw)
            .with_context(|| format!("parsing ledger {}", path.display()))?;
        Ok(ledger)
    }

    /// Persist a ledger atomically: write a temp file, then rename over the
    /// target so a crash never leaves a half-written document.
    pub fn save(&self, ledger: &Ledger) -> Result<()> {
        let path = self.path_for(&ledger.script_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating ledger directory {}", parent.display()))?;
        }
        let payload = serde_json::to_string_pretty(ledger).context("serializing ledger")?;
        let tmp = tmp_path(&path);
        fs::write(&tmp, payload).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("replacing ledger {}", path.display()))?;
        debug!(script_id = %ledger.script_id, path = %path.display(), "ledger saved");
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}
