use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Purchase-source (commerce platform) connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CommerceConfig {
    pub base_url: String,
    #[serde(default = "default_transactions_endpoint")]
    pub transactions_endpoint: String,
    #[serde(default = "default_since_param")]
    pub since_param: String,
    #[serde(default)]
    pub transactions_limit: Option<u32>,
    #[serde(default = "default_status_filter")]
    pub status_filter: Vec<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub basic_auth_user: Option<String>,
    #[serde(default)]
    pub basic_auth_password: Option<String>,
}

/// Licensing-platform connection settings, including the grant retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct LicensingConfig {
    pub base_url: String,
    #[serde(default = "default_grant_endpoint")]
    pub grant_endpoint: String,
    #[serde(default = "default_validate_endpoint")]
    pub validate_endpoint: String,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    pub api_key: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_seconds")]
    pub retry_backoff_seconds: Vec<u64>,
}

/// One purchasable catalog item mapped to a licensing-platform script.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogItem {
    pub script_id: String,
    pub duration_days: i64,
    #[serde(default)]
    pub subscription_type: Option<String>,
    #[serde(default = "default_true")]
    pub stacking_allowed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            dry_run: false,
        }
    }
}

/// Outbound notification relay. Delivery is disabled when no webhook URL is set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_from_name")]
    pub from_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_ledger_dir")]
    pub ledger_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            ledger_dir: default_ledger_dir(),
        }
    }
}

/// Full application configuration, loaded once at startup and passed by
/// reference to every component.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub commerce: CommerceConfig,
    pub licensing: LicensingConfig,
    pub catalog: HashMap<String, CatalogItem>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub notifications: Option<NotificationConfig>,
    #[serde(default)]
    pub paths: PathsConfig,
}

impl Settings {
    /// Parse and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.catalog.is_empty() {
            anyhow::bail!("config has no catalog items; at least one mapping is required");
        }
        for (item_id, item) in &self.catalog {
            if item.script_id.trim().is_empty() {
                anyhow::bail!("catalog item {item_id} has an empty script_id");
            }
            if item.duration_days < 1 {
                anyhow::bail!(
                    "catalog item {item_id} has duration_days {} (must be >= 1)",
                    item.duration_days
                );
            }
        }
        if self.licensing.api_key.trim().is_empty() {
            anyhow::bail!("licensing.api_key must not be empty");
        }
        if self.scheduler.interval_minutes < 1 {
            anyhow::bail!("scheduler.interval_minutes must be >= 1");
        }
        Ok(())
    }

    /// Catalog lookup by the commerce platform's item id.
    pub fn catalog_item(&self, catalog_item_id: &str) -> Option<&CatalogItem> {
        self.catalog.get(catalog_item_id)
    }

    /// Distinct target script ids across the catalog, each backed by its own ledger.
    pub fn script_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .catalog
            .values()
            .map(|item| item.script_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

fn default_transactions_endpoint() -> String {
    "/users/transactions".to_string()
}

fn default_since_param() -> String {
    "since".to_string()
}

fn default_status_filter() -> Vec<String> {
    vec!["complete".to_string(), "confirmed".to_string()]
}

fn default_grant_endpoint() -> String {
    "/access/grant".to_string()
}

fn default_validate_endpoint() -> String {
    "/validate/{username}".to_string()
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_seconds() -> Vec<u64> {
    vec![5, 15, 60]
}

fn default_interval_minutes() -> u64 {
    15
}

fn default_from_name() -> String {
    "Access Sync".to_string()
}

fn default_ledger_dir() -> PathBuf {
    PathBuf::from("ledger")
}

fn default_true() -> bool {
    true
}
