use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde_json::Value;
use tracing::{error, warn};

use crate::clients::{join_url, ApiError};
use crate::config::CommerceConfig;

const SERVICE: &str = "commerce";

/// Boundary for the purchase-source API. The orchestrator only depends on
/// this trait so tests can feed transactions from memory.
#[async_trait]
pub trait PurchaseSource: Send + Sync {
    /// Fetch raw transaction records created after `since` (all when absent).
    async fn fetch_transactions(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, ApiError>;
}

/// HTTP client for the commerce platform's transaction export endpoint.
#[derive(Debug, Clone)]
pub struct CommerceClient {
    http: Client,
    base_url: String,
    endpoint: String,
    since_param: String,
    limit: Option<u32>,
    api_key: Option<String>,
    basic_auth: Option<(String, String)>,
}

impl CommerceClient {
    pub fn new(cfg: &CommerceConfig) -> Result<Self, anyhow::Error> {
        let http = Client::builder()
            .user_agent("access-sync/0.1")
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        let basic_auth = match (&cfg.basic_auth_user, &cfg.basic_auth_password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };
        Ok(Self {
            http,
            base_url: cfg.base_url.clone(),
            endpoint: cfg.transactions_endpoint.clone(),
            since_param: cfg.since_param.clone(),
            limit: cfg.transactions_limit,
            api_key: cfg.api_key.clone(),
            basic_auth,
        })
    }
}

#[async_trait]
impl PurchaseSource for CommerceClient {
    async fn fetch_transactions(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, ApiError> {
        let url = join_url(&self.base_url, &self.endpoint);
        let mut req = self.http.get(&url);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        if let Some((user, password)) = &self.basic_auth {
            req = req.basic_auth(user, Some(password));
        }
        if let Some(limit) = self.limit {
            req = req.query(&[("limit", limit.to_string())]);
        }
        if let Some(since) = since {
            req = req.query(&[(
                self.since_param.as_str(),
                since.to_rfc3339_opts(SecondsFormat::Secs, true),
            )]);
        }

        let resp = req.send().await.map_err(|source| ApiError::Transport {
            service: SERVICE,
            source,
        })?;
        let status = resp.status();
        if !status.is_success() {
            error!(status = status.as_u16(), url = %url, "transaction fetch failed");
            return Err(ApiError::Status {
                service: SERVICE,
                status: status.as_u16(),
            });
        }

        let payload: Value = resp.json().await.map_err(|source| ApiError::Transport {
            service: SERVICE,
            source,
        })?;
        Ok(extract_records(payload))
    }
}

/// The export endpoint returns either a bare array or `{"data": [...]}`.
/// Anything else is logged and treated as empty rather than failing the pass.
fn extract_records(payload: Value) -> Vec<Value> {
    match payload {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => items,
            _ => {
                warn!("unexpected transaction response shape (object without data array)");
                Vec::new()
            }
        },
        other => {
            warn!(payload_type = %value_type(&other), "unexpected transaction response shape");
            Vec::new()
        }
    }
}

fn value_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_bare_array() {
        let records = extract_records(json!([{ "transaction_id": "tx-1" }]));
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn extracts_data_wrapper() {
        let records = extract_records(json!({ "data": [{}, {}] }));
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn unexpected_shapes_yield_empty() {
        assert!(extract_records(json!({ "rows": [] })).is_empty());
        assert!(extract_records(json!("nope")).is_empty());
        assert!(extract_records(json!(42)).is_empty());
    }
}
