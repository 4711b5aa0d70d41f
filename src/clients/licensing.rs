use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::clients::{join_url, ApiError};
use crate::config::LicensingConfig;

const SERVICE: &str = "licensing";

/// Body of a grant call. Field names follow the licensing platform's wire
/// contract; `expiry` is a plain `YYYY-MM-DD` date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GrantPayload {
    #[serde(rename = "scriptId")]
    pub script_id: String,
    pub username: String,
    pub email: String,
    pub expiry: String,
    pub subscription_type: String,
    pub source_username: String,
    pub remarks: String,
}

impl GrantPayload {
    pub fn expiry_date(expiry: DateTime<Utc>) -> String {
        expiry.date_naive().to_string()
    }
}

/// Result of an identity lookup on the licensing platform.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityCheck {
    #[serde(rename = "validUser", default)]
    pub valid: bool,
    #[serde(rename = "verifiedUserName", default)]
    pub verified_username: Option<String>,
    #[serde(rename = "allUserSuggestions", default)]
    pub suggestions: Vec<IdentitySuggestion>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentitySuggestion {
    #[serde(default)]
    pub username: Option<String>,
}

impl IdentityCheck {
    /// Verified platform identity, when the platform reported one.
    pub fn verified(&self) -> Option<&str> {
        self.verified_username
            .as_deref()
            .filter(|name| !name.is_empty())
    }
}

/// Boundary for the licensing-platform API.
#[async_trait]
pub trait LicensingApi: Send + Sync {
    async fn validate_identity(&self, username: &str) -> Result<IdentityCheck, ApiError>;
    async fn grant_access(&self, payload: &GrantPayload) -> Result<Value, ApiError>;
}

/// HTTP client for the licensing platform. Grant calls carry a bounded
/// retry with the configured backoff schedule; validation is a single shot.
#[derive(Debug, Clone)]
pub struct LicensingClient {
    http: Client,
    base_url: String,
    grant_endpoint: String,
    validate_endpoint: String,
    api_key_header: String,
    api_key: String,
    max_retries: u32,
    backoff_seconds: Vec<u64>,
}

impl LicensingClient {
    pub fn new(cfg: &LicensingConfig) -> Result<Self, anyhow::Error> {
        let http = Client::builder()
            .user_agent("access-sync/0.1")
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url.clone(),
            grant_endpoint: cfg.grant_endpoint.clone(),
            validate_endpoint: cfg.validate_endpoint.clone(),
            api_key_header: cfg.api_key_header.clone(),
            api_key: cfg.api_key.clone(),
            max_retries: cfg.max_retries,
            backoff_seconds: cfg.retry_backoff_seconds.clone(),
        })
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let secs = match self.backoff_seconds.as_slice() {
            [] => 1,
            schedule => {
                let idx = (attempt as usize).min(schedule.len() - 1);
                schedule[idx]
            }
        };
        Duration::from_secs(secs)
    }
}

#[async_trait]
impl LicensingApi for LicensingClient {
    async fn validate_identity(&self, username: &str) -> Result<IdentityCheck, ApiError> {
        let endpoint = self.validate_endpoint.replace("{username}", username);
        let url = join_url(&self.base_url, &endpoint);
        let resp = self
            .http
            .get(&url)
            .header(&self.api_key_header, &self.api_key)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                service: SERVICE,
                source,
            })?;
        let status = resp.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), username, "identity validation failed");
            return Err(ApiError::Status {
                service: SERVICE,
                status: status.as_u16(),
            });
        }
        resp.json::<IdentityCheck>()
            .await
            .map_err(|_| ApiError::UnexpectedResponse { service: SERVICE })
    }

    async fn grant_access(&self, payload: &GrantPayload) -> Result<Value, ApiError> {
        let url = join_url(&self.base_url, &self.grant_endpoint);
        let mut last_error = ApiError::UnexpectedResponse { service: SERVICE };

        for attempt in 0..=self.max_retries {
            let result = self
                .http
                .post(&url)
                .header(&self.api_key_header, &self.api_key)
                .json(payload)
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        info!(
                            status = status.as_u16(),
                            script_id = %payload.script_id,
                            username = %payload.username,
                            "grant call succeeded"
                        );
                        return resp
                            .json::<Value>()
                            .await
                            .map_err(|_| ApiError::UnexpectedResponse { service: SERVICE });
                    }
                    warn!(
                        attempt = attempt + 1,
                        status = status.as_u16(),
                        script_id = %payload.script_id,
                        username = %payload.username,
                        "grant call rejected"
                    );
                    last_error = ApiError::Status {
                        service: SERVICE,
                        status: status.as_u16(),
                    };
                }
                Err(source) => {
                    warn!(
                        attempt = attempt + 1,
                        script_id = %payload.script_id,
                        username = %payload.username,
                        error = %source,
                        "grant call transport error"
                    );
                    last_error = ApiError::Transport {
                        service: SERVICE,
                        source,
                    };
                }
            }

            if attempt < self.max_retries {
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LicensingConfig;

    fn client(backoff: Vec<u64>) -> LicensingClient {
        let cfg: LicensingConfig = serde_json::from_value(serde_json::json!({
            "base_url": "https://licensing.example.com",
            "api_key": "k",
            "retry_backoff_seconds": backoff,
        }))
        .unwrap();
        LicensingClient::new(&cfg).unwrap()
    }

    #[test]
    fn backoff_schedule_reuses_last_entry() {
        let c = client(vec![5, 15, 60]);
        assert_eq!(c.backoff_delay(0), Duration::from_secs(5));
        assert_eq!(c.backoff_delay(1), Duration::from_secs(15));
        assert_eq!(c.backoff_delay(2), Duration::from_secs(60));
        assert_eq!(c.backoff_delay(9), Duration::from_secs(60));
    }

    #[test]
    fn empty_backoff_schedule_falls_back_to_one_second() {
        let c = client(vec![]);
        assert_eq!(c.backoff_delay(0), Duration::from_secs(1));
    }

    #[test]
    fn grant_payload_serializes_wire_names() {
        let payload = GrantPayload {
            script_id: "SCRIPT_1".into(),
            username: "trader".into(),
            email: "trader@example.com".into(),
            expiry: "2026-01-31".into(),
            subscription_type: "Monthly".into(),
            source_username: "trader".into(),
            remarks: "paid".into(),
        };
        let wire = serde_json::to_value(&payload).unwrap();
        assert_eq!(wire["scriptId"], "SCRIPT_1");
        assert_eq!(wire["expiry"], "2026-01-31");
        assert_eq!(wire["source_username"], "trader");
    }

    #[test]
    fn identity_check_parses_wire_names() {
        let check: IdentityCheck = serde_json::from_value(serde_json::json!({
            "validUser": true,
            "verifiedUserName": "Trader",
            "allUserSuggestions": [{ "username": "trader_1" }, {}]
        }))
        .unwrap();
        assert!(check.valid);
        assert_eq!(check.verified(), Some("Trader"));
        assert_eq!(check.suggestions.len(), 2);
    }

    #[test]
    fn empty_verified_username_reads_as_absent() {
        let check: IdentityCheck = serde_json::from_value(serde_json::json!({
            "validUser": false,
            "verifiedUserName": ""
        }))
        .unwrap();
        assert_eq!(check.verified(), None);
    }

    #[test]
    fn expiry_date_is_calendar_date() {
        let expiry = "2026-03-15T23:59:59Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(GrantPayload::expiry_date(expiry), "2026-03-15");
    }
}
