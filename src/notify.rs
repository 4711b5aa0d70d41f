use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, error, info};

use crate::clients::licensing::IdentitySuggestion;
use crate::config::NotificationConfig;

/// Outbound notification boundary. Delivery failures are logged and never
/// propagated into the reconciliation flow.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, recipient_email: &str, subject: &str, body: &str);
}

/// Delivers notifications by posting JSON to a configured relay webhook.
/// With no webhook URL configured it degrades to a logged no-op.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: Client,
    webhook_url: Option<String>,
    from_name: String,
}

impl WebhookNotifier {
    pub fn new(cfg: Option<&NotificationConfig>) -> Result<Self, anyhow::Error> {
        let http = Client::builder()
            .user_agent("access-sync/0.1")
            .timeout(Duration::from_secs(15))
            .build()?;
        let (webhook_url, from_name) = match cfg {
            Some(cfg) => (cfg.webhook_url.clone(), cfg.from_name.clone()),
            None => (None, "Access Sync".to_string()),
        };
        Ok(Self {
            http,
            webhook_url,
            from_name,
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn send(&self, recipient_email: &str, subject: &str, body: &str) {
        let Some(url) = &self.webhook_url else {
            debug!(recipient = recipient_email, subject, "notifications disabled, skipping");
            return;
        };
        let payload = json!({
            "from": self.from_name,
            "to": recipient_email,
            "subject": subject,
            "body": body,
        });
        match self.http.post(url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(recipient = recipient_email, subject, "notification sent");
            }
            Ok(resp) => {
                error!(
                    recipient = recipient_email,
                    status = resp.status().as_u16(),
                    "notification relay rejected message"
                );
            }
            Err(err) => {
                error!(recipient = recipient_email, error = %err, "notification send failed");
            }
        }
    }
}

/// Message asking a recipient to fix the username they entered at purchase
/// time, with the platform's closest matches when it offered any.
pub fn invalid_identity_message(
    username: &str,
    suggestions: &[IdentitySuggestion],
) -> (String, String) {
    let subject = "Action needed: update your access username".to_string();

    let names: Vec<&str> = suggestions
        .iter()
        .filter_map(|s| s.username.as_deref())
        .filter(|name| !name.is_empty())
        .collect();

    let mut body = format!(
        "The username \"{username}\" you entered at checkout does not exist on \
the licensing platform, so your access could not be set up.\n\n"
    );
    if names.is_empty() {
        body.push_str(
            "The platform did not return any close matches. Please double-check \
the username in your platform profile and update it in your account.\n",
        );
    } else {
        body.push_str("Did you mean one of these?\n");
        for name in names {
            body.push_str(&format!("  - {name}\n"));
        }
    }
    (subject, body)
}
