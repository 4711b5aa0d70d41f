use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::info;

use crate::api::routes;
use crate::clients::commerce::CommerceClient;
use crate::clients::licensing::LicensingClient;
use crate::config::Settings;
use crate::ledger::LedgerStore;
use crate::notify::WebhookNotifier;

/// Shared state handed to the HTTP handlers. The run lock serializes trigger
/// requests so only one pass can be in flight at a time.
pub struct AppState {
    pub settings: Settings,
    pub source: CommerceClient,
    pub licensing: LicensingClient,
    pub notifier: WebhookNotifier,
    pub store: LedgerStore,
    pub run_lock: Mutex<()>,
}

pub struct ApiServer {
    pub host: String,
    pub port: u16,
}

impl ApiServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Bind and serve the trigger endpoint until the process is stopped.
    pub async fn run(self, settings: Settings) -> Result<()> {
        let bind_addr = format!("{}:{}", self.host, self.port);

        let state = web::Data::new(AppState {
            source: CommerceClient::new(&settings.commerce)
                .context("building commerce client")?,
            licensing: LicensingClient::new(&settings.licensing)
                .context("building licensing client")?,
            notifier: WebhookNotifier::new(settings.notifications.as_ref())
                .context("building notification sender")?,
            store: LedgerStore::new(settings.paths.ledger_dir.clone()),
            settings,
            run_lock: Mutex::new(()),
        });

        info!(addr = %bind_addr, "starting sync trigger server");

        HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .configure(routes::configure_routes)
        })
        .bind(&bind_addr)
        .with_context(|| format!("failed to bind to {bind_addr}"))?
        .run()
        .await
        .context("HTTP server error")?;

        Ok(())
    }
}
