use actix_web::{web, HttpResponse, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::api::server::AppState;
use crate::sync::run_sync;

/// Liveness probe.
pub async fn health_check() -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    #[serde(default)]
    pub dry_run: Option<bool>,
}

/// Run one reconciliation pass and return its summary. Triggers that arrive
/// while a pass is in flight are rejected rather than queued, so two passes
/// can never mutate the same ledger concurrently.
pub async fn trigger_sync(
    state: web::Data<AppState>,
    query: web::Query<SyncQuery>,
) -> Result<HttpResponse> {
    let Ok(_guard) = state.run_lock.try_lock() else {
        return Ok(HttpResponse::Conflict().json(json!({
            "error": "a sync pass is already running"
        })));
    };

    let dry_run = query.dry_run.unwrap_or(state.settings.scheduler.dry_run);
    info!(dry_run, "sync pass triggered over HTTP");

    match run_sync(
        &state.settings,
        &state.source,
        &state.licensing,
        &state.notifier,
        &state.store,
        dry_run,
    )
    .await
    {
        Ok(summary) => Ok(HttpResponse::Ok().json(summary)),
        Err(err) => {
            error!(error = %err, "triggered sync pass failed");
            Ok(HttpResponse::InternalServerError().json(json!({
                "error": err.to_string()
            })))
        }
    }
}
