use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::clients::commerce::CommerceClient;
use crate::clients::licensing::LicensingClient;
use crate::config::Settings;
use crate::ledger::LedgerStore;
use crate::notify::WebhookNotifier;
use crate::sync::run_sync;

/// Run a reconciliation pass on a fixed interval until Ctrl-C.
///
/// Passes are strictly sequential: the next tick is not serviced until the
/// current pass finishes, and ticks that pile up behind a slow pass coalesce
/// into one. The first pass starts immediately.
pub async fn run_scheduler(settings: &Settings) -> Result<()> {
    let source = CommerceClient::new(&settings.commerce).context("building commerce client")?;
    let licensing =
        LicensingClient::new(&settings.licensing).context("building licensing client")?;
    let notifier = WebhookNotifier::new(settings.notifications.as_ref())
        .context("building notification sender")?;
    let store = LedgerStore::new(settings.paths.ledger_dir.clone());

    let mut ticker = tokio::time::interval(Duration::from_secs(
        settings.scheduler.interval_minutes * 60,
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        interval_minutes = settings.scheduler.interval_minutes,
        dry_run = settings.scheduler.dry_run,
        "scheduler started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match run_sync(
                    settings,
                    &source,
                    &licensing,
                    &notifier,
                    &store,
                    settings.scheduler.dry_run,
                )
                .await
                {
                    Ok(summary) => info!(
                        processed = summary.processed,
                        stacked = summary.stacked,
                        skipped = summary.skipped,
                        manual_review = summary.manual_review,
                        failed = summary.failed,
                        "scheduled pass finished"
                    ),
                    Err(err) => error!(error = %err, "scheduled pass failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("scheduler stopping");
                break;
            }
        }
    }
    Ok(())
}
