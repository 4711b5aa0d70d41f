use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::info;

use access_sync::api::ApiServer;
use access_sync::batch::{run_batch_grant, DEFAULT_CHUNK_SIZE};
use access_sync::clients::commerce::CommerceClient;
use access_sync::clients::licensing::LicensingClient;
use access_sync::config::Settings;
use access_sync::ledger::LedgerStore;
use access_sync::notify::WebhookNotifier;
use access_sync::scheduler::run_scheduler;
use access_sync::sync::run_sync;

#[derive(Parser, Debug)]
#[command(name = "access-sync", version, about = "Commerce-to-licensing access reconciliation")]
struct Cli {
    /// Path to the JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Run one reconciliation pass now and print the summary
    Sync {
        /// Log grant actions without calling the licensing platform
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Run reconciliation passes on the configured interval until Ctrl-C
    Schedule,
    /// Serve the HTTP trigger endpoint
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Bulk-grant access from a prepared JSON file of rows
    BatchGrant {
        /// Input file: JSON array of {username, email?, expiry, ...} rows
        file: PathBuf,
        /// Rows per chunk; touched ledgers are persisted after each chunk
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        /// Log grant actions without calling the licensing platform
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .or_else(|| std::env::var("ACCESS_SYNC_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.json"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    access_sync::tracing::init_tracing("info")?;

    let cli = Cli::parse();
    let settings = Settings::load(config_path(&cli)).context("loading configuration")?;

    match cli.command {
        Commands::Sync { dry_run } => {
            let source = CommerceClient::new(&settings.commerce)?;
            let licensing = LicensingClient::new(&settings.licensing)?;
            let notifier = WebhookNotifier::new(settings.notifications.as_ref())?;
            let store = LedgerStore::new(settings.paths.ledger_dir.clone());
            let dry_run = dry_run || settings.scheduler.dry_run;
            let summary = run_sync(&settings, &source, &licensing, &notifier, &store, dry_run)
                .await
                .context("sync pass failed")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Schedule => {
            run_scheduler(&settings).await?;
        }
        Commands::Serve { host, port } => {
            info!(host = %host, port, "serving sync trigger endpoint");
            ApiServer::new(host, port).run(settings).await?;
        }
        Commands::BatchGrant {
            file,
            chunk_size,
            dry_run,
        } => {
            let licensing = LicensingClient::new(&settings.licensing)?;
            let store = LedgerStore::new(settings.paths.ledger_dir.clone());
            let outcome =
                run_batch_grant(&settings, &licensing, &store, &file, chunk_size, dry_run)
                    .await
                    .context("batch grant failed")?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }

    Ok(())
}
