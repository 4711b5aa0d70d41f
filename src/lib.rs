// Access reconciliation service: turns commerce purchase transactions into
// idempotent access grants on the licensing platform, with durable
// per-script ledgers that make repeated runs safe.

pub mod api;
pub mod batch;
pub mod clients;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod normalize;
pub mod notify;
pub mod scheduler;
pub mod sync;
pub mod tracing;

pub use config::Settings;
pub use sync::{run_sync, RunSummary};
