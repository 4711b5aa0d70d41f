// HTTP trigger surface for the reconciliation service.

pub mod handlers;
pub mod routes;
pub mod server;

pub use server::ApiServer;
