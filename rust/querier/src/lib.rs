pub mod config;
pub mod db;
pub mod encode;
pub mod engine;
pub mod error;
pub mod filter;
pub mod operator;
pub mod prometheus;
pub mod server;
pub mod state;
pub mod tag;
pub mod telemetry;
pub mod time;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the filter translation service using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config)?.run().await
}
