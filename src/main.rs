mod bootstrap;
mod cli;

use anyhow::Result;
use clap::Parser;
use marketwatch_core::AppConfig;
use tracing::warn;

use crate::cli::Cli;

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_str = std::fs::read_to_string(&cli.config).unwrap_or_else(|_| {
        warn!(path = %cli.config, "config file not found, using defaults");
        include_str!("../config/default.toml").to_string()
    });
    let mut config: AppConfig = toml::from_str(&config_str)?;

    if let Ok(v) = std::env::var("DATABASE_URL") {
        config.database.postgres_url = v;
    }
    if let Ok(v) = std::env::var("REDIS_URL") {
        config.redis.url = v;
    }
    if let Ok(v) = std::env::var("INTERVAL_SECONDS") {
        if let Ok(n) = v.parse::<u64>() {
            config.general.interval_seconds = n;
        }
    }

    bootstrap::run(config).await
}
