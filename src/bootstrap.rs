use std::sync::Arc;

use anyhow::Result;
use marketwatch_client::FetchClient;
use marketwatch_core::AppConfig;
use marketwatch_publisher::Publisher;
use marketwatch_scheduler::Scheduler;
use marketwatch_storage::Storage;
use tracing::info;

/// C8: opens the stores, reconciles C4 against C3, connects the publisher
/// (fatal on failure), and runs the scheduler loop forever (§4.6).
pub async fn run(config: AppConfig) -> Result<()> {
    let storage = Storage::connect(&config.database.postgres_url).await?;
    storage.run_migrations().await?;

    let removed = storage.delete_orphan_latest_listings().await?;
    if removed > 0 {
        info!(removed, "reconciled orphan latest-listing rows");
    }

    let publisher = Publisher::connect(&config.redis.url).await?;
    publisher.ping().await?;
    info!("publisher reachable");

    let client = FetchClient::with_max_body_bytes(
        config.http.user_agent.clone(),
        config.http.attempts,
        config.http.start_timeout_seconds,
        config.http.max_body_bytes,
    )?;

    let scheduler = Scheduler::new(
        Arc::new(storage),
        Arc::new(publisher),
        Arc::new(client),
        config.general.interval_seconds,
        config.general.enrich_count,
        config.general.tick_seconds,
        config.general.poll_idle_seconds,
    );

    scheduler.initialize_schedule().await?;
    info!("schedule initialized, entering tick loop");
    scheduler.run().await?;
    Ok(())
}
