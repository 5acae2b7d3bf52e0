//! ClueGetter - policy engine entry point

use anyhow::Result;
use cluegetter_common::Config;
use cluegetter_core::{
    ArchiveQueue, ArchiveSink, DnsSpfResolver, Engine, GreylistModule, RelationalSink,
};
use cluegetter_storage::{Cache, DatabasePool, DbGreylistStore, DbMessageStore, RedisCache};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::load()?);

    // Initialize logging
    init_logging(&config);

    info!("Starting ClueGetter policy engine...");

    // Initialize database
    let db_pool = DatabasePool::new(&config.database).await?;

    // Run migrations
    db_pool.migrate().await?;

    // Cache is optional; without it greylisting falls back to the
    // relational backend
    let cache: Option<Arc<dyn Cache>> = if config.redis.enabled {
        info!("Using Redis cache at {}", config.redis.url);
        Some(Arc::new(RedisCache::new(&config.redis.url)?))
    } else {
        None
    };

    // Archive: every decided message lands in the relational store
    let sinks: Vec<Arc<dyn ArchiveSink>> = vec![Arc::new(RelationalSink::new(
        DbMessageStore::new(db_pool.clone()),
    ))];
    let (archive, archive_handle) =
        ArchiveQueue::start(sinks, config.cluegetter.archive_queue_size);

    // Build the engine and register modules
    let mut engine = Engine::new(Arc::clone(&config), archive)?;

    let greylist = Arc::new(GreylistModule::new(
        Arc::clone(&config),
        Arc::new(DbGreylistStore::new(db_pool.clone())),
        cache,
        Arc::new(DnsSpfResolver::new()),
    ));
    engine.register(greylist.clone())?;

    engine.start().await?;
    let engine = Arc::new(engine);

    // Background whitelist maintenance
    let shutdown = CancellationToken::new();
    let maintenance_handle = if config.greylisting.enabled {
        Some(greylist.spawn_maintenance(shutdown.clone()))
    } else {
        None
    };

    info!("ClueGetter ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    shutdown.cancel();
    if let Some(handle) = maintenance_handle {
        let _ = handle.await;
    }

    // dropping the engine closes the archive queue; wait for the
    // consumer to drain what's left
    drop(engine);
    let _ = archive_handle.await;

    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}
