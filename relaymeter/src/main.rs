#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod args;

use std::sync::Arc;

use args::Args;
use clap::Parser;
use relaymeter_config::{Config, StorageConfig, SweepScope};
use relaymeter_core::TaskPool;
use relaymeter_health::{HealthMonitor, HealthPolicy};
use relaymeter_ledger::{Ledger, LedgerOptions, MemoryStore, QuotaStore, RedisStore, UsageLogSink};
use relaymeter_pricing::PricingResolver;
use relaymeter_relay::{AdaptorProber, AdaptorRegistry, ProbeSettings};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;

    let _telemetry_guard = relaymeter_telemetry::init(&config.telemetry)?;

    tracing::info!(
        config_path = %args.config.display(),
        "starting relaymeter"
    );

    let (store, usage_log) = build_store(&config.storage).await?;

    let tasks = TaskPool::new(config.tasks.max_concurrency);
    let ledger = Arc::new(Ledger::new(
        Arc::clone(&store),
        Arc::clone(&usage_log),
        tasks,
        LedgerOptions::from_config(&config.ledger, &config.batch)?,
    ));

    let registry = Arc::new(AdaptorRegistry::with_defaults(reqwest::Client::new()));
    let prober = AdaptorProber::new(
        registry,
        ledger.recorder().clone(),
        PricingResolver::from_config(&config.pricing),
        ProbeSettings::from_config(&config.health),
    );
    let health = Arc::new(HealthMonitor::new(
        Arc::clone(&store),
        Arc::new(prober),
        HealthPolicy::from_config(&config.health)?,
    ));

    if args.sweep_once {
        let report = health.sweep(SweepScope::All).await?;
        tracing::info!(
            probed = report.probed,
            disabled = report.disabled,
            enabled = report.enabled,
            "sweep finished"
        );
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();

    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_clone.cancel();
    });

    let loops = [
        Some(ledger.spawn_flusher(shutdown.clone())),
        health.spawn_sweeper(shutdown.clone()),
        health.spawn_balance_refresher(shutdown.clone()),
    ];

    shutdown.cancelled().await;

    for handle in loops.into_iter().flatten() {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "background loop panicked");
        }
    }

    tracing::info!("relaymeter stopped");
    Ok(())
}

async fn build_store(config: &StorageConfig) -> anyhow::Result<(Arc<dyn QuotaStore>, Arc<dyn UsageLogSink>)> {
    match config {
        StorageConfig::Memory => {
            tracing::warn!("using in-memory storage, balances are lost on restart");
            let store = Arc::new(MemoryStore::new());
            Ok((store.clone(), store))
        }
        StorageConfig::Redis(redis) => {
            let store = Arc::new(RedisStore::connect(redis.url.as_str(), redis.key_prefix.clone()).await?);
            tracing::info!(key_prefix = %redis.key_prefix, "connected to redis");
            Ok((store.clone(), store))
        }
    }
}

/// Wait for a shutdown signal (`SIGINT` or `SIGTERM`)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
