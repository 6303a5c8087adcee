//! Realtime Manager - watches tables over the NATS change relay

use anyhow::Result;
use realtime_manager::core::{Config, Handlers, RealtimeManager, SubscriptionConfig};
use realtime_manager::infra::NatsTransport;
use realtime_manager::telemetry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = Arc::new(Config::from_env()?);

    // Init tracing
    telemetry::init(&cfg)?;

    info!("Realtime Manager v{} [{}]", VERSION, cfg.project_ref());
    cfg.log_summary();

    info!("Connecting to NATS...");
    let nats = NatsTransport::connect(cfg.clone()).await?;
    let rt = RealtimeManager::new(cfg.clone(), Arc::new(nats.clone()));

    if cfg.watch.is_empty() {
        warn!("WATCH_TABLES is empty, nothing to subscribe to");
    }
    for entry in &cfg.watch {
        let config = watch_config(entry);
        let id = format!("watch_{}_{}", config.schema, config.table);
        match rt.subscribe(&id, config, log_handlers(&id)).await {
            Ok(()) => info!("Watching {}", entry),
            // Failed handshakes keep retrying in the background
            Err(e) => warn!("Watch {} not live yet: {}", entry, e),
        }
    }

    // Shutdown signal
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Task: Periodic stats logging
    let h1 = tokio::spawn({
        let (rt, n, mut rx) = (rt.clone(), nats.clone(), shutdown_tx.subscribe());
        async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let (msgs_in, _) = n.stats();
                        match serde_json::to_string(&rt.stats()) {
                            Ok(s) => info!("Stats: {} nats_in={}", s, msgs_in),
                            Err(e) => error!("Stats encode: {e}"),
                        }
                    }
                    _ = rx.recv() => { break; }
                }
            }
        }
    });

    info!("✓ Ready - press Ctrl+C to stop");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down (timeout={}s)...", cfg.shutdown_timeout_secs);

    let _ = shutdown_tx.send(());
    rt.destroy();

    let shutdown = async {
        let _ = h1.await;
        if let Err(e) = nats.nc.flush().await {
            warn!("NATS flush: {e}");
        }
    };
    if tokio::time::timeout(cfg.shutdown_timeout(), shutdown).await.is_err() {
        warn!("Shutdown timeout, forcing exit");
    }

    info!("Goodbye!");
    Ok(())
}

/// `schema.table` or bare `table`
fn watch_config(entry: &str) -> SubscriptionConfig {
    match entry.split_once('.') {
        Some((schema, table)) => SubscriptionConfig::table(table).schema(schema),
        None => SubscriptionConfig::table(entry),
    }
}

fn log_handlers(id: &str) -> Handlers {
    let id: Arc<str> = id.into();
    let err_id = id.clone();
    Handlers::new()
        .on_change(move |ev| {
            info!(
                "[{}] {} {}",
                id,
                ev.kind,
                ev.record().map(|r| r.to_string()).unwrap_or_default()
            );
            Ok(())
        })
        .on_error(move |e| warn!("[{}] {}", err_id, e))
}
