//! Publishes synthetic change events on the NATS relay
//! Run with: cargo run --bin publish-changes -- [table] [count]

use anyhow::Result;
use realtime_manager::core::{ChangeEvent, Config};
use realtime_manager::infra::NatsTransport;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let mut args = std::env::args().skip(1);
    let table = args.next().unwrap_or_else(|| "orders".to_string());
    let count: u32 = args.next().and_then(|n| n.parse().ok()).unwrap_or(3);

    let cfg = Arc::new(Config::from_env()?);
    println!("Connecting to NATS at {}...", cfg.nats_url);
    let nats = NatsTransport::connect(cfg.clone()).await?;
    println!("Connected! subject={}\n", cfg.table_subject("public", &table));

    for i in 1..=count {
        let id = format!("row_{i}");
        let steps = [
            ChangeEvent::insert(&table, json!({"id": id, "user_id": 42, "status": "new"})),
            ChangeEvent::update(
                &table,
                Some(json!({"id": id})),
                json!({"id": id, "user_id": 42, "status": "paid"}),
            ),
            ChangeEvent::delete(&table, json!({"id": id})),
        ];
        for ev in &steps {
            nats.publish(ev).await?;
            println!("  → {} {}", ev.kind, id);
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    nats.nc.flush().await?;
    let (_, out) = nats.stats();
    println!("\n✓ Published {} events", out);
    Ok(())
}
