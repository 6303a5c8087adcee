//! # realtime-manager
//!
//! Client-side realtime subscriptions over a database change feed, with
//! optimistic updates reconciled against the echoed changes and automatic
//! reconnection with exponential backoff.
//!
//! ```no_run
//! use realtime_manager::{Config, Handlers, MemoryTransport, RealtimeManager, SubscriptionConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let cfg = Arc::new(Config::from_env()?);
//! let rt = RealtimeManager::new(cfg, Arc::new(MemoryTransport::new()));
//! rt.subscribe(
//!     "orders",
//!     SubscriptionConfig::table("orders").filter("user_id=eq.42"),
//!     Handlers::new().on_insert(|ev| {
//!         println!("new order {:?}", ev.new);
//!         Ok(())
//!     }),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod infra;
pub mod telemetry;

pub use crate::core::{
    create_project_subscription, create_user_subscription, ChangeEvent, ChangeKind, Config,
    EventFilter, Handlers, HealthReport, OptimisticUpdate, RealtimeError, RealtimeManager,
    RealtimeResult, RealtimeStats, SubscriptionConfig, SubscriptionState,
};
pub use crate::infra::{ChannelFactory, HandshakeMode, MemoryTransport, NatsTransport};
