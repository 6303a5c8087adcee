pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod helpers;
pub mod ledger;
pub mod manager;
pub mod reconnect;
pub mod stats;
pub mod subscription;
pub mod timers;

pub use config::Config;
pub use error::{RealtimeError, RealtimeResult};
pub use event::{ChangeEvent, ChangeKind, EventFilter};
pub use helpers::{create_project_subscription, create_user_subscription};
pub use ledger::OptimisticUpdate;
pub use manager::{HealthReport, RealtimeManager, SubscriptionProbe};
pub use reconnect::SubscriptionState;
pub use stats::RealtimeStats;
pub use subscription::{Handlers, SubscriptionConfig};
