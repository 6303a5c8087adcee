//! Scoped subscription shortcuts

use crate::core::error::RealtimeResult;
use crate::core::filter::RowFilter;
use crate::core::manager::RealtimeManager;
use crate::core::subscription::{Handlers, SubscriptionConfig};

/// Subscribe to `table` rows owned by `user_id`.
/// Id is `user_<user_id>_<table>`, filter `user_id=eq.<user_id>`.
pub async fn create_user_subscription(
    manager: &RealtimeManager,
    user_id: &str,
    table: &str,
    handlers: Handlers,
) -> RealtimeResult<String> {
    scoped(manager, "user", user_id, table, handlers).await
}

/// Subscribe to `table` rows of `project_id`.
/// Id is `project_<project_id>_<table>`, filter `project_id=eq.<project_id>`.
pub async fn create_project_subscription(
    manager: &RealtimeManager,
    project_id: &str,
    table: &str,
    handlers: Handlers,
) -> RealtimeResult<String> {
    scoped(manager, "project", project_id, table, handlers).await
}

async fn scoped(
    manager: &RealtimeManager,
    scope: &str,
    owner: &str,
    table: &str,
    handlers: Handlers,
) -> RealtimeResult<String> {
    let id = format!("{scope}_{owner}_{table}");
    let filter = RowFilter::eq(&format!("{scope}_id"), owner);
    let config = SubscriptionConfig::table(table).filter(filter.to_string());
    manager.subscribe(&id, config, handlers).await?;
    Ok(id)
}
