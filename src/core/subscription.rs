//! Subscription Registry - client-provided ids with stored config for retries

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use tokio::task::AbortHandle;

use crate::core::error::{RealtimeError, RealtimeResult};
use crate::core::event::{default_schema, ChangeEvent, ChangeKind, EventFilter};
use crate::core::filter::RowFilter;
use crate::core::ledger::OptimisticUpdate;
use crate::core::reconnect::{ReconnectState, SubscriptionState};
use crate::infra::transport::{ChannelHandle, ChannelSpec};

type Map<K, V> = DashMap<K, V, FxBuildHasher>;

/// What a subscription listens to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub table: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default)]
    pub event: EventFilter,
    /// PostgREST style row filter, e.g. `user_id=eq.42`
    #[serde(default)]
    pub filter: Option<String>,
    /// Field used to match change events against optimistic updates
    #[serde(default = "default_identity_field")]
    pub identity_field: String,
}

fn default_identity_field() -> String {
    "id".into()
}

impl SubscriptionConfig {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            schema: default_schema(),
            event: EventFilter::All,
            filter: None,
            identity_field: default_identity_field(),
        }
    }

    pub fn schema(mut self, v: impl Into<String>) -> Self {
        self.schema = v.into();
        self
    }
    pub fn event(mut self, v: EventFilter) -> Self {
        self.event = v;
        self
    }
    pub fn filter(mut self, v: impl Into<String>) -> Self {
        self.filter = Some(v.into());
        self
    }
    pub fn identity_field(mut self, v: impl Into<String>) -> Self {
        self.identity_field = v.into();
        self
    }

    /// Validate and build the transport scope
    pub fn channel_spec(&self) -> RealtimeResult<ChannelSpec> {
        if self.table.trim().is_empty() {
            return Err(RealtimeError::InvalidConfig("table is required".into()));
        }
        if self.schema.trim().is_empty() {
            return Err(RealtimeError::InvalidConfig("schema is empty".into()));
        }
        if self.identity_field.is_empty() {
            return Err(RealtimeError::InvalidConfig("identity_field is empty".into()));
        }
        let filter = self.filter.as_deref().map(RowFilter::parse).transpose()?;
        Ok(ChannelSpec {
            schema: self.schema.clone(),
            table: self.table.clone(),
            event: self.event,
            filter,
        })
    }
}

pub type ChangeHandler = Arc<dyn Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&RealtimeError) + Send + Sync>;
pub type ExpiryHandler = Arc<dyn Fn(&OptimisticUpdate) + Send + Sync>;

/// User callbacks. Change handlers may fail or panic; both are routed
/// to `on_error`.
#[derive(Clone, Default)]
pub struct Handlers {
    pub on_insert: Option<ChangeHandler>,
    pub on_update: Option<ChangeHandler>,
    pub on_delete: Option<ChangeHandler>,
    pub on_error: Option<ErrorHandler>,
    /// Optimistic update evicted without confirmation
    pub on_expired: Option<ExpiryHandler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_insert<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_insert = Some(Arc::new(f));
        self
    }

    pub fn on_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(f));
        self
    }

    pub fn on_delete<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_delete = Some(Arc::new(f));
        self
    }

    /// Same handler for every change kind
    pub fn on_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let f: ChangeHandler = Arc::new(f);
        self.on_insert = Some(f.clone());
        self.on_update = Some(f.clone());
        self.on_delete = Some(f);
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&RealtimeError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_expired<F>(mut self, f: F) -> Self
    where
        F: Fn(&OptimisticUpdate) + Send + Sync + 'static,
    {
        self.on_expired = Some(Arc::new(f));
        self
    }

    #[inline]
    pub fn for_kind(&self, kind: ChangeKind) -> Option<&ChangeHandler> {
        match kind {
            ChangeKind::Insert => self.on_insert.as_ref(),
            ChangeKind::Update => self.on_update.as_ref(),
            ChangeKind::Delete => self.on_delete.as_ref(),
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("on_insert", &self.on_insert.is_some())
            .field("on_update", &self.on_update.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_expired", &self.on_expired.is_some())
            .finish()
    }
}

/// Registry entry. Config and handlers from subscribe() are kept so a retry
/// can reopen the channel exactly like the first subscribe did.
pub struct Subscription {
    pub id: Arc<str>,
    pub config: SubscriptionConfig,
    pub spec: ChannelSpec,
    pub handlers: Handlers,
    pub state: SubscriptionState,
    pub reconnect: ReconnectState,
    /// Bumped on every channel (re)open; stale callbacks compare against it
    pub epoch: u64,
    channel: Option<Box<dyn ChannelHandle>>,
    pump: Option<AbortHandle>,
}

impl Subscription {
    pub fn new(
        id: Arc<str>,
        config: SubscriptionConfig,
        spec: ChannelSpec,
        handlers: Handlers,
    ) -> Self {
        Self {
            id,
            config,
            spec,
            handlers,
            state: SubscriptionState::Idle,
            reconnect: ReconnectState::default(),
            epoch: 0,
            channel: None,
            pump: None,
        }
    }

    #[inline]
    pub fn attach(&mut self, channel: Box<dyn ChannelHandle>) {
        self.channel = Some(channel);
    }

    #[inline]
    pub fn attach_pump(&mut self, pump: AbortHandle) {
        self.pump = Some(pump);
    }

    /// Stop the listener and release the transport channel (fire-and-forget)
    pub fn close(&mut self) {
        if let Some(p) = self.pump.take() {
            p.abort();
        }
        if let Some(ch) = self.channel.take() {
            ch.unsubscribe();
        }
    }
}

/// subscription_id → Subscription
pub struct SubscriptionRegistry {
    subs: Map<Arc<str>, Subscription>,
    epoch: AtomicU64,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            subs: Map::with_hasher(FxBuildHasher),
            epoch: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Relaxed) + 1
    }

    /// Insert; a replaced entry is closed. True if one was replaced.
    pub fn insert(&self, sub: Subscription) -> bool {
        self.subs
            .insert(sub.id.clone(), sub)
            .map(|mut old| old.close())
            .is_some()
    }

    pub fn remove(&self, id: &str) -> Option<Subscription> {
        self.subs.remove(id).map(|(_, s)| s)
    }

    /// Run `f` on the entry. The shard lock is held for the duration:
    /// `f` must not call back into the registry.
    #[inline]
    pub fn with<R>(&self, id: &str, f: impl FnOnce(&mut Subscription) -> R) -> Option<R> {
        self.subs.get_mut(id).map(|mut s| f(&mut *s))
    }

    /// Like [`with`](Self::with) but only when `epoch` is still current
    #[inline]
    pub fn with_current<R>(
        &self,
        id: &str,
        epoch: u64,
        f: impl FnOnce(&mut Subscription) -> R,
    ) -> Option<R> {
        self.subs
            .get_mut(id)
            .filter(|s| s.epoch == epoch)
            .map(|mut s| f(&mut *s))
    }

    #[inline]
    pub fn is_current(&self, id: &str, epoch: u64) -> bool {
        self.subs.get(id).is_some_and(|s| s.epoch == epoch)
    }

    #[inline]
    pub fn contains(&self, id: &str) -> bool {
        self.subs.contains_key(id)
    }

    #[inline]
    pub fn state(&self, id: &str) -> Option<SubscriptionState> {
        self.subs.get(id).map(|s| s.state)
    }

    #[inline]
    pub fn identity_field(&self, id: &str) -> Option<String> {
        self.subs.get(id).map(|s| s.config.identity_field.clone())
    }

    #[inline]
    pub fn expiry_handler(&self, id: &str) -> Option<ExpiryHandler> {
        self.subs.get(id).and_then(|s| s.handlers.on_expired.clone())
    }

    /// Ids in `Live` state, sorted
    pub fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .subs
            .iter()
            .filter(|s| s.state.is_live())
            .map(|s| s.id.to_string())
            .collect();
        ids.sort();
        ids
    }

    #[inline]
    pub fn live_count(&self) -> usize {
        self.subs.iter().filter(|s| s.state.is_live()).count()
    }

    /// (id, state) for every registered subscription, sorted by id
    pub fn states(&self) -> Vec<(Arc<str>, SubscriptionState)> {
        let mut v: Vec<_> = self.subs.iter().map(|s| (s.id.clone(), s.state)).collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        v
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Remove every entry
    pub fn drain(&self) -> Vec<Subscription> {
        let keys: Vec<Arc<str>> = self.subs.iter().map(|s| s.key().clone()).collect();
        keys.into_iter()
            .filter_map(|k| self.subs.remove(&k).map(|(_, s)| s))
            .collect()
    }
}
