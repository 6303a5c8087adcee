//! Realtime Manager - subscriptions, optimistic ledger, reconciliation,
//! reconnection and health monitoring behind one handle.
//!
//! Construct one manager at startup and pass clones of it around; clones
//! share the same state.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use smallvec::SmallVec;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::config::Config;
use crate::core::error::{RealtimeError, RealtimeResult};
use crate::core::event::{ChangeEvent, ChangeKind};
use crate::core::ledger::{generate_update_id, OptimisticLedger, OptimisticUpdate};
use crate::core::reconnect::{ReconnectPolicy, ReconnectState, RetryDecision, SubscriptionState};
use crate::core::stats::{RealtimeStats, StatsCounters};
use crate::core::subscription::{
    ErrorHandler, Handlers, Subscription, SubscriptionConfig, SubscriptionRegistry,
};
use crate::core::timers::{TimerArena, TimerKey};
use crate::infra::transport::{ChannelFactory, ChannelMessage, ChannelReceiver, ChannelStatus};

type Ack = oneshot::Sender<RealtimeResult<()>>;

/// Cheap-to-clone handle to the shared manager state
#[derive(Clone)]
pub struct RealtimeManager {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: Arc<Config>,
    transport: Arc<dyn ChannelFactory>,
    subs: SubscriptionRegistry,
    ledger: OptimisticLedger,
    timers: TimerArena,
    stats: StatsCounters,
    policy: ReconnectPolicy,
    health: Mutex<Option<AbortHandle>>,
    destroyed: AtomicBool,
}

/// Per-subscription line of a health report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionProbe {
    pub id: String,
    pub state: SubscriptionState,
    pub pending_updates: usize,
}

/// Result of one health monitor pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub stale: bool,
    pub idle: Duration,
    pub subscriptions: Vec<SubscriptionProbe>,
}

impl RealtimeManager {
    /// Create the manager and start the health monitor.
    /// Must be called from within a tokio runtime.
    pub fn new(cfg: Arc<Config>, transport: Arc<dyn ChannelFactory>) -> Self {
        let inner = Arc::new(Inner {
            policy: cfg.reconnect_policy(),
            cfg,
            transport,
            subs: SubscriptionRegistry::new(),
            ledger: OptimisticLedger::new(),
            timers: TimerArena::new(),
            stats: StatsCounters::new(),
            health: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });
        *inner.health.lock() = Some(spawn_health_monitor(&inner));
        info!(
            "Realtime manager ready (transport={}, project={})",
            inner.transport.name(),
            inner.cfg.project_ref()
        );
        Self { inner }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    // === Subscription Registry ===

    /// Subscribe under a caller-chosen id, replacing any existing (or
    /// in-flight) subscription with the same id. Resolves once the transport
    /// reports SUBSCRIBED.
    ///
    /// A handshake failure both fails this call and hands the subscription
    /// to the reconnection controller; it stays registered while retrying.
    pub async fn subscribe(
        &self,
        id: &str,
        config: SubscriptionConfig,
        handlers: Handlers,
    ) -> RealtimeResult<()> {
        let inner = &self.inner;
        if inner.destroyed.load(Relaxed) {
            return Err(RealtimeError::Destroyed);
        }
        let spec = config.channel_spec()?;
        let id: Arc<str> = id.into();

        if inner.teardown(&id) {
            info!("Replacing [{}]", id);
        }
        let topic = spec.topic();
        // A concurrent subscribe for the same id may have slipped in after teardown
        if inner
            .subs
            .insert(Subscription::new(id.clone(), config, spec, handlers))
        {
            info!("Replacing [{}] (concurrent subscribe)", id);
        }
        info!("+Sub [{}] {}", id, topic);

        let Some(ack) = inner.open_channel(&id) else {
            return Err(inner.gone_reason(&id));
        };
        // The pump enforces the handshake timeout
        match ack.await {
            Ok(res) => res,
            Err(_) => Err(inner.gone_reason(&id)),
        }
    }

    /// Close and forget a subscription. False when the id is unknown.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.inner.teardown(id);
        if removed {
            info!("-Sub [{}]", id);
        }
        removed
    }

    /// Subscriptions currently live, sorted by id
    #[inline]
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.inner.subs.live_ids()
    }

    #[inline]
    pub fn is_subscription_active(&self, id: &str) -> bool {
        self.inner.subs.state(id).is_some_and(SubscriptionState::is_live)
    }

    /// Reconnection state, None when the id is not registered
    #[inline]
    pub fn subscription_state(&self, id: &str) -> Option<SubscriptionState> {
        self.inner.subs.state(id)
    }

    // === Optimistic Update Ledger ===

    /// Record a local mutation awaiting echo. Returns the update id
    /// immediately. Re-using an id replaces the older entry.
    ///
    /// An unconfirmed entry is evicted (and `on_expired` called) after the
    /// optimistic timeout; a confirmed one ages out the same timeout after
    /// its confirmation. The identity is read with the subscription's
    /// identity field when events arrive, so the entry may be added before
    /// the subscription exists.
    pub fn add_optimistic_update(
        &self,
        sub_id: &str,
        kind: ChangeKind,
        data: Value,
        update_id: Option<&str>,
    ) -> String {
        let inner = &self.inner;
        let update_id: Arc<str> = match update_id {
            Some(id) => id.into(),
            None => generate_update_id().into(),
        };
        if inner.destroyed.load(Relaxed) {
            debug!("Optimistic {} ignored: manager destroyed", update_id);
            return update_id.to_string();
        }

        if let Some(field) = inner.subs.identity_field(sub_id) {
            if data.get(&field).is_none() {
                warn!(
                    "Optimistic {} on [{}] has no '{}' field; it can only be confirmed manually",
                    update_id, sub_id, field
                );
            }
        }
        inner
            .ledger
            .add(sub_id, OptimisticUpdate::new(update_id.clone(), kind, data));
        inner.schedule_eviction(sub_id.into(), update_id.clone());
        debug!("+Optimistic {} {} on [{}]", kind, update_id, sub_id);
        update_id.to_string()
    }

    /// Mark confirmed; the entry ages out one optimistic timeout later
    pub fn confirm_optimistic_update(&self, sub_id: &str, update_id: &str) -> bool {
        let hit = self.inner.ledger.confirm(sub_id, update_id);
        if hit {
            self.inner.schedule_eviction(sub_id.into(), update_id.into());
        }
        hit
    }

    pub fn remove_optimistic_update(&self, sub_id: &str, update_id: &str) -> bool {
        self.inner.timers.cancel(&eviction_key(sub_id, update_id));
        self.inner.ledger.remove(sub_id, update_id).is_some()
    }

    /// All entries (confirmed and pending) in insertion order
    #[inline]
    pub fn optimistic_updates(&self, sub_id: &str) -> Vec<OptimisticUpdate> {
        self.inner.ledger.all(sub_id)
    }

    /// Unconfirmed entries in insertion order
    #[inline]
    pub fn pending_optimistic_updates(&self, sub_id: &str) -> Vec<OptimisticUpdate> {
        self.inner.ledger.pending(sub_id)
    }

    // === Stats / health ===

    #[inline]
    pub fn stats(&self) -> RealtimeStats {
        self.inner.stats.snapshot(self.inner.subs.live_count())
    }

    /// What the health monitor looks at on every tick
    #[inline]
    pub fn health_check(&self) -> HealthReport {
        self.inner.health_check()
    }

    // === Teardown ===

    /// Cancel every timer, close every channel and clear all state.
    /// Idempotent; the manager rejects new subscriptions afterwards.
    pub fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Relaxed) {
            return;
        }
        if let Some(h) = inner.health.lock().take() {
            h.abort();
        }
        let subs = inner.subs.drain();
        let n = subs.len();
        for mut s in subs {
            s.close();
        }
        let timers = inner.timers.cancel_all();
        inner.ledger.clear_all();
        info!("Realtime manager destroyed ({} subs, {} timers)", n, timers);
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Relaxed)
    }
}

// === Internals ===

impl Inner {
    /// Remove every trace of a registered `id`. Ledger entries added before
    /// the first subscribe are kept. True if a subscription was registered.
    fn teardown(&self, id: &str) -> bool {
        let Some(mut s) = self.subs.remove(id) else {
            return false;
        };
        s.close();
        self.timers.cancel_sub(id);
        let dropped = self.ledger.clear(id);
        if !dropped.is_empty() {
            debug!("Dropped {} optimistic updates for [{}]", dropped.len(), id);
        }
        true
    }

    /// Open (or reopen) the transport channel for a registered subscription.
    /// Returns the handshake receiver, None if `id` is gone.
    fn open_channel(
        self: &Arc<Self>,
        id: &Arc<str>,
    ) -> Option<oneshot::Receiver<RealtimeResult<()>>> {
        let epoch = self.subs.next_epoch();
        let (ack_tx, ack_rx) = oneshot::channel();

        let opened = self.subs.with(id, |s| {
            s.close();
            s.epoch = epoch;
            s.state = SubscriptionState::Subscribing;
            let topic = s.spec.topic();
            self.transport.open(&topic, &s.spec).map(|ch| {
                s.attach(ch.handle);
                ch.rx
            })
        })?;

        match opened {
            Ok(rx) => {
                let pump = tokio::spawn(pump(
                    Arc::downgrade(self),
                    id.clone(),
                    epoch,
                    rx,
                    ack_tx,
                    self.cfg.subscribe_timeout(),
                ));
                self.subs
                    .with_current(id, epoch, |s| s.attach_pump(pump.abort_handle()));
            }
            Err(e) => {
                let _ = ack_tx.send(Err(e.clone()));
                self.on_failure(id, epoch, e);
            }
        }
        Some(ack_rx)
    }

    /// Why a pending subscribe() lost its handshake channel
    fn gone_reason(&self, id: &str) -> RealtimeError {
        if self.destroyed.load(Relaxed) {
            RealtimeError::Destroyed
        } else if self.subs.contains(id) {
            RealtimeError::Superseded(id.to_string())
        } else {
            RealtimeError::ChannelClosed(id.to_string())
        }
    }

    fn on_subscribed(&self, id: &str, epoch: u64) -> bool {
        let Some(retries) = self.subs.with_current(id, epoch, |s| {
            let n = s.reconnect.attempts();
            s.reconnect.reset();
            s.state = SubscriptionState::Live;
            n
        }) else {
            return false;
        };
        self.stats.touch();
        if retries > 0 {
            info!("Resubscribed [{}] after {} attempts", id, retries);
        } else {
            info!("Live [{}]", id);
        }
        true
    }

    /// Transport error, handshake timeout or forced close
    fn on_failure(self: &Arc<Self>, id: &Arc<str>, epoch: u64, err: RealtimeError) {
        let policy = self.policy;
        let outcome = self.subs.with_current(id, epoch, |s| {
            // One failure per channel: a second report for the same epoch is a no-op
            if !matches!(s.state, SubscriptionState::Subscribing | SubscriptionState::Live) {
                return None;
            }
            s.close();
            let d = s.reconnect.on_failure(&policy);
            s.state = ReconnectState::state_for(d);
            Some((d, s.handlers.on_error.clone()))
        });
        let Some((decision, on_error)) = outcome.flatten() else {
            debug!("Ignoring stale failure for [{}]: {}", id, err);
            return;
        };

        self.stats.on_error();
        warn!("[{}] {}", id, err);
        if let Some(h) = on_error {
            call_error_handler(id, &h, &err);
        }

        match decision {
            RetryDecision::Retry { attempt, delay } => {
                self.stats.on_reconnect();
                info!(
                    "Retry [{}] #{}/{} in {:?}",
                    id, attempt, policy.max_attempts, delay
                );
                self.schedule_retry(id.clone(), epoch, delay);
            }
            RetryDecision::Abandon { attempts } => {
                error!(
                    "Giving up on [{}] after {} reconnect attempts; resubscribe manually",
                    id, attempts
                );
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, id: Arc<str>, epoch: u64, delay: Duration) {
        if self.destroyed.load(Relaxed) {
            return;
        }
        let key = TimerKey::Retry { sub: id.clone() };
        let weak = Arc::downgrade(self);
        let fired = key.clone();
        self.timers.schedule(key, delay, move |seq| async move {
            let Some(inner) = weak.upgrade() else { return };
            if !inner.timers.complete(&fired, seq) || !inner.subs.is_current(&id, epoch) {
                return;
            }
            debug!("Reopening [{}]", id);
            inner.open_channel(&id);
        });
    }

    fn schedule_eviction(self: &Arc<Self>, sub: Arc<str>, update: Arc<str>) {
        let key = TimerKey::Eviction {
            sub: sub.clone(),
            update: update.clone(),
        };
        let weak = Arc::downgrade(self);
        let fired = key.clone();
        self.timers
            .schedule(key, self.cfg.optimistic_timeout(), move |seq| async move {
                let Some(inner) = weak.upgrade() else { return };
                if !inner.timers.complete(&fired, seq) {
                    return;
                }
                let Some(expired) = inner.ledger.remove(&sub, &update) else {
                    return;
                };
                if expired.confirmed {
                    debug!("Confirmed optimistic {} on [{}] aged out", update, sub);
                    return;
                }
                debug!("Optimistic {} on [{}] expired unconfirmed", update, sub);
                if let Some(h) = inner.subs.expiry_handler(&sub) {
                    if catch_unwind(AssertUnwindSafe(|| h(&expired))).is_err() {
                        inner.stats.on_error();
                        warn!("[{}] on_expired handler panicked", sub);
                    }
                }
            });
    }

    /// Reconciliation + dispatch for one inbound change
    fn on_change(self: &Arc<Self>, id: &Arc<str>, epoch: u64, ev: ChangeEvent) {
        let Some((field, handlers)) = self.subs.with_current(id, epoch, |s| {
            (s.config.identity_field.clone(), s.handlers.clone())
        }) else {
            return;
        };
        self.stats.on_message();

        if let Some(identity) = ev.identity(&field) {
            if let Some(uid) = self.ledger.reconcile(id, ev.kind, &field, identity) {
                debug!("Confirmed optimistic {} on [{}]", uid, id);
                self.schedule_eviction(id.clone(), uid);
            }
        }

        let Some(handler) = handlers.for_kind(ev.kind) else {
            return;
        };
        let message = match catch_unwind(AssertUnwindSafe(|| handler(&ev))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => format!("panic: {}", panic_message(panic.as_ref())),
        };
        self.stats.on_error();
        let err = RealtimeError::Handler {
            id: id.to_string(),
            message,
        };
        warn!("{} ({} event)", err, ev.kind);
        if let Some(h) = &handlers.on_error {
            call_error_handler(id, h, &err);
        }
    }

    fn health_check(&self) -> HealthReport {
        let idle = self.stats.idle_for();
        let subscriptions = self
            .subs
            .states()
            .into_iter()
            .map(|(id, state)| SubscriptionProbe {
                pending_updates: self.ledger.pending_count(&id),
                id: id.to_string(),
                state,
            })
            .collect();
        HealthReport {
            stale: idle > self.cfg.stale_after(),
            idle,
            subscriptions,
        }
    }
}

/// Drains one channel's queue. Ends on failure; a retry spawns a new pump.
///
/// Until SUBSCRIBED arrives the queue is read against the handshake
/// deadline, for the first subscribe and for every retry alike.
async fn pump(
    weak: Weak<Inner>,
    id: Arc<str>,
    epoch: u64,
    mut rx: ChannelReceiver,
    ack: Ack,
    handshake_timeout: Duration,
) {
    let mut ack = Some(ack);
    let deadline = Instant::now() + handshake_timeout;
    loop {
        let next = if ack.is_some() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(msg) => msg,
                Err(_) => {
                    let err = RealtimeError::TimedOut(id.to_string());
                    if let Some(tx) = ack.take() {
                        let _ = tx.send(Err(err.clone()));
                    }
                    if let Some(inner) = weak.upgrade() {
                        inner.on_failure(&id, epoch, err);
                    }
                    return;
                }
            }
        } else {
            rx.recv().await
        };
        let Some(msg) = next else { break };
        let Some(inner) = weak.upgrade() else { return };
        match msg {
            ChannelMessage::Status(ChannelStatus::Subscribed) => {
                if !inner.on_subscribed(&id, epoch) {
                    return;
                }
                if let Some(tx) = ack.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            ChannelMessage::Status(status) => {
                let err = status_error(&id, status);
                if let Some(tx) = ack.take() {
                    let _ = tx.send(Err(err.clone()));
                }
                inner.on_failure(&id, epoch, err);
                return;
            }
            ChannelMessage::Change(ev) => inner.on_change(&id, epoch, ev),
        }
    }

    // Transport dropped the queue without a status
    if let Some(inner) = weak.upgrade() {
        let err = RealtimeError::ChannelClosed(id.to_string());
        if let Some(tx) = ack.take() {
            let _ = tx.send(Err(err.clone()));
        }
        inner.on_failure(&id, epoch, err);
    }
}

fn status_error(id: &str, status: ChannelStatus) -> RealtimeError {
    match status {
        ChannelStatus::ChannelError(reason) => RealtimeError::ChannelError {
            id: id.to_string(),
            reason,
        },
        ChannelStatus::TimedOut => RealtimeError::TimedOut(id.to_string()),
        ChannelStatus::Closed | ChannelStatus::Subscribed => {
            RealtimeError::ChannelClosed(id.to_string())
        }
    }
}

fn spawn_health_monitor(inner: &Arc<Inner>) -> AbortHandle {
    let weak = Arc::downgrade(inner);
    let period = inner.cfg.health_interval();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.tick().await;
        loop {
            tick.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            let report = inner.health_check();
            if !report.stale {
                debug!(
                    "Health ok: idle={}s subs={}",
                    report.idle.as_secs(),
                    report.subscriptions.len()
                );
                continue;
            }
            warn!(
                "No realtime activity for {}s ({} subscriptions)",
                report.idle.as_secs(),
                report.subscriptions.len()
            );
            let not_live: SmallVec<[&SubscriptionProbe; 8]> = report
                .subscriptions
                .iter()
                .filter(|p| !p.state.is_live())
                .collect();
            for p in &report.subscriptions {
                info!(
                    "Probe [{}] state={:?} pending={}",
                    p.id, p.state, p.pending_updates
                );
            }
            if !not_live.is_empty() {
                warn!("{} subscriptions not live", not_live.len());
            }
        }
    })
    .abort_handle()
}

#[inline]
fn eviction_key(sub: &str, update: &str) -> TimerKey {
    TimerKey::Eviction {
        sub: sub.into(),
        update: update.into(),
    }
}

fn call_error_handler(id: &str, h: &ErrorHandler, err: &RealtimeError) {
    if catch_unwind(AssertUnwindSafe(|| h(err))).is_err() {
        warn!("[{}] on_error handler panicked", id);
    }
}

fn panic_message(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(
            status_error("a", ChannelStatus::ChannelError("x".into())),
            RealtimeError::ChannelError { .. }
        ));
        assert_eq!(
            status_error("a", ChannelStatus::TimedOut),
            RealtimeError::TimedOut("a".into())
        );
        assert_eq!(
            status_error("a", ChannelStatus::Closed),
            RealtimeError::ChannelClosed("a".into())
        );
    }

    #[test]
    fn test_panic_message() {
        let p = catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(p.as_ref()), "boom");
        let p = catch_unwind(|| panic!("{}", String::from("dyn"))).unwrap_err();
        assert_eq!(panic_message(p.as_ref()), "dyn");
    }
}
