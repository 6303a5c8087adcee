//! Timer Arena - abortable scheduled tasks keyed by owner

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;

/// What a timer belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Optimistic update eviction
    Eviction { sub: Arc<str>, update: Arc<str> },
    /// Reconnect attempt
    Retry { sub: Arc<str> },
}

impl TimerKey {
    #[inline]
    pub fn sub(&self) -> &str {
        match self {
            TimerKey::Eviction { sub, .. } | TimerKey::Retry { sub } => sub,
        }
    }
}

struct Slot {
    seq: u64,
    handle: AbortHandle,
}

/// Pending timeouts, cancellable individually, per owner, or all at once
#[derive(Default)]
pub struct TimerArena {
    slots: Mutex<FxHashMap<TimerKey, Slot>>,
    seq: AtomicU64,
}

impl TimerArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` after `delay`. Re-scheduling an existing key aborts the old timer.
    /// `f` receives the timer's sequence number for [`TimerArena::complete`].
    pub fn schedule<F, Fut>(&self, key: TimerKey, delay: Duration, f: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let seq = self.seq.fetch_add(1, Relaxed) + 1;
        // Held across spawn so complete() can never run before the slot exists
        let mut slots = self.slots.lock();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f(seq).await;
        });
        let prev = slots.insert(
            key,
            Slot {
                seq,
                handle: task.abort_handle(),
            },
        );
        if let Some(prev) = prev {
            prev.handle.abort();
        }
        seq
    }

    /// Forget a fired timer. Returns false if it was cancelled or replaced
    /// in the meantime, in which case the caller must not act.
    pub fn complete(&self, key: &TimerKey, seq: u64) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(slot) if slot.seq == seq => {
                slots.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&self, key: &TimerKey) -> bool {
        self.slots
            .lock()
            .remove(key)
            .map(|s| s.handle.abort())
            .is_some()
    }

    /// Cancel every timer owned by a subscription
    pub fn cancel_sub(&self, sub: &str) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|k, slot| {
            if k.sub() == sub {
                slot.handle.abort();
                false
            } else {
                true
            }
        });
        before - slots.len()
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Slot> = self.slots.lock().drain().map(|(_, s)| s).collect();
        for s in &drained {
            s.handle.abort();
        }
        drained.len()
    }

    #[inline]
    pub fn contains(&self, key: &TimerKey) -> bool {
        self.slots.lock().contains_key(key)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
