//! Process-wide realtime counters

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use tokio::time::Instant;

use crate::core::event::ts_millis;

/// Counters mutated only by the manager
pub struct StatsCounters {
    messages: AtomicU64,
    reconnections: AtomicU64,
    errors: AtomicU64,
    /// Wall clock of last activity (ms since epoch), 0 = never
    last_activity_ms: AtomicU64,
    /// Monotonic twin of `last_activity_ms` for staleness checks
    last_activity: Mutex<Instant>,
}

/// Read-only snapshot handed to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeStats {
    pub active_subscriptions: usize,
    pub total_messages: u64,
    pub reconnections: u64,
    pub errors: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl Default for StatsCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCounters {
    pub fn new() -> Self {
        Self {
            messages: AtomicU64::new(0),
            reconnections: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn touch(&self) {
        self.last_activity_ms.store(ts_millis(), Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    #[inline]
    pub fn on_message(&self) {
        self.messages.fetch_add(1, Relaxed);
        self.touch();
    }

    #[inline]
    pub fn on_reconnect(&self) {
        self.reconnections.fetch_add(1, Relaxed);
    }

    #[inline]
    pub fn on_error(&self) {
        self.errors.fetch_add(1, Relaxed);
    }

    #[inline]
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn snapshot(&self, active_subscriptions: usize) -> RealtimeStats {
        let ms = self.last_activity_ms.load(Relaxed);
        RealtimeStats {
            active_subscriptions,
            total_messages: self.messages.load(Relaxed),
            reconnections: self.reconnections.load(Relaxed),
            errors: self.errors.load(Relaxed),
            last_activity: (ms > 0)
                .then(|| Utc.timestamp_millis_opt(ms as i64).single())
                .flatten(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let s = StatsCounters::new();
        assert!(s.snapshot(0).last_activity.is_none());
        s.on_message();
        s.on_message();
        s.on_error();
        s.on_reconnect();
        let snap = s.snapshot(3);
        assert_eq!(snap.active_subscriptions, 3);
        assert_eq!(snap.total_messages, 2);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.reconnections, 1);
        assert!(snap.last_activity.is_some());
    }
}
