//! Optimistic Update Ledger - local mutations awaiting backend echo

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::core::event::{ts_millis, ChangeKind};

type Map<K, V> = DashMap<K, V, FxBuildHasher>;

/// A locally applied mutation that has not (yet) been echoed back
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimisticUpdate {
    pub id: Arc<str>,
    pub kind: ChangeKind,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub confirmed: bool,
}

impl OptimisticUpdate {
    pub fn new(id: Arc<str>, kind: ChangeKind, data: Value) -> Self {
        Self {
            id,
            kind,
            data,
            created_at: Utc::now(),
            confirmed: false,
        }
    }

    /// Kind + identity match. The identity is read from `data` at match
    /// time, so the subscription's current identity field applies.
    #[inline]
    pub fn matches(&self, kind: ChangeKind, field: &str, identity: &Value) -> bool {
        self.kind == kind
            && self
                .data
                .get(field)
                .is_some_and(|mine| same_identity(mine, identity))
    }
}

/// Per-subscription list of optimistic updates, insertion ordered
#[derive(Default)]
pub struct OptimisticLedger {
    entries: Map<Arc<str>, Vec<OptimisticUpdate>>,
}

impl OptimisticLedger {
    pub fn new() -> Self {
        Self {
            entries: Map::with_hasher(FxBuildHasher),
        }
    }

    /// Append; an entry with the same id is replaced
    pub fn add(&self, sub_id: &str, update: OptimisticUpdate) {
        let mut list = self.entries.entry(Arc::from(sub_id)).or_default();
        list.retain(|u| u.id != update.id);
        list.push(update);
    }

    /// Flip `confirmed`; the entry stays queryable until it ages out
    pub fn confirm(&self, sub_id: &str, update_id: &str) -> bool {
        self.entries
            .get_mut(sub_id)
            .and_then(|mut list| {
                list.iter_mut()
                    .find(|u| u.id.as_ref() == update_id)
                    .map(|u| u.confirmed = true)
            })
            .is_some()
    }

    /// Remove regardless of confirmation state
    pub fn remove(&self, sub_id: &str, update_id: &str) -> Option<OptimisticUpdate> {
        self.take_where(sub_id, |u| u.id.as_ref() == update_id)
    }

    fn take_where<F>(&self, sub_id: &str, pred: F) -> Option<OptimisticUpdate>
    where
        F: Fn(&OptimisticUpdate) -> bool,
    {
        let removed = {
            let mut list = self.entries.get_mut(sub_id)?;
            let pos = list.iter().position(pred)?;
            list.remove(pos)
        };
        self.entries.remove_if(sub_id, |_, list| list.is_empty());
        Some(removed)
    }

    /// Confirm the first pending entry matching kind + identity.
    /// At most one entry is confirmed per call.
    pub fn reconcile(
        &self,
        sub_id: &str,
        kind: ChangeKind,
        field: &str,
        identity: &Value,
    ) -> Option<Arc<str>> {
        let mut list = self.entries.get_mut(sub_id)?;
        let hit = list
            .iter_mut()
            .find(|u| !u.confirmed && u.matches(kind, field, identity))?;
        hit.confirmed = true;
        Some(hit.id.clone())
    }

    pub fn all(&self, sub_id: &str) -> Vec<OptimisticUpdate> {
        self.entries
            .get(sub_id)
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    pub fn pending(&self, sub_id: &str) -> Vec<OptimisticUpdate> {
        self.entries
            .get(sub_id)
            .map(|l| l.iter().filter(|u| !u.confirmed).cloned().collect())
            .unwrap_or_default()
    }

    #[inline]
    pub fn pending_count(&self, sub_id: &str) -> usize {
        self.entries
            .get(sub_id)
            .map_or(0, |l| l.iter().filter(|u| !u.confirmed).count())
    }

    /// Drop all entries for a subscription, returning their ids
    pub fn clear(&self, sub_id: &str) -> Vec<Arc<str>> {
        self.entries
            .remove(sub_id)
            .map(|(_, l)| l.into_iter().map(|u| u.id).collect())
            .unwrap_or_default()
    }

    pub fn clear_all(&self) {
        self.entries.clear();
    }

    /// Total entries across all subscriptions
    pub fn len(&self) -> usize {
        self.entries.iter().map(|l| l.len()).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `<millis>_<9 hex chars>`; callers needing strict uniqueness pass their own id
pub fn generate_update_id() -> String {
    let rand = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", ts_millis(), &rand[..9])
}

/// Identity equality. Scalars compare by text so `42` and `"42"` agree
/// (bigint keys are often echoed as strings).
#[inline]
pub fn same_identity(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            n.to_string() == *s
        }
        _ => false,
    }
}
