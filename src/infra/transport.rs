//! Channel Transport adapter
//!
//! The manager only sees these traits. A transport opens one logical
//! channel per subscription, reports the handshake outcome as a
//! [`ChannelStatus`] and then streams [`ChangeEvent`]s on the same queue.

use tokio::sync::mpsc;

use crate::core::error::RealtimeResult;
use crate::core::event::{ChangeEvent, EventFilter};
use crate::core::filter::RowFilter;

/// What a channel is scoped to
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub schema: String,
    pub table: String,
    pub event: EventFilter,
    pub filter: Option<RowFilter>,
}

impl ChannelSpec {
    /// Channel topic, e.g. `realtime:public:orders:user_id=eq.42`
    pub fn topic(&self) -> String {
        match &self.filter {
            Some(f) => format!("realtime:{}:{}:{}", self.schema, self.table, f),
            None => format!("realtime:{}:{}", self.schema, self.table),
        }
    }

    /// Client-side scoping for transports that receive a whole table feed
    #[inline]
    pub fn accepts(&self, ev: &ChangeEvent) -> bool {
        ev.table == self.table
            && ev.schema == self.schema
            && self.event.accepts(ev.kind)
            && match (&self.filter, ev.record()) {
                (None, _) => true,
                (Some(f), Some(row)) => f.eval(row).passes(),
                (Some(_), None) => true,
            }
    }
}

/// Handshake / lifecycle status, mirrors SUBSCRIBED / CHANNEL_ERROR /
/// TIMED_OUT / CLOSED
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Status(ChannelStatus),
    Change(ChangeEvent),
}

pub type ChannelSender = mpsc::UnboundedSender<ChannelMessage>;
pub type ChannelReceiver = mpsc::UnboundedReceiver<ChannelMessage>;

/// Teardown side of an open channel. Fire-and-forget: must not block.
pub trait ChannelHandle: Send + Sync {
    fn unsubscribe(&self);
}

/// An opened channel: teardown handle plus its message queue
pub struct Channel {
    pub handle: Box<dyn ChannelHandle>,
    pub rx: ChannelReceiver,
}

/// Opens logical channels on a shared transport client.
///
/// Called from within a tokio runtime; implementations may spawn.
pub trait ChannelFactory: Send + Sync + 'static {
    fn open(&self, topic: &str, spec: &ChannelSpec) -> RealtimeResult<Channel>;

    fn name(&self) -> &'static str {
        "transport"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(filter: Option<&str>, event: EventFilter) -> ChannelSpec {
        ChannelSpec {
            schema: "public".into(),
            table: "orders".into(),
            event,
            filter: filter.map(|f| RowFilter::parse(f).unwrap()),
        }
    }

    #[test]
    fn test_topic() {
        assert_eq!(spec(None, EventFilter::All).topic(), "realtime:public:orders");
        assert_eq!(
            spec(Some("user_id=eq.42"), EventFilter::All).topic(),
            "realtime:public:orders:user_id=eq.42"
        );
    }

    #[test]
    fn test_accepts() {
        let s = spec(Some("user_id=eq.42"), EventFilter::All);
        assert!(s.accepts(&ChangeEvent::insert("orders", json!({"id": 1, "user_id": 42}))));
        assert!(!s.accepts(&ChangeEvent::insert("orders", json!({"id": 1, "user_id": 7}))));
        assert!(!s.accepts(&ChangeEvent::insert("users", json!({"user_id": 42}))));
        // key-only pre-image cannot be evaluated
        assert!(s.accepts(&ChangeEvent::delete("orders", json!({"id": 1}))));

        let ins = spec(None, EventFilter::Insert);
        assert!(!ins.accepts(&ChangeEvent::delete("orders", json!({"id": 1}))));
        assert!(!ins.accepts(&ChangeEvent::insert("orders", json!({})).with_schema("audit")));
    }
}
