//! In-process transport - fan-out hub for embedding and tests

use dashmap::DashMap;
use parking_lot::RwLock;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::error::RealtimeResult;
use crate::core::event::ChangeEvent;
use crate::infra::transport::{
    Channel, ChannelFactory, ChannelHandle, ChannelMessage, ChannelSender, ChannelSpec,
    ChannelStatus,
};

/// How the hub answers a new channel
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HandshakeMode {
    /// Reply SUBSCRIBED immediately
    #[default]
    Ack,
    /// Reply CHANNEL_ERROR with the given reason
    Error(String),
    /// Never reply (the manager's handshake timeout kicks in)
    Silent,
}

struct OpenChannel {
    topic: String,
    spec: ChannelSpec,
    tx: ChannelSender,
}

#[derive(Default)]
struct Hub {
    channels: DashMap<u64, OpenChannel, FxBuildHasher>,
    next_id: AtomicU64,
    opened: AtomicU64,
    mode: RwLock<HandshakeMode>,
}

/// Cloneable handle to a shared in-memory hub
#[derive(Clone, Default)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handshake(mode: HandshakeMode) -> Self {
        let t = Self::new();
        t.set_handshake(mode);
        t
    }

    /// Applies to channels opened from now on
    pub fn set_handshake(&self, mode: HandshakeMode) {
        *self.hub.mode.write() = mode;
    }

    /// Deliver a change to every open channel whose spec accepts it.
    /// Returns the number of channels reached.
    pub fn publish(&self, ev: &ChangeEvent) -> usize {
        let mut dead: SmallVec<[u64; 8]> = SmallVec::new();
        let mut reached = 0;
        for ch in self.hub.channels.iter() {
            if !ch.spec.accepts(ev) {
                continue;
            }
            if ch.tx.send(ChannelMessage::Change(ev.clone())).is_ok() {
                reached += 1;
            } else {
                dead.push(*ch.key());
            }
        }
        for id in dead {
            self.hub.channels.remove(&id);
        }
        reached
    }

    /// Simulate the server dropping every channel
    pub fn close_all(&self) -> usize {
        self.broadcast_status(ChannelStatus::Closed)
    }

    /// Simulate a CHANNEL_ERROR on every channel
    pub fn fail_all(&self, reason: &str) -> usize {
        self.broadcast_status(ChannelStatus::ChannelError(reason.into()))
    }

    fn broadcast_status(&self, status: ChannelStatus) -> usize {
        let ids: SmallVec<[u64; 8]> = self.hub.channels.iter().map(|c| *c.key()).collect();
        let mut n = 0;
        for id in ids {
            if let Some((_, ch)) = self.hub.channels.remove(&id) {
                let _ = ch.tx.send(ChannelMessage::Status(status.clone()));
                n += 1;
            }
        }
        n
    }

    /// Currently open channels
    #[inline]
    pub fn channel_count(&self) -> usize {
        self.hub.channels.len()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut t: Vec<String> = self.hub.channels.iter().map(|c| c.topic.clone()).collect();
        t.sort();
        t
    }

    /// Channels ever opened, including failed handshakes
    #[inline]
    pub fn opened_total(&self) -> u64 {
        self.hub.opened.load(Relaxed)
    }
}

struct MemoryHandle {
    hub: Weak<Hub>,
    id: u64,
}

impl ChannelHandle for MemoryHandle {
    fn unsubscribe(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.channels.remove(&self.id);
        }
    }
}

impl ChannelFactory for MemoryTransport {
    fn open(&self, topic: &str, spec: &ChannelSpec) -> RealtimeResult<Channel> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.hub.next_id.fetch_add(1, Relaxed) + 1;
        self.hub.opened.fetch_add(1, Relaxed);
        let mode = self.hub.mode.read().clone();
        debug!("memory open #{} {} ({:?})", id, topic, mode);

        match mode {
            HandshakeMode::Ack => {
                let _ = tx.send(ChannelMessage::Status(ChannelStatus::Subscribed));
            }
            HandshakeMode::Error(reason) => {
                let _ = tx.send(ChannelMessage::Status(ChannelStatus::ChannelError(reason)));
                return Ok(Channel {
                    handle: Box::new(MemoryHandle {
                        hub: Arc::downgrade(&self.hub),
                        id,
                    }),
                    rx,
                });
            }
            HandshakeMode::Silent => {}
        }

        self.hub.channels.insert(
            id,
            OpenChannel {
                topic: topic.to_string(),
                spec: spec.clone(),
                tx,
            },
        );
        Ok(Channel {
            handle: Box::new(MemoryHandle {
                hub: Arc::downgrade(&self.hub),
                id,
            }),
            rx,
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
