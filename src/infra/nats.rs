//! NATS transport - change feed relayed on per-table subjects
//!
//! Subject: `{prefix}.{project}.{schema}.{table}`, payload is a JSON
//! [`ChangeEvent`]. Row filters are applied on this side.

use anyhow::{Context, Result};
use async_nats::{Client, ConnectOptions};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::core::error::RealtimeResult;
use crate::core::event::ChangeEvent;
use crate::core::Config;
use crate::infra::transport::{
    Channel, ChannelFactory, ChannelHandle, ChannelMessage, ChannelSender, ChannelSpec,
    ChannelStatus,
};

#[derive(Clone)]
pub struct NatsTransport {
    pub nc: Client,
    cfg: Arc<Config>,
    msgs_in: Arc<AtomicU64>,
    msgs_out: Arc<AtomicU64>,
}

impl NatsTransport {
    /// Connect using the API key as auth token
    pub async fn connect(cfg: Arc<Config>) -> Result<Self> {
        let nc = ConnectOptions::with_token(cfg.api_key.clone())
            .name("realtime-manager")
            .connect(cfg.nats_url.as_str())
            .await
            .context("NATS connect")?;
        info!("NATS connected to {}", cfg.nats_url);
        Ok(Self {
            nc,
            cfg,
            msgs_in: Arc::new(AtomicU64::new(0)),
            msgs_out: Arc::new(AtomicU64::new(0)),
        })
    }

    #[inline]
    pub fn subject_for(&self, ev: &ChangeEvent) -> String {
        self.cfg.table_subject(&ev.schema, &ev.table)
    }

    /// Publish one change on its table subject
    pub async fn publish(&self, ev: &ChangeEvent) -> Result<()> {
        let bytes: Bytes = serde_json::to_vec(ev)?.into();
        self.nc.publish(self.subject_for(ev), bytes).await?;
        self.msgs_out.fetch_add(1, Relaxed);
        Ok(())
    }

    /// Publish and flush once (reduces syscalls)
    pub async fn publish_batch(&self, events: &[ChangeEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        for ev in events {
            let bytes: Bytes = serde_json::to_vec(ev)?.into();
            self.nc.publish(self.subject_for(ev), bytes).await?;
        }
        self.msgs_out.fetch_add(events.len() as u64, Relaxed);
        self.nc.flush().await?;
        Ok(())
    }

    /// Get stats: (messages_in, messages_out)
    #[inline]
    pub fn stats(&self) -> (u64, u64) {
        (self.msgs_in.load(Relaxed), self.msgs_out.load(Relaxed))
    }
}

struct NatsHandle {
    task: AbortHandle,
}

impl ChannelHandle for NatsHandle {
    // Dropping the subscriber inside the task sends UNSUB
    fn unsubscribe(&self) {
        self.task.abort();
    }
}

impl ChannelFactory for NatsTransport {
    fn open(&self, topic: &str, spec: &ChannelSpec) -> RealtimeResult<Channel> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subject = self.cfg.table_subject(&spec.schema, &spec.table);
        debug!("nats open {} -> {}", topic, subject);
        let task = tokio::spawn(listen(
            self.nc.clone(),
            subject,
            spec.clone(),
            tx,
            self.cfg.subscribe_timeout(),
            self.msgs_in.clone(),
        ));
        Ok(Channel {
            handle: Box::new(NatsHandle {
                task: task.abort_handle(),
            }),
            rx,
        })
    }

    fn name(&self) -> &'static str {
        "nats"
    }
}

async fn listen(
    nc: Client,
    subject: String,
    spec: ChannelSpec,
    tx: ChannelSender,
    handshake_timeout: Duration,
    msgs_in: Arc<AtomicU64>,
) {
    let handshake = async {
        let sub = nc.subscribe(subject.clone()).await?;
        nc.flush().await?;
        anyhow::Ok(sub)
    };
    let mut sub = match tokio::time::timeout(handshake_timeout, handshake).await {
        Ok(Ok(sub)) => sub,
        Ok(Err(e)) => {
            let _ = tx.send(ChannelMessage::Status(ChannelStatus::ChannelError(
                format!("{e:#}"),
            )));
            return;
        }
        Err(_) => {
            let _ = tx.send(ChannelMessage::Status(ChannelStatus::TimedOut));
            return;
        }
    };
    if tx.send(ChannelMessage::Status(ChannelStatus::Subscribed)).is_err() {
        return;
    }

    while let Some(m) = sub.next().await {
        msgs_in.fetch_add(1, Relaxed);
        match decode_change(&m.payload) {
            Ok(ev) if spec.accepts(&ev) => {
                if tx.send(ChannelMessage::Change(ev)).is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Bad change payload on {}: {}", subject, e),
        }
    }
    let _ = tx.send(ChannelMessage::Status(ChannelStatus::Closed));
}

#[inline]
pub fn decode_change(payload: &[u8]) -> serde_json::Result<ChangeEvent> {
    serde_json::from_slice(payload)
}
