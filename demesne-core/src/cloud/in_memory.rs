//! An in-memory implementation of [`Cloud`].
//!
//! Useful for testing and single-process deployments: it provides real
//! asynchronous mailboxes and a real presence feed without a broker. Every
//! delivery is encoded and decoded through the configured
//! [`Codec`](crate::codec::Codec), so serialization faults surface here
//! exactly as they would on a networked transport.
//!
//! The cloud is cheaply cloneable; clones share the same mailboxes and
//! roster.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{Cloud, PeerId, Presence};
use crate::{codec::Codec, packet::Envelope};

const PRESENCE_FEED_DEPTH: usize = 256;

#[derive(Clone)]
pub struct InMemoryCloud {
    /// Per-peer mailboxes, indexed by address.
    mailboxes: Arc<DashMap<PeerId, mpsc::UnboundedSender<Envelope>>>,
    /// Latest announcement per peer.
    roster: Arc<DashMap<PeerId, Presence>>,
    presence_tx: broadcast::Sender<Presence>,
    codec: Codec,
}

impl InMemoryCloud {
    pub fn new(codec: Codec) -> Self {
        let (presence_tx, _) = broadcast::channel(PRESENCE_FEED_DEPTH);
        Self {
            mailboxes: Default::default(),
            roster: Default::default(),
            presence_tx,
            codec,
        }
    }
}

impl Default for InMemoryCloud {
    fn default() -> Self {
        Self::new(Codec::default())
    }
}

#[async_trait]
impl Cloud for InMemoryCloud {
    async fn deliver(&self, to: &PeerId, envelope: Envelope) -> Result<()> {
        // Round-trip through the codec so in-memory behavior matches a real
        // wire, including any serialization failure.
        let bytes = self.codec.to_bytes(&envelope)?;
        let envelope: Envelope = self.codec.from_bytes(&bytes)?;

        let mailbox = self
            .mailboxes
            .get(to)
            .with_context(|| format!("no such peer: {to}"))?;
        mailbox
            .send(envelope)
            .map_err(|_| anyhow!("mailbox closed: {to}"))
    }

    async fn bind(&self, peer: &PeerId) -> Result<mpsc::UnboundedReceiver<Envelope>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.mailboxes.insert(peer.clone(), tx).is_some() {
            debug!(%peer, "rebinding an already-bound mailbox");
        }
        Ok(rx)
    }

    async fn unbind(&self, peer: &PeerId) {
        self.mailboxes.remove(peer);
        self.roster.remove(peer);
    }

    fn announce(&self, presence: Presence) {
        self.roster.insert(presence.peer.clone(), presence.clone());
        // A send error only means nobody is subscribed yet; the roster
        // snapshot covers late subscribers.
        let _ = self.presence_tx.send(presence);
    }

    fn presences(&self) -> broadcast::Receiver<Presence> {
        self.presence_tx.subscribe()
    }

    fn roster(&self) -> Vec<Presence> {
        self.roster.iter().map(|entry| entry.value().clone()).collect()
    }
}
