//! The messaging transport boundary.
//!
//! The transport is an external collaborator: it owns addressing, delivery
//! and presence. This module pins down exactly the interface the core needs
//! — point-to-point envelope delivery, a per-peer inbound mailbox, and a
//! presence feed of known/available peers — and nothing more.
//!
//! An in-memory implementation is provided in [`in_memory`] for tests and
//! single-process deployments. It emulates a real wire by round-tripping
//! every envelope through the configured [`Codec`](crate::codec::Codec).
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::packet::Envelope;

/// A peer's address on the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Mint a fresh address with the given role prefix.
    pub fn fresh(prefix: &str) -> Self {
        Self(crate::fresh_token(prefix, 10))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role a peer plays on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerKind {
    Farm,
    Villein,
}

/// One availability announcement on the presence feed.
///
/// Farms re-announce whenever their availability changes (a VM is spawned
/// or terminated). The latest announcement per peer is also retained in the
/// roster so late subscribers can seed from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub peer: PeerId,
    pub kind: PeerKind,
    /// Whether the peer is accepting new work.
    pub available: bool,
    /// Remaining VM slots, for farms.
    pub free_slots: usize,
}

/// Generic behavior of a federated, presence-aware messaging transport.
///
/// Implementations must deliver each envelope to exactly one mailbox (the
/// addressee's) and must treat delivery to an unknown peer as an error —
/// callers handle "peer gone" as a first-class outcome.
#[async_trait]
pub trait Cloud: Send + Sync {
    /// Deliver an envelope to the peer's mailbox.
    async fn deliver(&self, to: &PeerId, envelope: Envelope) -> Result<()>;

    /// Claim the inbound mailbox for a peer. One binding per peer.
    async fn bind(&self, peer: &PeerId) -> Result<mpsc::UnboundedReceiver<Envelope>>;

    /// Remove a peer's mailbox and roster entry.
    async fn unbind(&self, peer: &PeerId);

    /// Publish an availability announcement.
    fn announce(&self, presence: Presence);

    /// Subscribe to the live presence feed.
    fn presences(&self) -> broadcast::Receiver<Presence>;

    /// Snapshot of the latest announcement per known peer.
    fn roster(&self) -> Vec<Presence>;
}

pub mod in_memory;

pub use in_memory::InMemoryCloud;
