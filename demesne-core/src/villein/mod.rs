//! The villein: the orchestrating client session.
//!
//! A [`Villein`] owns a peer identity on the cloud, a correlation router,
//! and nothing else — it caches no job or binding data beyond what remotes
//! explicitly return. Remote farms and VMs are reached through
//! [`FarmProxy`]/[`VmProxy`] handles, whose request methods all follow the
//! same shape: register a pending slot under a fresh correlation id, send,
//! and resolve when the matching response arrives or the caller's deadline
//! elapses.
//!
//! The roster of known peers is session-scoped: it is read from the cloud
//! this villein connected to, never from process-wide state.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    cloud::{Cloud, PeerId, PeerKind, Presence},
    error::Fault,
    packet::{CorrelationId, Envelope, Payload, Request, Response},
};

pub mod patterns;
pub mod proxy;

pub use proxy::{FarmProxy, JobStruct, VmProxy};

type PendingTable = Arc<DashMap<CorrelationId, oneshot::Sender<Response>>>;

/// An orchestrating client session. Cheaply cloneable; clones share the
/// same identity and correlation table.
#[derive(Clone)]
pub struct Villein {
    inner: Arc<VilleinInner>,
}

struct VilleinInner {
    id: PeerId,
    cloud: Arc<dyn Cloud>,
    /// In-flight correlation id → pending-result slot.
    pending: PendingTable,
    next_correlation: AtomicU64,
    router: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Villein {
    /// Join the cloud under a fresh identity and start routing responses.
    pub async fn connect(cloud: Arc<dyn Cloud>) -> Result<Self> {
        let id = PeerId::fresh("villein");
        let inbox = cloud.bind(&id).await?;

        let pending: PendingTable = Default::default();
        let handle = tokio::spawn(Self::route(pending.clone(), inbox));

        let villein = Self {
            inner: Arc::new(VilleinInner {
                id,
                cloud,
                pending,
                next_correlation: AtomicU64::new(0),
                router: std::sync::Mutex::new(Some(handle)),
            }),
        };
        Ok(villein)
    }

    pub fn id(&self) -> &PeerId {
        &self.inner.id
    }

    /// Snapshot of the latest presence per known peer.
    pub fn roster(&self) -> Vec<Presence> {
        self.inner.cloud.roster()
    }

    /// Subscribe to the live presence feed.
    pub fn presences(&self) -> broadcast::Receiver<Presence> {
        self.inner.cloud.presences()
    }

    /// A handle on a remote farm, seeded with its last announcement.
    pub fn farm_proxy(&self, presence: Presence) -> FarmProxy {
        FarmProxy::new(self.clone(), presence)
    }

    /// Proxies for every farm currently in the roster.
    pub fn known_farms(&self) -> Vec<FarmProxy> {
        self.roster()
            .into_iter()
            .filter(|presence| presence.kind == PeerKind::Farm)
            .map(|presence| self.farm_proxy(presence))
            .collect()
    }

    /// Resolve inbound responses against the pending table. A slot
    /// completes exactly once; responses for an already-completed or
    /// removed slot are discarded.
    async fn route(pending: PendingTable, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = inbox.recv().await {
            let Payload::Response(response) = envelope.payload else {
                debug!(from = %envelope.from, "discarding non-response packet");
                continue;
            };
            match pending.remove(&envelope.correlation) {
                Some((_, slot)) => {
                    // A closed receiver means the caller already timed out.
                    if slot.send(response).is_err() {
                        debug!(
                            correlation = ?envelope.correlation,
                            "response arrived after the caller's deadline"
                        );
                    }
                }
                None => debug!(
                    correlation = ?envelope.correlation,
                    "discarding late or duplicate response"
                ),
            }
        }
    }

    fn fresh_correlation(&self) -> CorrelationId {
        CorrelationId(self.inner.next_correlation.fetch_add(1, Ordering::Relaxed))
    }

    /// Single-shot request/response with a caller-supplied deadline.
    ///
    /// The pending slot is registered before the send, so a fast response
    /// can never race past its own slot. On deadline expiry the slot is
    /// removed and the request resolves to [`Fault::Timeout`]; no retry is
    /// ever attempted.
    pub(crate) async fn request(
        &self,
        to: &PeerId,
        request: Request,
        deadline: Duration,
    ) -> Result<Response, Fault> {
        let correlation = self.fresh_correlation();
        let (slot, resolved) = oneshot::channel();
        self.inner.pending.insert(correlation, slot);

        let envelope = Envelope {
            from: self.inner.id.clone(),
            correlation,
            payload: Payload::Request(request),
        };
        if let Err(e) = self.inner.cloud.deliver(to, envelope).await {
            self.inner.pending.remove(&correlation);
            warn!(%to, "delivery failed: {e}");
            return Err(Fault::FarmNotFound);
        }

        match tokio::time::timeout(deadline, resolved).await {
            Ok(Ok(response)) => Ok(response),
            // The router dropped the slot without sending; treat it like a
            // deadline, the remote is not answering on this session.
            Ok(Err(_)) => Err(Fault::Timeout),
            Err(_) => {
                self.inner.pending.remove(&correlation);
                Err(Fault::Timeout)
            }
        }
    }

    /// Fire-and-forget: send without registering a pending slot. Whatever
    /// response comes back is discarded by the router as unmatched.
    pub(crate) async fn fire(&self, to: &PeerId, request: Request) {
        let envelope = Envelope {
            from: self.inner.id.clone(),
            correlation: self.fresh_correlation(),
            payload: Payload::Request(request),
        };
        if let Err(e) = self.inner.cloud.deliver(to, envelope).await {
            debug!(%to, "fire-and-forget delivery failed: {e}");
        }
    }
}

impl Drop for VilleinInner {
    fn drop(&mut self) {
        if let Ok(mut router) = self.router.lock() {
            if let Some(handle) = router.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::InMemoryCloud;

    #[tokio::test]
    async fn request_times_out_against_a_silent_peer() {
        let cloud = Arc::new(InMemoryCloud::default());
        let villein = Villein::connect(cloud.clone()).await.unwrap();

        // Bound but never answering.
        let silent = PeerId::fresh("farm");
        let _inbox = cloud.bind(&silent).await.unwrap();

        let outcome = villein
            .request(
                &silent,
                Request::SpawnVm {
                    language: "calc".into(),
                },
                Duration::from_millis(50),
            )
            .await;
        assert_eq!(outcome.unwrap_err(), Fault::Timeout);
        // The slot was cleaned up.
        assert!(villein.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn delivery_failure_is_a_first_class_outcome() {
        let cloud = Arc::new(InMemoryCloud::default());
        let villein = Villein::connect(cloud).await.unwrap();

        let outcome = villein
            .request(
                &PeerId::new("farm/long-gone"),
                Request::SpawnVm {
                    language: "calc".into(),
                },
                Duration::from_millis(50),
            )
            .await;
        assert_eq!(outcome.unwrap_err(), Fault::FarmNotFound);
        assert!(villein.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn late_and_duplicate_responses_are_discarded() {
        let cloud = Arc::new(InMemoryCloud::default());
        let villein = Villein::connect(cloud.clone()).await.unwrap();

        // Two responses for a correlation id nobody is waiting on must be
        // swallowed by the router without disturbing the session.
        for _ in 0..2 {
            cloud
                .deliver(
                    villein.id(),
                    Envelope {
                        from: PeerId::fresh("farm"),
                        correlation: CorrelationId(999),
                        payload: Payload::Response(Response::Ack),
                    },
                )
                .await
                .unwrap();
        }

        // The session still works afterwards.
        tokio::task::yield_now().await;
        assert!(villein.inner.pending.is_empty());
    }
}
