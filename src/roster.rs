//! Roster manager: the authoritative local mapping of peer identity to
//! negotiated connection and user metadata. All mutations run on the session
//! event loop, so the roster itself needs no locking.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Result;
use crate::signaling::{PeerIdentity, SignalBlob, UserProfile};

/// One negotiated (or negotiating) connection to a remote peer.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Feed a counterpart payload into the negotiation. Errors after the link
    /// was intentionally closed are swallowed by the implementation.
    async fn apply_remote(&self, signal: SignalBlob) -> Result<()>;

    /// Observes `true` once remote media is flowing.
    fn remote_ready(&self) -> watch::Receiver<bool>;

    async fn close(&self);
}

/// A freshly created link plus the locally produced payload to relay to the
/// counterpart peer.
pub struct LinkHandle {
    pub link: Box<dyn PeerLink>,
    pub signal: SignalBlob,
}

/// Creates per-peer links in either negotiation role. The factory holds the
/// local media stream, shared read-only by every link it creates, and
/// releases it exactly once in `release`.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    /// Offer role: for a peer already known from a roster snapshot.
    async fn initiate(&self) -> Result<LinkHandle>;

    /// Answer role: consumes the counterpart's payload immediately.
    async fn respond(&self, remote: SignalBlob) -> Result<LinkHandle>;

    /// Releases the local media stream.
    async fn release(&self);
}

/// A payload to relay to one specific peer, never broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSignal {
    pub to: PeerIdentity,
    pub signal: SignalBlob,
}

/// Read-only projection of one roster entry.
#[derive(Debug, Clone)]
pub struct PeerView {
    pub identity: PeerIdentity,
    pub profile: UserProfile,
    pub remote_ready: watch::Receiver<bool>,
}

/// Immutable projection of the roster, in join order. Produced on every
/// mutation; consumers replace their previous copy rather than mutate it.
#[derive(Debug, Clone, Default)]
pub struct RosterSnapshot {
    peers: Vec<PeerView>,
}

impl RosterSnapshot {
    pub fn peers(&self) -> &[PeerView] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn identities(&self) -> Vec<PeerIdentity> {
        self.peers.iter().map(|p| p.identity.clone()).collect()
    }
}

struct PeerEntry {
    identity: PeerIdentity,
    profile: UserProfile,
    link: Box<dyn PeerLink>,
}

pub struct Roster {
    entries: Vec<PeerEntry>,
    factory: Arc<dyn LinkFactory>,
}

impl Roster {
    pub fn new(factory: Arc<dyn LinkFactory>) -> Self {
        Self {
            entries: Vec::new(),
            factory,
        }
    }

    pub fn snapshot(&self) -> RosterSnapshot {
        RosterSnapshot {
            peers: self
                .entries
                .iter()
                .map(|e| PeerView {
                    identity: e.identity.clone(),
                    profile: e.profile.clone(),
                    remote_ready: e.link.remote_ready(),
                })
                .collect(),
        }
    }

    /// Full reset from a relay snapshot: every existing link is destroyed and
    /// one offer-role link is created per listed peer. Used on initial join
    /// and after a transport reconnect; stale entries are never merged.
    ///
    /// A peer whose negotiation fails is skipped; the rest of the mesh is
    /// unaffected.
    pub async fn apply_snapshot(
        &mut self,
        peers: Vec<(PeerIdentity, UserProfile)>,
    ) -> (RosterSnapshot, Vec<OutboundSignal>) {
        for entry in self.entries.drain(..) {
            entry.link.close().await;
        }

        let mut outbound = Vec::with_capacity(peers.len());
        for (identity, profile) in peers {
            match self.factory.initiate().await {
                Ok(handle) => {
                    outbound.push(OutboundSignal {
                        to: identity.clone(),
                        signal: handle.signal,
                    });
                    self.entries.push(PeerEntry {
                        identity,
                        profile,
                        link: handle.link,
                    });
                }
                Err(e) => warn!(peer = %identity, error = %e, "skipping peer, offer failed"),
            }
        }
        (self.snapshot(), outbound)
    }

    /// Admits a newly joined peer in the answer role. Idempotent by identity:
    /// a duplicate join observed during a signaling race is a no-op and emits
    /// nothing.
    pub async fn admit_peer(
        &mut self,
        identity: PeerIdentity,
        profile: UserProfile,
        signal: SignalBlob,
    ) -> (RosterSnapshot, Option<OutboundSignal>) {
        if self.entries.iter().any(|e| e.identity == identity) {
            debug!(peer = %identity, "duplicate join ignored");
            return (self.snapshot(), None);
        }

        match self.factory.respond(signal).await {
            Ok(handle) => {
                let outbound = OutboundSignal {
                    to: identity.clone(),
                    signal: handle.signal,
                };
                self.entries.push(PeerEntry {
                    identity,
                    profile,
                    link: handle.link,
                });
                (self.snapshot(), Some(outbound))
            }
            Err(e) => {
                warn!(peer = %identity, error = %e, "dropping peer, answer failed");
                (self.snapshot(), None)
            }
        }
    }

    /// Forwards a counterpart's return payload into the matching link. A
    /// no-op for unknown identities: the peer may have left, or the session
    /// may have been torn down, before the payload arrived.
    pub async fn apply_returned_signal(&mut self, identity: &PeerIdentity, signal: SignalBlob) {
        let Some(pos) = self.entries.iter().position(|e| &e.identity == identity) else {
            debug!(peer = %identity, "returned signal for unknown peer discarded");
            return;
        };
        if let Err(e) = self.entries[pos].link.apply_remote(signal).await {
            warn!(peer = %identity, error = %e, "dropping peer, negotiation failed");
            let entry = self.entries.remove(pos);
            entry.link.close().await;
        }
    }

    /// Releases the peer's link and removes its entry. Idempotent.
    pub async fn remove_peer(&mut self, identity: &PeerIdentity) -> RosterSnapshot {
        if let Some(pos) = self.entries.iter().position(|e| &e.identity == identity) {
            let entry = self.entries.remove(pos);
            entry.link.close().await;
        }
        self.snapshot()
    }

    /// Releases every link and the local media stream.
    pub async fn teardown(&mut self) {
        for entry in self.entries.drain(..) {
            entry.link.close().await;
        }
        self.factory.release().await;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
