//! Session controller: orchestrates signaling, negotiation, and the roster
//! for one room. One controller per session; a closed controller is terminal
//! and a new session requires a new instance.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::roster::{LinkFactory, Roster, RosterSnapshot};
use crate::signaling::{ClientEvent, ServerEvent, SignalChannel, UserProfile};

/// Acquires the local media stream. Called exactly once per session; the
/// returned factory owns the stream and releases it on roster teardown.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn LinkFactory>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Joining,
    Active,
    Leaving,
    Closed,
}

/// What the embedding application observes: roster changes and the opaque
/// application-level broadcasts the mesh relays but never interprets.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    RosterChanged(RosterSnapshot),
    Message(serde_json::Value),
    Reaction(serde_json::Value),
    Hype,
}

pub struct SessionController<C: SignalChannel> {
    state: SessionState,
    room_id: String,
    profile: UserProfile,
    config: MeshConfig,
    channel: C,
    media: Arc<dyn MediaSource>,
    roster: Option<Roster>,
    events: mpsc::UnboundedSender<SessionEvent>,
    reconnect_attempts: u32,
}

impl<C: SignalChannel> SessionController<C> {
    pub fn new(
        room_id: impl Into<String>,
        profile: UserProfile,
        config: MeshConfig,
        channel: C,
        media: Arc<dyn MediaSource>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                state: SessionState::Idle,
                room_id: room_id.into(),
                profile,
                config,
                channel,
                media,
                roster: None,
                events,
                reconnect_attempts: 0,
            },
            events_rx,
        )
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn snapshot(&self) -> RosterSnapshot {
        self.roster
            .as_ref()
            .map(Roster::snapshot)
            .unwrap_or_default()
    }

    /// Acquires local media and announces the session to the relay. If media
    /// is denied the controller stays `Idle` and no join is attempted.
    pub async fn join(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(MeshError::SessionClosed);
        }

        let factory = self.media.open().await?;
        self.roster = Some(Roster::new(factory));
        self.state = SessionState::Joining;

        if let Err(e) = self.channel.join_room(&self.room_id, &self.profile).await {
            // Media was already acquired; close out rather than leak it.
            self.leave().await;
            return Err(e);
        }
        Ok(())
    }

    /// Pumps signaling events until the session closes. On transport loss the
    /// channel is redialed and the room rejoined per the configured policy;
    /// the fresh roster snapshot then rebuilds the mesh from scratch.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if matches!(self.state, SessionState::Leaving | SessionState::Closed) {
                return Ok(());
            }
            let step = match self.channel.next_event().await {
                Some(event) => self.handle_event(event).await,
                None => self.recover().await,
            };
            if let Err(e) = step {
                self.leave().await;
                return Err(e);
            }
        }
    }

    pub async fn handle_event(&mut self, event: ServerEvent) -> Result<()> {
        match event {
            ServerEvent::AllUsers(peers) => {
                if !matches!(self.state, SessionState::Joining | SessionState::Active) {
                    debug!(state = ?self.state, "roster snapshot ignored");
                    return Ok(());
                }
                let caller = self
                    .channel
                    .local_identity()
                    .ok_or_else(|| MeshError::Signaling("no local identity".to_string()))?;
                let listed = peers
                    .into_iter()
                    .map(|p| (p.peer_identity, p.user_profile))
                    .collect();
                let roster = self.roster_mut()?;
                let (snapshot, outbound) = roster.apply_snapshot(listed).await;
                for signal in outbound {
                    self.channel
                        .emit(ClientEvent::SendingSignal {
                            user_to_signal: signal.to,
                            caller_id: caller.clone(),
                            signal: signal.signal,
                        })
                        .await?;
                }
                self.state = SessionState::Active;
                self.reconnect_attempts = 0;
                let _ = self.events.send(SessionEvent::RosterChanged(snapshot));
            }
            ServerEvent::UserJoined {
                signal,
                caller_id,
                caller_user,
            } => {
                if self.state != SessionState::Active {
                    debug!(state = ?self.state, peer = %caller_id, "join event ignored");
                    return Ok(());
                }
                let roster = self.roster_mut()?;
                let (snapshot, outbound) = roster.admit_peer(caller_id, caller_user, signal).await;
                if let Some(answer) = outbound {
                    self.channel
                        .emit(ClientEvent::ReturningSignal {
                            signal: answer.signal,
                            caller_id: answer.to,
                        })
                        .await?;
                }
                let _ = self.events.send(SessionEvent::RosterChanged(snapshot));
            }
            ServerEvent::ReceivingReturnedSignal { id, signal } => {
                // After teardown the roster is empty and the payload is
                // silently discarded by the identity check.
                if let Some(roster) = self.roster.as_mut() {
                    roster.apply_returned_signal(&id, signal).await;
                }
            }
            ServerEvent::UserLeft(identity) => {
                if self.state != SessionState::Active {
                    debug!(state = ?self.state, peer = %identity, "leave event ignored");
                    return Ok(());
                }
                let roster = self.roster_mut()?;
                let snapshot = roster.remove_peer(&identity).await;
                let _ = self.events.send(SessionEvent::RosterChanged(snapshot));
            }
            ServerEvent::NewMessage(payload) => {
                let _ = self.events.send(SessionEvent::Message(payload));
            }
            ServerEvent::ReactMessage(payload) => {
                let _ = self.events.send(SessionEvent::Reaction(payload));
            }
            ServerEvent::HypeRoom => {
                let _ = self.events.send(SessionEvent::Hype);
            }
            ServerEvent::Session(_) => {
                // Handshake frames are normally consumed by the channel.
                debug!("stray session frame ignored");
            }
        }
        Ok(())
    }

    /// Forwards an application-level broadcast (chat message, reaction, room
    /// boost) onto the signaling channel. The payload is never interpreted.
    pub async fn broadcast(&mut self, event: ClientEvent) -> Result<()> {
        if !matches!(self.state, SessionState::Joining | SessionState::Active) {
            return Err(MeshError::SessionClosed);
        }
        self.channel.emit(event).await
    }

    /// Tears down the session: every link, the local media stream, and the
    /// channel subscription, on every exit path. Idempotent.
    pub async fn leave(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Leaving;
        if let Some(roster) = self.roster.as_mut() {
            roster.teardown().await;
        }
        self.channel.disconnect().await;
        self.state = SessionState::Closed;
    }

    async fn recover(&mut self) -> Result<()> {
        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            warn!("signaling channel lost, giving up");
            self.leave().await;
            return Err(MeshError::Signaling(
                "max reconnection attempts reached".to_string(),
            ));
        }
        self.reconnect_attempts += 1;
        debug!(attempt = self.reconnect_attempts, "redialing signaling relay");
        sleep(Duration::from_millis(self.config.reconnect_delay_ms)).await;

        match self.channel.reconnect().await {
            Ok(()) => {
                self.channel.join_room(&self.room_id, &self.profile).await?;
                // The relay re-admits us and sends a fresh snapshot; stale
                // entries are rebuilt wholesale when it arrives.
                self.state = SessionState::Joining;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "reconnection attempt failed");
                Ok(())
            }
        }
    }

    fn roster_mut(&mut self) -> Result<&mut Roster> {
        self.roster.as_mut().ok_or(MeshError::SessionClosed)
    }
}
