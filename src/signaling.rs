//! Signaling channel: wire event types and the WebSocket client that relays
//! membership and negotiation events for one room session.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::{MeshError, Result};

/// Transport-assigned identifier for one connected socket. Unique within a
/// room session, reassigned on reconnect, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable application identity, supplied by the embedding application and
/// carried alongside (but independent of) the transport identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub profile_image: Option<String>,
}

/// Opaque connection-negotiation payload. Relayed verbatim between peers;
/// only the negotiator that produced or consumes it looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalBlob(serde_json::Value);

impl SignalBlob {
    pub fn from_value(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterPeer {
    pub peer_identity: PeerIdentity,
    pub user_profile: UserProfile,
}

/// Events the client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        user_profile: UserProfile,
    },
    #[serde(rename_all = "camelCase")]
    SendingSignal {
        user_to_signal: PeerIdentity,
        #[serde(rename = "callerID")]
        caller_id: PeerIdentity,
        signal: SignalBlob,
    },
    ReturningSignal {
        signal: SignalBlob,
        #[serde(rename = "callerID")]
        caller_id: PeerIdentity,
    },
    SendMessage(serde_json::Value),
    ReactMessage(serde_json::Value),
    HypeRoom(String),
}

/// Events the relay sends to the client. `Session` is the transport handshake
/// that assigns the local identity; it is consumed inside the channel and
/// never reaches the session layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Session(PeerIdentity),
    AllUsers(Vec<RosterPeer>),
    #[serde(rename_all = "camelCase")]
    UserJoined {
        signal: SignalBlob,
        #[serde(rename = "callerID")]
        caller_id: PeerIdentity,
        caller_user: UserProfile,
    },
    ReceivingReturnedSignal {
        id: PeerIdentity,
        signal: SignalBlob,
    },
    UserLeft(PeerIdentity),
    NewMessage(serde_json::Value),
    ReactMessage(serde_json::Value),
    HypeRoom,
}

/// Bidirectional event transport to the signaling relay.
///
/// Delivery order follows server-send order per connection. After
/// `reconnect`, the caller must re-issue `join_room`; the fresh roster
/// snapshot replaces local state, it is never merged.
#[async_trait]
pub trait SignalChannel: Send {
    /// Identity the relay assigned to this socket, once known.
    fn local_identity(&self) -> Option<PeerIdentity>;

    async fn join_room(&mut self, room_id: &str, profile: &UserProfile) -> Result<()>;

    async fn emit(&mut self, event: ClientEvent) -> Result<()>;

    /// Next server event, or `None` once the transport is gone.
    async fn next_event(&mut self) -> Option<ServerEvent>;

    async fn reconnect(&mut self) -> Result<()>;

    async fn disconnect(&mut self);
}

/// WebSocket-backed signaling client. The socket is split into reader and
/// writer pump tasks bridged by channels, so callers only ever touch plain
/// `ClientEvent`/`ServerEvent` values.
pub struct SignalingClient {
    url: String,
    outgoing: mpsc::Sender<ClientEvent>,
    incoming: mpsc::Receiver<ServerEvent>,
    identity: Option<PeerIdentity>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (outgoing, incoming) = Self::dial(url).await?;
        Ok(Self {
            url: url.to_string(),
            outgoing,
            incoming,
            identity: None,
        })
    }

    async fn dial(url: &str) -> Result<(mpsc::Sender<ClientEvent>, mpsc::Receiver<ServerEvent>)> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| MeshError::Signaling(format!("relay unreachable: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        let (incoming_tx, incoming_rx) = mpsc::channel(100);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ClientEvent>(100);

        tokio::spawn(async move {
            while let Some(event) = outgoing_rx.recv().await {
                let Ok(json) = serde_json::to_string(&event) else {
                    continue;
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            // Sender gone: the session is over. Close the socket so the
            // relay observes the departure and broadcasts user-left.
            let _ = write.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(Ok(msg)) = read.next().await {
                let Ok(text) = msg.into_text() else { continue };
                match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => {
                        if incoming_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "discarding unparseable signaling frame"),
                }
            }
        });

        Ok((outgoing_tx, incoming_rx))
    }
}

#[async_trait]
impl SignalChannel for SignalingClient {
    fn local_identity(&self) -> Option<PeerIdentity> {
        self.identity.clone()
    }

    async fn join_room(&mut self, room_id: &str, profile: &UserProfile) -> Result<()> {
        self.emit(ClientEvent::JoinRoom {
            room_id: room_id.to_string(),
            user_profile: profile.clone(),
        })
        .await
    }

    async fn emit(&mut self, event: ClientEvent) -> Result<()> {
        self.outgoing
            .send(event)
            .await
            .map_err(|_| MeshError::Signaling("connection closed".to_string()))
    }

    async fn next_event(&mut self) -> Option<ServerEvent> {
        loop {
            match self.incoming.recv().await? {
                ServerEvent::Session(id) => {
                    debug!(identity = %id, "relay assigned local identity");
                    self.identity = Some(id);
                }
                event => return Some(event),
            }
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        let (outgoing, incoming) = Self::dial(&self.url).await?;
        self.outgoing = outgoing;
        self.incoming = incoming;
        // A fresh socket means a fresh identity from the relay.
        self.identity = None;
        Ok(())
    }

    async fn disconnect(&mut self) {
        // Dropping the sender makes the writer task close the socket;
        // closing the receiver ends the reader task once the stream dies.
        let (tx, _rx) = mpsc::channel(1);
        drop(std::mem::replace(&mut self.outgoing, tx));
        self.incoming.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile() -> UserProfile {
        UserProfile {
            id: "u1".to_string(),
            name: "Ada".to_string(),
            profile_image: None,
        }
    }

    #[test]
    fn join_room_wire_shape() {
        let event = ClientEvent::JoinRoom {
            room_id: "r1".to_string(),
            user_profile: profile(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "join-room");
        assert_eq!(value["data"]["roomId"], "r1");
        assert_eq!(value["data"]["userProfile"]["name"], "Ada");
    }

    #[test]
    fn sending_signal_uses_caller_id_key() {
        let event = ClientEvent::SendingSignal {
            user_to_signal: PeerIdentity::new("p2"),
            caller_id: PeerIdentity::new("p1"),
            signal: SignalBlob::from_value(json!({"type": "offer"})),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "sending-signal");
        assert_eq!(value["data"]["userToSignal"], "p2");
        assert_eq!(value["data"]["callerID"], "p1");
        assert_eq!(value["data"]["signal"]["type"], "offer");
    }

    #[test]
    fn parses_roster_snapshot() {
        let frame = json!({
            "event": "all-users",
            "data": [
                {"peerIdentity": "p2", "userProfile": {"id": "u2", "name": "Bob"}},
                {"peerIdentity": "p3", "userProfile": {"id": "u3", "name": "Eve", "profileImage": "x.png"}},
            ],
        });
        let event: ServerEvent = serde_json::from_value(frame).unwrap();
        let ServerEvent::AllUsers(peers) = event else {
            panic!("expected all-users");
        };
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].peer_identity, PeerIdentity::new("p2"));
        assert_eq!(peers[1].user_profile.profile_image.as_deref(), Some("x.png"));
    }

    #[test]
    fn parses_user_left_and_hype() {
        let left: ServerEvent =
            serde_json::from_value(json!({"event": "user-left", "data": "p9"})).unwrap();
        assert_eq!(left, ServerEvent::UserLeft(PeerIdentity::new("p9")));

        let hype: ServerEvent = serde_json::from_value(json!({"event": "hype-room"})).unwrap();
        assert_eq!(hype, ServerEvent::HypeRoom);
    }

    #[test]
    fn parses_returned_signal() {
        let frame = json!({
            "event": "receiving-returned-signal",
            "data": {"id": "p2", "signal": {"type": "answer", "sdp": "v=0"}},
        });
        let event: ServerEvent = serde_json::from_value(frame).unwrap();
        let ServerEvent::ReceivingReturnedSignal { id, signal } = event else {
            panic!("expected returned signal");
        };
        assert_eq!(id, PeerIdentity::new("p2"));
        assert_eq!(signal.into_value()["type"], "answer");
    }
}
