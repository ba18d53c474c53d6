//! Peer-mesh coordinator for full-mesh voice rooms.
//!
//! Joins a room through a WebSocket signaling relay, negotiates one direct
//! audio connection per remote participant, and keeps a local roster
//! consistent as participants come and go. The embedding application drives
//! a [`SessionController`] and renders the [`RosterSnapshot`]s it emits;
//! negotiation payloads are relayed opaquely and never interpreted here.

pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod roster;
pub mod session;
pub mod signaling;

pub use config::MeshConfig;
pub use connection::WebRtcMedia;
pub use error::MeshError;
pub use roster::{
    LinkFactory, LinkHandle, OutboundSignal, PeerLink, PeerView, Roster, RosterSnapshot,
};
pub use session::{MediaSource, SessionController, SessionEvent, SessionState};
pub use signaling::{
    ClientEvent, PeerIdentity, ServerEvent, SignalBlob, SignalChannel, SignalingClient, UserProfile,
};
