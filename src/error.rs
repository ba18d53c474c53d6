use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    /// Local capture could not be acquired. Aborts the session before it joins.
    #[error("local media setup failed: {0}")]
    MediaSetup(String),

    /// The signaling channel is unreachable or was lost past recovery.
    #[error("signaling channel: {0}")]
    Signaling(String),

    /// One peer's negotiation failed. The entry is dropped, the rest of the
    /// mesh is unaffected.
    #[error("peer negotiation: {0}")]
    Negotiation(String),

    /// Operation on a controller that already reached its terminal state.
    #[error("session already closed")]
    SessionClosed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MeshError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MeshError::MediaSetup(_) | MeshError::Signaling(_) | MeshError::SessionClosed
        )
    }
}

impl From<webrtc::Error> for MeshError {
    fn from(err: webrtc::Error) -> Self {
        MeshError::Negotiation(err.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Negotiation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
