//! Error types for the peer mesh

use crate::peer::{LinkInput, LinkState};

/// Result type alias using the mesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in mesh operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling relay error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Peer not found
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Invalid data format
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A link state machine rejected an input
    #[error("Invalid transition: {input:?} in state {from:?}")]
    InvalidTransition {
        /// State the link was in
        from: LinkState,
        /// Input that was rejected
        input: LinkInput,
    },

    /// Operation requires a joined session
    #[error("Not joined to a session")]
    NotJoined,

    /// `join` called twice without `leave`
    #[error("Already joined to session {0}")]
    AlreadyJoined(String),

    /// Local media acquisition failed
    #[error(transparent)]
    Media(#[from] MediaError),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Error raised by a host-provided transport or device
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::IceCandidateError(_)
                | Error::WebRtcError(_)
                | Error::Media(MediaError::DeviceBusy)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::IceCandidateError(_)
                | Error::SdpError(_)
                | Error::DataChannelError(_)
                | Error::InvalidTransition { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

/// Local capture device failures, surfaced from `join`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    /// The user or platform refused access to the device
    #[error("Microphone permission denied")]
    PermissionDenied,

    /// No capture device present
    #[error("No microphone found")]
    DeviceMissing,

    /// Device exists but another application holds it
    #[error("Microphone is in use by another application")]
    DeviceBusy,

    /// Any other capture failure
    #[error("Media capture failed: {0}")]
    Capture(String),
}
