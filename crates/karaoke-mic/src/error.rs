//! Error types for the mic relay.
//!
//! Only [`MicError::DeviceUnavailable`] is ever surfaced to a user. Everything else is
//! logged at the boundary of the operation that produced it.

/// Failures reported by a peer connection implementation.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    Rtc(#[from] webrtc::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] opus::Error),

    #[error("Invalid session description: {0}")]
    Sdp(String),

    #[error("Peer connection is closed")]
    Closed,
}

/// Failures on the signaling channel.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("Signaling channel closed")]
    Closed,

    #[error("Failed to encode signal: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Errors returned by the mic sender and receiver.
#[derive(Debug, thiserror::Error)]
pub enum MicError {
    /// Capture access denied, or no input device exists.
    #[error("Audio capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Peer connection error: {0}")]
    Peer(#[from] PeerError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalError),
}

/// Audio graph construction errors.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("FFT size must be a power of two between 32 and 32768, got {0}")]
    InvalidFftSize(usize),

    #[error("Convolution block size must be non-zero")]
    InvalidBlockSize,
}
