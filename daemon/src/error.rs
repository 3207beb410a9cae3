//! Error taxonomy. Only device and transport failures propagate (the
//! orchestrator alone decides retry and backoff); protocol violations
//! and degraded audio enhancements are logged where they happen and
//! the session carries on.

use std::time::Duration;
use thiserror::Error;

/// Capture/playback device failures. Fatal to the current session; the
/// orchestrator retries on the next connection cycle, never in place.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("audio device unavailable: {0}")]
    Unavailable(String),

    #[error("audio device read failed: {0}")]
    ReadError(String),
}

/// Connection-level failures. Any of these forces the session to
/// `Disconnected` and hands control back to the orchestrator's
/// backoff-and-retry loop.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Opening the WebSocket failed; [`TransportError::WebSocket`]
    /// covers failures on an established connection.
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("connection closed")]
    Closed,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Error, Debug)]
pub enum SatelliteError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
