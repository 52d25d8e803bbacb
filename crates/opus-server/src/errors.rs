//! Gateway error types.

use thiserror::Error;

/// Errors surfaced by the gateway's public entry points.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The hub's event loop has stopped; no further requests are processed.
    #[error("hub is not running")]
    HubClosed,
    /// Binding the listen socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The HTTP server loop failed.
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Errors converting between [`Frame`](crate::websocket::frame::Frame) and
/// its JSON wire form.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Inbound text was not a valid frame object.
    #[error("malformed frame: {0}")]
    Decode(#[source] serde_json::Error),
    /// A frame failed to serialize.
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Why a frame could not be placed on an outbound queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The queue is at capacity; the frame was dropped.
    #[error("outbound queue full")]
    Full,
    /// The session has been torn down.
    #[error("outbound queue closed")]
    Closed,
}
