//! Error types for the stream transport.

use std::io;

use thiserror::Error;

/// Errors surfaced by [`StreamConnection`](super::StreamConnection).
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket I/O failed.
    #[error("{operation} failed: {source}")]
    Io {
        /// What was being attempted.
        operation: &'static str,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// A message could not be serialised.
    #[error("failed to encode message: {source}")]
    Encode {
        /// Serialiser failure.
        #[source]
        source: serde_json::Error,
    },
    /// A received frame was not a valid message.
    #[error("failed to decode frame: {source}")]
    Decode {
        /// Parser failure.
        #[source]
        source: serde_json::Error,
    },
    /// A received frame exceeded the size limit.
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge {
        /// Maximum accepted frame length.
        limit: usize,
    },
    /// The connection is closed.
    #[error("connection is closed")]
    Disconnected,
    /// Outgoing data could not be written before the deadline.
    #[error("timed out flushing {pending} queued bytes")]
    FlushTimeout {
        /// Bytes still queued.
        pending: usize,
    },
    /// A blocking call received no reply in time.
    #[error("no reply to call {serial}")]
    ReplyTimeout {
        /// Serial of the unanswered call.
        serial: u32,
    },
    /// The endpoint names a transport this platform cannot open.
    #[error("unsupported transport for endpoint {endpoint}")]
    UnsupportedTransport {
        /// Rendered endpoint.
        endpoint: String,
    },
}

impl TransportError {
    pub(crate) const fn io(operation: &'static str, source: io::Error) -> Self {
        Self::Io { operation, source }
    }
}
