//! Error types for the Rank Matcher client.
//!
//! Decoding failures are frame-local and live in [`DecodeError`]: the
//! offending frame is dropped but the connection stays up. Everything that
//! concerns the connection or the session itself is a [`RankMatcherError`].

use thiserror::Error;

/// Reasons a single inbound frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Expected a base-10 number but found no digits (or an overflowing run).
    #[error("malformed number at character {position}")]
    MalformedNumber {
        /// Character offset into the frame where the number should start.
        position: usize,
    },

    /// A string field declared more characters than the frame has left.
    #[error("truncated string: declared {declared} characters, {remaining} remaining")]
    TruncatedString {
        /// Length prefix read from the wire.
        declared: u64,
        /// Characters actually left in the frame.
        remaining: usize,
    },

    /// The frame's version prefix is not one this client speaks.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u64),

    /// The frame's type tag does not name any known message.
    #[error("unknown message type {0}")]
    UnknownMessageType(u64),
}

/// Errors that can occur when using the Rank Matcher client.
#[derive(Debug, Error)]
pub enum RankMatcherError {
    /// The transport could not be established (or its handshake did not
    /// finish) within the configured connect timeout.
    #[error("connection attempt timed out")]
    ConnectTimeout,

    /// Failed to send a frame through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed before the operation settled.
    #[error("transport connection closed")]
    TransportClosed,

    /// The server URL could not be used to open a connection.
    #[error("invalid server url {url}: {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// `connect` was called while a connection is already being set up or live.
    #[error("session is already connected or connecting")]
    AlreadyConnected,

    /// The session was shut down; no further operations are accepted.
    #[error("session closed")]
    SessionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RankMatcherError {
    /// Returns `true` for connection-level failures the caller may retry.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout
                | Self::TransportSend(_)
                | Self::TransportReceive(_)
                | Self::TransportClosed
                | Self::Io(_)
        )
    }
}

/// A specialized [`Result`] type for Rank Matcher client operations.
pub type Result<T> = std::result::Result<T, RankMatcherError>;
