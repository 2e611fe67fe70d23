//! Transport abstraction for the Rank Matcher protocol.
//!
//! The [`Transport`] trait defines a bidirectional text frame channel between
//! the client and the matcher. One protocol message travels in exactly one
//! frame, so implementations must preserve frame boundaries (WebSocket text
//! frames, length-prefixed TCP, in-process channels, ...).
//!
//! # Connection Setup
//!
//! Opening a connection happens in two steps, mirroring TCP connect followed
//! by a WebSocket upgrade:
//!
//! 1. [`Connector::connect`] produces a transport whose underlying link is up
//!    but whose protocol handshake has not run yet. The session is
//!    `Connecting` from here on and queues outgoing commands.
//! 2. [`Transport::handshake`] completes session establishment. Once it
//!    returns, queued commands are flushed in order.
//!
//! Transports that have no separate handshake step keep the default
//! [`handshake`](Transport::handshake), which succeeds immediately.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use rank_matcher_client::error::RankMatcherError;
//! use rank_matcher_client::transport::Transport;
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, frame: String) -> Result<(), RankMatcherError> {
//!         // Write one text frame
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, RankMatcherError>> {
//!         // Read the next text frame; None once the peer closed cleanly
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), RankMatcherError> {
//!         todo!()
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::RankMatcherError;

/// A bidirectional text frame transport.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe because the client's
/// transport loop polls it inside `tokio::select!`. Dropping an unfinished
/// `recv` future must not lose a frame.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Complete the session-establishment handshake.
    ///
    /// Called exactly once, after [`Connector::connect`] and before any
    /// [`send`](Transport::send) or [`recv`](Transport::recv).
    ///
    /// # Errors
    ///
    /// Any transport error that prevents the session from being established.
    async fn handshake(&mut self) -> Result<(), RankMatcherError> {
        Ok(())
    }

    /// Send one text frame.
    ///
    /// Resolves once the transport has accepted the write.
    ///
    /// # Errors
    ///
    /// Returns [`RankMatcherError::TransportSend`] if the frame could not be
    /// written, or [`RankMatcherError::TransportClosed`] after
    /// [`close`](Transport::close).
    async fn send(&mut self, frame: String) -> Result<(), RankMatcherError>;

    /// Receive the next text frame.
    ///
    /// Returns:
    /// - `Some(Ok(text))` — a complete frame was received
    /// - `Some(Err(e))` — a transport error occurred
    /// - `None` — the peer closed the connection cleanly
    async fn recv(&mut self) -> Option<Result<String, RankMatcherError>>;

    /// Close the connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful close fails. Implementations should
    /// still release their resources in that case.
    async fn close(&mut self) -> Result<(), RankMatcherError>;
}

/// Opens new transports, one per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// The transport this connector produces.
    type Transport: Transport;

    /// Establish the underlying link (e.g. the TCP connection).
    ///
    /// The client bounds this call with its connect timeout.
    ///
    /// # Errors
    ///
    /// Any error that prevents the link from being established.
    async fn connect(&self) -> Result<Self::Transport, RankMatcherError>;
}
