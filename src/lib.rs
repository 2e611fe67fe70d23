//! # Rank Matcher Client
//!
//! Transport-agnostic Rust client for the Rank Matcher matchmaking protocol.
//!
//! Game servers use the matcher to pool players into arenas and get notified
//! when a match forms. This crate speaks the matcher's comma-delimited text
//! protocol over any bidirectional frame transport.
//!
//! ## Layers
//!
//! - [`codec`] — field-level encoding: length-prefixed escaped strings and
//!   decimal numbers
//! - [`protocol`] — the closed [`Message`] union and per-variant field layouts
//! - [`frame`] — the `<version>,<tag>,<payload>` envelope
//! - [`dispatch`] — routing decoded messages to handlers
//! - [`session`] — handshake gating and the ordered pending queue
//! - [`client`] — the high-level [`RankMatcherClient`]
//!
//! ## Features
//!
//! - **Transport-agnostic** — implement [`Transport`] and [`Connector`] for any backend
//! - **WebSocket built-in** — default `transport-websocket` feature provides
//!   [`WebSocketConnector`]
//! - **Ordered queueing** — commands issued before the handshake are flushed
//!   in order ahead of later commands
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), rank_matcher_client::RankMatcherError> {
//! use rank_matcher_client::{AddPlayerParams, RankMatcherClient, RankMatcherConfig};
//!
//! let client = RankMatcherClient::new(RankMatcherConfig::new("ws://127.0.0.1:12310"));
//! client.on_match_success(|m| println!("{} matched: {:?}", m.arena, m.players));
//!
//! client.add_arena("lobby1", 2);
//! client.connect_websocket().await?;
//! client.add_player(AddPlayerParams::new("lobby1", "alice", 1500)).await?;
//! client.add_player(AddPlayerParams::new("lobby1", "bob", 1510)).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod dispatch;
pub mod error;
pub mod error_codes;
pub mod frame;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use client::{AddPlayerParams, RankMatcherClient, RankMatcherConfig};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use error::{DecodeError, RankMatcherError};
pub use error_codes::MatchFailureCode;
pub use frame::PROTOCOL_VERSION;
pub use protocol::{Message, MessageType};
pub use session::{Delivery, SendHandle, SessionState};
pub use transport::{Connector, Transport};

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
