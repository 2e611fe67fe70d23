//! # Custom Transport Example
//!
//! Shows how to implement the [`Transport`] and [`Connector`] traits with a
//! simple in-process loopback channel, and drives it with a toy matcher that
//! forms a match as soon as an arena is full. This is useful for:
//!
//! - **Testing** — unit-test your matchmaking flow without a real server
//! - **Custom backends** — adapt any I/O layer (TCP, QUIC, Unix sockets)
//!
//! ## Running
//!
//! ```sh
//! cargo run --example custom_transport
//! ```

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rank_matcher_client::protocol::{MatchSuccess, TeamEntry};
use rank_matcher_client::{
    AddPlayerParams, Connector, Message, RankMatcherClient, RankMatcherConfig, RankMatcherError,
    Transport,
};
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Step 1: Define a channel-based "loopback" transport
// ─────────────────────────────────────────────────────────────────────

/// The client half of the loopback.
pub struct LoopbackTransport {
    /// Frames the client sends go here (the matcher reads the other end).
    tx: mpsc::UnboundedSender<String>,
    /// Frames the matcher sends arrive here.
    rx: mpsc::UnboundedReceiver<String>,
}

/// The matcher half of the loopback.
pub struct LoopbackServer {
    pub rx: mpsc::UnboundedReceiver<String>,
    pub tx: mpsc::UnboundedSender<String>,
}

fn loopback_pair() -> (LoopbackTransport, LoopbackServer) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    (
        LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        },
        LoopbackServer {
            rx: server_rx,
            tx: server_tx,
        },
    )
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: Implement the Transport and Connector traits
// ─────────────────────────────────────────────────────────────────────

#[async_trait]
impl Transport for LoopbackTransport {
    // `handshake` keeps its default: channels need no session setup.

    async fn send(&mut self, frame: String) -> Result<(), RankMatcherError> {
        self.tx
            .send(frame)
            .map_err(|e| RankMatcherError::TransportSend(e.to_string()))
    }

    /// Cancel-safe because `mpsc::UnboundedReceiver::recv` is.
    async fn recv(&mut self) -> Option<Result<String, RankMatcherError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), RankMatcherError> {
        self.rx.close();
        Ok(())
    }
}

/// Hands out a single prepared loopback transport.
struct LoopbackConnector {
    transport: Mutex<Option<LoopbackTransport>>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn connect(&self) -> Result<LoopbackTransport, RankMatcherError> {
        self.transport
            .lock()
            .map_err(|_| RankMatcherError::TransportClosed)?
            .take()
            .ok_or(RankMatcherError::TransportClosed)
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: A toy matcher on the other end
// ─────────────────────────────────────────────────────────────────────

/// Fills arenas in arrival order and reports a match once one is full.
/// Ranks are ignored.
async fn toy_matcher(mut server: LoopbackServer) {
    let mut capacity: HashMap<String, u64> = HashMap::new();
    let mut waiting: HashMap<String, Vec<TeamEntry>> = HashMap::new();
    let mut next_stage = 1;

    while let Some(frame) = server.rx.recv().await {
        tracing::info!("matcher received: {frame}");
        match Message::decode(&frame) {
            Ok(Message::AddArena(add)) => {
                capacity.insert(add.arena, add.num_players);
            }
            Ok(Message::AddPlayer(add)) => {
                let Some(&seats) = capacity.get(&add.arena) else {
                    continue;
                };
                let queue = waiting.entry(add.arena.clone()).or_default();
                queue.push(TeamEntry::new(add.player, add.length));
                let filled: u64 = queue.iter().map(|t| t.team_length).sum();
                if filled >= seats {
                    let result = MatchSuccess {
                        arena: add.arena,
                        stage_request_id: next_stage,
                        players: std::mem::take(queue),
                    };
                    next_stage += 1;
                    let _ = server.tx.send(Message::from(result).encode());
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("matcher could not decode {frame:?}: {e}"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 4: Wire together the client and the toy matcher
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (transport, server) = loopback_pair();
    tokio::spawn(toy_matcher(server));
    let connector = LoopbackConnector {
        transport: Mutex::new(Some(transport)),
    };

    let client = RankMatcherClient::new(RankMatcherConfig::default());
    let (matched_tx, mut matched_rx) = mpsc::unbounded_channel();
    client.on_match_success(move |m| {
        let _ = matched_tx.send(m.clone());
    });

    // Issued before connecting: queued, then flushed in order.
    client.add_arena("duel", 2);
    client.connect(&connector).await?;

    client
        .add_player(AddPlayerParams::new("duel", "alice", 1500))
        .await?;
    client
        .add_player(AddPlayerParams::new("duel", "bob", 1520))
        .await?;

    if let Some(result) = matched_rx.recv().await {
        let names: Vec<&str> = result.players.iter().map(|t| t.player.as_str()).collect();
        tracing::info!(
            "match #{} in {}: {}",
            result.stage_request_id,
            result.arena,
            names.join(" vs ")
        );
    }

    client.shutdown().await;
    tracing::info!("Done. Custom transport works!");
    Ok(())
}
