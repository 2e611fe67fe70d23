//! # Lobby Matcher Example
//!
//! Demonstrates a complete Rank Matcher client lifecycle:
//!
//! 1. Register handlers for match results and state snapshots
//! 2. Queue an arena and a few players before connecting
//! 3. Connect over WebSocket; the queue is flushed in order
//! 4. Subscribe to periodic connection-state pushes
//! 5. Shut down gracefully on Ctrl+C or disconnect
//!
//! ## Running
//!
//! ```sh
//! # Start a matcher on localhost:12310, then:
//! cargo run --example lobby_matcher
//!
//! # Override the server URL:
//! RANK_MATCHER_URL=ws://matcher:12310 cargo run --example lobby_matcher
//! ```

use std::sync::Arc;
use std::time::Duration;

use rank_matcher_client::client::DEFAULT_URL;
use rank_matcher_client::{AddPlayerParams, RankMatcherClient, RankMatcherConfig};
use tokio::sync::Notify;

const ARENA: &str = "ranked-4";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let url = std::env::var("RANK_MATCHER_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    let config = RankMatcherConfig::new(url).with_connect_timeout(Duration::from_secs(5));
    let client = RankMatcherClient::new(config);

    // ── Handlers ────────────────────────────────────────────────────
    client.on_match_success(|m| {
        tracing::info!(
            arena = %m.arena,
            stage_request_id = m.stage_request_id,
            "match formed: {:?}",
            m.players
        );
    });
    client.on_match_failure(|f| {
        tracing::warn!(arena = %f.arena, code = %f.code(), "match failed: {}", f.error_message);
    });
    client.on_connection_state(|state| {
        for (player, info) in &state.players {
            tracing::info!(
                "{player} waiting in {} with {} candidates",
                info.arena,
                info.num_matched
            );
        }
    });
    client.on_format_error(|e| tracing::error!("matcher rejected a frame: {}", e.message));

    let disconnected = Arc::new(Notify::new());
    let notify = Arc::clone(&disconnected);
    client.on_disconnected(move |reason| {
        tracing::info!("disconnected: {}", reason.unwrap_or("server closed"));
        notify.notify_one();
    });

    // ── Queue work, then connect ────────────────────────────────────
    client.add_arena(ARENA, 4);
    for (name, rank) in [("alice", 1500), ("bob", 1540), ("carol", 1490)] {
        client.add_player(
            AddPlayerParams::new(ARENA, name, rank)
                .with_init_rank_diff(50)
                .with_speed(10),
        );
    }
    // A team of two takes two seats.
    client.add_player(
        AddPlayerParams::new(ARENA, "dave", 1520)
            .with_length(2)
            .with_init_rank_diff(50),
    );

    client.connect_websocket().await?;
    client.get_or_subscribe_state(5).await?;

    // ── Wait ────────────────────────────────────────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl+C received"),
        () = disconnected.notified() => {}
    }

    client.remove_arena(ARENA);
    client.shutdown().await;
    Ok(())
}
