#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for Rank Matcher client integration tests.
//!
//! Provides a channel-driven [`MockTransport`], a [`MockConnector`] that
//! hands out prepared transports (or scripted failures), and helpers for
//! building server frames.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rank_matcher_client::protocol::{
    ConnectionState, FormatError, MatchFailure, MatchSuccess, PlayerState, TeamEntry,
};
use rank_matcher_client::{Connector, Message, RankMatcherError, Transport};
use tokio::sync::{mpsc, oneshot};

type Incoming = Option<Result<String, RankMatcherError>>;

// ── MockTransport ───────────────────────────────────────────────────

/// A channel-based mock transport.
///
/// Frames pushed through the paired [`MockPeer`] are yielded by `recv()` in
/// order. Once the peer is dropped `recv()` hangs forever, so the transport
/// loop stays alive until shutdown. All frames written by the client are
/// recorded in `sent`.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Incoming>,
    sent: Arc<StdMutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
    faults: Arc<Faults>,
    /// When set, `handshake()` waits for this gate and returns its result.
    handshake_gate: Option<oneshot::Receiver<Result<(), RankMatcherError>>>,
}

/// Misbehaviour the test can switch on through [`MockPeer`].
#[derive(Default)]
struct Faults {
    fail_sends: AtomicBool,
    panic_on_recv: AtomicBool,
}

/// The test's end of a [`MockTransport`].
pub struct MockPeer {
    to_client: mpsc::UnboundedSender<Incoming>,
    /// Frames the client wrote, in order.
    pub sent: Arc<StdMutex<Vec<String>>>,
    /// Whether `close()` was called.
    pub closed: Arc<AtomicBool>,
    faults: Arc<Faults>,
    handshake_gate: Option<oneshot::Sender<Result<(), RankMatcherError>>>,
}

impl MockTransport {
    /// Create a transport whose handshake succeeds immediately.
    pub fn new() -> (Self, MockPeer) {
        Self::build(false)
    }

    /// Create a transport whose handshake waits for
    /// [`MockPeer::complete_handshake`].
    pub fn gated() -> (Self, MockPeer) {
        Self::build(true)
    }

    fn build(gated: bool) -> (Self, MockPeer) {
        let (to_client, incoming) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let faults = Arc::new(Faults::default());
        let (gate_tx, gate_rx) = if gated {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let transport = Self {
            incoming,
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
            faults: Arc::clone(&faults),
            handshake_gate: gate_rx,
        };
        let peer = MockPeer {
            to_client,
            sent,
            closed,
            faults,
            handshake_gate: gate_tx,
        };
        (transport, peer)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn handshake(&mut self) -> Result<(), RankMatcherError> {
        match self.handshake_gate.take() {
            Some(gate) => gate.await.unwrap_or(Err(RankMatcherError::TransportClosed)),
            None => Ok(()),
        }
    }

    async fn send(&mut self, frame: String) -> Result<(), RankMatcherError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(RankMatcherError::TransportClosed);
        }
        if self.faults.fail_sends.load(Ordering::Relaxed) {
            return Err(RankMatcherError::TransportSend("broken pipe".into()));
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, RankMatcherError>> {
        let next = self.incoming.recv().await;
        if self.faults.panic_on_recv.load(Ordering::Relaxed) {
            panic!("mock transport crashed");
        }
        match next {
            // An explicit `None` entry signals a clean transport close;
            // `Some(result)` delivers the scripted frame or error.
            Some(item) => item,
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), RankMatcherError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

impl MockPeer {
    /// Deliver a frame to the client.
    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.to_client.send(Some(Ok(frame.into())));
    }

    /// Deliver an encoded message to the client.
    pub fn push_message(&self, message: impl Into<Message>) {
        self.push(message.into().encode());
    }

    /// Make the client's `recv()` report a clean close.
    pub fn hang_up(&self) {
        let _ = self.to_client.send(None);
    }

    /// Make the client's `recv()` report a transport error.
    pub fn fail(&self, reason: &str) {
        let _ = self
            .to_client
            .send(Some(Err(RankMatcherError::TransportReceive(reason.into()))));
    }

    /// Make every later write fail.
    pub fn break_sends(&self) {
        self.faults.fail_sends.store(true, Ordering::Relaxed);
    }

    /// Make the client's pending `recv()` panic.
    pub fn crash(&self) {
        self.faults.panic_on_recv.store(true, Ordering::Relaxed);
        let _ = self.to_client.send(Some(Ok(String::new())));
    }

    /// Let a gated handshake finish with `result`.
    pub fn complete_handshake(&mut self, result: Result<(), RankMatcherError>) {
        if let Some(gate) = self.handshake_gate.take() {
            let _ = gate.send(result);
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Wait until the client has written at least `count` frames.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<String> {
        eventually(|| self.sent.lock().unwrap().len() >= count).await;
        self.sent()
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// What the next `connect()` call should do.
pub enum Attempt {
    Transport(MockTransport),
    Fail(RankMatcherError),
    /// Never complete (exercises the connect timeout).
    Hang,
}

/// Hands out scripted connection attempts in order.
#[derive(Default)]
pub struct MockConnector {
    attempts: StdMutex<VecDeque<Attempt>>,
}

impl MockConnector {
    pub fn new(attempts: Vec<Attempt>) -> Self {
        Self {
            attempts: StdMutex::new(VecDeque::from(attempts)),
        }
    }

    /// A connector with a single transport whose handshake succeeds.
    pub fn single() -> (Self, MockPeer) {
        let (transport, peer) = MockTransport::new();
        (Self::new(vec![Attempt::Transport(transport)]), peer)
    }

    pub fn push(&self, attempt: Attempt) {
        self.attempts.lock().unwrap().push_back(attempt);
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&self) -> Result<MockTransport, RankMatcherError> {
        let next = self.attempts.lock().unwrap().pop_front();
        match next {
            Some(Attempt::Transport(transport)) => Ok(transport),
            Some(Attempt::Fail(err)) => Err(err),
            Some(Attempt::Hang) => std::future::pending().await,
            None => Err(RankMatcherError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "no scripted attempt left",
            ))),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Poll `check` until it returns `true`, failing the test after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 2s");
}

pub fn match_success(arena: &str, stage_request_id: u64, players: &[(&str, u64)]) -> MatchSuccess {
    MatchSuccess {
        arena: arena.into(),
        stage_request_id,
        players: players
            .iter()
            .map(|(player, len)| TeamEntry::new(*player, *len))
            .collect(),
    }
}

pub fn match_failure(arena: &str, error_id: u64, players: &[(&str, u64)]) -> MatchFailure {
    MatchFailure {
        arena: arena.into(),
        error_id,
        error_message: "stage request failed".into(),
        players: players
            .iter()
            .map(|(player, len)| TeamEntry::new(*player, *len))
            .collect(),
    }
}

pub fn connection_state(entries: &[(&str, &str, u64)]) -> ConnectionState {
    ConnectionState {
        players: entries
            .iter()
            .map(|(player, arena, num_matched)| {
                (
                    (*player).to_string(),
                    PlayerState {
                        arena: (*arena).to_string(),
                        num_matched: *num_matched,
                    },
                )
            })
            .collect(),
    }
}

pub fn format_error(message: &str) -> FormatError {
    FormatError {
        message: message.into(),
    }
}
