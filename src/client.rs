//! Async client for the Rank Matcher protocol.
//!
//! [`RankMatcherClient`] is a thin handle over a [`Session`] (handshake gating
//! and the pending queue) and a [`Dispatcher`] (handler table). Each
//! successful [`connect`](RankMatcherClient::connect) spawns a background
//! transport loop that writes outbound frames in order, decodes inbound
//! frames and hands them to the registered handlers.
//!
//! # Example
//!
//! ```rust,ignore
//! let client = RankMatcherClient::new(RankMatcherConfig::new("ws://127.0.0.1:12310"));
//! client.on_match_success(|m| println!("match in {}: {:?}", m.arena, m.players));
//!
//! // Commands issued before the handshake are queued and flushed in order.
//! client.add_arena("lobby1", 2);
//! client.connect_websocket().await?;
//! client
//!     .add_player(AddPlayerParams::new("lobby1", "alice", 1500).with_init_rank_diff(100))
//!     .await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::error::{DecodeError, RankMatcherError, Result};
use crate::protocol::{
    AddArena, AddPlayer, ConnectionState, FormatError, GetOrSubscribeState, MatchFailure,
    MatchSuccess, Message, MessageType, RemoveArena, RemovePlayer,
};
use crate::session::{Delivery, Outbound, SendHandle, Session, SessionState};
use crate::transport::{Connector, Transport};

/// Server URL used by [`RankMatcherConfig::default`].
pub const DEFAULT_URL: &str = "ws://127.0.0.1:12310";

/// Largest inbound frame accepted by default, in bytes.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Default bound on connecting plus handshaking.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest span handed to the timer. Longer durations are treated as this
/// one, which in practice means "never".
const MAX_TIMER_SPAN: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const DEFAULT_TEAM_LENGTH: u64 = 1;
const DEFAULT_INIT_RANK_DIFF: u64 = 0;
const DEFAULT_SPEED: u64 = 1;

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`RankMatcherClient`].
///
/// # Example
///
/// ```
/// use rank_matcher_client::client::RankMatcherConfig;
/// use std::time::Duration;
///
/// let config = RankMatcherConfig::new("ws://matcher.local:12310")
///     .with_connect_timeout(Duration::from_secs(5))
///     .with_state_poll_interval(Duration::from_secs(10));
/// assert_eq!(config.url, "ws://matcher.local:12310");
/// assert_eq!(config.state_poll_interval, Some(Duration::from_secs(10)));
/// ```
#[derive(Debug, Clone)]
pub struct RankMatcherConfig {
    /// `ws://` URL of the matcher, used by
    /// [`connect_websocket`](RankMatcherClient::connect_websocket).
    pub url: String,
    /// Upper bound on establishing the transport and completing its
    /// handshake. Defaults to **2 seconds**. `Duration::MAX` effectively
    /// disables the bound.
    pub connect_timeout: Duration,
    /// Timeout for the graceful shutdown.
    ///
    /// When [`RankMatcherClient::shutdown`] is called, the background
    /// transport loop is given this much time to finish accepted writes and
    /// close the transport. If the timeout expires the task is aborted.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// When set, the client sends a one-shot [`GetOrSubscribeState`] at this
    /// interval while connected. Defaults to `None`.
    ///
    /// A one-shot request cancels a running subscription on the server, so
    /// polling pauses while the application holds a subscription made with
    /// [`RankMatcherClient::get_or_subscribe_state`] and resumes once it sends
    /// a one-shot request or the connection is replaced.
    pub state_poll_interval: Option<Duration>,
    /// Inbound frames longer than this many bytes are dropped without being
    /// decoded. Defaults to **1 MiB**.
    pub max_frame_len: usize,
}

impl RankMatcherConfig {
    /// Create a configuration for `url` with default values.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            state_poll_interval: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Set the bound on connecting plus handshaking.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the timeout for the graceful shutdown.
    ///
    /// A zero timeout aborts the transport loop immediately.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Poll the connection state periodically. A zero interval disables
    /// polling.
    ///
    /// Polling is skipped while a state subscription is active; see
    /// [`state_poll_interval`](Self::state_poll_interval).
    #[must_use]
    pub fn with_state_poll_interval(mut self, interval: Duration) -> Self {
        self.state_poll_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Set the inbound frame size limit. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len.max(1);
        self
    }
}

impl Default for RankMatcherConfig {
    fn default() -> Self {
        Self::new(DEFAULT_URL)
    }
}

// ── AddPlayerParams ─────────────────────────────────────────────────

/// Parameters for [`RankMatcherClient::add_player`].
///
/// Only the arena, player and rank are required. The team length defaults
/// to 1, the initial rank band to 0 (exact rank) and the widening speed to 1.
///
/// # Example
///
/// ```
/// use rank_matcher_client::client::AddPlayerParams;
///
/// let params = AddPlayerParams::new("lobby1", "alice", 1500)
///     .with_length(2)
///     .with_init_rank_diff(100);
/// assert_eq!(params.length, 2);
/// assert_eq!(params.speed, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddPlayerParams {
    pub arena: String,
    pub player: String,
    pub rank: u64,
    pub length: u64,
    pub init_rank_diff: u64,
    pub speed: u64,
}

impl AddPlayerParams {
    pub fn new(arena: impl Into<String>, player: impl Into<String>, rank: u64) -> Self {
        Self {
            arena: arena.into(),
            player: player.into(),
            rank,
            length: DEFAULT_TEAM_LENGTH,
            init_rank_diff: DEFAULT_INIT_RANK_DIFF,
            speed: DEFAULT_SPEED,
        }
    }

    /// Number of seats the team occupies.
    #[must_use]
    pub fn with_length(mut self, length: u64) -> Self {
        self.length = length;
        self
    }

    /// Half-width of the initial rank band.
    #[must_use]
    pub fn with_init_rank_diff(mut self, init_rank_diff: u64) -> Self {
        self.init_rank_diff = init_rank_diff;
        self
    }

    /// How fast the rank band widens while waiting.
    #[must_use]
    pub fn with_speed(mut self, speed: u64) -> Self {
        self.speed = speed;
        self
    }
}

impl From<AddPlayerParams> for AddPlayer {
    fn from(params: AddPlayerParams) -> Self {
        Self {
            arena: params.arena,
            player: params.player,
            rank: params.rank,
            length: params.length,
            init_rank_diff: params.init_rank_diff,
            speed: params.speed,
        }
    }
}

// ── Client ──────────────────────────────────────────────────────────

struct LoopHandle {
    task: JoinHandle<()>,
    shutdown_tx: oneshot::Sender<()>,
}

/// Async client handle for the Rank Matcher protocol.
///
/// All methods take `&self`; wrap the client in an [`Arc`] to issue commands
/// from several tasks or threads. Commands may be issued at any time: before
/// the handshake completes they are queued, and the queue is flushed in FIFO
/// order ahead of any later command.
pub struct RankMatcherClient {
    config: RankMatcherConfig,
    session: Arc<Session>,
    dispatcher: Arc<Dispatcher>,
    /// Transport loop of the current connection. Also serializes
    /// `connect` against `shutdown`.
    runner: Mutex<Option<LoopHandle>>,
    /// Flips to `true` on shutdown; cuts short a connect in progress.
    closed: watch::Sender<bool>,
}

impl RankMatcherClient {
    /// Create an unconnected client.
    pub fn new(config: RankMatcherConfig) -> Self {
        Self {
            config,
            session: Arc::new(Session::new()),
            dispatcher: Arc::new(Dispatcher::new()),
            runner: Mutex::new(None),
            closed: watch::Sender::new(false),
        }
    }

    pub fn config(&self) -> &RankMatcherConfig {
        &self.config
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Open a transport with `connector`, complete its handshake and start
    /// the transport loop.
    ///
    /// Connecting and handshaking together are bounded by
    /// [`RankMatcherConfig::connect_timeout`]. On failure the session returns
    /// to `Unconnected` with its queue intact, so `connect` may be retried.
    ///
    /// # Errors
    ///
    /// - [`RankMatcherError::AlreadyConnected`] if a connection is live or
    ///   being set up
    /// - [`RankMatcherError::SessionClosed`] after [`shutdown`](Self::shutdown)
    /// - [`RankMatcherError::ConnectTimeout`] if the deadline elapsed
    /// - any error returned by the connector or the handshake
    pub async fn connect<C: Connector>(&self, connector: &C) -> Result<()> {
        let mut closed = self.closed.subscribe();
        let mut runner = self.runner.lock().await;
        let (attempt, cmd_rx) = self.session.begin_connecting()?;
        let span = info_span!("rank_matcher", session_id = %self.session.id(), attempt);

        let outcome = tokio::select! {
            result = self.establish(connector).instrument(span.clone()) => result,
            () = async {
                let _ = closed.wait_for(|done| *done).await;
            } => Err(RankMatcherError::SessionClosed),
        };
        let mut transport = match outcome {
            Ok(transport) => transport,
            Err(e) => {
                self.session.abort_connecting();
                warn!(parent: &span, "connection attempt failed: {e}");
                return Err(e);
            }
        };

        // Queued commands go onto the link before the loop starts reading it.
        let drained = match self.session.on_handshake_complete() {
            Ok(drained) => drained,
            Err(e) => {
                warn!(parent: &span, "session shut down during handshake");
                if let Err(close_err) = transport.close().await {
                    debug!(parent: &span, "failed to close transport: {close_err}");
                }
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let context = LoopContext {
            session: Arc::clone(&self.session),
            dispatcher: Arc::clone(&self.dispatcher),
            attempt,
            state_poll_interval: self.config.state_poll_interval,
            max_frame_len: self.config.max_frame_len,
        };
        let task = tokio::spawn(
            transport_loop(transport, cmd_rx, shutdown_rx, context).instrument(span.clone()),
        );
        // Any previous loop has already reported its connection lost and is
        // on its way out; dropping the handle detaches it.
        *runner = Some(LoopHandle { task, shutdown_tx });

        info!(parent: &span, drained, "connected to rank matcher");
        Ok(())
    }

    /// [`connect`](Self::connect) over WebSocket to [`RankMatcherConfig::url`].
    ///
    /// # Errors
    ///
    /// [`RankMatcherError::InvalidUrl`] if the configured URL is unusable,
    /// otherwise as [`connect`](Self::connect).
    #[cfg(feature = "transport-websocket")]
    pub async fn connect_websocket(&self) -> Result<()> {
        let connector = crate::transports::WebSocketConnector::new(self.config.url.as_str())?;
        self.connect(&connector).await
    }

    async fn establish<C: Connector>(&self, connector: &C) -> Result<C::Transport> {
        let deadline = deadline_after(self.config.connect_timeout);

        let mut transport = tokio::time::timeout_at(deadline, connector.connect())
            .await
            .map_err(|_| RankMatcherError::ConnectTimeout)??;
        debug!("transport connected, starting handshake");

        let outcome = match tokio::time::timeout_at(deadline, transport.handshake()).await {
            Ok(result) => result,
            Err(_) => Err(RankMatcherError::ConnectTimeout),
        };
        match outcome {
            Ok(()) => Ok(transport),
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    debug!("failed to close transport after handshake error: {close_err}");
                }
                Err(e)
            }
        }
    }

    /// Shut the client down.
    ///
    /// Further commands fail with [`RankMatcherError::SessionClosed`] and
    /// commands still waiting for a handshake are discarded. Writes the
    /// transport loop had already accepted are finished before the transport
    /// is closed. Returns `false` if the loop had to be aborted after
    /// [`RankMatcherConfig::shutdown_timeout`].
    ///
    /// Calling `shutdown` more than once is harmless.
    pub async fn shutdown(&self) -> bool {
        debug!(session_id = %self.session.id(), "shutdown requested");
        self.session.shutdown();
        self.closed.send_replace(true);

        let Some(LoopHandle {
            mut task,
            shutdown_tx,
        }) = self.runner.lock().await.take()
        else {
            return true;
        };
        let _ = shutdown_tx.send(());

        // Await the transport loop with a timeout. If it doesn't exit in time,
        // abort it so the task cannot detach and run indefinitely.
        match tokio::time::timeout(self.config.shutdown_timeout, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(join_err)) => {
                warn!("transport loop terminated with join error: {join_err}");
                false
            }
            Err(_) => {
                warn!("transport loop did not exit within timeout; aborting task");
                task.abort();
                if let Err(join_err) = task.await {
                    debug!("transport loop aborted: {join_err}");
                }
                false
            }
        }
    }

    // ── Sending ─────────────────────────────────────────────────────

    /// Send any message and wait for it to be written (or queued).
    ///
    /// # Errors
    ///
    /// [`RankMatcherError::SessionClosed`] after shutdown, or the transport
    /// error that failed the write.
    pub async fn send(&self, message: impl Into<Message>) -> Result<Delivery> {
        self.session.send(&message.into()).await
    }

    /// Send any message without waiting. The returned handle may be awaited,
    /// polled or dropped.
    pub fn send_async(&self, message: impl Into<Message>) -> SendHandle {
        self.session.send_async(&message.into())
    }

    /// [`send`](Self::send) for threads outside the async runtime.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn send_blocking(&self, message: impl Into<Message>) -> Result<Delivery> {
        self.session.send_blocking(&message.into())
    }

    /// Register an arena that completes a match at `num_players` seats.
    pub fn add_arena(&self, arena: impl Into<String>, num_players: u64) -> SendHandle {
        self.send_async(AddArena {
            arena: arena.into(),
            num_players,
        })
    }

    /// Remove an arena.
    pub fn remove_arena(&self, arena: impl Into<String>) -> SendHandle {
        self.send_async(RemoveArena {
            arena: arena.into(),
        })
    }

    /// Queue a player (or team) for matching.
    pub fn add_player(&self, params: AddPlayerParams) -> SendHandle {
        self.send_async(AddPlayer::from(params))
    }

    /// Withdraw a queued player.
    pub fn remove_player(&self, arena: impl Into<String>, player: impl Into<String>) -> SendHandle {
        self.send_async(RemovePlayer {
            arena: arena.into(),
            player: player.into(),
        })
    }

    /// Request a [`ConnectionState`] snapshot. A `period` of 0 asks for a
    /// single reply; any other value subscribes to one every `period`
    /// seconds.
    pub fn get_or_subscribe_state(&self, period: u64) -> SendHandle {
        self.send_async(GetOrSubscribeState { period })
    }

    // ── Handlers ────────────────────────────────────────────────────

    /// Run `handler` for every [`MatchSuccess`].
    pub fn on_match_success<F>(&self, handler: F)
    where
        F: Fn(&MatchSuccess) + Send + Sync + 'static,
    {
        self.dispatcher
            .register(MessageType::MatchSuccess, move |message| {
                if let Message::MatchSuccess(payload) = message {
                    handler(payload);
                }
            });
    }

    /// Run `handler` for every [`MatchFailure`].
    pub fn on_match_failure<F>(&self, handler: F)
    where
        F: Fn(&MatchFailure) + Send + Sync + 'static,
    {
        self.dispatcher
            .register(MessageType::MatchFailure, move |message| {
                if let Message::MatchFailure(payload) = message {
                    handler(payload);
                }
            });
    }

    /// Run `handler` for every [`ConnectionState`].
    pub fn on_connection_state<F>(&self, handler: F)
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.dispatcher
            .register(MessageType::ConnectionState, move |message| {
                if let Message::ConnectionState(payload) = message {
                    handler(payload);
                }
            });
    }

    /// Run `handler` whenever the server reports it could not parse a frame
    /// from this client.
    pub fn on_format_error<F>(&self, handler: F)
    where
        F: Fn(&FormatError) + Send + Sync + 'static,
    {
        self.dispatcher
            .register(MessageType::FormatError, move |message| {
                if let Message::FormatError(payload) = message {
                    handler(payload);
                }
            });
    }

    /// Register an untyped handler for `kind`, replacing any previous one.
    pub fn on_message<F>(&self, kind: MessageType, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.dispatcher.register(kind, handler);
    }

    /// Observe inbound frames that failed to decode.
    pub fn on_decode_error<F>(&self, handler: F)
    where
        F: Fn(&DecodeError, &str) + Send + Sync + 'static,
    {
        self.dispatcher.set_decode_error_handler(handler);
    }

    /// Run `handler` when the connection goes away, with the reason if one
    /// is known.
    pub fn on_disconnected<F>(&self, handler: F)
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        self.dispatcher.set_disconnect_handler(handler);
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    // ── State accessors ─────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Returns `true` once the handshake has completed and until the
    /// connection is lost or shut down.
    pub fn is_connected(&self) -> bool {
        self.session.is_handshake_complete()
    }

    /// Number of commands waiting for the handshake.
    pub fn pending_len(&self) -> usize {
        self.session.pending_len()
    }

    pub fn session_id(&self) -> Uuid {
        self.session.id()
    }
}

impl Default for RankMatcherClient {
    fn default() -> Self {
        Self::new(RankMatcherConfig::default())
    }
}

impl std::fmt::Debug for RankMatcherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankMatcherClient")
            .field("url", &self.config.url)
            .field("session", &self.session)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl Drop for RankMatcherClient {
    fn drop(&mut self) {
        // No executor to drive a graceful close from here; abort the loop.
        if let Some(handle) = self.runner.get_mut().take() {
            handle.task.abort();
        }
    }
}

// ── Transport loop ──────────────────────────────────────────────────

struct LoopContext {
    session: Arc<Session>,
    dispatcher: Arc<Dispatcher>,
    attempt: u64,
    state_poll_interval: Option<Duration>,
    max_frame_len: usize,
}

enum Exit {
    Shutdown,
    Lost(Option<String>),
}

/// Background transport loop that multiplexes send/receive via `tokio::select!`.
///
/// Exits when:
/// - The outbound link closes or the shutdown signal fires (client shut down)
/// - The transport returns `None` (server closed connection)
/// - A transport error occurs
async fn transport_loop<T: Transport>(
    mut transport: T,
    mut cmd_rx: mpsc::UnboundedReceiver<Outbound>,
    mut shutdown_rx: oneshot::Receiver<()>,
    ctx: LoopContext,
) {
    debug!("transport loop started");

    let mut guard = LoopGuard {
        ctx: &ctx,
        armed: true,
    };

    let mut poll = ctx
        .state_poll_interval
        .filter(|period| !period.is_zero())
        .map(|period| {
            let period = period.min(MAX_TIMER_SPAN);
            let mut interval = tokio::time::interval_at(deadline_after(period), period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

    let exit = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(outbound) => {
                        if let Err(e) = write_frame(&mut transport, outbound).await {
                            error!("transport send error: {e}");
                            break Exit::Lost(Some(format!("transport send error: {e}")));
                        }
                    }
                    None => {
                        debug!("outbound link released, shutting down transport loop");
                        break Exit::Shutdown;
                    }
                }
            }

            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                break Exit::Shutdown;
            }

            () = next_tick(&mut poll) => {
                if ctx.session.is_subscribed() {
                    trace!("state subscription active, skipping poll");
                } else {
                    trace!("polling connection state");
                    drop(ctx.session.send_async(&GetOrSubscribeState { period: 0 }.into()));
                }
            }

            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(frame)) => handle_frame(&ctx, &frame),
                    Some(Err(e)) => {
                        error!("transport receive error: {e}");
                        break Exit::Lost(Some(format!("transport receive error: {e}")));
                    }
                    None => {
                        debug!("transport closed by server");
                        break Exit::Lost(None);
                    }
                }
            }
        }
    };

    match exit {
        Exit::Shutdown => {
            // Writes accepted before shutdown still go out.
            cmd_rx.close();
            while let Ok(outbound) = cmd_rx.try_recv() {
                if let Err(e) = write_frame(&mut transport, outbound).await {
                    warn!("transport send error during shutdown: {e}");
                    break;
                }
            }
            if let Err(e) = transport.close().await {
                debug!("error closing transport: {e}");
            }
            ctx.dispatcher.report_disconnect(Some("client shut down"));
        }
        Exit::Lost(reason) => {
            // Release the link first so no new sends land in the channel.
            ctx.session.connection_lost(ctx.attempt);
            cmd_rx.close();
            while let Ok(outbound) = cmd_rx.try_recv() {
                outbound.settle(Err(RankMatcherError::TransportClosed));
            }
            ctx.dispatcher.report_disconnect(reason.as_deref());
        }
    }

    guard.armed = false;
    debug!("transport loop exited");
}

/// Hands the connection back to the session when the loop ends without
/// reaching its own teardown: a transport method panicked or the task was
/// aborted.
struct LoopGuard<'a> {
    ctx: &'a LoopContext,
    armed: bool,
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.ctx.session.connection_lost(self.ctx.attempt) {
            warn!("transport loop terminated abnormally");
            self.ctx
                .dispatcher
                .report_disconnect(Some("transport loop terminated"));
        }
    }
}

/// `now + span`, with `span` capped at [`MAX_TIMER_SPAN`].
fn deadline_after(span: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(span.min(MAX_TIMER_SPAN)).unwrap_or(now)
}

async fn next_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Write one frame and settle its handle.
async fn write_frame<T: Transport>(transport: &mut T, mut outbound: Outbound) -> Result<()> {
    trace!(message_type = %outbound.message_type, "writing frame");
    let frame = std::mem::take(&mut outbound.frame);
    match transport.send(frame).await {
        Ok(()) => {
            outbound.settle(Ok(Delivery::Written));
            Ok(())
        }
        Err(e) => {
            outbound.settle(Err(RankMatcherError::TransportSend(e.to_string())));
            Err(e)
        }
    }
}

/// Decode one inbound frame and dispatch it.
fn handle_frame(ctx: &LoopContext, frame: &str) {
    if frame.len() > ctx.max_frame_len {
        warn!(
            frame_len = frame.len(),
            max_frame_len = ctx.max_frame_len,
            "dropping oversized frame"
        );
        return;
    }
    match Message::decode(frame) {
        Ok(message) => {
            if let Message::FormatError(rejected) = &message {
                warn!(reason = %rejected.message, "server could not parse a frame we sent");
            }
            trace!(message_type = %message.message_type(), "dispatching message");
            ctx.dispatcher.dispatch(&message);
        }
        Err(e) => ctx.dispatcher.report_decode_error(&e, frame),
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    // ── Mock transport ──────────────────────────────────────────────

    /// Records sent frames; `recv` yields whatever the test pushes.
    struct MockTransport {
        incoming: mpsc::UnboundedReceiver<Option<Result<String>>>,
        sent: Arc<StdMutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
        fail_sends: bool,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, frame: String) -> Result<()> {
            if self.fail_sends {
                return Err(RankMatcherError::TransportSend("broken pipe".into()));
            }
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            match self.incoming.recv().await {
                Some(item) => item,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    struct MockConnector {
        transport: StdMutex<Option<MockTransport>>,
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Transport = MockTransport;

        async fn connect(&self) -> Result<MockTransport> {
            self.transport
                .lock()
                .unwrap()
                .take()
                .ok_or(RankMatcherError::TransportClosed)
        }
    }

    struct Peer {
        to_client: mpsc::UnboundedSender<Option<Result<String>>>,
        sent: Arc<StdMutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
    }

    fn mock(fail_sends: bool) -> (MockConnector, Peer) {
        let (to_client, incoming) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let transport = MockTransport {
            incoming,
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
            fail_sends,
        };
        let connector = MockConnector {
            transport: StdMutex::new(Some(transport)),
        };
        (
            connector,
            Peer {
                to_client,
                sent,
                closed,
            },
        )
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    // ── Config / params ─────────────────────────────────────────────

    #[test]
    fn config_defaults() {
        let config = RankMatcherConfig::default();
        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.connect_timeout, Duration::from_millis(2000));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.state_poll_interval, None);
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
    }

    #[test]
    fn zero_poll_interval_disables_polling() {
        let config = RankMatcherConfig::default().with_state_poll_interval(Duration::ZERO);
        assert_eq!(config.state_poll_interval, None);
        let config = RankMatcherConfig::default().with_max_frame_len(0);
        assert_eq!(config.max_frame_len, 1);
    }

    #[test]
    fn add_player_params_defaults() {
        let add: AddPlayer = AddPlayerParams::new("lobby1", "alice", 1500).into();
        assert_eq!(add.length, 1);
        assert_eq!(add.init_rank_diff, 0);
        assert_eq!(add.speed, 1);
        assert_eq!(add.rank_range(), (1500, 1500));
    }

    // ── Transport loop ──────────────────────────────────────────────

    #[tokio::test]
    async fn queued_commands_flush_on_connect() {
        let client = RankMatcherClient::default();
        let mut first = client.add_arena("lobby1", 2);
        let _ = client.remove_arena("old");
        assert!(matches!(first.try_result(), Some(Ok(Delivery::Queued))));
        assert_eq!(client.pending_len(), 2);

        let (connector, peer) = mock(false);
        client.connect(&connector).await.unwrap();
        assert!(client.is_connected());
        assert_eq!(client.pending_len(), 0);

        let delivery = client.get_or_subscribe_state(0).await.unwrap();
        assert_eq!(delivery, Delivery::Written);
        assert_eq!(
            *peer.sent.lock().unwrap(),
            vec!["1,1,6,lobby1,2", "1,2,3,old", "1,5,0"]
        );
    }

    #[tokio::test]
    async fn oversized_frames_are_dropped() {
        let client = RankMatcherClient::new(RankMatcherConfig::default().with_max_frame_len(16));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        client.on_format_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (connector, peer) = mock(false);
        client.connect(&connector).await.unwrap();
        peer.to_client
            .send(Some(Ok(format!("1,9,40,{}", "x".repeat(40)))))
            .unwrap();
        peer.to_client.send(Some(Ok("1,9,2,ok".into()))).unwrap();

        eventually(|| seen.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn state_poll_sends_one_shot_requests() {
        let client = RankMatcherClient::new(
            RankMatcherConfig::default().with_state_poll_interval(Duration::from_millis(10)),
        );
        let (connector, peer) = mock(false);
        client.connect(&connector).await.unwrap();

        eventually(|| peer.sent.lock().unwrap().len() >= 2).await;
        assert!(peer.sent.lock().unwrap().iter().all(|f| f == "1,5,0"));
        assert!(client.shutdown().await);
    }

    #[tokio::test]
    async fn send_failure_drops_connection() {
        let client = RankMatcherClient::default();
        let reason = Arc::new(StdMutex::new(None));
        let sink = Arc::clone(&reason);
        client.on_disconnected(move |r| {
            *sink.lock().unwrap() = r.map(str::to_string);
        });

        let (connector, _peer) = mock(true);
        client.connect(&connector).await.unwrap();
        let result = client.remove_arena("lobby1").await;
        assert!(matches!(result, Err(RankMatcherError::TransportSend(_))));

        eventually(|| client.state() == SessionState::Unconnected).await;
        let reason = reason.lock().unwrap().clone().unwrap();
        assert!(reason.contains("broken pipe"), "{reason}");
    }

    #[tokio::test]
    async fn shutdown_closes_transport() {
        let client = RankMatcherClient::default();
        let (connector, peer) = mock(false);
        client.connect(&connector).await.unwrap();

        assert!(client.shutdown().await);
        assert!(peer.closed.load(Ordering::Relaxed));
        assert_eq!(client.state(), SessionState::ShutDown);
        assert!(client.shutdown().await);
    }

    #[tokio::test]
    async fn failed_connect_can_be_retried() {
        let client = RankMatcherClient::default();
        let empty = MockConnector {
            transport: StdMutex::new(None),
        };
        let err = client.connect(&empty).await.unwrap_err();
        assert!(matches!(err, RankMatcherError::TransportClosed));
        assert_eq!(client.state(), SessionState::Unconnected);

        let (connector, _peer) = mock(false);
        client.connect(&connector).await.unwrap();
        assert!(client.is_connected());
    }

    #[test]
    fn debug_includes_url() {
        let client = RankMatcherClient::default();
        let text = format!("{client:?}");
        assert!(text.contains(DEFAULT_URL));
    }
}
