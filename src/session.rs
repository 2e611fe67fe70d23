//! Connection session state machine and outbound queue.
//!
//! ```text
//! Unconnected ──begin_connecting──▶ Connecting ──on_handshake_complete──▶ HandshakeComplete
//!      ▲                                │                                      │
//!      └──────abort_connecting──────────┘◀──────────connection_lost────────────┘
//!
//! any state ──shutdown──▶ ShutDown (terminal)
//! ```
//!
//! Until the handshake completes, every send is appended to the pending
//! queue and reported as [`Delivery::Queued`]. Completing the handshake sets
//! the handshake flag and moves the whole queue, in FIFO order, onto the
//! outbound link while holding the same lock that sends take. A send racing
//! with the drain therefore either lands in the queue before it is drained or
//! observes the flag and is placed on the link after every drained message.
//!
//! The link is an unbounded channel consumed by the client's transport loop,
//! which performs the writes one at a time in channel order.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{RankMatcherError, Result};
use crate::protocol::{Message, MessageType};

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No transport. Sends are queued.
    Unconnected,
    /// The transport is up but its handshake has not completed. Sends are queued.
    Connecting,
    /// Sends go straight to the transport.
    HandshakeComplete,
    /// Terminal. Sends fail with [`RankMatcherError::SessionClosed`].
    ShutDown,
}

/// How far a successful send got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// The message was added to the pending queue and will be written once
    /// the handshake completes.
    Queued,
    /// The transport accepted the write.
    Written,
}

/// A frame waiting to be written by the transport loop.
pub(crate) struct Outbound {
    pub(crate) message_type: MessageType,
    pub(crate) frame: String,
    /// `None` for messages that were queued: their caller was already told
    /// [`Delivery::Queued`].
    pub(crate) reply: Option<oneshot::Sender<Result<Delivery>>>,
}

impl Outbound {
    /// Report the outcome of the write to whoever is waiting on it.
    pub(crate) fn settle(self, result: Result<Delivery>) {
        match self.reply {
            Some(reply) => {
                // The caller may have dropped its handle; that is fine.
                let _ = reply.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!(
                        message_type = %self.message_type,
                        "queued message was not delivered: {e}"
                    );
                }
            }
        }
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound")
            .field("message_type", &self.message_type)
            .field("frame_len", &self.frame.len())
            .field("awaited", &self.reply.is_some())
            .finish()
    }
}

// ── Send handle ─────────────────────────────────────────────────────

/// Single-resolution completion handle for a send.
///
/// Await it to wait for the write to settle, poll it with
/// [`try_result`](SendHandle::try_result), block on it from a non-async
/// thread with [`wait_blocking`](SendHandle::wait_blocking), or simply drop
/// it. Dropping the handle never cancels the write.
#[derive(Debug)]
pub struct SendHandle {
    rx: oneshot::Receiver<Result<Delivery>>,
}

impl SendHandle {
    fn pending() -> (oneshot::Sender<Result<Delivery>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A handle that is already resolved.
    pub(crate) fn ready(result: Result<Delivery>) -> Self {
        let (tx, handle) = Self::pending();
        let _ = tx.send(result);
        handle
    }

    /// Take the outcome if the write has settled.
    ///
    /// Returns `None` while the write is still in flight. The outcome is
    /// handed out once; polling again afterwards reports
    /// [`RankMatcherError::TransportClosed`].
    pub fn try_result(&mut self) -> Option<Result<Delivery>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(RankMatcherError::TransportClosed))
            }
        }
    }

    /// Block the current thread until the write settles.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context; use
    /// `.await` there instead.
    pub fn wait_blocking(self) -> Result<Delivery> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(RankMatcherError::TransportClosed))
    }
}

impl Future for SendHandle {
    type Output = Result<Delivery>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(RankMatcherError::TransportClosed)))
    }
}

// ── Session ─────────────────────────────────────────────────────────

struct Inner {
    state: SessionState,
    pending: VecDeque<Outbound>,
    link: Option<mpsc::UnboundedSender<Outbound>>,
    attempt: u64,
    /// Whether the last state request sent on this connection subscribed.
    subscribed: bool,
}

/// Handshake gating and ordered hand-off of outbound messages.
///
/// All methods take `&self` and are safe to call from any thread.
pub struct Session {
    id: Uuid,
    inner: Mutex<Inner>,
}

impl Session {
    /// Create an unconnected session with an empty queue.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            inner: Mutex::new(Inner {
                state: SessionState::Unconnected,
                pending: VecDeque::new(),
                link: None,
                attempt: 0,
                subscribed: false,
            }),
        }
    }

    /// Identifier attached to this session's log records.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// The handshake flag.
    pub fn is_handshake_complete(&self) -> bool {
        self.state() == SessionState::HandshakeComplete
    }

    /// Number of messages waiting for the handshake.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of connection attempts started so far.
    pub fn attempt(&self) -> u64 {
        self.lock().attempt
    }

    /// Returns `true` while a periodic [`GetOrSubscribeState`] subscription
    /// has been requested on the current connection.
    ///
    /// [`GetOrSubscribeState`]: crate::protocol::GetOrSubscribeState
    pub fn is_subscribed(&self) -> bool {
        self.lock().subscribed
    }

    /// Start a connection attempt: `Unconnected` → `Connecting`.
    ///
    /// Returns the attempt number and the receiving end of the outbound
    /// link, to be handed to the transport loop.
    ///
    /// # Errors
    ///
    /// [`RankMatcherError::SessionClosed`] after shutdown, or
    /// [`RankMatcherError::AlreadyConnected`] if an attempt is already under
    /// way or live.
    pub fn begin_connecting(&self) -> Result<(u64, mpsc::UnboundedReceiver<Outbound>)> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Unconnected => {}
            SessionState::ShutDown => return Err(RankMatcherError::SessionClosed),
            SessionState::Connecting | SessionState::HandshakeComplete => {
                return Err(RankMatcherError::AlreadyConnected);
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.attempt += 1;
        inner.state = SessionState::Connecting;
        inner.link = Some(tx);
        debug!(session_id = %self.id, attempt = inner.attempt, "session connecting");
        Ok((inner.attempt, rx))
    }

    /// Give up on the current attempt: `Connecting` → `Unconnected`.
    ///
    /// Queued messages are kept for the next attempt.
    pub fn abort_connecting(&self) {
        let mut inner = self.lock();
        if inner.state == SessionState::Connecting {
            inner.state = SessionState::Unconnected;
            inner.link = None;
            debug!(session_id = %self.id, attempt = inner.attempt, "connection attempt aborted");
        }
    }

    /// Mark the handshake complete and flush the pending queue.
    ///
    /// Idempotent: only the first call in a connection attempt drains the
    /// queue; later calls (and calls outside `Connecting`) do nothing.
    /// Returns the number of messages drained.
    ///
    /// # Errors
    ///
    /// [`RankMatcherError::SessionClosed`] if the session was shut down while
    /// the handshake was in flight.
    pub fn on_handshake_complete(&self) -> Result<usize> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Connecting => {}
            SessionState::ShutDown => return Err(RankMatcherError::SessionClosed),
            SessionState::Unconnected | SessionState::HandshakeComplete => {
                debug!(
                    session_id = %self.id,
                    state = ?inner.state,
                    "handshake completion ignored"
                );
                return Ok(0);
            }
        }
        // Flag first: every later send bypasses the queue.
        inner.state = SessionState::HandshakeComplete;

        let Inner { pending, link, .. } = &mut *inner;
        let drained = pending.len();
        while let Some(outbound) = pending.pop_front() {
            forward(link.as_ref(), outbound);
        }
        debug!(session_id = %self.id, drained, "handshake complete");
        Ok(drained)
    }

    /// Queue or forward `message` and return a handle to its outcome.
    ///
    /// Never blocks. Before the handshake the handle resolves immediately to
    /// [`Delivery::Queued`]; afterwards it resolves once the transport loop
    /// has written the frame.
    pub fn send_async(&self, message: &Message) -> SendHandle {
        let message_type = message.message_type();
        let frame = message.encode();

        let mut inner = self.lock();
        if inner.state != SessionState::ShutDown {
            if let Message::GetOrSubscribeState(request) = message {
                inner.subscribed = !request.is_one_shot();
            }
        }
        match inner.state {
            SessionState::ShutDown => SendHandle::ready(Err(RankMatcherError::SessionClosed)),
            SessionState::Unconnected | SessionState::Connecting => {
                inner.pending.push_back(Outbound {
                    message_type,
                    frame,
                    reply: None,
                });
                SendHandle::ready(Ok(Delivery::Queued))
            }
            SessionState::HandshakeComplete => {
                let (reply, handle) = SendHandle::pending();
                forward(
                    inner.link.as_ref(),
                    Outbound {
                        message_type,
                        frame,
                        reply: Some(reply),
                    },
                );
                handle
            }
        }
    }

    /// Send `message` and wait until the transport has accepted it (or it
    /// was queued).
    ///
    /// # Errors
    ///
    /// [`RankMatcherError::SessionClosed`] after shutdown, or the transport
    /// error that failed the write.
    pub async fn send(&self, message: &Message) -> Result<Delivery> {
        self.send_async(message).await
    }

    /// Like [`send`](Session::send), for threads outside the async runtime.
    ///
    /// # Errors
    ///
    /// See [`send`](Session::send).
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn send_blocking(&self, message: &Message) -> Result<Delivery> {
        self.send_async(message).wait_blocking()
    }

    /// The transport for `attempt` went away.
    ///
    /// Returns to `Unconnected` so a new attempt can start. Reports from a
    /// superseded attempt are ignored. Returns `true` if the state changed.
    pub fn connection_lost(&self, attempt: u64) -> bool {
        let mut inner = self.lock();
        let live = matches!(
            inner.state,
            SessionState::Connecting | SessionState::HandshakeComplete
        );
        if !live || inner.attempt != attempt {
            return false;
        }
        inner.state = SessionState::Unconnected;
        inner.link = None;
        // The server forgets subscriptions along with the connection.
        inner.subscribed = false;
        debug!(session_id = %self.id, attempt, "connection lost");
        true
    }

    /// Enter the terminal `ShutDown` state.
    ///
    /// Releases the outbound link, so the transport loop finishes the writes
    /// it already accepted and then closes the transport. Messages still
    /// waiting for a handshake are discarded; their count is returned.
    pub fn shutdown(&self) -> usize {
        let mut inner = self.lock();
        inner.state = SessionState::ShutDown;
        inner.link = None;
        let discarded = inner.pending.len();
        inner.pending.clear();
        if discarded > 0 {
            warn!(
                session_id = %self.id,
                discarded,
                "discarding messages queued before handshake"
            );
        }
        debug!(session_id = %self.id, "session shut down");
        discarded
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Nothing panics while holding this lock, but never propagate poison.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("pending", &inner.pending.len())
            .field("attempt", &inner.attempt)
            .finish()
    }
}

/// Put `outbound` on the link, failing its handle if the loop is gone.
fn forward(link: Option<&mpsc::UnboundedSender<Outbound>>, outbound: Outbound) {
    match link {
        Some(link) => {
            if let Err(mpsc::error::SendError(outbound)) = link.send(outbound) {
                outbound.settle(Err(RankMatcherError::TransportClosed));
            }
        }
        None => outbound.settle(Err(RankMatcherError::TransportClosed)),
    }
}

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
    use crate::protocol::{AddArena, GetOrSubscribeState, RemoveArena};
    use std::sync::Arc;

    fn arena(name: &str) -> Message {
        Message::AddArena(AddArena {
            arena: name.into(),
            num_players: 2,
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(outbound) = rx.try_recv() {
            frames.push(outbound.frame);
        }
        frames
    }

    #[test]
    fn new_session_is_unconnected() {
        let session = Session::new();
        assert_eq!(session.state(), SessionState::Unconnected);
        assert!(!session.is_handshake_complete());
        assert_eq!(session.pending_len(), 0);
    }

    #[tokio::test]
    async fn sends_before_handshake_are_queued() {
        let session = Session::new();
        let delivery = session.send(&arena("a")).await.unwrap();
        assert_eq!(delivery, Delivery::Queued);

        let (_attempt, _rx) = session.begin_connecting().unwrap();
        let delivery = session.send(&arena("b")).await.unwrap();
        assert_eq!(delivery, Delivery::Queued);
        assert_eq!(session.pending_len(), 2);
    }

    #[test]
    fn queue_drains_in_order_before_later_sends() {
        let session = Session::new();
        let (_attempt, mut rx) = session.begin_connecting().unwrap();
        for name in ["A", "B", "C"] {
            let mut handle = session.send_async(&arena(name));
            assert!(matches!(handle.try_result(), Some(Ok(Delivery::Queued))));
        }

        assert_eq!(session.on_handshake_complete().unwrap(), 3);
        let _d = session.send_async(&arena("D"));

        let expected: Vec<String> = ["A", "B", "C", "D"]
            .iter()
            .map(|name| arena(name).encode())
            .collect();
        assert_eq!(drain(&mut rx), expected);
    }

    #[test]
    fn handshake_completion_is_idempotent() {
        let session = Session::new();
        let (_attempt, mut rx) = session.begin_connecting().unwrap();
        let _ = session.send_async(&arena("A"));

        assert_eq!(session.on_handshake_complete().unwrap(), 1);
        assert_eq!(session.on_handshake_complete().unwrap(), 0);
        assert_eq!(drain(&mut rx).len(), 1);
        assert!(session.is_handshake_complete());
    }

    #[test]
    fn handshake_outside_connecting_is_ignored() {
        let session = Session::new();
        let _ = session.send_async(&arena("A"));
        assert_eq!(session.on_handshake_complete().unwrap(), 0);
        assert_eq!(session.state(), SessionState::Unconnected);
        assert_eq!(session.pending_len(), 1);
    }

    #[test]
    fn second_connect_is_rejected() {
        let session = Session::new();
        let _link = session.begin_connecting().unwrap();
        assert!(matches!(
            session.begin_connecting(),
            Err(RankMatcherError::AlreadyConnected)
        ));
    }

    #[test]
    fn abort_keeps_queue_for_retry() {
        let session = Session::new();
        let (first, _rx) = session.begin_connecting().unwrap();
        let _ = session.send_async(&arena("A"));
        session.abort_connecting();
        assert_eq!(session.state(), SessionState::Unconnected);
        assert_eq!(session.pending_len(), 1);

        let (second, mut rx) = session.begin_connecting().unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(session.attempt(), second);
        session.on_handshake_complete().unwrap();
        assert_eq!(drain(&mut rx), vec![arena("A").encode()]);
    }

    #[test]
    fn handshake_after_shutdown_is_refused() {
        let session = Session::new();
        let (_attempt, mut rx) = session.begin_connecting().unwrap();
        let _ = session.send_async(&arena("A"));
        assert_eq!(session.shutdown(), 1);

        assert!(matches!(
            session.on_handshake_complete(),
            Err(RankMatcherError::SessionClosed)
        ));
        assert_eq!(session.state(), SessionState::ShutDown);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn state_subscription_is_tracked_per_connection() {
        let session = Session::new();
        let (attempt, _rx) = session.begin_connecting().unwrap();
        session.on_handshake_complete().unwrap();
        assert!(!session.is_subscribed());

        let _ = session.send_async(&GetOrSubscribeState { period: 5 }.into());
        assert!(session.is_subscribed());
        let _ = session.send_async(&GetOrSubscribeState { period: 0 }.into());
        assert!(!session.is_subscribed());

        let _ = session.send_async(&GetOrSubscribeState { period: 5 }.into());
        assert!(session.connection_lost(attempt));
        assert!(!session.is_subscribed());

        // A subscription queued for the next connection counts.
        let _ = session.send_async(&GetOrSubscribeState { period: 5 }.into());
        assert!(session.is_subscribed());
    }

    #[tokio::test]
    async fn live_send_resolves_when_loop_settles() {
        let session = Session::new();
        let (_attempt, mut rx) = session.begin_connecting().unwrap();
        session.on_handshake_complete().unwrap();

        let mut handle = session.send_async(&arena("A"));
        assert!(handle.try_result().is_none());

        let outbound = rx.recv().await.unwrap();
        outbound.settle(Ok(Delivery::Written));
        assert_eq!(handle.await.unwrap(), Delivery::Written);
    }

    #[test]
    fn handle_stays_pending_until_settled() {
        let session = Session::new();
        let (_attempt, mut rx) = session.begin_connecting().unwrap();
        session.on_handshake_complete().unwrap();

        let mut handle = tokio_test::task::spawn(session.send_async(&arena("A")));
        tokio_test::assert_pending!(handle.poll());

        let outbound = rx.try_recv().unwrap();
        outbound.settle(Ok(Delivery::Written));
        assert!(handle.is_woken());
        let result = tokio_test::assert_ready!(handle.poll());
        assert!(matches!(result, Ok(Delivery::Written)));
    }

    #[tokio::test]
    async fn dropped_link_fails_pending_handles() {
        let session = Session::new();
        let (_attempt, rx) = session.begin_connecting().unwrap();
        session.on_handshake_complete().unwrap();
        drop(rx);

        let result = session.send(&arena("A")).await;
        assert!(matches!(result, Err(RankMatcherError::TransportClosed)));
    }

    #[tokio::test]
    async fn send_after_shutdown_is_rejected() {
        let session = Session::new();
        let _ = session.send_async(&arena("A"));
        assert_eq!(session.shutdown(), 1);

        let result = session.send(&arena("B")).await;
        assert!(matches!(result, Err(RankMatcherError::SessionClosed)));
        assert!(matches!(
            session.begin_connecting(),
            Err(RankMatcherError::SessionClosed)
        ));
    }

    #[test]
    fn stale_connection_loss_is_ignored() {
        let session = Session::new();
        let (first, _rx) = session.begin_connecting().unwrap();
        session.on_handshake_complete().unwrap();
        assert!(session.connection_lost(first));

        let (second, _rx) = session.begin_connecting().unwrap();
        assert!(!session.connection_lost(first));
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.connection_lost(second));
    }

    #[test]
    fn blocking_send_from_plain_thread() {
        let session = Session::new();
        let delivery = std::thread::spawn(move || {
            session.send_blocking(&Message::RemoveArena(RemoveArena {
                arena: "x".into(),
            }))
        })
        .join()
        .unwrap()
        .unwrap();
        assert_eq!(delivery, Delivery::Queued);
    }

    #[test]
    fn concurrent_senders_race_with_handshake_without_loss() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 200;

        let session = Arc::new(Session::new());
        let (_attempt, mut rx) = session.begin_connecting().unwrap();

        let mut workers = Vec::new();
        for t in 0..THREADS {
            let session = Arc::clone(&session);
            workers.push(std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let _ = session.send_async(&arena(&format!("{t}-{i}")));
                }
            }));
        }
        let completer = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || session.on_handshake_complete().unwrap())
        };
        for worker in workers {
            worker.join().unwrap();
        }
        completer.join().unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), THREADS * PER_THREAD);

        // Each thread's messages arrive exactly once and in issue order.
        for t in 0..THREADS {
            let own: Vec<&String> = frames
                .iter()
                .filter(|f| f.contains(&format!(",{t}-")))
                .collect();
            let expected: Vec<String> = (0..PER_THREAD)
                .map(|i| arena(&format!("{t}-{i}")).encode())
                .collect();
            assert_eq!(own.len(), PER_THREAD);
            for (got, want) in own.iter().zip(expected.iter()) {
                assert_eq!(*got, want);
            }
        }
    }
}
