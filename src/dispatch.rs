//! Routing of decoded messages to application handlers.
//!
//! A [`Dispatcher`] holds at most one handler per [`MessageType`].
//! Registering a second handler for the same type replaces the first.
//! Messages whose type has no handler are dropped without error, since
//! applications usually only care about a subset of events.
//!
//! Handlers run synchronously on the task that decoded the frame (the
//! client's transport loop), so they must not block for long. A handler that
//! panics is isolated: the panic is logged and the next frame is processed
//! normally.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error, warn};

use crate::error::DecodeError;
use crate::protocol::{Message, MessageType};

/// Handler invoked with each decoded message of its registered type.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync + 'static>;

/// Diagnostic sink for frames that failed to decode. Receives the error and
/// the raw frame.
pub type DecodeErrorHandler = Arc<dyn Fn(&DecodeError, &str) + Send + Sync + 'static>;

/// Invoked once when a live connection goes away, with the reason if any.
pub type DisconnectHandler = Arc<dyn Fn(Option<&str>) + Send + Sync + 'static>;

/// What happened to a message handed to [`Dispatcher::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The registered handler ran to completion.
    Delivered,
    /// No handler is registered for the message type.
    Unhandled,
    /// The handler panicked; the panic was caught and logged.
    HandlerPanicked,
}

/// Message-type keyed handler table.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<MessageType, Handler>>,
    decode_error: RwLock<Option<DecodeErrorHandler>>,
    disconnect: RwLock<Option<DisconnectHandler>>,
}

impl Dispatcher {
    /// Create a dispatcher with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous handler.
    ///
    /// Returns `true` if a handler was replaced.
    pub fn register<F>(&self, kind: MessageType, handler: F) -> bool
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, Arc::new(handler))
            .is_some();
        debug!(message_type = %kind, replaced, "handler registered");
        replaced
    }

    /// Remove the handler for `kind`. Returns `true` if one was registered.
    pub fn unregister(&self, kind: MessageType) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind)
            .is_some()
    }

    /// Returns `true` if a handler is registered for `kind`.
    pub fn is_registered(&self, kind: MessageType) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }

    /// Deliver `message` to the handler registered for its type.
    pub fn dispatch(&self, message: &Message) -> DispatchOutcome {
        let kind = message.message_type();
        // Clone the handler out so it runs without the lock held; a handler
        // may register or unregister handlers itself.
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned();

        let Some(handler) = handler else {
            debug!(message_type = %kind, "no handler registered, dropping message");
            return DispatchOutcome::Unhandled;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
            Ok(()) => DispatchOutcome::Delivered,
            Err(payload) => {
                error!(
                    message_type = %kind,
                    "message handler panicked: {}",
                    panic_message(payload.as_ref())
                );
                DispatchOutcome::HandlerPanicked
            }
        }
    }

    /// Install the sink that receives frame decode failures.
    pub fn set_decode_error_handler<F>(&self, handler: F)
    where
        F: Fn(&DecodeError, &str) + Send + Sync + 'static,
    {
        *self
            .decode_error
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Install the hook that runs when a live connection drops.
    pub fn set_disconnect_handler<F>(&self, handler: F)
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        *self
            .disconnect
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Report a frame that could not be decoded.
    pub fn report_decode_error(&self, err: &DecodeError, frame: &str) {
        warn!(error = %err, frame_len = frame.len(), "dropping undecodable frame");
        let sink = self
            .decode_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(sink) = sink {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| sink(err, frame))) {
                error!(
                    "decode error handler panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    /// Report that the connection went away.
    pub fn report_disconnect(&self, reason: Option<&str>) {
        let hook = self
            .disconnect
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(reason))) {
                error!(
                    "disconnect handler panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut registered: Vec<MessageType> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        registered.sort();
        f.debug_struct("Dispatcher")
            .field("registered", &registered)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&'static str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.as_str()
    } else {
        "<non-string panic payload>"
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
    use crate::protocol::{FormatError, MatchSuccess, TeamEntry};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn match_success() -> Message {
        Message::MatchSuccess(MatchSuccess {
            arena: "lobby1".into(),
            stage_request_id: 7,
            players: vec![TeamEntry::new("bob", 1)],
        })
    }

    #[test]
    fn delivers_to_registered_handler() {
        let dispatcher = Dispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        dispatcher.register(MessageType::MatchSuccess, move |msg| {
            assert!(matches!(msg, Message::MatchSuccess(_)));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(
            dispatcher.dispatch(&match_success()),
            DispatchOutcome::Delivered
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregistered_type_is_dropped() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(MessageType::FormatError, |_| panic!("wrong handler"));
        assert_eq!(
            dispatcher.dispatch(&match_success()),
            DispatchOutcome::Unhandled
        );
    }

    #[test]
    fn last_registration_wins() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let first = Arc::clone(&log);
        assert!(!dispatcher.register(MessageType::MatchSuccess, move |_| {
            first.lock().unwrap().push("first");
        }));
        let second = Arc::clone(&log);
        assert!(dispatcher.register(MessageType::MatchSuccess, move |_| {
            second.lock().unwrap().push("second");
        }));

        dispatcher.dispatch(&match_success());
        assert_eq!(*log.lock().unwrap(), vec!["second"]);
    }

    #[test]
    fn panicking_handler_is_isolated() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(MessageType::MatchSuccess, |_| panic!("boom"));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        dispatcher.register(MessageType::FormatError, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(
            dispatcher.dispatch(&match_success()),
            DispatchOutcome::HandlerPanicked
        );
        let format_error = Message::FormatError(FormatError {
            message: "bad".into(),
        });
        assert_eq!(
            dispatcher.dispatch(&format_error),
            DispatchOutcome::Delivered
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_reregister_itself() {
        let dispatcher = Arc::new(Dispatcher::new());
        let inner = Arc::clone(&dispatcher);
        dispatcher.register(MessageType::MatchSuccess, move |_| {
            inner.unregister(MessageType::MatchSuccess);
        });
        assert_eq!(
            dispatcher.dispatch(&match_success()),
            DispatchOutcome::Delivered
        );
        assert!(!dispatcher.is_registered(MessageType::MatchSuccess));
    }

    #[test]
    fn decode_errors_reach_sink() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(StdMutex::new(None));
        let sink = Arc::clone(&seen);
        dispatcher.set_decode_error_handler(move |err, frame| {
            *sink.lock().unwrap() = Some((err.clone(), frame.to_string()));
        });

        dispatcher.report_decode_error(&DecodeError::UnsupportedVersion(3), "3,1");
        let (err, frame) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(err, DecodeError::UnsupportedVersion(3));
        assert_eq!(frame, "3,1");
    }

    #[test]
    fn debug_lists_registered_types() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(MessageType::MatchFailure, |_| {});
        let text = format!("{dispatcher:?}");
        assert!(text.contains("MatchFailure"));
    }
}
