#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Integration-style client tests for the Rank Matcher client.
//!
//! Uses the shared `MockConnector`/`MockTransport` from `tests/common` to
//! drive `RankMatcherClient` through connection setup, queue draining,
//! dispatch, disconnects and shutdown.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rank_matcher_client::protocol::{AddArena, MatchSuccess};
use rank_matcher_client::{
    AddPlayerParams, DecodeError, Delivery, Message, MessageType, RankMatcherClient,
    RankMatcherConfig, RankMatcherError, SessionState,
};

use common::{
    connection_state, eventually, format_error, match_failure, match_success, Attempt,
    MockConnector, MockTransport,
};

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

fn client() -> Arc<RankMatcherClient> {
    Arc::new(RankMatcherClient::new(RankMatcherConfig::default()))
}

fn arena_frame(name: &str) -> String {
    Message::from(AddArena {
        arena: name.into(),
        num_players: 2,
    })
    .encode()
}

/// Record every `MatchSuccess` the client dispatches.
fn record_matches(client: &RankMatcherClient) -> Arc<StdMutex<Vec<MatchSuccess>>> {
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client.on_match_success(move |m| sink.lock().unwrap().push(m.clone()));
    seen
}

// ════════════════════════════════════════════════════════════════════
// Handshake and queue ordering
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn commands_before_handshake_precede_later_commands() {
    let client = client();
    let (transport, mut peer) = MockTransport::gated();
    let connector = Arc::new(MockConnector::new(vec![Attempt::Transport(transport)]));

    let connecting = {
        let client = Arc::clone(&client);
        let connector = Arc::clone(&connector);
        tokio::spawn(async move { client.connect(connector.as_ref()).await })
    };
    eventually(|| client.state() == SessionState::Connecting).await;

    for name in ["A", "B", "C"] {
        assert_eq!(
            client.add_arena(name, 2).await.unwrap(),
            Delivery::Queued
        );
    }
    assert_eq!(client.pending_len(), 3);
    assert!(peer.sent().is_empty());

    peer.complete_handshake(Ok(()));
    connecting.await.unwrap().unwrap();
    assert!(client.is_connected());

    assert_eq!(client.add_arena("D", 2).await.unwrap(), Delivery::Written);
    let sent = peer.wait_for_sent(4).await;
    assert_eq!(
        sent,
        vec![
            arena_frame("A"),
            arena_frame("B"),
            arena_frame("C"),
            arena_frame("D")
        ]
    );
}

#[tokio::test]
async fn commands_issued_while_unconnected_are_kept() {
    let client = client();
    client.add_arena("lobby1", 4);
    client.add_player(AddPlayerParams::new("lobby1", "alice", 1200));
    assert_eq!(client.state(), SessionState::Unconnected);
    assert_eq!(client.pending_len(), 2);

    let (connector, peer) = MockConnector::single();
    client.connect(&connector).await.unwrap();

    let sent = peer.wait_for_sent(2).await;
    assert_eq!(sent[0], "1,1,6,lobby1,4");
    assert_eq!(sent[1], "1,3,6,lobby1,5,alice,1200,1,0,1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_senders_during_handshake_lose_nothing() {
    let client = client();
    let (transport, mut peer) = MockTransport::gated();
    let connector = Arc::new(MockConnector::new(vec![Attempt::Transport(transport)]));
    let connecting = {
        let client = Arc::clone(&client);
        let connector = Arc::clone(&connector);
        tokio::spawn(async move { client.connect(connector.as_ref()).await })
    };
    eventually(|| client.state() == SessionState::Connecting).await;

    let mut senders = Vec::new();
    for t in 0..4 {
        let client = Arc::clone(&client);
        senders.push(std::thread::spawn(move || {
            for i in 0..50 {
                client
                    .send_blocking(AddArena {
                        arena: format!("t{t}-{i}"),
                        num_players: 2,
                    })
                    .unwrap();
            }
        }));
    }
    peer.complete_handshake(Ok(()));
    for sender in senders {
        sender.join().unwrap();
    }
    connecting.await.unwrap().unwrap();

    let sent = peer.wait_for_sent(200).await;
    assert_eq!(sent.len(), 200);
    for t in 0..4 {
        let own: Vec<&String> = sent
            .iter()
            .filter(|f| f.contains(&format!(",t{t}-")))
            .collect();
        let expected: Vec<String> = (0..50).map(|i| arena_frame(&format!("t{t}-{i}"))).collect();
        assert_eq!(own.len(), 50);
        for (got, want) in own.into_iter().zip(&expected) {
            assert_eq!(got, want);
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// Connection setup failures
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn connect_times_out_and_can_be_retried() {
    let client = RankMatcherClient::new(
        RankMatcherConfig::default().with_connect_timeout(Duration::from_millis(50)),
    );
    client.add_arena("lobby1", 2);

    let connector = MockConnector::new(vec![Attempt::Hang]);
    let err = client.connect(&connector).await.unwrap_err();
    assert!(matches!(err, RankMatcherError::ConnectTimeout));
    assert_eq!(client.state(), SessionState::Unconnected);
    assert_eq!(client.pending_len(), 1);

    let (transport, peer) = MockTransport::new();
    connector.push(Attempt::Transport(transport));
    client.connect(&connector).await.unwrap();
    assert_eq!(peer.wait_for_sent(1).await, vec!["1,1,6,lobby1,2"]);
}

#[tokio::test]
async fn stalled_handshake_times_out() {
    let client = RankMatcherClient::new(
        RankMatcherConfig::default().with_connect_timeout(Duration::from_millis(50)),
    );
    let (transport, peer) = MockTransport::gated();
    let connector = MockConnector::new(vec![Attempt::Transport(transport)]);

    let err = client.connect(&connector).await.unwrap_err();
    assert!(matches!(err, RankMatcherError::ConnectTimeout));
    assert!(peer.is_closed());
    assert_eq!(client.state(), SessionState::Unconnected);
}

#[tokio::test]
async fn failed_handshake_reports_error() {
    let client = client();
    let (transport, mut peer) = MockTransport::gated();
    peer.complete_handshake(Err(RankMatcherError::TransportReceive("rejected".into())));
    let connector = MockConnector::new(vec![Attempt::Transport(transport)]);

    let err = client.connect(&connector).await.unwrap_err();
    assert!(matches!(err, RankMatcherError::TransportReceive(_)));
    assert_eq!(client.state(), SessionState::Unconnected);
}

#[tokio::test]
async fn refused_connection_is_an_io_error() {
    let client = client();
    let connector = MockConnector::new(vec![Attempt::Fail(RankMatcherError::Io(
        std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
    ))]);
    let err = client.connect(&connector).await.unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn second_connect_is_rejected_while_live() {
    let client = client();
    let (connector, _peer) = MockConnector::single();
    client.connect(&connector).await.unwrap();

    let err = client.connect(&connector).await.unwrap_err();
    assert!(matches!(err, RankMatcherError::AlreadyConnected));
}

// ════════════════════════════════════════════════════════════════════
// Dispatch
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn match_success_handler_runs_once_per_frame() {
    let client = client();
    let seen = record_matches(&client);
    let (connector, peer) = MockConnector::single();
    client.connect(&connector).await.unwrap();

    peer.push("1,7,6,lobby1,42,2,5,alice,1,3,bob,2");
    peer.push_message(match_success("lobby2", 43, &[("carol", 1)]));
    eventually(|| seen.lock().unwrap().len() == 2).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0], match_success("lobby1", 42, &[("alice", 1), ("bob", 2)]));
    assert_eq!(seen[1].stage_request_id, 43);
}

#[tokio::test]
async fn truncated_frame_is_not_dispatched() {
    let client = client();
    let seen = record_matches(&client);
    let errors = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    client.on_decode_error(move |err, frame| {
        sink.lock().unwrap().push((err.clone(), frame.to_string()));
    });

    let (connector, peer) = MockConnector::single();
    client.connect(&connector).await.unwrap();

    peer.push("1,7,6,lobby1,42,1,50,alice,1");
    peer.push("1,7,6,lobby1,43,0");
    eventually(|| seen.lock().unwrap().len() == 1).await;

    // Only the intact frame reached the handler; the connection stayed up.
    assert_eq!(seen.lock().unwrap()[0].stage_request_id, 43);
    assert!(client.is_connected());
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors[0].0,
        DecodeError::TruncatedString { declared: 50, .. }
    ));
}

#[tokio::test]
async fn version_and_tag_errors_reach_decode_sink() {
    let client = client();
    let errors = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    client.on_decode_error(move |err, _| sink.lock().unwrap().push(err.clone()));

    let (connector, peer) = MockConnector::single();
    client.connect(&connector).await.unwrap();
    peer.push("2,7,0,,0,0");
    peer.push("1,77");

    eventually(|| errors.lock().unwrap().len() == 2).await;
    assert_eq!(
        *errors.lock().unwrap(),
        vec![
            DecodeError::UnsupportedVersion(2),
            DecodeError::UnknownMessageType(77)
        ]
    );
}

#[tokio::test]
async fn typed_handlers_receive_their_events() {
    let client = client();
    let states = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(StdMutex::new(Vec::new()));
    let rejections = Arc::new(StdMutex::new(Vec::new()));
    {
        let states = Arc::clone(&states);
        client.on_connection_state(move |s| {
            assert_eq!(s.players_in("lobby1").collect::<Vec<_>>(), vec!["bob"]);
            states.fetch_add(1, Ordering::SeqCst);
        });
        let failures = Arc::clone(&failures);
        client.on_match_failure(move |f| failures.lock().unwrap().push(f.code()));
        let rejections = Arc::clone(&rejections);
        client.on_format_error(move |e| rejections.lock().unwrap().push(e.message.clone()));
    }

    let (connector, peer) = MockConnector::single();
    client.connect(&connector).await.unwrap();
    peer.push("1,6,1,3,bob,6,lobby1,2");
    peer.push_message(match_failure("lobby1", 9000, &[("bob", 1)]));
    peer.push_message(format_error("1,3,bad"));

    eventually(|| rejections.lock().unwrap().len() == 1).await;
    assert_eq!(states.load(Ordering::SeqCst), 1);
    assert_eq!(
        *failures.lock().unwrap(),
        vec![rank_matcher_client::MatchFailureCode::InvalidStageResponse]
    );
    assert_eq!(*rejections.lock().unwrap(), vec!["1,3,bad".to_string()]);
}

#[tokio::test]
async fn panicking_handler_does_not_stop_the_loop() {
    let client = client();
    client.on_message(MessageType::ConnectionState, |_| panic!("handler bug"));
    let seen = record_matches(&client);

    let (connector, peer) = MockConnector::single();
    client.connect(&connector).await.unwrap();
    peer.push_message(connection_state(&[("bob", "lobby1", 0)]));
    peer.push_message(match_success("lobby1", 1, &[]));

    eventually(|| seen.lock().unwrap().len() == 1).await;
    assert!(client.is_connected());
}

#[tokio::test]
async fn unhandled_messages_are_ignored() {
    let client = client();
    let seen = record_matches(&client);
    let (connector, peer) = MockConnector::single();
    client.connect(&connector).await.unwrap();

    peer.push_message(format_error("nobody listens"));
    peer.push_message(match_success("lobby1", 9, &[]));
    eventually(|| seen.lock().unwrap().len() == 1).await;
}

// ════════════════════════════════════════════════════════════════════
// Disconnect and shutdown
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn server_hang_up_allows_reconnect() {
    let client = client();
    let reasons = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    client.on_disconnected(move |r| sink.lock().unwrap().push(r.map(str::to_string)));

    let (connector, peer) = MockConnector::single();
    client.connect(&connector).await.unwrap();
    peer.hang_up();
    eventually(|| client.state() == SessionState::Unconnected).await;
    eventually(|| reasons.lock().unwrap().len() == 1).await;
    assert_eq!(reasons.lock().unwrap()[0], None);

    // Commands issued while disconnected wait for the next handshake.
    assert_eq!(client.remove_arena("lobby1").await.unwrap(), Delivery::Queued);

    let (transport, second) = MockTransport::new();
    connector.push(Attempt::Transport(transport));
    client.connect(&connector).await.unwrap();
    assert_eq!(second.wait_for_sent(1).await, vec!["1,2,6,lobby1"]);
}

#[tokio::test]
async fn receive_error_reports_reason() {
    let client = client();
    let reasons = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    client.on_disconnected(move |r| sink.lock().unwrap().push(r.map(str::to_string)));

    let (connector, peer) = MockConnector::single();
    client.connect(&connector).await.unwrap();
    peer.fail("connection reset");

    eventually(|| reasons.lock().unwrap().len() == 1).await;
    let reason = reasons.lock().unwrap()[0].clone().unwrap();
    assert!(reason.contains("connection reset"), "{reason}");
    assert!(!client.is_connected());
}

#[tokio::test]
async fn shutdown_flushes_accepted_writes_then_closes() {
    let client = client();
    let (connector, peer) = MockConnector::single();
    client.connect(&connector).await.unwrap();

    let handles: Vec<_> = (0..10)
        .map(|i| client.add_arena(format!("a{i}"), 2))
        .collect();
    assert!(client.shutdown().await);

    assert_eq!(peer.sent().len(), 10);
    assert!(peer.is_closed());
    for handle in handles {
        assert_eq!(handle.await.unwrap(), Delivery::Written);
    }
}

#[tokio::test]
async fn commands_after_shutdown_fail() {
    let client = client();
    client.add_arena("never-sent", 2);
    assert!(client.shutdown().await);
    assert_eq!(client.pending_len(), 0);
    assert_eq!(client.state(), SessionState::ShutDown);

    let err = client.add_arena("lobby1", 2).await.unwrap_err();
    assert!(matches!(err, RankMatcherError::SessionClosed));
    let (connector, _peer) = MockConnector::single();
    assert!(matches!(
        client.connect(&connector).await,
        Err(RankMatcherError::SessionClosed)
    ));
}

#[tokio::test]
async fn shutdown_runs_disconnect_hook() {
    let client = client();
    let reasons = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    client.on_disconnected(move |r| sink.lock().unwrap().push(r.map(str::to_string)));

    let (connector, _peer) = MockConnector::single();
    client.connect(&connector).await.unwrap();
    client.shutdown().await;

    assert_eq!(
        *reasons.lock().unwrap(),
        vec![Some("client shut down".to_string())]
    );
}

#[tokio::test]
async fn dropping_client_stops_loop() {
    let (connector, peer) = MockConnector::single();
    {
        let client = RankMatcherClient::default();
        client.connect(&connector).await.unwrap();
    }
    // The aborted loop drops its transport; nothing is written afterwards.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(peer.sent().is_empty());
}

#[tokio::test]
async fn shutdown_during_handshake_cancels_connect() {
    let client = client();
    let (transport, mut peer) = MockTransport::gated();
    let connector = Arc::new(MockConnector::new(vec![Attempt::Transport(transport)]));
    client.add_arena("lobby1", 2);

    let connecting = {
        let client = Arc::clone(&client);
        let connector = Arc::clone(&connector);
        tokio::spawn(async move { client.connect(connector.as_ref()).await })
    };
    eventually(|| client.state() == SessionState::Connecting).await;

    let clean = tokio::time::timeout(Duration::from_millis(500), client.shutdown())
        .await
        .expect("shutdown waited for the connect timeout");
    assert!(clean);
    assert!(matches!(
        connecting.await.unwrap(),
        Err(RankMatcherError::SessionClosed)
    ));

    peer.complete_handshake(Ok(()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.state(), SessionState::ShutDown);
    assert!(peer.sent().is_empty());
}

// ════════════════════════════════════════════════════════════════════
// Transport failures inside the loop
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn send_failure_drops_connection() {
    let client = client();
    let reasons = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    client.on_disconnected(move |r| sink.lock().unwrap().push(r.map(str::to_string)));

    let (connector, peer) = MockConnector::single();
    client.connect(&connector).await.unwrap();
    peer.break_sends();

    let err = client.add_arena("lobby1", 2).await.unwrap_err();
    assert!(matches!(err, RankMatcherError::TransportSend(_)), "{err:?}");
    eventually(|| client.state() == SessionState::Unconnected).await;
    eventually(|| reasons.lock().unwrap().len() == 1).await;
    let reason = reasons.lock().unwrap()[0].clone().unwrap();
    assert!(reason.contains("broken pipe"), "{reason}");
}

#[tokio::test]
async fn transport_panic_returns_session_to_unconnected() {
    let client = client();
    let reasons = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    client.on_disconnected(move |r| sink.lock().unwrap().push(r.map(str::to_string)));

    let (connector, peer) = MockConnector::single();
    client.connect(&connector).await.unwrap();
    peer.crash();

    eventually(|| client.state() == SessionState::Unconnected).await;
    eventually(|| reasons.lock().unwrap().len() == 1).await;
    assert_eq!(
        reasons.lock().unwrap()[0].as_deref(),
        Some("transport loop terminated")
    );

    // The session is usable again: commands queue and a new connect works.
    assert_eq!(client.remove_arena("lobby1").await.unwrap(), Delivery::Queued);
    let (transport, second) = MockTransport::new();
    connector.push(Attempt::Transport(transport));
    client.connect(&connector).await.unwrap();
    assert_eq!(second.wait_for_sent(1).await, vec!["1,2,6,lobby1"]);
    assert!(client.is_connected());
}

// ════════════════════════════════════════════════════════════════════
// Timers
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn unbounded_connect_timeout_is_accepted() {
    let client = RankMatcherClient::new(
        RankMatcherConfig::default().with_connect_timeout(Duration::MAX),
    );
    let (connector, _peer) = MockConnector::single();
    client.connect(&connector).await.unwrap();
    assert!(client.is_connected());
}

#[tokio::test]
async fn huge_poll_interval_keeps_loop_alive() {
    let client = RankMatcherClient::new(
        RankMatcherConfig::default().with_state_poll_interval(Duration::MAX),
    );
    let (connector, peer) = MockConnector::single();
    client.connect(&connector).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(client.state(), SessionState::HandshakeComplete);
    assert_eq!(client.add_arena("lobby1", 2).await.unwrap(), Delivery::Written);
    assert_eq!(peer.sent(), vec![arena_frame("lobby1")]);
}

#[tokio::test]
async fn state_poll_stops_after_shutdown() {
    let client = RankMatcherClient::new(
        RankMatcherConfig::default().with_state_poll_interval(Duration::from_millis(10)),
    );
    let (connector, peer) = MockConnector::single();
    client.connect(&connector).await.unwrap();

    let polls = peer.wait_for_sent(2).await;
    assert!(polls.iter().all(|frame| frame == "1,5,0"), "{polls:?}");
    assert!(client.shutdown().await);

    let after_shutdown = peer.sent().len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(peer.sent().len(), after_shutdown);
}

#[tokio::test]
async fn state_poll_pauses_while_subscribed() {
    let client = RankMatcherClient::new(
        RankMatcherConfig::default().with_state_poll_interval(Duration::from_millis(20)),
    );
    let (connector, peer) = MockConnector::single();
    client.connect(&connector).await.unwrap();
    assert_eq!(
        client.get_or_subscribe_state(5).await.unwrap(),
        Delivery::Written
    );

    tokio::time::sleep(Duration::from_millis(70)).await;
    assert_eq!(peer.sent(), vec!["1,5,5"]);

    // A one-shot request ends the subscription and polling resumes.
    client.get_or_subscribe_state(0).await.unwrap();
    let sent = peer.wait_for_sent(3).await;
    assert_eq!(sent[0], "1,5,5");
    assert!(sent[1..].iter().all(|frame| frame == "1,5,0"), "{sent:?}");
}
