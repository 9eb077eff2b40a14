//! End-to-end session behaviour against the in-memory broker.

use std::{collections::HashSet, sync::Arc, time::Duration};

use serde_json::Value;
use sessionbus_core::{
    ClientSettings, DeadLetterOptions, Error, HandleState, Message, MessageRef, Properties,
    ReceiveMode, StaticTokenProvider,
    message::{DEAD_LETTER_ERROR_DESCRIPTION, DEAD_LETTER_REASON},
};
use sessionbus_session::{
    BrokerConfig, EntityDescription, Fault, InMemoryBroker, MessageSession, SessionAcceptor,
};

const QUEUE: &str = "orders";

fn settings(token: &str) -> ClientSettings {
    ClientSettings::new(Arc::new(StaticTokenProvider::new(token)))
        .with_operation_timeout(Duration::from_secs(10))
}

fn acceptor(broker: &InMemoryBroker) -> SessionAcceptor {
    SessionAcceptor::new(Arc::new(broker.clone()), settings("sig"))
}

fn setup() -> (InMemoryBroker, SessionAcceptor) {
    setup_with(BrokerConfig::default())
}

fn setup_with(config: BrokerConfig) -> (InMemoryBroker, SessionAcceptor) {
    let broker = InMemoryBroker::with_config(config);
    broker.create_entity(EntityDescription::queue(QUEUE)).unwrap();
    let acceptor = acceptor(&broker);
    (broker, acceptor)
}

fn send(broker: &InMemoryBroker, session_id: &str, body: &str) -> i64 {
    broker
        .send(QUEUE, Message::new(body.as_bytes()).with_session_id(session_id))
        .unwrap()
}

async fn accept(acceptor: &SessionAcceptor, session_id: &str, mode: ReceiveMode) -> MessageSession {
    acceptor
        .accept_session(QUEUE, Some(session_id), mode)
        .await
        .unwrap()
}

// Acceptance

#[tokio::test(start_paused = true)]
async fn test_accept_any_times_out_on_idle_entity() {
    let (broker, acceptor) = setup();

    let err = acceptor
        .accept_session_with_timeout(QUEUE, None, ReceiveMode::PeekLock, Duration::from_secs(10))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "Expected timeout, got {err:?}");
    assert_eq!(broker.active_message_count(QUEUE).unwrap(), 0);

    send(&broker, "s-1", "hello");
    let session = acceptor
        .accept_session_with_timeout(QUEUE, None, ReceiveMode::PeekLock, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(session.session_id(), "s-1");
    assert_eq!(session.state(), HandleState::Active);
    assert!(broker.is_session_locked(QUEUE, "s-1"));
}

#[tokio::test(start_paused = true)]
async fn test_grant_after_accept_timeout_is_released() {
    let (broker, acceptor) = setup();
    send(&broker, "s-1", "hello");

    broker.inject_fault(Fault::DelayResponse(Duration::from_secs(5)));
    let err = acceptor
        .accept_session_with_timeout(QUEUE, None, ReceiveMode::PeekLock, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "Expected timeout, got {err:?}");
    // The broker granted the lock; only the answer is late.
    assert!(broker.is_session_locked(QUEUE, "s-1"));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!broker.is_session_locked(QUEUE, "s-1"));

    let other = SessionAcceptor::new(Arc::new(broker.clone()), settings("sig"));
    let session = accept(&other, "s-1", ReceiveMode::PeekLock).await;
    let message = session.receive().await.unwrap().unwrap();
    assert_eq!(message.body, b"hello");
}

#[tokio::test(start_paused = true)]
async fn test_accept_any_waits_for_a_message() {
    let (broker, acceptor) = setup();

    let waiting = tokio::spawn({
        let acceptor = acceptor.clone();
        async move {
            acceptor
                .accept_session_with_timeout(QUEUE, None, ReceiveMode::PeekLock, Duration::from_secs(30))
                .await
        }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    send(&broker, "late", "hello");

    let session = waiting.await.unwrap().unwrap();
    assert_eq!(session.session_id(), "late");
}

#[tokio::test(start_paused = true)]
async fn test_accept_any_skips_locked_sessions() {
    let (broker, acceptor) = setup();
    send(&broker, "a", "1");
    send(&broker, "b", "2");

    let first = acceptor
        .accept_session(QUEUE, None, ReceiveMode::PeekLock)
        .await
        .unwrap();
    let second = acceptor
        .accept_session(QUEUE, None, ReceiveMode::PeekLock)
        .await
        .unwrap();
    assert_ne!(first.session_id(), second.session_id());
}

#[tokio::test]
async fn test_named_session_cannot_be_locked_twice() {
    let (_broker, acceptor) = setup();
    let other = acceptor.clone();

    let owner = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;
    let err = other
        .accept_session(QUEUE, Some("s-1"), ReceiveMode::PeekLock)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionCannotBeLocked { ref session_id } if session_id == "s-1"));

    owner.close().await;
    let session = accept(&other, "s-1", ReceiveMode::PeekLock).await;
    assert_eq!(session.session_id(), "s-1");
}

#[tokio::test]
async fn test_accept_reports_link_setup_failures() {
    let (broker, _) = setup();

    let err = acceptor(&broker)
        .accept_session("missing", Some("s-1"), ReceiveMode::PeekLock)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EntityNotFound(_)));

    let unauthorized = SessionAcceptor::new(Arc::new(broker.clone()), settings(""));
    let err = unauthorized
        .accept_session(QUEUE, Some("s-1"), ReceiveMode::PeekLock)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)));
}

#[tokio::test]
async fn test_subscription_sessions() {
    let broker = InMemoryBroker::new();
    broker.create_entity(EntityDescription::topic("events")).unwrap();
    broker
        .create_entity(EntityDescription::subscription("events", "audit"))
        .unwrap();
    broker
        .send("events", Message::new(b"fan-out".to_vec()).with_session_id("s-1"))
        .unwrap();

    let session = acceptor(&broker)
        .accept_session("events/subscriptions/audit", None, ReceiveMode::ReceiveAndDelete)
        .await
        .unwrap();
    let message = session
        .receive_with_wait(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.body, b"fan-out");
    assert_eq!(message.session_id, "s-1");
}

// Lock renewal

#[tokio::test(start_paused = true)]
async fn test_renewals_move_lock_forward() {
    let (_broker, acceptor) = setup();
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;
    let initial = session.locked_until();

    let first = session.renew_session_lock().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let second = session.renew_session_lock().await.unwrap();

    assert!(first > initial);
    assert!(second > first);
    assert_eq!(session.locked_until(), second);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_renewals() {
    let (_broker, acceptor) = setup();
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;

    let renewals = (0..5000).map(|_| {
        let session = session.clone();
        async move { session.renew_session_lock().await }
    });
    let results = futures::future::join_all(renewals).await;

    let expiries: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    let distinct: HashSet<_> = expiries.iter().collect();
    assert_eq!(distinct.len(), 5000);
    assert_eq!(session.locked_until(), *expiries.iter().max().unwrap());

    let blocking = session.clone();
    let after = tokio::task::spawn_blocking(move || blocking.renew_session_lock_blocking())
        .await
        .unwrap()
        .unwrap();
    assert!(after > *expiries.iter().max().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_renew_message_lock() {
    let (broker, acceptor) = setup();
    send(&broker, "s-1", "work");
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;

    let message = session.receive().await.unwrap().unwrap();
    let renewed = session.renew_message_lock(&message).await.unwrap();
    assert!(renewed > message.locked_until.unwrap());
    assert_eq!(session.locked_until(), renewed);

    session.complete(message.lock_token.unwrap()).await.unwrap();
    let err = session.renew_message_lock(&message).await.unwrap_err();
    assert!(matches!(err, Error::MessageLockLost { .. }));
    assert_eq!(session.state(), HandleState::Active);
}

#[tokio::test]
async fn test_auto_renew_keeps_lock_alive() {
    let (broker, acceptor) = setup_with(BrokerConfig {
        lock_duration: Duration::from_millis(600),
        ..BrokerConfig::default()
    });
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;
    let initial = session.locked_until();

    let guard = session.auto_renew(Duration::from_secs(5));
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(broker.is_session_locked(QUEUE, "s-1"));
    assert!(session.locked_until() > initial);
    assert_eq!(session.get_state().await.unwrap(), None);

    guard.stop().await;
}

// Session state

#[tokio::test(start_paused = true)]
async fn test_state_round_trip() {
    let (_broker, acceptor) = setup();
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;

    assert_eq!(session.get_state().await.unwrap(), None);

    let blob: Vec<u8> = (0..=255).collect();
    session.set_state(Some(&blob)).await.unwrap();
    assert_eq!(session.get_state().await.unwrap(), Some(blob.clone()));

    session.set_state(None).await.unwrap();
    assert_eq!(session.get_state().await.unwrap(), None);

    // State belongs to the session, not the handle.
    session.set_state(Some(b"checkpoint")).await.unwrap();
    session.close().await;
    let reopened = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;
    assert_eq!(reopened.get_state().await.unwrap().as_deref(), Some(&b"checkpoint"[..]));
}

#[tokio::test(start_paused = true)]
async fn test_oversized_state_is_rejected() {
    let (_broker, acceptor) = setup();
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;

    let max = BrokerConfig::default().max_state_bytes;
    session.set_state(Some(&vec![7; max])).await.unwrap();

    let err = session.set_state(Some(&vec![7; max + 1])).await.unwrap_err();
    assert!(matches!(err, Error::StateTooLarge { size, max: limit, .. } if size == max + 1 && limit == max));
    assert_eq!(session.state(), HandleState::Active);
}

// Receive and settlement

#[tokio::test(start_paused = true)]
async fn test_receive_and_delete_needs_no_settlement() {
    let (broker, acceptor) = setup();
    send(&broker, "s-1", "one");
    send(&broker, "s-1", "two");
    let session = accept(&acceptor, "s-1", ReceiveMode::ReceiveAndDelete).await;

    let messages = session
        .receive_batch(10, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.lock_token.is_none()));
    assert_eq!(broker.active_message_count(QUEUE).unwrap(), 0);

    let err = session
        .complete_by_sequence_number(messages[0].sequence_number)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)));

    assert!(
        session
            .receive_with_wait(Duration::from_secs(2))
            .await
            .unwrap()
            .is_none()
    );

    // A closed handle reports its state before the mode restriction.
    session.close().await;
    let err = session
        .complete_by_sequence_number(messages[0].sequence_number)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::IllegalState {
            state: HandleState::Closed,
            ..
        }
    ));
    let err = session.renew_message_lock(&messages[1]).await.unwrap_err();
    assert!(matches!(
        err,
        Error::IllegalState {
            state: HandleState::Closed,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_peek_lock_dispositions() {
    let (broker, acceptor) = setup();
    send(&broker, "s-1", "complete me");
    send(&broker, "s-1", "abandon me");
    send(&broker, "s-1", "dead-letter me");
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;

    let messages = session
        .receive_batch(3, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(messages.len(), 3);
    let token = |i: usize| messages[i].lock_token.unwrap();

    session.complete(token(0)).await.unwrap();
    let mut changes = Properties::new();
    changes.insert("attempt".to_string(), Value::from(1));
    session.abandon(token(1), changes).await.unwrap();
    session
        .dead_letter(token(2), DeadLetterOptions::new("Poison", "cannot parse"))
        .await
        .unwrap();

    let redelivered = session
        .receive_with_wait(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(redelivered.body, b"abandon me");
    assert_eq!(redelivered.delivery_count, 2);
    assert_eq!(redelivered.property("attempt"), Some(&Value::from(1)));
    session
        .complete(redelivered.lock_token.unwrap())
        .await
        .unwrap();

    let dead = broker.dead_letter_messages(QUEUE).unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, b"dead-letter me");
    assert_eq!(dead[0].property(DEAD_LETTER_REASON), Some(&Value::from("Poison")));
    assert_eq!(
        dead[0].property(DEAD_LETTER_ERROR_DESCRIPTION),
        Some(&Value::from("cannot parse"))
    );
    assert_eq!(broker.active_message_count(QUEUE).unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_double_settlement_fails_only_that_message() {
    let (broker, acceptor) = setup();
    send(&broker, "s-1", "a");
    send(&broker, "s-1", "b");
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;

    let messages = session
        .receive_batch(2, Duration::from_secs(1))
        .await
        .unwrap();
    let first = messages[0].lock_token.unwrap();
    let second = messages[1].lock_token.unwrap();

    session.complete(first).await.unwrap();
    let err = session.complete(first).await.unwrap_err();
    match err {
        Error::MessageLockLost { session_id, target } => {
            assert_eq!(session_id, "s-1");
            assert_eq!(target, MessageRef::LockToken(first));
        }
        other => panic!("Expected MessageLockLost, got {other:?}"),
    }

    session.complete(second).await.unwrap();
    assert_eq!(session.state(), HandleState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_deferred_messages_by_sequence_number() {
    let (broker, acceptor) = setup();
    let seq = send(&broker, "s-1", "later");
    let dead_seq = send(&broker, "s-1", "never");
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;

    for message in session.receive_batch(2, Duration::from_secs(1)).await.unwrap() {
        session
            .defer(message.lock_token.unwrap(), Properties::new())
            .await
            .unwrap();
    }
    assert!(
        session
            .receive_with_wait(Duration::from_secs(1))
            .await
            .unwrap()
            .is_none()
    );

    let deferred = session.receive_deferred(seq).await.unwrap();
    assert_eq!(deferred.body, b"later");
    assert!(deferred.lock_token.is_some());

    // Defer again, fetch again, then complete by sequence number.
    session
        .defer_by_sequence_number(seq, Properties::new())
        .await
        .unwrap();
    let again = session.receive_deferred_batch(&[seq]).await.unwrap();
    assert_eq!(again.len(), 1);
    session.complete_by_sequence_number(seq).await.unwrap();

    session.receive_deferred(dead_seq).await.unwrap();
    session
        .dead_letter_by_sequence_number(dead_seq, DeadLetterOptions::default())
        .await
        .unwrap();

    let err = session.receive_deferred(seq).await.unwrap_err();
    assert!(matches!(err, Error::MessageNotFound { sequence_number, .. } if sequence_number == seq));
    assert_eq!(broker.active_message_count(QUEUE).unwrap(), 0);
    assert_eq!(broker.dead_letter_messages(QUEUE).unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abandon_by_sequence_number_returns_message() {
    let (broker, acceptor) = setup();
    let seq = send(&broker, "s-1", "retry");
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;

    session.receive().await.unwrap().unwrap();
    session
        .abandon_by_sequence_number(seq, Properties::new())
        .await
        .unwrap();

    let message = session.receive().await.unwrap().unwrap();
    assert_eq!(message.sequence_number, seq);
    assert_eq!(message.delivery_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_deferred_message_stays_deferred() {
    let (broker, acceptor) = setup();
    let seq = send(&broker, "s-1", "parked");
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;

    let message = session.receive().await.unwrap().unwrap();
    session
        .defer(message.lock_token.unwrap(), Properties::new())
        .await
        .unwrap();
    let deferred = session.receive_deferred(seq).await.unwrap();
    session
        .abandon(deferred.lock_token.unwrap(), Properties::new())
        .await
        .unwrap();

    assert!(
        session
            .receive_with_wait(Duration::from_secs(1))
            .await
            .unwrap()
            .is_none()
    );
    let again = session.receive_deferred(seq).await.unwrap();
    assert_eq!(again.body, b"parked");
}

#[tokio::test(start_paused = true)]
async fn test_closing_keeps_fetched_deferred_message_deferred() {
    let (broker, acceptor) = setup();
    let seq = send(&broker, "s-1", "parked");
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;

    let message = session.receive().await.unwrap().unwrap();
    session
        .defer(message.lock_token.unwrap(), Properties::new())
        .await
        .unwrap();
    session.receive_deferred(seq).await.unwrap();
    session.close().await;

    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;
    assert!(
        session
            .receive_with_wait(Duration::from_secs(1))
            .await
            .unwrap()
            .is_none()
    );
    let again = session.receive_deferred(seq).await.unwrap();
    assert_eq!(again.sequence_number, seq);
}

#[tokio::test(start_paused = true)]
async fn test_peek_browses_without_locking() {
    let (broker, acceptor) = setup();
    for body in ["1", "2", "3"] {
        send(&broker, "s-1", body);
    }
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;

    assert_eq!(session.peek().await.unwrap().unwrap().sequence_number, 1);
    assert_eq!(session.peek().await.unwrap().unwrap().sequence_number, 2);
    let rest = session.peek_batch(5).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].sequence_number, 3);
    assert!(session.peek().await.unwrap().is_none());

    let all = session.peek_from(1, 10).await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|m| m.lock_token.is_none()));

    let received = session
        .receive_batch(10, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(received.len(), 3);
    assert!(received.iter().all(|m| m.delivery_count == 1));
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_messages() {
    let (broker, acceptor) = setup();
    let due = broker.now() + chrono::Duration::seconds(10);
    let scheduled = broker
        .schedule_message(QUEUE, Message::new(b"tick".to_vec()).with_session_id("s-1"), due)
        .unwrap();
    let cancelled = broker
        .schedule_message(QUEUE, Message::new(b"never".to_vec()).with_session_id("s-1"), due)
        .unwrap();

    broker.cancel_scheduled_message(QUEUE, cancelled).unwrap();
    assert!(matches!(
        broker.cancel_scheduled_message(QUEUE, cancelled),
        Err(Error::MessageNotFound { .. })
    ));

    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;
    assert!(
        session
            .receive_with_wait(Duration::from_secs(2))
            .await
            .unwrap()
            .is_none()
    );

    let message = session
        .receive_with_wait(Duration::from_secs(20))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.sequence_number, scheduled);
    assert!(broker.now() >= due);
}

#[tokio::test(start_paused = true)]
async fn test_drain_completes_everything() {
    let (broker, acceptor) = setup();
    for i in 0..5 {
        send(&broker, "s-1", &i.to_string());
    }
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;

    assert_eq!(session.drain(Duration::from_millis(200)).await.unwrap(), 5);
    assert_eq!(broker.active_message_count(QUEUE).unwrap(), 0);
}

// Handle lifecycle

#[tokio::test(start_paused = true)]
async fn test_lock_loss_expires_handle() {
    let (broker, acceptor) = setup();
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;
    let before = session.locked_until();

    assert!(broker.expire_session_lock(QUEUE, "s-1"));
    let err = session.renew_session_lock().await.unwrap_err();
    assert!(matches!(err, Error::SessionLockLost { .. }));
    assert_eq!(session.state(), HandleState::Expired);
    assert_eq!(session.locked_until(), before);

    let err = session.get_state().await.unwrap_err();
    assert!(matches!(
        err,
        Error::IllegalState {
            state: HandleState::Expired,
            ..
        }
    ));
    assert!(err.is_session_lock_lost());

    session.close().await;
    assert_eq!(session.state(), HandleState::Expired);
}

#[tokio::test(start_paused = true)]
async fn test_lock_lapses_without_renewal() {
    let (broker, acceptor) = setup();
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;

    tokio::time::sleep(broker.config().lock_duration + Duration::from_secs(1)).await;
    let err = session.set_state(Some(b"x")).await.unwrap_err();
    assert!(err.is_session_lock_lost());
    assert_eq!(session.state(), HandleState::Expired);
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent_and_fails_pending() {
    let (broker, acceptor) = setup();
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;

    let waiting = tokio::spawn({
        let session = session.clone();
        async move { session.receive_with_wait(Duration::from_secs(30)).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    session.close().await;
    session.close().await;

    let err = waiting.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        Error::IllegalState {
            state: HandleState::Closed,
            ..
        }
    ));
    assert_eq!(session.state(), HandleState::Closed);
    assert!(!broker.is_session_locked(QUEUE, "s-1"));

    let err = session.renew_session_lock().await.unwrap_err();
    assert!(matches!(
        err,
        Error::IllegalState {
            state: HandleState::Closed,
            ..
        }
    ));
    assert!(!err.is_session_lock_lost());
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handle_releases_lock() {
    let (broker, acceptor) = setup();
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;
    assert!(broker.is_session_locked(QUEUE, "s-1"));

    drop(session);
    assert!(!broker.is_session_locked(QUEUE, "s-1"));
}

// Transient failures

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried() {
    let (broker, acceptor) = setup();
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;

    broker.inject_fault(Fault::ServerBusy);
    session.renew_session_lock().await.unwrap();
    assert_eq!(session.state(), HandleState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_response_times_out() {
    let (broker, acceptor) = setup();
    let session = accept(&acceptor, "s-1", ReceiveMode::PeekLock).await;

    broker.inject_fault(Fault::DropResponse);
    let started = tokio::time::Instant::now();
    let err = session.get_state().await.unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() <= Duration::from_secs(10));

    // The handle survives a timeout.
    assert_eq!(session.state(), HandleState::Active);
    session.renew_session_lock().await.unwrap();
}

// Blocking facade

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_facade() {
    let (broker, acceptor) = setup();
    send(&broker, "s-1", "sync");

    let outcome = tokio::task::spawn_blocking(move || {
        let session = acceptor.accept_session_blocking(QUEUE, Some("s-1"), ReceiveMode::PeekLock)?;
        session.renew_session_lock_blocking()?;
        let message = session
            .receive_blocking(Duration::from_secs(1))?
            .expect("message available");
        session.complete_blocking(message.lock_token.expect("peek-lock token"))?;
        session.set_state_blocking(Some(b"done"))?;
        let state = session.get_state_blocking()?;
        session.close_blocking();
        Ok::<_, Error>((state, session.state()))
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(outcome.0.as_deref(), Some(&b"done"[..]));
    assert_eq!(outcome.1, HandleState::Closed);
    assert!(!broker.is_session_locked(QUEUE, "s-1"));
}
