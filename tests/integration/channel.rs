#[path = "../common/mod.rs"]
mod common;

use common::{message, MockBackend};
use matchmate_chat::config::ChannelConfig;
use matchmate_chat::realtime::{MemoryHub, RoomEvent};
use matchmate_chat::types::{CallKind, CallSignal, MessageId};
use matchmate_chat::{
    ChannelMode, ChatError, Message, MessageChannel, MessageSubscription, OutgoingMessage, Role,
    SessionId, SessionResolver,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(2);

fn config() -> ChannelConfig {
    ChannelConfig {
        poll_interval_ms: 50,
        echo_timeout_ms: 100,
    }
}

fn setup() -> (Arc<MockBackend>, MemoryHub, MessageChannel) {
    let backend = Arc::new(MockBackend::new());
    let hub = MemoryHub::new();
    let channel = MessageChannel::new(backend.clone(), Arc::new(hub.connect()), config());
    (backend, hub, channel)
}

async fn next(sub: &mut MessageSubscription) -> Message {
    timeout(WAIT, sub.recv())
        .await
        .expect("timed out waiting for message")
        .expect("subscription closed")
}

async fn settle() {
    sleep(Duration::from_millis(100)).await;
}

fn is_sorted(messages: &[Message]) -> bool {
    messages
        .windows(2)
        .all(|w| w[0].sort_key() <= w[1].sort_key())
}

fn ids(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.id.to_string()).collect()
}

#[tokio::test]
async fn test_open_seeds_log_from_backend() {
    let (backend, hub, channel) = setup();
    let s1 = SessionId::new("s1");
    backend.insert_message(message("s1", "b", 20, Role::Agency, "second"));
    backend.insert_message(message("s1", "a", 10, Role::User, "first"));

    let mut sub = channel.subscribe();
    channel.open(s1.clone()).await.unwrap();

    assert_eq!(channel.session_id(), Some(s1.clone()));
    assert_eq!(channel.mode(), ChannelMode::Live);
    assert_eq!(ids(&channel.messages()), vec!["a", "b"]);
    assert_eq!(hub.member_count(&s1), 1);
    assert_eq!(next(&mut sub).await.id, MessageId::new("a"));
    assert_eq!(next(&mut sub).await.id, MessageId::new("b"));
}

#[tokio::test]
async fn test_large_log_notifies_every_message() {
    let (backend, _hub, channel) = setup();
    for n in 0..300 {
        backend.insert_message(message("s1", &format!("m{n:03}"), n, Role::Agency, "bulk"));
    }
    let mut sub = channel.subscribe();
    channel.open(SessionId::new("s1")).await.unwrap();
    assert_eq!(channel.messages().len(), 300);

    let mut notified = Vec::new();
    while let Some(msg) = sub.try_recv() {
        notified.push(msg.id.to_string());
    }
    assert_eq!(notified.len(), 300);
    assert_eq!(notified.first().map(String::as_str), Some("m000"));
    assert_eq!(notified.last().map(String::as_str), Some("m299"));
}

#[tokio::test]
async fn test_dropped_subscription_does_not_block_others() {
    let (_backend, hub, channel) = setup();
    channel.open(SessionId::new("s1")).await.unwrap();
    let gone = channel.subscribe();
    let mut kept = channel.subscribe();
    drop(gone);

    hub.publish(RoomEvent::NewMessage(message("s1", "m1", 1, Role::Agency, "hi")));
    assert_eq!(next(&mut kept).await.id, MessageId::new("m1"));
}

#[tokio::test]
async fn test_log_stays_sorted_after_every_send() {
    let (backend, _hub, channel) = setup();
    let s1 = SessionId::new("s1");
    backend.insert_message(message("s1", "late", 1_000, Role::Agency, "from the future"));
    channel.open(s1).await.unwrap();

    for text in ["one", "two", "three", "four"] {
        channel
            .send(OutgoingMessage::text(Role::User, text))
            .await
            .unwrap();
        assert!(is_sorted(&channel.messages()));
    }
    let log = channel.messages();
    assert_eq!(log.len(), 5);
    assert_eq!(log.last().unwrap().id, MessageId::new("late"));
}

#[tokio::test]
async fn test_out_of_order_live_delivery_is_inserted_in_place() {
    let (_backend, hub, channel) = setup();
    channel.open(SessionId::new("s1")).await.unwrap();
    let mut sub = channel.subscribe();

    hub.publish(RoomEvent::NewMessage(message("s1", "m3", 30, Role::Agency, "c")));
    hub.publish(RoomEvent::NewMessage(message("s1", "m1", 10, Role::Agency, "a")));
    hub.publish(RoomEvent::NewMessage(message("s1", "m2", 20, Role::Agency, "b")));
    for _ in 0..3 {
        next(&mut sub).await;
    }
    assert_eq!(ids(&channel.messages()), vec!["m1", "m2", "m3"]);
}

#[tokio::test]
async fn test_echo_then_live_confirmation_yields_one_entry() {
    let (_backend, hub, channel) = setup();
    channel.open(SessionId::new("s1")).await.unwrap();
    let mut sub = channel.subscribe();

    let mut outgoing = OutgoingMessage::text(Role::User, "hi");
    let echo = channel.echo(&mut outgoing).unwrap();
    assert_eq!(channel.pending_echoes().len(), 1);
    assert!(channel.messages().is_empty());

    let confirmed = message("s1", "42", 5, Role::User, "hi");
    hub.publish(RoomEvent::NewMessage(confirmed.clone()));
    assert_eq!(next(&mut sub).await.id, MessageId::new("42"));

    // A second copy of the same confirmed message changes nothing.
    hub.publish(RoomEvent::NewMessage(confirmed));
    settle().await;
    assert!(sub.try_recv().is_none());

    let log = channel.messages();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].id, MessageId::new("42"));
    assert!(channel.pending_echoes().is_empty());
    assert!(channel.rollback_echo(&echo.client_ref).is_none());
}

#[tokio::test]
async fn test_send_fires_subscriber_once_despite_own_emit() {
    let (_backend, hub, channel) = setup();
    channel.open(SessionId::new("s1")).await.unwrap();
    let mut sub = channel.subscribe();

    let sent = channel
        .send_with_echo(OutgoingMessage::text(Role::User, "hello"))
        .await
        .unwrap();
    assert_eq!(next(&mut sub).await.id, sent.id);

    // The hub loops our own emit back to us; it must be suppressed.
    settle().await;
    assert!(sub.try_recv().is_none());
    assert_eq!(channel.messages().len(), 1);
    assert_eq!(hub.emitted().len(), 1);
    assert!(channel.pending_echoes().is_empty());
}

#[tokio::test]
async fn test_content_match_replaces_echo_without_client_ref() {
    let (backend, _hub, channel) = setup();
    backend.drop_client_ref(true);
    channel.open(SessionId::new("s1")).await.unwrap();

    let mut outgoing = OutgoingMessage::text(Role::User, "same words");
    channel.echo(&mut outgoing).unwrap();
    let confirmed = channel.send(outgoing).await.unwrap();
    assert!(confirmed.client_ref.is_none());
    assert!(channel.pending_echoes().is_empty());
    assert_eq!(channel.messages().len(), 1);
}

#[tokio::test]
async fn test_failed_send_never_emits() {
    let (backend, hub, channel) = setup();
    channel.open(SessionId::new("s1")).await.unwrap();
    backend.fail_post(true);

    let err = channel
        .send_with_echo(OutgoingMessage::text(Role::User, "lost"))
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Send { .. }));
    assert!(hub.emitted().is_empty());
    assert!(channel.messages().is_empty());
    assert!(channel.pending_echoes().is_empty());
}

#[tokio::test]
async fn test_send_requires_open_channel() {
    let (backend, _hub, channel) = setup();
    let err = channel
        .send(OutgoingMessage::text(Role::User, "nobody home"))
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::NotOpen));
    assert_eq!(backend.posted(), 0);
}

#[tokio::test]
async fn test_close_then_open_other_discards_prior_session() {
    let (backend, hub, channel) = setup();
    let s1 = SessionId::new("s1");
    let s2 = SessionId::new("s2");
    backend.insert_message(message("s1", "old", 1, Role::Agency, "old news"));
    backend.insert_message(message("s2", "new", 2, Role::Agency, "fresh"));

    // Subscribed before s1 opens, so "old" is queued but never read.
    let mut sub = channel.subscribe();
    channel.open(s1.clone()).await.unwrap();
    channel.close().await;
    assert_eq!(channel.mode(), ChannelMode::Closed);
    assert!(channel.messages().is_empty());
    assert_eq!(hub.member_count(&s1), 0);
    assert!(sub.try_recv().is_none());

    channel.open(s2.clone()).await.unwrap();
    assert_eq!(next(&mut sub).await.id, MessageId::new("new"));

    hub.publish(RoomEvent::NewMessage(message("s1", "late", 3, Role::Agency, "stale")));
    settle().await;
    assert!(sub.try_recv().is_none());
    assert_eq!(ids(&channel.messages()), vec!["new"]);
}

#[tokio::test]
async fn test_open_while_open_switches_rooms() {
    let (_backend, hub, channel) = setup();
    let s1 = SessionId::new("s1");
    let s2 = SessionId::new("s2");
    channel.open(s1.clone()).await.unwrap();
    channel.open(s2.clone()).await.unwrap();
    assert_eq!(hub.member_count(&s1), 0);
    assert_eq!(hub.member_count(&s2), 1);
    assert_eq!(channel.session_id(), Some(s2));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (_backend, _hub, channel) = setup();
    channel.close().await;
    channel.open(SessionId::new("s1")).await.unwrap();
    channel.close().await;
    channel.close().await;
    assert_eq!(channel.session_id(), None);
    assert_eq!(channel.mode(), ChannelMode::Closed);
}

#[tokio::test]
async fn test_close_discards_in_flight_open() {
    let (backend, _hub, channel) = setup();
    let channel = Arc::new(channel);
    backend.insert_message(message("s1", "x", 1, Role::Agency, "too late"));
    backend.fetch_delay_ms(200);
    let mut sub = channel.subscribe();

    let opener = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.open(SessionId::new("s1")).await })
    };
    sleep(Duration::from_millis(50)).await;
    channel.close().await;

    opener.await.unwrap().unwrap();
    assert!(channel.messages().is_empty());
    assert_eq!(channel.mode(), ChannelMode::Closed);
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn test_concurrent_opens_are_serialized() {
    let (backend, hub, channel) = setup();
    let channel = Arc::new(channel);
    backend.fetch_delay_ms(50);
    let s1 = SessionId::new("s1");
    let s2 = SessionId::new("s2");

    let first = {
        let channel = channel.clone();
        let s1 = s1.clone();
        tokio::spawn(async move { channel.open(s1).await })
    };
    sleep(Duration::from_millis(10)).await;
    channel.open(s2.clone()).await.unwrap();
    first.await.unwrap().unwrap();

    assert_eq!(channel.session_id(), Some(s2.clone()));
    assert_eq!(hub.member_count(&s1), 0);
    assert_eq!(hub.member_count(&s2), 1);
}

#[tokio::test]
async fn test_fetch_failure_fails_open() {
    let (backend, hub, channel) = setup();
    backend.fail_fetch(true);
    let s1 = SessionId::new("s1");
    let err = channel.open(s1.clone()).await.unwrap_err();
    assert!(matches!(err, ChatError::Fetch { .. }));
    assert_eq!(channel.mode(), ChannelMode::Closed);
    assert_eq!(hub.member_count(&s1), 0);
}

#[tokio::test]
async fn test_join_failure_degrades_to_polling() {
    let (backend, hub, channel) = setup();
    let s1 = SessionId::new("s1");
    hub.set_online(false);

    channel.open(s1.clone()).await.unwrap();
    assert_eq!(channel.mode(), ChannelMode::Degraded);

    // Sends still go through the backend.
    let sent = channel
        .send(OutgoingMessage::text(Role::User, "over rest"))
        .await
        .unwrap();
    assert!(hub.emitted().is_empty());

    let mut sub = channel.subscribe();
    let remote = backend.insert_remote(&s1, Role::Agency, "polled in");
    assert_eq!(next(&mut sub).await.id, remote.id);
    assert_eq!(ids(&channel.messages()), vec![sent.id.to_string(), remote.id.to_string()]);
}

#[tokio::test]
async fn test_reconnect_signal_rejoins_room() {
    let (backend, hub, channel) = setup();
    let s1 = SessionId::new("s1");
    hub.set_online(false);
    channel.open(s1.clone()).await.unwrap();
    assert_eq!(channel.mode(), ChannelMode::Degraded);

    hub.set_online(true);
    timeout(WAIT, async {
        while channel.mode() != ChannelMode::Live {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("channel never went live");
    assert_eq!(hub.member_count(&s1), 1);

    channel
        .send(OutgoingMessage::text(Role::User, "back online"))
        .await
        .unwrap();
    assert_eq!(hub.emitted().len(), 1);
    assert!(backend.fetch_calls() >= 2);
}

#[tokio::test]
async fn test_disconnect_switches_to_degraded() {
    let (_backend, hub, channel) = setup();
    channel.open(SessionId::new("s1")).await.unwrap();
    assert_eq!(channel.mode(), ChannelMode::Live);
    hub.set_online(false);
    timeout(WAIT, async {
        while channel.mode() != ChannelMode::Degraded {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("channel never degraded");
}

#[tokio::test]
async fn test_malformed_payload_is_forwarded_opaquely() {
    let (_backend, hub, channel) = setup();
    channel.open(SessionId::new("s1")).await.unwrap();
    let mut sub = channel.subscribe();

    let mut odd = message("s1", "f1", 1, Role::User, "");
    odd.kind = matchmate_chat::MessageKind::FormResponse;
    odd.payload = json!("{not json at all");
    hub.publish(RoomEvent::NewMessage(odd.clone()));

    let got = next(&mut sub).await;
    assert_eq!(got.payload, odd.payload);
}

#[tokio::test]
async fn test_expired_echoes_are_reported_not_retried() {
    let (backend, _hub, channel) = setup();
    channel.open(SessionId::new("s1")).await.unwrap();
    let mut outgoing = OutgoingMessage::text(Role::User, "stuck");
    let echo = channel.echo(&mut outgoing).unwrap();
    assert!(channel.expired_echoes().is_empty());

    sleep(Duration::from_millis(150)).await;
    let expired = channel.expired_echoes();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].client_ref, echo.client_ref);
    assert_eq!(backend.posted(), 0);
}

#[tokio::test]
async fn test_call_signals_are_scoped_to_room() {
    let (_backend, hub, channel) = setup();
    let s1 = SessionId::new("s1");
    channel.open(s1.clone()).await.unwrap();
    let mut calls = channel.subscribe_calls();

    hub.publish(RoomEvent::Call {
        room_id: SessionId::new("elsewhere"),
        signal: CallSignal::CallEnded { from: Role::Agency },
    });
    let ring = CallSignal::CallUser {
        from: Role::Agency,
        kind: CallKind::Video,
        offer: json!({"sdp": "v=0"}),
    };
    hub.publish(RoomEvent::Call {
        room_id: s1.clone(),
        signal: ring.clone(),
    });

    let got = timeout(WAIT, calls.recv()).await.unwrap().unwrap();
    assert_eq!(got, ring);

    channel
        .signal_call(CallSignal::CallAccepted {
            from: Role::User,
            answer: json!({"sdp": "v=0"}),
        })
        .await
        .unwrap();
    assert_eq!(hub.emitted().len(), 1);
}

#[tokio::test]
async fn test_end_to_end_resolve_send_mark_read() {
    let backend = Arc::new(MockBackend::new());
    let hub = MemoryHub::new();
    let resolver = SessionResolver::new(backend.clone());
    let channel = MessageChannel::new(backend.clone(), Arc::new(hub.connect()), config());

    let s1 = resolver.resolve_session("U", "A").await.unwrap();
    backend.insert_remote(&s1, Role::Agency, "Welcome");
    channel.open(s1.clone()).await.unwrap();

    let first = channel
        .send(OutgoingMessage::text(Role::User, "Hello"))
        .await
        .unwrap();
    let second = channel
        .send(OutgoingMessage::text(Role::User, "Are you there?"))
        .await
        .unwrap();
    assert_eq!(first.payload, json!("Hello"));
    let first_id: u64 = first.id.as_str().parse().unwrap();
    let second_id: u64 = second.id.as_str().parse().unwrap();
    assert!(second_id > first_id);

    assert_eq!(channel.unread_count(Role::Agency), 2);
    assert_eq!(channel.unread_count(Role::User), 1);

    channel.mark_read(&s1, Role::Agency).await.unwrap();
    assert_eq!(channel.unread_count(Role::Agency), 0);
    assert_eq!(channel.unread_count(Role::User), 1);
    assert_eq!(backend.read_marks(), vec![(s1.clone(), Role::Agency)]);
    let unread = backend.session_unread(&s1);
    assert_eq!(unread.agency, 0);
    assert_eq!(unread.user, 1);
}

#[tokio::test]
async fn test_two_participants_share_a_room() {
    let backend = Arc::new(MockBackend::new());
    let hub = MemoryHub::new();
    let user = MessageChannel::new(backend.clone(), Arc::new(hub.connect()), config());
    let agency = MessageChannel::new(backend.clone(), Arc::new(hub.connect()), config());
    let s1 = SessionId::new("s1");
    user.open(s1.clone()).await.unwrap();
    agency.open(s1.clone()).await.unwrap();
    assert_eq!(hub.member_count(&s1), 2);

    let mut agency_sub = agency.subscribe();
    let sent = user
        .send(OutgoingMessage::text(Role::User, "Namaste"))
        .await
        .unwrap();
    let got = next(&mut agency_sub).await;
    assert_eq!(got.id, sent.id);
    assert_eq!(agency.messages().len(), 1);
}
