mod common;

use std::collections::HashSet;
use std::time::Duration;

use beach_relay::SessionSettings;
use futures_util::SinkExt;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

use common::{
    assert_silent, expect_closed, ids, next_json, send_json, send_text, TestRelay, SIGNAL_PATH,
};

#[test_timeout::tokio_timeout_test]
async fn alice_offers_bob_and_then_disappears() {
    let relay = TestRelay::start().await;

    let (mut alice, alice_init) = relay.join("alice").await;
    assert_eq!(ids(&alice_init["data"]), Vec::<String>::new());
    assert_eq!(alice_init["target_id"], "alice");

    let (mut bob, bob_init) = relay.join("bob").await;
    assert_eq!(ids(&bob_init["data"]), vec!["alice"]);

    send_json(
        &mut alice,
        &json!({
            "type": "offer",
            "target_id": "bob",
            "source_id": "mallory",
            "data": {"sdp": "v=0\r\no=- 1 2 IN IP4 127.0.0.1"}
        }),
    )
    .await;
    let offer = next_json(&mut bob).await;
    assert_eq!(offer["type"], "offer");
    assert_eq!(offer["source_id"], "alice");
    assert_eq!(offer["data"], json!({"sdp": "v=0\r\no=- 1 2 IN IP4 127.0.0.1"}));

    alice.close(None).await.expect("close alice");
    relay.wait_until_gone("alice").await;

    send_json(
        &mut bob,
        &json!({"type": "candidate", "target_id": "alice", "data": {"candidate": "c"}}),
    )
    .await;
    assert_silent(&mut bob, Duration::from_millis(100)).await;

    let (mut carol, carol_init) = relay.join("carol").await;
    assert_eq!(ids(&carol_init["data"]), vec!["bob"]);

    send_json(&mut bob, &json!({"type": "hello", "target_id": "carol"})).await;
    let hello = next_json(&mut carol).await;
    assert_eq!(hello["source_id"], "bob");
    assert!(hello.get("data").is_none());
}

#[test_timeout::tokio_timeout_test]
async fn every_joiner_learns_only_the_peers_before_it() {
    let relay = TestRelay::start().await;
    let names = ["p1", "p2", "p3", "p4", "p5"];
    let mut sockets = Vec::new();

    for (index, name) in names.iter().enumerate() {
        let (ws, init) = relay.join(name).await;
        let seen: HashSet<String> = ids(&init["data"]).into_iter().collect();
        let expected: HashSet<String> = names[..index].iter().map(|s| s.to_string()).collect();
        assert_eq!(seen, expected);
        assert!(!seen.contains(*name));
        sockets.push(ws);
    }

    assert_eq!(relay.state.registry.len(), names.len());
}

#[test_timeout::tokio_timeout_test]
async fn unknown_targets_are_dropped_silently() {
    let relay = TestRelay::start().await;
    let (mut alice, _) = relay.join("alice").await;
    let (mut bob, _) = relay.join("bob").await;

    send_json(&mut alice, &json!({"type": "offer", "target_id": "nobody"})).await;
    send_json(&mut alice, &json!({"type": "offer"})).await;

    assert_silent(&mut alice, Duration::from_millis(100)).await;
    assert_silent(&mut bob, Duration::from_millis(100)).await;

    send_json(&mut alice, &json!({"type": "still-here", "target_id": "bob"})).await;
    assert_eq!(next_json(&mut bob).await["type"], "still-here");
}

#[test_timeout::tokio_timeout_test]
async fn per_sender_order_is_preserved() {
    let relay = TestRelay::start().await;
    let (mut alice, _) = relay.join("alice").await;
    let (mut bob, _) = relay.join("bob").await;

    for seq in 0..20 {
        send_json(
            &mut alice,
            &json!({"type": "candidate", "target_id": "bob", "data": seq}),
        )
        .await;
    }
    for seq in 0..20 {
        assert_eq!(next_json(&mut bob).await["data"], seq);
    }
}

#[test_timeout::tokio_timeout_test]
async fn duplicate_ids_are_refused() {
    let relay = TestRelay::start().await;
    let (mut original, _) = relay.join("alice").await;

    let mut impostor = relay.connect(SIGNAL_PATH).await;
    send_json(&mut impostor, &json!({"type": "join", "peer_id": "alice"})).await;
    let refusal = next_json(&mut impostor).await;
    assert_eq!(refusal["type"], "join_error");
    assert!(refusal["data"]["reason"]
        .as_str()
        .expect("reason")
        .contains("already registered"));
    expect_closed(&mut impostor).await;

    let (mut bob, _) = relay.join("bob").await;
    send_json(&mut bob, &json!({"type": "offer", "target_id": "alice"})).await;
    assert_eq!(next_json(&mut original).await["source_id"], "bob");
    assert_eq!(relay.state.registry.len(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn bare_and_query_joins_are_routable() {
    let relay = TestRelay::start().await;

    let mut legacy = relay.connect(SIGNAL_PATH).await;
    send_text(&mut legacy, "k3x9q2m7").await;
    let legacy_init = next_json(&mut legacy).await;
    assert_eq!(legacy_init["type"], "init");
    assert_eq!(legacy_init["target_id"], "k3x9q2m7");

    let mut preset = relay.connect(&format!("{SIGNAL_PATH}?peer_id=zed")).await;
    let preset_init = next_json(&mut preset).await;
    assert_eq!(ids(&preset_init["data"]), vec!["k3x9q2m7"]);

    // Older clients address peers through `id`.
    send_json(&mut legacy, &json!({"type": "answer", "id": "zed", "data": "sdp"})).await;
    let answer = next_json(&mut preset).await;
    assert_eq!(answer["source_id"], "k3x9q2m7");
    assert_eq!(answer["data"], "sdp");
}

#[test_timeout::tokio_timeout_test]
async fn garbage_terminates_only_the_sender() {
    let relay = TestRelay::start().await;
    let (mut alice, _) = relay.join("alice").await;
    let (mut bob, _) = relay.join("bob").await;

    send_text(&mut alice, "{this is not an envelope").await;
    expect_closed(&mut alice).await;
    relay.wait_until_gone("alice").await;

    let (mut carol, carol_init) = relay.join("carol").await;
    assert_eq!(ids(&carol_init["data"]), vec!["bob"]);
    send_json(&mut bob, &json!({"type": "ping", "target_id": "carol"})).await;
    assert_eq!(next_json(&mut carol).await["source_id"], "bob");
}

#[test_timeout::tokio_timeout_test]
async fn invalid_join_frames_are_refused() {
    let relay = TestRelay::start().await;

    let mut blank = relay.connect(SIGNAL_PATH).await;
    send_text(&mut blank, "   ").await;
    assert_eq!(next_json(&mut blank).await["type"], "join_error");
    expect_closed(&mut blank).await;

    let mut wrong = relay.connect(SIGNAL_PATH).await;
    send_json(&mut wrong, &json!({"type": "offer", "peer_id": "x"})).await;
    assert_eq!(next_json(&mut wrong).await["type"], "join_error");
    expect_closed(&mut wrong).await;

    assert!(relay.state.registry.is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn silent_connections_time_out_during_join() {
    let relay = TestRelay::start_with(SessionSettings {
        join_timeout: Duration::from_millis(100),
        ..SessionSettings::default()
    })
    .await;

    let mut lurker = relay.connect(SIGNAL_PATH).await;
    expect_closed(&mut lurker).await;
    assert!(relay.state.registry.is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn idle_peers_are_closed_when_configured() {
    let relay = TestRelay::start_with(SessionSettings {
        idle_timeout: Some(Duration::from_millis(150)),
        ..SessionSettings::default()
    })
    .await;

    let (mut sleepy, _) = relay.join("sleepy").await;
    expect_closed(&mut sleepy).await;
    relay.wait_until_gone("sleepy").await;
}

#[test_timeout::tokio_timeout_test(multi_thread)]
async fn presence_is_announced_when_enabled() {
    let relay = TestRelay::start_with(SessionSettings {
        announce_presence: true,
        ..SessionSettings::default()
    })
    .await;

    let (mut alice, _) = relay.join("alice").await;
    let (mut bob, bob_init) = relay.join("bob").await;
    assert_eq!(ids(&bob_init["data"]), vec!["alice"]);

    let joined = next_json(&mut alice).await;
    assert_eq!(joined["type"], "peer_joined");
    assert_eq!(joined["source_id"], "bob");

    // carol learns about alice and bob from init alone
    let (mut carol, carol_init) = relay.join("carol").await;
    assert_eq!(ids(&carol_init["data"]), vec!["alice", "bob"]);
    for peer in [&mut alice, &mut bob] {
        let joined = next_json(peer).await;
        assert_eq!(joined["type"], "peer_joined");
        assert_eq!(joined["source_id"], "carol");
    }
    assert_silent(&mut carol, Duration::from_millis(100)).await;

    bob.send(Message::Close(None)).await.expect("close bob");
    for peer in [&mut alice, &mut carol] {
        let left = next_json(peer).await;
        assert_eq!(left["type"], "peer_left");
        assert_eq!(left["source_id"], "bob");
    }
}

#[test_timeout::tokio_timeout_test]
async fn presence_is_quiet_by_default() {
    let relay = TestRelay::start().await;
    let (mut alice, _) = relay.join("alice").await;
    let (bob, _) = relay.join("bob").await;
    drop(bob);

    relay.wait_until_gone("bob").await;
    assert_silent(&mut alice, Duration::from_millis(100)).await;
}

#[test_timeout::tokio_timeout_test]
async fn a_reconnecting_peer_keeps_its_new_session() {
    let relay = TestRelay::start().await;
    let (mut first, _) = relay.join("alice").await;
    first.close(None).await.expect("close first");
    relay.wait_until_gone("alice").await;

    let (mut second, init) = relay.join("alice").await;
    assert_eq!(ids(&init["data"]), Vec::<String>::new());

    let (mut bob, _) = relay.join("bob").await;
    send_json(&mut bob, &json!({"type": "offer", "target_id": "alice"})).await;
    assert_eq!(next_json(&mut second).await["source_id"], "bob");
}
