use ackchat::protocol::{Pdu, PduBody, PduKind};
use ackchat::ui::UiEvent;
use ackchat_tests::harness::client::{RawPeer, TestClient};
use ackchat_tests::harness::init_tracing;
use ackchat_tests::harness::server::TestServer;
use std::time::Duration;

#[tokio::test]
async fn chat_reaches_every_member_including_sender() {
    init_tracing();
    let server = TestServer::spawn().await.unwrap();
    let addr = server.server_addr();
    let mut alice = TestClient::login_as(&addr, "alice").await.unwrap();
    let mut bob = TestClient::login_as(&addr, "bob").await.unwrap();
    let mut carol = TestClient::login_as(&addr, "carol").await.unwrap();

    let seq = alice.chat("hello all").await.unwrap();
    assert_eq!(seq, 1);

    // The response only arrives after everyone confirmed, so every copy has
    // already been delivered by now.
    let line = ("alice".to_string(), "hello all".to_string());
    for member in [&mut bob, &mut carol] {
        member
            .wait_for(|e| matches!(e, UiEvent::MessageLine { text, .. } if text == "hello all"))
            .await
            .unwrap();
        assert_eq!(member.messages(), vec![line.clone()]);
    }
    assert_eq!(alice.messages(), vec![line]);
}

#[tokio::test]
async fn sequence_numbers_are_echoed_in_order() {
    init_tracing();
    let server = TestServer::spawn().await.unwrap();
    let addr = server.server_addr();
    let mut alice = TestClient::login_as(&addr, "alice").await.unwrap();
    let _bob = TestClient::login_as(&addr, "bob").await.unwrap();

    for expected in 1..=5u64 {
        let seq = alice.chat(&format!("message {expected}")).await.unwrap();
        assert_eq!(seq, expected);
    }
    let texts: Vec<String> = alice.messages().into_iter().map(|(_, t)| t).collect();
    assert_eq!(
        texts,
        (1..=5).map(|i| format!("message {i}")).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn chat_response_held_until_last_confirm() {
    init_tracing();
    let server = TestServer::spawn().await.unwrap();
    let addr = server.server_addr();
    let mut alice = TestClient::login_as(&addr, "alice").await.unwrap();

    let mut holdout = RawPeer::connect(&addr, "holdout").await.unwrap();
    holdout.login().await.unwrap();

    alice.send("are you there?").unwrap();
    let event = holdout.recv_kind(PduKind::ChatMessageEvent).await.unwrap();
    assert_eq!(event.user_name, "holdout");
    assert_eq!(event.event_user_name(), Some("alice"));
    assert_eq!(event.sequence_number, 1);

    assert!(
        alice
            .wait_for_within(Duration::from_millis(300), |e| *e == UiEvent::Lock(false))
            .await
            .is_err()
    );
    assert_eq!(server.registry.wait_list_size("alice"), Some(1));

    holdout.confirm(&event).unwrap();
    alice.wait_unlocked().await.unwrap();
    assert_eq!(server.registry.wait_list_size("alice"), None);
}

#[tokio::test]
async fn response_echoes_request_sequence_and_counters() {
    init_tracing();
    let server = TestServer::spawn().await.unwrap();
    let mut raw = RawPeer::connect(&server.server_addr(), "solo")
        .await
        .unwrap();
    raw.login().await.unwrap();

    for seq in [41u64, 42] {
        raw.send(Pdu::chat_request("solo", "raw", seq, "ping"))
            .unwrap();
        let event = raw.recv_kind(PduKind::ChatMessageEvent).await.unwrap();
        raw.confirm(&event).unwrap();
        let response = raw.recv_kind(PduKind::ChatMessageResponse).await.unwrap();
        assert_eq!(response.sequence_number, seq);
        assert_eq!(response.client_thread_name, "raw");
        match response.body {
            PduBody::ChatMessageResponse {
                received_messages, ..
            } => assert_eq!(received_messages, seq - 40),
            other => panic!("unexpected body {other:?}"),
        }
    }
}

#[tokio::test]
async fn late_confirm_is_harmless() {
    init_tracing();
    let server = TestServer::spawn().await.unwrap();
    let mut raw = RawPeer::connect(&server.server_addr(), "solo")
        .await
        .unwrap();
    raw.login().await.unwrap();

    raw.send(Pdu::chat_request("solo", "raw", 1, "once"))
        .unwrap();
    let event = raw.recv_kind(PduKind::ChatMessageEvent).await.unwrap();
    raw.confirm(&event).unwrap();
    raw.recv_kind(PduKind::ChatMessageResponse).await.unwrap();

    // Duplicate confirm after the drain: no second response.
    raw.confirm(&event).unwrap();
    assert!(raw.is_quiet(Duration::from_millis(200)).await);
    assert_eq!(server.registry.open_wait_lists(), 0);
}
