use ackchat::protocol::{ConversationStatus, ErrorCode, Pdu, PduKind};
use ackchat::ui::UiEvent;
use ackchat_tests::harness::client::{RawPeer, TestClient};
use ackchat_tests::harness::server::TestServer;
use ackchat_tests::harness::{WAIT, init_tracing, poll_until};

#[tokio::test]
async fn single_client_logs_in_and_out() {
    init_tracing();
    let server = TestServer::spawn().await.unwrap();
    let mut alice = TestClient::login_as(&server.server_addr(), "alice")
        .await
        .unwrap();
    assert_eq!(alice.client.status(), ConversationStatus::Registered);
    assert_eq!(alice.last_client_list(), Some(vec!["alice".to_string()]));

    let stats = alice.logout().await.unwrap();
    // Own login and logout events.
    assert_eq!(stats.login_events, 1);
    assert_eq!(stats.logout_events, 1);
    assert_eq!(stats.confirms_sent, 2);
    assert_eq!(alice.client.status(), ConversationStatus::Unregistered);
    assert!(alice.client.wait_finished(WAIT).await);

    let registry = server.registry.clone();
    assert!(
        poll_until(WAIT, || {
            let r = registry.clone();
            async move { r.is_empty() }
        })
        .await
    );
}

#[tokio::test]
async fn duplicate_name_is_rejected_and_first_session_survives() {
    init_tracing();
    let server = TestServer::spawn().await.unwrap();
    let mut first = TestClient::login_as(&server.server_addr(), "alice")
        .await
        .unwrap();

    let mut second = TestClient::connect(&server.server_addr(), "alice")
        .await
        .unwrap();
    let code = second.login_rejected().await.unwrap();
    assert_eq!(code, ErrorCode::LoginError.code());
    assert_eq!(second.client.status(), ConversationStatus::Unregistered);

    // The first session keeps working.
    first.chat("still here").await.unwrap();
    assert_eq!(
        first.messages(),
        vec![("alice".to_string(), "still here".to_string())]
    );
    assert_eq!(server.registry.len(), 1);
}

#[tokio::test]
async fn login_response_waits_for_existing_members() {
    init_tracing();
    let server = TestServer::spawn().await.unwrap();
    let mut holdout = RawPeer::connect(&server.server_addr(), "holdout")
        .await
        .unwrap();
    holdout.login().await.unwrap();

    let mut alice = TestClient::connect(&server.server_addr(), "alice")
        .await
        .unwrap();
    alice.client.login().unwrap();

    let event = holdout.recv_kind(PduKind::LoginEvent).await.unwrap();
    assert_eq!(event.event_user_name(), Some("alice"));
    assert_eq!(
        event.clients().map(|c| c.to_vec()),
        Some(vec!["alice".to_string(), "holdout".to_string()])
    );

    // No confirm from holdout yet: alice must still be logging in.
    assert!(
        alice
            .wait_for_within(std::time::Duration::from_millis(300), |e| {
                *e == UiEvent::LoginComplete
            })
            .await
            .is_err()
    );
    assert_eq!(alice.client.status(), ConversationStatus::Registering);

    holdout.confirm(&event).unwrap();
    alice.wait_for(|e| *e == UiEvent::LoginComplete).await.unwrap();
    assert_eq!(alice.client.status(), ConversationStatus::Registered);
}

#[tokio::test]
async fn logout_notifies_remaining_members() {
    init_tracing();
    let server = TestServer::spawn().await.unwrap();
    let mut alice = TestClient::login_as(&server.server_addr(), "alice")
        .await
        .unwrap();
    let mut bob = TestClient::login_as(&server.server_addr(), "bob")
        .await
        .unwrap();
    alice
        .wait_for(|e| *e == UiEvent::ClientList(vec!["alice".into(), "bob".into()]))
        .await
        .unwrap();

    bob.logout().await.unwrap();
    alice
        .wait_for(|e| *e == UiEvent::ClientList(vec!["alice".into()]))
        .await
        .unwrap();

    let registry = server.registry.clone();
    assert!(
        poll_until(WAIT, || {
            let r = registry.clone();
            async move { r.snapshot_names() == vec!["alice".to_string()] }
        })
        .await
    );

    // Alice can still chat with just herself.
    alice.chat("alone now").await.unwrap();
}

#[tokio::test]
async fn requests_before_login_are_ignored() {
    init_tracing();
    let server = TestServer::spawn().await.unwrap();
    let mut raw = RawPeer::connect(&server.server_addr(), "early")
        .await
        .unwrap();
    raw.send(Pdu::chat_request("early", "raw", 1, "too soon"))
        .unwrap();
    raw.send(Pdu::logout_request("early", "raw")).unwrap();
    assert!(raw.is_quiet(std::time::Duration::from_millis(200)).await);
    assert!(server.registry.is_empty());

    raw.login().await.unwrap();
    assert_eq!(server.registry.snapshot_names(), vec!["early".to_string()]);
}
