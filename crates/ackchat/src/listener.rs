use crate::connection::{Connection, TransportError};
use crate::protocol::{ConversationStatus, Pdu, PduKind};
use crate::ui::{ChatUi, SessionStatistics};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Error code reported to the UI when the server connection drops unexpectedly.
pub const CONNECTION_LOST: u32 = 2;

/// Client state shared between the user-facing [`crate::client::ChatClient`]
/// and its [`MessageListener`] task.
#[derive(Debug)]
pub struct SharedClientData {
    user_name: String,
    client_thread_name: String,
    status: AtomicU8,
    /// Sequence number of the last chat message sent.
    pub message_counter: AtomicU64,
    pub event_counter: AtomicU64,
    pub confirm_counter: AtomicU64,
    pub login_events: AtomicU64,
    pub logout_events: AtomicU64,
    pub chat_events: AtomicU64,
}

impl SharedClientData {
    pub fn new(user_name: &str, client_thread_name: &str) -> Self {
        Self {
            user_name: user_name.to_string(),
            client_thread_name: client_thread_name.to_string(),
            status: AtomicU8::new(ConversationStatus::Unregistered.to_u8()),
            message_counter: AtomicU64::new(0),
            event_counter: AtomicU64::new(0),
            confirm_counter: AtomicU64::new(0),
            login_events: AtomicU64::new(0),
            logout_events: AtomicU64::new(0),
            chat_events: AtomicU64::new(0),
        }
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn client_thread_name(&self) -> &str {
        &self.client_thread_name
    }

    pub fn status(&self) -> ConversationStatus {
        ConversationStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, next: ConversationStatus) {
        let previous =
            ConversationStatus::from_u8(self.status.swap(next.to_u8(), Ordering::AcqRel));
        if previous != next && !previous.can_transition_to(next) {
            warn!(user = %self.user_name, from = %previous, to = %next, "unexpected status transition");
        }
    }

    /// Allocate the sequence number for the next chat message.
    pub fn next_sequence(&self) -> u64 {
        self.message_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn statistics(&self) -> SessionStatistics {
        SessionStatistics {
            events_received: self.event_counter.load(Ordering::Relaxed),
            confirms_sent: self.confirm_counter.load(Ordering::Relaxed),
            login_events: self.login_events.load(Ordering::Relaxed),
            logout_events: self.logout_events.load(Ordering::Relaxed),
            chat_events: self.chat_events.load(Ordering::Relaxed),
        }
    }
}

/// Drives the client side of the conversation: applies server-pushed PDUs
/// and answers every event with a confirm.
pub struct MessageListener {
    connection: Connection,
    shared: Arc<SharedClientData>,
    ui: Arc<dyn ChatUi>,
    finished: bool,
}

impl MessageListener {
    pub fn new(connection: Connection, shared: Arc<SharedClientData>, ui: Arc<dyn ChatUi>) -> Self {
        Self {
            connection,
            shared,
            ui,
            finished: false,
        }
    }

    /// Receive and handle PDUs until logout completes, the login is rejected
    /// or the connection drops.
    pub async fn run(mut self) {
        debug!(user = %self.shared.user_name(), "message listener started");

        while !self.finished {
            let pdu = match self.connection.receive_next().await {
                Ok(pdu) => pdu,
                Err(TransportError::Malformed(e)) => {
                    warn!(err = %e, "discarding malformed pdu from server");
                    continue;
                }
                Err(e) => {
                    self.connection_lost(&e);
                    break;
                }
            };
            self.handle(pdu);
        }

        self.connection.close().await;
        debug!(
            user = %self.shared.user_name(),
            status = %self.shared.status(),
            "message listener finished"
        );
    }

    /// Apply one PDU according to the current conversation status.
    pub fn handle(&mut self, pdu: Pdu) {
        let status = self.shared.status();
        let kind = pdu.kind();
        if !status.accepts(kind) {
            debug!(%status, ?kind, "discarding pdu not expected in current status");
            return;
        }

        match kind {
            PduKind::LoginResponse => self.login_response(&pdu),
            PduKind::LoginEvent | PduKind::LogoutEvent => self.membership_event(&pdu),
            PduKind::ChatMessageResponse => self.chat_message_response(&pdu),
            PduKind::ChatMessageEvent => self.chat_message_event(&pdu),
            PduKind::LogoutResponse => self.logout_response(&pdu),
            other => debug!(kind = ?other, "ignoring pdu kind not handled by clients"),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn login_response(&mut self, pdu: &Pdu) {
        let error_code = pdu.error_code();
        if error_code.is_error() {
            warn!(user = %pdu.user_name, "login rejected by server");
            self.ui.set_error_message(
                "chat server",
                &format!(
                    "login failed, user {} is probably already logged in",
                    pdu.user_name
                ),
                error_code.code(),
            );
            self.shared.set_status(ConversationStatus::Unregistered);
            self.finished = true;
            return;
        }

        self.shared.set_status(ConversationStatus::Registered);
        if let Some(nanos) = pdu.server_time_ns() {
            self.ui.set_last_server_time(nanos);
        }
        self.ui.login_complete();
        info!(user = %self.shared.user_name(), "logged in");
    }

    fn membership_event(&mut self, pdu: &Pdu) {
        self.shared.event_counter.fetch_add(1, Ordering::Relaxed);
        let per_kind = match pdu.kind() {
            PduKind::LoginEvent => &self.shared.login_events,
            _ => &self.shared.logout_events,
        };
        let events = per_kind.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            user = %self.shared.user_name(),
            kind = ?pdu.kind(),
            originator = ?pdu.event_user_name(),
            events,
            "membership event"
        );

        self.confirm(pdu);

        if let Some(clients) = pdu.clients() {
            self.ui.set_client_list(clients);
        }
    }

    fn chat_message_response(&mut self, pdu: &Pdu) {
        let expected = self.shared.message_counter.load(Ordering::Acquire);
        if pdu.sequence_number != expected {
            debug!(
                received = pdu.sequence_number,
                expected, "discarding chat response with stale sequence number"
            );
            return;
        }

        if let Some(nanos) = pdu.server_time_ns() {
            self.ui.set_last_server_time(nanos);
        }
        self.ui.set_lock(false);
    }

    fn chat_message_event(&mut self, pdu: &Pdu) {
        self.shared.event_counter.fetch_add(1, Ordering::Relaxed);
        self.shared.chat_events.fetch_add(1, Ordering::Relaxed);

        self.confirm(pdu);

        let sender = pdu.event_user_name().unwrap_or_default();
        self.ui
            .set_message_line(sender, pdu.message().unwrap_or_default());
    }

    fn logout_response(&mut self, _pdu: &Pdu) {
        self.shared.set_status(ConversationStatus::Unregistered);
        self.ui.set_session_statistics(self.shared.statistics());
        debug!(
            user = %self.shared.user_name(),
            messages_sent = self.shared.message_counter.load(Ordering::Relaxed),
            "logout confirmed"
        );
        self.finished = true;
        self.ui.logout_complete();
    }

    fn confirm(&self, event: &Pdu) {
        let Some(confirm) =
            event.confirm_for(self.shared.user_name(), self.shared.client_thread_name())
        else {
            return;
        };
        match self.connection.send(confirm) {
            Ok(()) => {
                self.shared.confirm_counter.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(kind = ?event.kind(), err = %e, "failed to send confirm"),
        }
    }

    fn connection_lost(&mut self, err: &TransportError) {
        let status = self.shared.status();
        if status != ConversationStatus::Unregistered {
            warn!(user = %self.shared.user_name(), %status, err = %err, "connection to server lost");
            self.ui.set_error_message(
                "chat server",
                &format!("connection lost: {err}"),
                CONNECTION_LOST,
            );
            self.shared.set_status(ConversationStatus::Unregistered);
        } else {
            debug!(err = %err, "server connection closed");
        }
        self.finished = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorCode;
    use crate::ui::{ChannelUi, UiEvent};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        listener: MessageListener,
        server: Connection,
        shared: Arc<SharedClientData>,
        ui_rx: UnboundedReceiver<UiEvent>,
    }

    fn fixture(status: ConversationStatus) -> Fixture {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let shared = Arc::new(SharedClientData::new("alice", "alice-1"));
        shared.set_status(status);
        let (ui, ui_rx) = ChannelUi::new();
        let listener = MessageListener::new(
            Connection::new(client_io, "server", 16),
            shared.clone(),
            Arc::new(ui),
        );
        Fixture {
            listener,
            server: Connection::new(server_io, "client", 16),
            shared,
            ui_rx,
        }
    }

    async fn next_from_client(server: &mut Connection) -> Pdu {
        server.receive(Duration::from_secs(1)).await.unwrap()
    }

    #[tokio::test]
    async fn login_response_success_registers() {
        let mut f = fixture(ConversationStatus::Registering);
        f.listener.handle(Pdu::login_response("alice", "alice-1", 0, 1_000));

        assert_eq!(f.shared.status(), ConversationStatus::Registered);
        assert_eq!(f.ui_rx.try_recv().unwrap(), UiEvent::LastServerTime(1_000));
        assert_eq!(f.ui_rx.try_recv().unwrap(), UiEvent::LoginComplete);
        assert!(!f.listener.is_finished());
    }

    #[tokio::test]
    async fn login_error_finishes_listener() {
        let mut f = fixture(ConversationStatus::Registering);
        let request = Pdu::login_request("alice", "alice-1");
        f.listener
            .handle(Pdu::login_error(&request, ErrorCode::LoginError));

        assert_eq!(f.shared.status(), ConversationStatus::Unregistered);
        assert!(f.listener.is_finished());
        match f.ui_rx.try_recv().unwrap() {
            UiEvent::Error { code, .. } => assert_eq!(code, 1),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn login_event_is_confirmed_and_applied() {
        let mut f = fixture(ConversationStatus::Registered);
        let event = Pdu::login_event("bob", vec!["alice".into(), "bob".into()]).addressed_to("alice");
        f.listener.handle(event);

        let confirm = next_from_client(&mut f.server).await;
        assert_eq!(confirm.kind(), PduKind::LoginConfirm);
        assert_eq!(confirm.user_name, "alice");
        assert_eq!(confirm.event_user_name(), Some("bob"));

        assert_eq!(f.shared.login_events.load(Ordering::Relaxed), 1);
        assert_eq!(f.shared.confirm_counter.load(Ordering::Relaxed), 1);
        assert_eq!(
            f.ui_rx.try_recv().unwrap(),
            UiEvent::ClientList(vec!["alice".into(), "bob".into()])
        );
    }

    #[tokio::test]
    async fn chat_event_is_confirmed_and_shown() {
        let mut f = fixture(ConversationStatus::Registered);
        f.listener
            .handle(Pdu::chat_event("bob", 3, "hi alice").addressed_to("alice"));

        let confirm = next_from_client(&mut f.server).await;
        assert_eq!(confirm.kind(), PduKind::ChatMessageConfirm);
        assert_eq!(confirm.sequence_number, 3);
        assert_eq!(
            f.ui_rx.try_recv().unwrap(),
            UiEvent::MessageLine {
                sender: "bob".into(),
                text: "hi alice".into()
            }
        );
        assert_eq!(f.shared.chat_events.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn chat_response_releases_lock_only_on_matching_sequence() {
        let mut f = fixture(ConversationStatus::Registered);
        f.shared.next_sequence();
        f.shared.next_sequence();

        f.listener.handle(Pdu::chat_response("alice", "", 1, 0, 5));
        assert!(f.ui_rx.try_recv().is_err());

        f.listener.handle(Pdu::chat_response("alice", "", 2, 0, 5));
        assert_eq!(f.ui_rx.try_recv().unwrap(), UiEvent::LastServerTime(5));
        assert_eq!(f.ui_rx.try_recv().unwrap(), UiEvent::Lock(false));
    }

    #[tokio::test]
    async fn illegal_kind_is_discarded_without_side_effects() {
        let mut f = fixture(ConversationStatus::Registered);
        f.listener.handle(Pdu::logout_response("alice", "", 0, 0));
        f.listener.handle(Pdu::login_response("alice", "", 0, 0));

        assert_eq!(f.shared.status(), ConversationStatus::Registered);
        assert!(!f.listener.is_finished());
        assert!(f.ui_rx.try_recv().is_err());

        let mut f = fixture(ConversationStatus::Unregistered);
        f.listener
            .handle(Pdu::chat_event("bob", 1, "late").addressed_to("alice"));
        assert_eq!(f.shared.event_counter.load(Ordering::Relaxed), 0);
        assert!(f.ui_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn logout_response_reports_statistics_and_finishes() {
        let mut f = fixture(ConversationStatus::Unregistering);
        f.listener
            .handle(Pdu::logout_event("alice", vec![]).addressed_to("alice"));
        let _confirm = next_from_client(&mut f.server).await;
        let _ = f.ui_rx.try_recv();

        f.listener.handle(Pdu::logout_response("alice", "", 0, 0));
        assert_eq!(f.shared.status(), ConversationStatus::Unregistered);
        assert!(f.listener.is_finished());
        match f.ui_rx.try_recv().unwrap() {
            UiEvent::Statistics(stats) => {
                assert_eq!(stats.events_received, 1);
                assert_eq!(stats.confirms_sent, 1);
                assert_eq!(stats.logout_events, 1);
            }
            other => panic!("expected statistics, got {other:?}"),
        }
        assert_eq!(f.ui_rx.try_recv().unwrap(), UiEvent::LogoutComplete);
    }

    #[tokio::test]
    async fn dropped_server_reports_connection_lost() {
        let f = fixture(ConversationStatus::Registered);
        let Fixture {
            listener,
            mut server,
            shared,
            mut ui_rx,
        } = f;
        server.close().await;
        drop(server);

        tokio::time::timeout(Duration::from_secs(1), listener.run())
            .await
            .unwrap();
        assert_eq!(shared.status(), ConversationStatus::Unregistered);
        match ui_rx.try_recv().unwrap() {
            UiEvent::Error { code, .. } => assert_eq!(code, CONNECTION_LOST),
            other => panic!("expected connection-lost error, got {other:?}"),
        }
    }
}
