//! Client-side presentation boundary.
//!
//! The listener never renders anything itself; it reports state changes through
//! [`ChatUi`]. Every call is a fire-and-forget notification.

use tokio::sync::mpsc;

/// Session statistics reported when a client logs out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStatistics {
    pub events_received: u64,
    pub confirms_sent: u64,
    pub login_events: u64,
    pub logout_events: u64,
    pub chat_events: u64,
}

pub trait ChatUi: Send + Sync + 'static {
    /// Login accepted; the user may start chatting.
    fn login_complete(&self);

    /// Logout acknowledged by the server.
    fn logout_complete(&self);

    /// A chat line arrived from `sender`.
    fn set_message_line(&self, sender: &str, text: &str);

    /// Show an error raised by `source` (login rejection, lost connection).
    fn set_error_message(&self, source: &str, text: &str, code: u32);

    /// Lock (`true`) or release (`false`) message input.
    fn set_lock(&self, locked: bool);

    /// Server processing time of the last completed request.
    fn set_last_server_time(&self, nanos: u64);

    fn set_session_statistics(&self, stats: SessionStatistics);

    /// Membership changed; `names` is the server's current snapshot.
    fn set_client_list(&self, names: &[String]) {
        let _ = names;
    }
}

/// One [`ChatUi`] notification as a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    LoginComplete,
    LogoutComplete,
    MessageLine { sender: String, text: String },
    Error { source: String, text: String, code: u32 },
    Lock(bool),
    LastServerTime(u64),
    Statistics(SessionStatistics),
    ClientList(Vec<String>),
}

/// [`ChatUi`] that forwards every notification into a channel.
#[derive(Debug, Clone)]
pub struct ChannelUi {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelUi {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: UiEvent) {
        // The receiving side may already be gone during shutdown.
        let _ = self.tx.send(event);
    }
}

impl ChatUi for ChannelUi {
    fn login_complete(&self) {
        self.emit(UiEvent::LoginComplete);
    }

    fn logout_complete(&self) {
        self.emit(UiEvent::LogoutComplete);
    }

    fn set_message_line(&self, sender: &str, text: &str) {
        self.emit(UiEvent::MessageLine {
            sender: sender.to_string(),
            text: text.to_string(),
        });
    }

    fn set_error_message(&self, source: &str, text: &str, code: u32) {
        self.emit(UiEvent::Error {
            source: source.to_string(),
            text: text.to_string(),
            code,
        });
    }

    fn set_lock(&self, locked: bool) {
        self.emit(UiEvent::Lock(locked));
    }

    fn set_last_server_time(&self, nanos: u64) {
        self.emit(UiEvent::LastServerTime(nanos));
    }

    fn set_session_statistics(&self, stats: SessionStatistics) {
        self.emit(UiEvent::Statistics(stats));
    }

    fn set_client_list(&self, names: &[String]) {
        self.emit(UiEvent::ClientList(names.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_ui_forwards_in_order() {
        let (ui, mut rx) = ChannelUi::new();
        ui.set_lock(true);
        ui.set_message_line("alice", "hi");
        ui.set_client_list(&["alice".to_string()]);

        assert_eq!(rx.try_recv().unwrap(), UiEvent::Lock(true));
        assert_eq!(
            rx.try_recv().unwrap(),
            UiEvent::MessageLine {
                sender: "alice".into(),
                text: "hi".into()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            UiEvent::ClientList(vec!["alice".into()])
        );
    }

    #[test]
    fn emitting_after_receiver_dropped_is_harmless() {
        let (ui, rx) = ChannelUi::new();
        drop(rx);
        ui.logout_complete();
    }
}
