use crate::connection::{Connection, ConnectionHandle, DEFAULT_OUTBOUND_QUEUE};
use crate::listener::{MessageListener, SharedClientData};
use crate::protocol::{ConversationStatus, Pdu};
use crate::ui::ChatUi;
use anyhow::{Context, Result, bail};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// A chat client: a connection to the server plus the listener task that
/// handles everything the server pushes.
pub struct ChatClient {
    handle: ConnectionHandle,
    shared: Arc<SharedClientData>,
    ui: Arc<dyn ChatUi>,
    listener: JoinHandle<()>,
}

impl ChatClient {
    /// Connect to the server at `addr` (`host:port`) as `user_name`.
    /// Does not log in yet.
    pub async fn connect(addr: &str, user_name: &str, ui: Arc<dyn ChatUi>) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        Ok(Self::from_connection(
            Connection::from_tcp(stream, DEFAULT_OUTBOUND_QUEUE),
            user_name,
            ui,
        ))
    }

    /// Build a client over an already established connection.
    pub fn from_connection(connection: Connection, user_name: &str, ui: Arc<dyn ChatUi>) -> Self {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let client_thread_name = format!("{user_name}-{}", &tag[..8]);
        let shared = Arc::new(SharedClientData::new(user_name, &client_thread_name));
        let handle = connection.handle();
        let listener = MessageListener::new(connection, shared.clone(), ui.clone());
        let listener = tokio::spawn(listener.run());
        Self {
            handle,
            shared,
            ui,
            listener,
        }
    }

    pub fn user_name(&self) -> &str {
        self.shared.user_name()
    }

    pub fn status(&self) -> ConversationStatus {
        self.shared.status()
    }

    pub fn shared(&self) -> &Arc<SharedClientData> {
        &self.shared
    }

    /// Send a login request. Completion is reported through the UI.
    pub fn login(&self) -> Result<()> {
        let status = self.status();
        if status != ConversationStatus::Unregistered {
            bail!("cannot log in while {status}");
        }
        if self.listener.is_finished() {
            bail!("connection to server is closed");
        }
        self.shared.set_status(ConversationStatus::Registering);
        self.handle
            .send(Pdu::login_request(
                self.shared.user_name(),
                self.shared.client_thread_name(),
            ))
            .context("failed to send login request")
    }

    /// Send a chat message and lock input until the server confirms delivery
    /// to every member. Returns the message's sequence number.
    pub fn send_message(&self, text: &str) -> Result<u64> {
        let status = self.status();
        if status != ConversationStatus::Registered {
            bail!("cannot send messages while {status}");
        }
        let sequence = self.shared.next_sequence();
        self.ui.set_lock(true);
        self.handle
            .send(Pdu::chat_request(
                self.shared.user_name(),
                self.shared.client_thread_name(),
                sequence,
                text,
            ))
            .context("failed to send chat message")?;
        Ok(sequence)
    }

    /// Send a logout request. Completion is reported through the UI.
    pub fn logout(&self) -> Result<()> {
        let status = self.status();
        if status != ConversationStatus::Registered {
            bail!("cannot log out while {status}");
        }
        self.shared.set_status(ConversationStatus::Unregistering);
        self.handle
            .send(Pdu::logout_request(
                self.shared.user_name(),
                self.shared.client_thread_name(),
            ))
            .context("failed to send logout request")
    }

    /// Whether the listener has stopped (logout done, login rejected or connection lost).
    pub fn is_finished(&self) -> bool {
        self.listener.is_finished()
    }

    /// Wait for the listener to stop, up to `timeout`. Returns whether it did.
    pub async fn wait_finished(&mut self, timeout: Duration) -> bool {
        if self.listener.is_finished() {
            return true;
        }
        tokio::time::timeout(timeout, &mut self.listener).await.is_ok()
    }

    /// Drop the connection without logging out.
    pub fn abort(&self) {
        self.handle.close();
        self.listener.abort();
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.handle.close();
    }
}
