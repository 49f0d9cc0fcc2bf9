use super::WAIT;
use ackchat::client::ChatClient;
use ackchat::connection::DEFAULT_OUTBOUND_QUEUE;
use ackchat::protocol::{Pdu, PduKind};
use ackchat::ui::{ChannelUi, SessionStatistics, UiEvent};
use ackchat::{Connection, TransportError};
use anyhow::{Context, Result, bail};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// A [`ChatClient`] whose UI notifications are recorded for assertions.
pub struct TestClient {
    pub client: ChatClient,
    events: mpsc::UnboundedReceiver<UiEvent>,
    seen: Vec<UiEvent>,
}

impl TestClient {
    pub async fn connect(addr: &str, name: &str) -> Result<Self> {
        let (ui, events) = ChannelUi::new();
        let client = ChatClient::connect(addr, name, Arc::new(ui)).await?;
        Ok(Self {
            client,
            events,
            seen: Vec::new(),
        })
    }

    /// Connect and log in.
    pub async fn login_as(addr: &str, name: &str) -> Result<Self> {
        let mut client = Self::connect(addr, name).await?;
        client.login().await?;
        Ok(client)
    }

    /// Log in and wait for the server to accept.
    pub async fn login(&mut self) -> Result<()> {
        self.client.login()?;
        match self
            .wait_for(|e| matches!(e, UiEvent::LoginComplete | UiEvent::Error { .. }))
            .await?
        {
            UiEvent::LoginComplete => Ok(()),
            other => bail!("login failed: {other:?}"),
        }
    }

    /// Log in expecting a rejection; returns the reported error code.
    pub async fn login_rejected(&mut self) -> Result<u32> {
        self.client.login()?;
        match self
            .wait_for(|e| matches!(e, UiEvent::LoginComplete | UiEvent::Error { .. }))
            .await?
        {
            UiEvent::Error { code, .. } => Ok(code),
            other => bail!("expected login error, got {other:?}"),
        }
    }

    /// Send a chat message without waiting for its response.
    pub fn send(&self, text: &str) -> Result<u64> {
        self.client.send_message(text)
    }

    /// Send a chat message and wait until the server released the response.
    pub async fn chat(&mut self, text: &str) -> Result<u64> {
        let seq = self.send(text)?;
        self.wait_unlocked().await?;
        Ok(seq)
    }

    pub async fn wait_unlocked(&mut self) -> Result<()> {
        self.wait_for(|e| *e == UiEvent::Lock(false)).await.map(|_| ())
    }

    /// Log out and wait for completion; returns the session statistics.
    pub async fn logout(&mut self) -> Result<SessionStatistics> {
        self.client.logout()?;
        self.wait_for(|e| *e == UiEvent::LogoutComplete).await?;
        self.seen
            .iter()
            .rev()
            .find_map(|e| match e {
                UiEvent::Statistics(s) => Some(*s),
                _ => None,
            })
            .context("logout completed without statistics")
    }

    /// Wait for the first notification matching `pred`, recording everything
    /// received on the way.
    pub async fn wait_for<F>(&mut self, pred: F) -> Result<UiEvent>
    where
        F: Fn(&UiEvent) -> bool,
    {
        self.wait_for_within(WAIT, pred).await
    }

    pub async fn wait_for_within<F>(&mut self, timeout: Duration, pred: F) -> Result<UiEvent>
    where
        F: Fn(&UiEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .context("timed out waiting for ui event")?
                .context("ui channel closed")?;
            self.seen.push(event.clone());
            if pred(&event) {
                return Ok(event);
            }
        }
    }

    /// Record notifications already queued without waiting.
    pub fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.seen.push(event);
        }
    }

    /// Chat lines seen so far, as `(sender, text)`.
    pub fn messages(&mut self) -> Vec<(String, String)> {
        self.drain();
        self.seen
            .iter()
            .filter_map(|e| match e {
                UiEvent::MessageLine { sender, text } => Some((sender.clone(), text.clone())),
                _ => None,
            })
            .collect()
    }

    /// The most recent membership snapshot seen.
    pub fn last_client_list(&mut self) -> Option<Vec<String>> {
        self.drain();
        self.seen.iter().rev().find_map(|e| match e {
            UiEvent::ClientList(names) => Some(names.clone()),
            _ => None,
        })
    }
}

/// A bare protocol connection with no listener, for driving the server
/// by hand (e.g. holding back confirms).
pub struct RawPeer {
    pub name: String,
    connection: Connection,
}

impl RawPeer {
    pub async fn connect(addr: &str, name: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            name: name.to_string(),
            connection: Connection::from_tcp(stream, DEFAULT_OUTBOUND_QUEUE),
        })
    }

    pub fn send(&self, pdu: Pdu) -> Result<()> {
        Ok(self.connection.send(pdu)?)
    }

    pub async fn recv(&mut self) -> Result<Pdu> {
        Ok(self.connection.receive(WAIT).await?)
    }

    /// Whether nothing arrives within `window`.
    pub async fn is_quiet(&mut self, window: Duration) -> bool {
        matches!(
            self.connection.receive(window).await,
            Err(TransportError::Timeout(_))
        )
    }

    /// Receive until a PDU of `kind` arrives.
    pub async fn recv_kind(&mut self, kind: PduKind) -> Result<Pdu> {
        loop {
            let pdu = self.recv().await?;
            if pdu.kind() == kind {
                return Ok(pdu);
            }
        }
    }

    /// Confirm `event` as this peer.
    pub fn confirm(&self, event: &Pdu) -> Result<()> {
        let confirm = event
            .confirm_for(&self.name, "raw")
            .context("not an event")?;
        self.send(confirm)
    }

    /// Log in, confirming the own login event.
    pub async fn login(&mut self) -> Result<()> {
        self.send(Pdu::login_request(&self.name, "raw"))?;
        let event = self.recv_kind(PduKind::LoginEvent).await?;
        self.confirm(&event)?;
        let response = self.recv_kind(PduKind::LoginResponse).await?;
        if response.error_code().is_error() {
            bail!("login rejected");
        }
        Ok(())
    }

    /// Drop the connection without logging out.
    pub async fn disconnect(mut self) {
        self.connection.close().await;
    }
}
