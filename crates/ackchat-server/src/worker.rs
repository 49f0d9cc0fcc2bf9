//! Per-connection worker: reads requests and confirms from one client, fans
//! events out through the registry and releases responses once every member
//! has confirmed.

use crate::registry::{
    Audience, ClientRegistry, Confirmation, Recipient, RegistryError, SessionId, SessionInfo,
};
use ackchat::protocol::{ConversationStatus, ErrorCode, EventKind, Pdu, PduKind};
use ackchat::{Connection, TransportError};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// The registration this connection created. The name alone is not enough:
/// once the session is swept the name can be registered again by someone else.
#[derive(Debug, Clone)]
struct OwnSession {
    name: String,
    id: SessionId,
}

pub struct ServerWorker {
    connection: Connection,
    registry: Arc<ClientRegistry>,
    receive_timeout: Duration,
    session: Option<OwnSession>,
    finished: bool,
}

impl ServerWorker {
    pub fn new(
        connection: Connection,
        registry: Arc<ClientRegistry>,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            registry,
            receive_timeout,
            session: None,
            finished: false,
        }
    }

    /// Drive the connection until the client logs out, disconnects or goes silent.
    pub async fn run(mut self) {
        debug!(peer = %self.connection.peer(), "worker started");
        while !self.finished {
            if self.session_removable() {
                break;
            }
            match self.connection.receive(self.receive_timeout).await {
                Ok(pdu) => {
                    let started = Instant::now();
                    if let Err(e) = self.handle(pdu, started) {
                        error!(peer = %self.connection.peer(), err = %e, "request failed, closing connection");
                        self.finished = true;
                    }
                }
                Err(TransportError::Timeout(after)) => {
                    if self.own_status() == Some(ConversationStatus::Unregistering) {
                        error!(user = ?self.user_name(), ?after, "no confirm from logging out client, giving up");
                        self.finished = true;
                    } else {
                        trace!(user = ?self.user_name(), "receive timeout, still waiting");
                    }
                }
                Err(e) if e.is_recoverable() => {
                    warn!(peer = %self.connection.peer(), err = %e, "discarding unreadable message");
                }
                Err(TransportError::EndOfStream) => {
                    debug!(peer = %self.connection.peer(), user = ?self.user_name(), "client closed connection");
                    self.finished = true;
                }
                Err(e) => {
                    error!(peer = %self.connection.peer(), err = %e, "receive failed, closing connection");
                    self.finished = true;
                }
            }
        }
        self.shutdown().await;
    }

    /// Handle one inbound PDU.
    pub fn handle(&mut self, pdu: Pdu, started: Instant) -> Result<()> {
        match pdu.kind() {
            PduKind::LoginRequest => self.login_request(pdu, started),
            PduKind::LogoutRequest => {
                self.logout_request(pdu, started);
                Ok(())
            }
            PduKind::ChatMessageRequest => {
                self.chat_message_request(pdu, started);
                Ok(())
            }
            PduKind::LoginConfirm | PduKind::LogoutConfirm | PduKind::ChatMessageConfirm => {
                self.confirm(pdu);
                Ok(())
            }
            other => {
                debug!(peer = %self.connection.peer(), kind = ?other, "unexpected message from client, discarding");
                Ok(())
            }
        }
    }

    /// Whether this worker should stop because its session is done with.
    ///
    /// Also sweeps other finished sessions out of the registry.
    fn session_removable(&mut self) -> bool {
        if let Some(own) = &self.session {
            match self.registry.lookup_session(&own.name, own.id) {
                None => {
                    debug!(user = %own.name, session = %own.id, "session no longer registered");
                    return true;
                }
                Some(info) if info.finished && self.registry.delete(&own.name, own.id) => {
                    debug!(user = %own.name, session = %own.id, "finished session deleted");
                    return true;
                }
                Some(_) => {}
            }
        }
        self.registry.garbage_collect();
        self.session.is_some() && self.own_session().is_none()
    }

    fn user_name(&self) -> Option<&str> {
        self.session.as_ref().map(|own| own.name.as_str())
    }

    /// This connection's registry entry, if it still exists.
    fn own_session(&self) -> Option<SessionInfo> {
        let own = self.session.as_ref()?;
        self.registry.lookup_session(&own.name, own.id)
    }

    fn own_status(&self) -> Option<ConversationStatus> {
        self.own_session().map(|info| info.status)
    }

    fn login_request(&mut self, pdu: Pdu, started: Instant) -> Result<()> {
        if let Some(name) = self.user_name() {
            debug!(user = %name, requested = %pdu.user_name, "connection already logged in, discarding login");
            return Ok(());
        }
        let name = pdu.user_name.clone();
        if name.trim().is_empty() {
            return self.reject_login(&pdu, "empty user name");
        }
        let id = match self.registry.register(&name, self.connection.handle()) {
            Ok(info) => info.id,
            Err(RegistryError::DuplicateName(_)) => {
                return self.reject_login(&pdu, "name already in use");
            }
        };
        self.session = Some(OwnSession {
            name: name.clone(),
            id,
        });
        self.registry.stats().incr_requests();
        self.registry
            .begin_request(&name, pdu.sequence_number, &pdu.client_thread_name, started);

        let recipients = self.registry.recipients(Audience::All);
        let targets: Vec<String> = recipients.iter().map(|r| r.name.clone()).collect();
        let members: Vec<String> = recipients
            .iter()
            .filter(|r| r.is_member())
            .map(|r| r.name.clone())
            .collect();
        let admitted = self
            .registry
            .open_wait_list(&name, EventKind::Login, &targets);
        info!(user = %name, session = %id, peer = %self.connection.peer(), members = members.len(), "login accepted");

        let event = Pdu::login_event(&name, members);
        if admitted == 0 {
            self.release(&name, EventKind::Login, id);
        } else {
            self.fan_out(&name, &event, &recipients);
        }
        self.registry
            .set_status(&name, ConversationStatus::Registered);
        Ok(())
    }

    fn reject_login(&self, pdu: &Pdu, reason: &str) -> Result<()> {
        info!(user = %pdu.user_name, peer = %self.connection.peer(), reason, "login rejected");
        self.connection
            .send(Pdu::login_error(pdu, ErrorCode::LoginError))
            .context("failed to send login error")
    }

    fn chat_message_request(&mut self, pdu: Pdu, started: Instant) {
        let Some(OwnSession { name, id }) = self.session.clone() else {
            debug!(peer = %self.connection.peer(), "chat message before login, discarding");
            return;
        };
        if self.own_status() != Some(ConversationStatus::Registered) {
            debug!(user = %name, "chat message while not registered, discarding");
            return;
        }
        self.registry.stats().incr_requests();
        self.registry.incr_messages_received(&name);
        self.registry
            .begin_request(&name, pdu.sequence_number, &pdu.client_thread_name, started);

        let recipients = self.registry.recipients(Audience::Active);
        let members: Vec<String> = recipients.iter().map(|r| r.name.clone()).collect();
        let admitted = self
            .registry
            .open_wait_list(&name, EventKind::Chat, &members);
        trace!(user = %name, seq = pdu.sequence_number, recipients = admitted, "relaying chat message");

        let message = pdu.message().unwrap_or_default();
        let event = Pdu::chat_event(&name, pdu.sequence_number, message);
        if admitted == 0 {
            self.release(&name, EventKind::Chat, id);
        } else {
            self.fan_out(&name, &event, &recipients);
        }
    }

    fn logout_request(&mut self, pdu: Pdu, started: Instant) {
        let Some(OwnSession { name, id }) = self.session.clone() else {
            debug!(peer = %self.connection.peer(), "logout before login, discarding");
            return;
        };
        if self.own_status() != Some(ConversationStatus::Registered) {
            debug!(user = %name, "duplicate logout, discarding");
            return;
        }
        self.registry.stats().incr_requests();
        self.registry.stats().incr_logouts();
        self.registry
            .begin_request(&name, pdu.sequence_number, &pdu.client_thread_name, started);

        // The departing member is fanned out to as well; its confirm is part
        // of the barrier.
        let recipients = self.registry.recipients(Audience::All);
        let targets: Vec<String> = recipients.iter().map(|r| r.name.clone()).collect();
        let admitted = self
            .registry
            .open_wait_list(&name, EventKind::Logout, &targets);
        self.registry
            .set_status(&name, ConversationStatus::Unregistering);
        info!(user = %name, members = targets.len(), "logout started");

        let remaining: Vec<String> = recipients
            .iter()
            .filter(|r| r.is_member() && r.name != name)
            .map(|r| r.name.clone())
            .collect();
        let event = Pdu::logout_event(&name, remaining);
        if admitted == 0 {
            self.release(&name, EventKind::Logout, id);
        } else {
            self.fan_out(&name, &event, &recipients);
        }
    }

    fn confirm(&mut self, pdu: Pdu) {
        let Some(confirmer) = self.user_name().map(str::to_string) else {
            debug!(peer = %self.connection.peer(), "confirm from connection without session, discarding");
            return;
        };
        if self.own_session().is_none() {
            debug!(user = %confirmer, "confirm after session was removed, discarding");
            return;
        }
        let (Some(event_key), Some(kind)) = (pdu.event_user_name(), pdu.kind().event_kind())
        else {
            return;
        };
        let event_key = event_key.to_string();
        self.registry.stats().incr_confirms_received();
        self.registry.incr_confirms_received(&event_key);

        match self.registry.confirm(&event_key, kind, &confirmer) {
            Confirmation::Drained { kind, owner } => {
                trace!(event_key = %event_key, confirmer = %confirmer, "wait list drained");
                self.release(&event_key, kind, owner);
            }
            Confirmation::Pending { remaining } => {
                trace!(event_key = %event_key, confirmer = %confirmer, remaining, "confirm recorded");
            }
            Confirmation::Ignored => {
                debug!(event_key = %event_key, confirmer = %confirmer, ?kind, "confirm for no open wait list");
            }
        }
    }

    /// Send one copy of `event` to every recipient. Recipients that cannot be
    /// reached are withdrawn from the wait list.
    fn fan_out(&self, event_key: &str, event: &Pdu, recipients: &[Recipient]) {
        for recipient in recipients {
            match recipient.connection.send(event.addressed_to(&recipient.name)) {
                Ok(()) => {
                    self.registry.stats().incr_events_sent();
                    self.registry.incr_events_sent(event_key);
                }
                Err(e) => {
                    warn!(event_key, recipient = %recipient.name, err = %e, "event not delivered, dropping recipient from wait list");
                    if let Confirmation::Drained { kind, owner } =
                        self.registry.withdraw(event_key, &recipient.name)
                    {
                        self.release(event_key, kind, owner);
                    }
                }
            }
        }
    }

    /// The wait list of `event_key` drained: answer the request of the
    /// registration `owner`, unless that registration is gone.
    fn release(&self, event_key: &str, kind: EventKind, owner: SessionId) {
        let Some(originator) = self.registry.lookup_session(event_key, owner) else {
            debug!(event_key, session = %owner, ?kind, "originator gone, response dropped");
            return;
        };
        let elapsed = u64::try_from(originator.request_started.elapsed().as_nanos())
            .unwrap_or(u64::MAX);
        let thread = &originator.client_thread_name;
        let response = match kind {
            EventKind::Login => {
                Pdu::login_response(event_key, thread, originator.messages_received, elapsed)
            }
            EventKind::Chat => Pdu::chat_response(
                event_key,
                thread,
                originator.sequence_number,
                originator.messages_received,
                elapsed,
            ),
            EventKind::Logout => {
                self.registry
                    .set_status(event_key, ConversationStatus::Unregistered);
                Pdu::logout_response(event_key, thread, originator.messages_received, elapsed)
            }
        };
        if let Err(e) = originator.connection.send(response) {
            warn!(event_key, ?kind, err = %e, "failed to send response");
        }
        if kind == EventKind::Logout {
            self.registry.mark_finished(event_key);
            info!(user = %event_key, "logout complete");
        }
    }

    async fn shutdown(&mut self) {
        if let Some(own) = self.session.take() {
            for drained in self.registry.remove(&own.name, own.id) {
                self.release(&drained.event_key, drained.kind, drained.owner);
            }
        }
        self.connection.close().await;
        debug!(peer = %self.connection.peer(), "worker stopped");
    }
}
