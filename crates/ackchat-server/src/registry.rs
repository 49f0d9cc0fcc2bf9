//! Shared table of all sessions plus the per-event wait lists that form the
//! fan-out/confirm barrier.
//!
//! Every operation takes the single registry lock for its whole duration and
//! returns detached data, so callers never hold the lock across a network send.
//! Misses are ordinary outcomes: no operation here fails because a name or
//! wait list is absent.

use crate::stats::ServerStats;
use ackchat::ConnectionHandle;
use ackchat::protocol::{ConversationStatus, EventKind};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("user name already registered: {0}")]
    DuplicateName(String),
}

/// Identifies one registration of a name. A name freed by logout or
/// disconnect can be registered again, but never with the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-session diagnostic counters.
#[derive(Debug, Default)]
struct SessionCounters {
    messages_received: AtomicU64,
    events_sent: AtomicU64,
    confirms_received: AtomicU64,
}

struct Session {
    id: SessionId,
    connection: ConnectionHandle,
    status: ConversationStatus,
    counters: Arc<SessionCounters>,
    login_time: Instant,
    request_started: Instant,
    sequence_number: u64,
    client_thread_name: String,
    finished: bool,
}

impl Session {
    fn info(&self, name: &str) -> SessionInfo {
        SessionInfo {
            id: self.id,
            name: name.to_string(),
            connection: self.connection.clone(),
            status: self.status,
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            events_sent: self.counters.events_sent.load(Ordering::Relaxed),
            confirms_received: self.counters.confirms_received.load(Ordering::Relaxed),
            login_time: self.login_time,
            request_started: self.request_started,
            sequence_number: self.sequence_number,
            client_thread_name: self.client_thread_name.clone(),
            finished: self.finished,
        }
    }
}

/// Detached copy of one registry entry.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub connection: ConnectionHandle,
    pub status: ConversationStatus,
    pub messages_received: u64,
    pub events_sent: u64,
    pub confirms_received: u64,
    pub login_time: Instant,
    /// When the session's most recent request arrived.
    pub request_started: Instant,
    /// Sequence number of the most recent request, echoed in its response.
    pub sequence_number: u64,
    pub client_thread_name: String,
    pub finished: bool,
}

/// A fan-out target: a member's name and where to send its copy of the event.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub name: String,
    pub status: ConversationStatus,
    pub connection: ConnectionHandle,
}

impl Recipient {
    /// Whether this recipient belongs in a membership snapshot.
    pub fn is_member(&self) -> bool {
        is_logged_in(self.status)
    }
}

/// Which members an event is fanned out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Every known session, whatever its status.
    All,
    /// Sessions not yet `Unregistered`.
    Active,
}

struct WaitList {
    kind: EventKind,
    /// The session whose request opened this wait list.
    owner: SessionId,
    pending: BTreeSet<String>,
}

/// Result of removing one name from a wait list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// No matching wait list is open, or the name was not (or no longer) on it.
    Ignored,
    /// The name was removed; others still have to confirm.
    Pending { remaining: usize },
    /// This call emptied the wait list. Exactly one caller sees this per event
    /// and must release the response to `owner`.
    Drained { kind: EventKind, owner: SessionId },
}

impl Confirmation {
    pub fn remaining(&self) -> Option<usize> {
        match self {
            Confirmation::Ignored => None,
            Confirmation::Pending { remaining } => Some(*remaining),
            Confirmation::Drained { .. } => Some(0),
        }
    }
}

/// A wait list emptied as a side effect of removing a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainedEvent {
    pub event_key: String,
    pub kind: EventKind,
    pub owner: SessionId,
}

#[derive(Default)]
struct Inner {
    sessions: BTreeMap<String, Session>,
    wait_lists: HashMap<String, WaitList>,
    next_id: u64,
}

impl Inner {
    fn is_pending_confirmer(&self, name: &str) -> bool {
        self.wait_lists.values().any(|w| w.pending.contains(name))
    }

    fn remove_pending(&mut self, event_key: &str, name: &str) -> Confirmation {
        let Some(list) = self.wait_lists.get_mut(event_key) else {
            return Confirmation::Ignored;
        };
        if !list.pending.remove(name) {
            return Confirmation::Ignored;
        }
        if list.pending.is_empty() {
            let (kind, owner) = (list.kind, list.owner);
            self.wait_lists.remove(event_key);
            Confirmation::Drained { kind, owner }
        } else {
            Confirmation::Pending {
                remaining: list.pending.len(),
            }
        }
    }
}

fn is_logged_in(status: ConversationStatus) -> bool {
    matches!(
        status,
        ConversationStatus::Registering | ConversationStatus::Registered
    )
}

/// The single owner of all sessions and wait lists.
pub struct ClientRegistry {
    inner: Mutex<Inner>,
    stats: ServerStats,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            stats: ServerStats::new(),
        }
    }

    /// Server-wide counters, including the logged-in gauge this registry maintains.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        // A panic elsewhere must not take the whole registry down with it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a session in `Registering` for a new, unique name. The returned
    /// [`SessionInfo::id`] is what the owning worker passes to [`Self::delete`]
    /// and [`Self::remove`].
    pub fn register(
        &self,
        name: &str,
        connection: ConnectionHandle,
    ) -> Result<SessionInfo, RegistryError> {
        let mut inner = self.inner();
        if inner.sessions.contains_key(name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        inner.next_id += 1;
        let id = SessionId(inner.next_id);
        let now = Instant::now();
        let session = Session {
            id,
            connection,
            status: ConversationStatus::Registering,
            counters: Arc::default(),
            login_time: now,
            request_started: now,
            sequence_number: 0,
            client_thread_name: String::new(),
            finished: false,
        };
        let info = session.info(name);
        inner.sessions.insert(name.to_string(), session);
        self.stats.incr_logged_in();
        debug!(user = %name, session = %id, sessions = inner.sessions.len(), "session registered");
        Ok(info)
    }

    pub fn lookup(&self, name: &str) -> Option<SessionInfo> {
        self.inner().sessions.get(name).map(|s| s.info(name))
    }

    /// Like [`Self::lookup`], but only for the registration `id`.
    pub fn lookup_session(&self, name: &str, id: SessionId) -> Option<SessionInfo> {
        self.inner()
            .sessions
            .get(name)
            .filter(|s| s.id == id)
            .map(|s| s.info(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner().sessions.contains_key(name)
    }

    /// Change one session's status. Legality is the caller's concern.
    /// Returns whether the session exists.
    pub fn set_status(&self, name: &str, status: ConversationStatus) -> bool {
        let mut inner = self.inner();
        let Some(session) = inner.sessions.get_mut(name) else {
            return false;
        };
        let previous = session.status;
        session.status = status;
        if is_logged_in(previous) && !is_logged_in(status) {
            self.stats.decr_logged_in();
        } else if !is_logged_in(previous) && is_logged_in(status) {
            self.stats.incr_logged_in();
        }
        true
    }

    /// Record the arrival of a request: its start instant, sequence number and
    /// correlation tag are needed later to build the response.
    pub fn begin_request(
        &self,
        name: &str,
        sequence_number: u64,
        client_thread_name: &str,
        started: Instant,
    ) -> bool {
        let mut inner = self.inner();
        let Some(session) = inner.sessions.get_mut(name) else {
            return false;
        };
        session.request_started = started;
        session.sequence_number = sequence_number;
        if !client_thread_name.is_empty() {
            session.client_thread_name = client_thread_name.to_string();
        }
        true
    }

    pub fn incr_messages_received(&self, name: &str) {
        self.with_counters(name, |c| {
            c.messages_received.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn incr_events_sent(&self, name: &str) {
        self.with_counters(name, |c| {
            c.events_sent.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn incr_confirms_received(&self, name: &str) {
        self.with_counters(name, |c| {
            c.confirms_received.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn with_counters(&self, name: &str, f: impl FnOnce(&SessionCounters)) {
        let counters = self.inner().sessions.get(name).map(|s| s.counters.clone());
        if let Some(counters) = counters {
            f(&counters);
        }
    }

    /// Names of every known session, registered or mid-transition.
    pub fn snapshot_names(&self) -> Vec<String> {
        self.inner().sessions.keys().cloned().collect()
    }

    /// Snapshot of fan-out targets with their connections.
    pub fn recipients(&self, audience: Audience) -> Vec<Recipient> {
        self.inner()
            .sessions
            .iter()
            .filter(|(_, s)| match audience {
                Audience::All => true,
                Audience::Active => s.status != ConversationStatus::Unregistered,
            })
            .map(|(name, s)| Recipient {
                name: name.clone(),
                status: s.status,
                connection: s.connection.clone(),
            })
            .collect()
    }

    /// Open a fresh wait list for `event_key` over `names`.
    ///
    /// Names that are not registered any more are left out. An existing wait
    /// list for the same key is replaced. Returns the number of names admitted;
    /// zero means nobody will confirm (or `event_key` itself is gone) and no
    /// wait list was kept.
    pub fn open_wait_list(&self, event_key: &str, kind: EventKind, names: &[String]) -> usize {
        let mut inner = self.inner();
        let Some(owner) = inner.sessions.get(event_key).map(|s| s.id) else {
            inner.wait_lists.remove(event_key);
            return 0;
        };
        let pending: BTreeSet<String> = names
            .iter()
            .filter(|n| inner.sessions.contains_key(n.as_str()))
            .cloned()
            .collect();
        let admitted = pending.len();
        if admitted == 0 {
            inner.wait_lists.remove(event_key);
            return 0;
        }
        if let Some(previous) = inner
            .wait_lists
            .insert(
                event_key.to_string(),
                WaitList {
                    kind,
                    owner,
                    pending,
                },
            )
        {
            warn!(
                event_key,
                previous = ?previous.kind,
                outstanding = previous.pending.len(),
                "replaced a wait list that had not drained"
            );
        }
        admitted
    }

    /// Remove `confirmer` from the wait list of `event_key`, provided that wait
    /// list belongs to an event of `kind`.
    pub fn confirm(&self, event_key: &str, kind: EventKind, confirmer: &str) -> Confirmation {
        let mut inner = self.inner();
        let open = match inner.wait_lists.get(event_key) {
            Some(list) => list.kind,
            None => return Confirmation::Ignored,
        };
        if open != kind {
            debug!(event_key, expected = ?open, got = ?kind, "confirm for a different event");
            return Confirmation::Ignored;
        }
        inner.remove_pending(event_key, confirmer)
    }

    /// Give up on `name` confirming the event of `event_key`, e.g. because the
    /// event could not be delivered to it.
    pub fn withdraw(&self, event_key: &str, name: &str) -> Confirmation {
        self.inner().remove_pending(event_key, name)
    }

    /// Number of names still pending on `event_key`'s wait list.
    pub fn wait_list_size(&self, event_key: &str) -> Option<usize> {
        self.inner().wait_lists.get(event_key).map(|w| w.pending.len())
    }

    pub fn open_wait_lists(&self) -> usize {
        self.inner().wait_lists.len()
    }

    /// Flag a session for removal. Does not remove it.
    pub fn mark_finished(&self, name: &str) -> bool {
        let mut inner = self.inner();
        match inner.sessions.get_mut(name) {
            Some(session) => {
                session.finished = true;
                true
            }
            None => false,
        }
    }

    /// Remove every finished session no open wait list still waits on.
    pub fn garbage_collect(&self) -> Vec<String> {
        let mut inner = self.inner();
        let removable: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(name, s)| s.finished && !inner.is_pending_confirmer(name))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &removable {
            if let Some(session) = inner.sessions.remove(name) {
                if is_logged_in(session.status) {
                    self.stats.decr_logged_in();
                }
                inner.wait_lists.remove(name);
            }
        }
        if !removable.is_empty() {
            debug!(removed = ?removable, sessions = inner.sessions.len(), "garbage collected sessions");
        }
        removable
    }

    /// Remove the registration `id` of `name` unless an open wait list still
    /// waits on it. A later registration of the same name is left alone.
    pub fn delete(&self, name: &str, id: SessionId) -> bool {
        let mut inner = self.inner();
        if inner.sessions.get(name).map(|s| s.id) != Some(id) || inner.is_pending_confirmer(name)
        {
            return false;
        }
        match inner.sessions.remove(name) {
            Some(session) => {
                if is_logged_in(session.status) {
                    self.stats.decr_logged_in();
                }
                inner.wait_lists.remove(name);
                true
            }
            None => false,
        }
    }

    /// Remove the registration `id` of `name` unconditionally, as a worker does
    /// when its connection ends. A later registration of the same name is left
    /// alone.
    ///
    /// `name` is withdrawn from every wait list it was pending on, and its own
    /// wait list is dropped since nobody is left to answer. Wait lists that
    /// drain because of the withdrawal are returned so the caller can release
    /// their responses.
    pub fn remove(&self, name: &str, id: SessionId) -> Vec<DrainedEvent> {
        let mut inner = self.inner();
        if inner.sessions.get(name).map(|s| s.id) != Some(id) {
            return Vec::new();
        }
        let Some(session) = inner.sessions.remove(name) else {
            return Vec::new();
        };
        if is_logged_in(session.status) {
            self.stats.decr_logged_in();
        }
        inner.wait_lists.remove(name);

        let keys: Vec<String> = inner
            .wait_lists
            .iter()
            .filter(|(_, w)| w.pending.contains(name))
            .map(|(key, _)| key.clone())
            .collect();
        let mut drained = Vec::new();
        for key in keys {
            if let Confirmation::Drained { kind, owner } = inner.remove_pending(&key, name) {
                drained.push(DrainedEvent {
                    event_key: key,
                    kind,
                    owner,
                });
            }
        }
        debug!(user = %name, session = %id, sessions = inner.sessions.len(), drained = drained.len(), "session removed");
        drained
    }

    pub fn len(&self) -> usize {
        self.inner().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner().sessions.is_empty()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
