use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum size of a JSON-lines frame on the wire (64 KiB).
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Port the server listens on when none is configured.
pub const DEFAULT_PORT: u16 = 50000;

// ---------------------------------------------------------------------------
// Conversation state machine
// ---------------------------------------------------------------------------

/// Conversation status of one session, shared by the server worker and the
/// client listener.
///
/// `Unregistered -> Registering -> Registered -> Unregistering -> Unregistered`.
/// A rejected login falls back from `Registering` straight to `Unregistered`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Unregistered,
    Registering,
    Registered,
    Unregistering,
}

impl ConversationStatus {
    /// Whether an inbound PDU of `kind` is legal in this status.
    ///
    /// Anything else is a stale or duplicate event and is discarded by the caller.
    pub fn accepts(self, kind: PduKind) -> bool {
        use PduKind::*;
        match self {
            ConversationStatus::Registering => matches!(
                kind,
                LoginResponse | LoginEvent | LogoutEvent | ChatMessageEvent
            ),
            ConversationStatus::Registered => matches!(
                kind,
                ChatMessageResponse | ChatMessageEvent | LoginEvent | LogoutEvent
            ),
            ConversationStatus::Unregistering => matches!(
                kind,
                ChatMessageEvent | LogoutResponse | LoginEvent | LogoutEvent
            ),
            ConversationStatus::Unregistered => false,
        }
    }

    /// Whether moving from `self` to `next` follows the one-directional cycle.
    pub fn can_transition_to(self, next: ConversationStatus) -> bool {
        use ConversationStatus::*;
        matches!(
            (self, next),
            (Unregistered, Registering)
                | (Registering, Registered)
                | (Registering, Unregistered)
                | (Registered, Unregistering)
                | (Unregistering, Unregistered)
        )
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ConversationStatus::Unregistered => 0,
            ConversationStatus::Registering => 1,
            ConversationStatus::Registered => 2,
            ConversationStatus::Unregistering => 3,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConversationStatus::Registering,
            2 => ConversationStatus::Registered,
            3 => ConversationStatus::Unregistering,
            _ => ConversationStatus::Unregistered,
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationStatus::Unregistered => write!(f, "UNREGISTERED"),
            ConversationStatus::Registering => write!(f, "REGISTERING"),
            ConversationStatus::Registered => write!(f, "REGISTERED"),
            ConversationStatus::Unregistering => write!(f, "UNREGISTERING"),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed enums for wire format safety
// ---------------------------------------------------------------------------

/// Result code carried by a login response.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[default]
    None,
    /// The requested name is already held by another session.
    LoginError,
}

impl ErrorCode {
    /// Numeric code reported to the user interface.
    pub fn code(self) -> u32 {
        match self {
            ErrorCode::None => 0,
            ErrorCode::LoginError => 1,
        }
    }

    pub fn is_error(self) -> bool {
        self != ErrorCode::None
    }
}

/// Which barrier a wait list belongs to, i.e. which response is released
/// when it drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Login,
    Logout,
    Chat,
}

/// The tag of a PDU without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PduKind {
    LoginRequest,
    LoginResponse,
    LoginEvent,
    LoginConfirm,
    LogoutRequest,
    LogoutResponse,
    LogoutEvent,
    LogoutConfirm,
    ChatMessageRequest,
    ChatMessageResponse,
    ChatMessageEvent,
    ChatMessageConfirm,
}

impl PduKind {
    /// Requests a client sends to start a conversation step.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            PduKind::LoginRequest | PduKind::LogoutRequest | PduKind::ChatMessageRequest
        )
    }

    /// Acknowledgements a client sends after applying an event.
    pub fn is_confirm(self) -> bool {
        matches!(
            self,
            PduKind::LoginConfirm | PduKind::LogoutConfirm | PduKind::ChatMessageConfirm
        )
    }

    /// The barrier an event or confirm of this kind belongs to.
    pub fn event_kind(self) -> Option<EventKind> {
        match self {
            PduKind::LoginEvent | PduKind::LoginConfirm => Some(EventKind::Login),
            PduKind::LogoutEvent | PduKind::LogoutConfirm => Some(EventKind::Logout),
            PduKind::ChatMessageEvent | PduKind::ChatMessageConfirm => Some(EventKind::Chat),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// PDU
// ---------------------------------------------------------------------------

/// One protocol data unit, sent as a single JSON line.
///
/// `user_name` is the sender for requests and confirms, and the addressee for
/// events and responses. Events and confirms additionally name the session
/// that triggered the event in `event_user_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pdu {
    pub user_name: String,
    /// Correlation tag chosen by the client, echoed in responses.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_thread_name: String,
    /// Assigned by the sending client, echoed unchanged in responses.
    #[serde(default)]
    pub sequence_number: u64,
    #[serde(flatten)]
    pub body: PduBody,
}

/// Kind-specific payload of a [`Pdu`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PduBody {
    LoginRequest,
    LoginResponse {
        #[serde(default)]
        error_code: ErrorCode,
        #[serde(default)]
        received_messages: u64,
        #[serde(default)]
        server_time_ns: u64,
    },
    LoginEvent {
        event_user_name: String,
        clients: Vec<String>,
    },
    LoginConfirm {
        event_user_name: String,
    },
    LogoutRequest,
    LogoutResponse {
        #[serde(default)]
        received_messages: u64,
        #[serde(default)]
        server_time_ns: u64,
    },
    LogoutEvent {
        event_user_name: String,
        clients: Vec<String>,
    },
    LogoutConfirm {
        event_user_name: String,
    },
    ChatMessageRequest {
        message: String,
    },
    ChatMessageResponse {
        #[serde(default)]
        received_messages: u64,
        #[serde(default)]
        server_time_ns: u64,
    },
    ChatMessageEvent {
        event_user_name: String,
        message: String,
    },
    ChatMessageConfirm {
        event_user_name: String,
    },
}

impl Pdu {
    fn new(user_name: &str, client_thread_name: &str, sequence_number: u64, body: PduBody) -> Self {
        Self {
            user_name: user_name.to_string(),
            client_thread_name: client_thread_name.to_string(),
            sequence_number,
            body,
        }
    }

    pub fn login_request(user_name: &str, client_thread_name: &str) -> Self {
        Self::new(user_name, client_thread_name, 0, PduBody::LoginRequest)
    }

    /// Successful login response, released once every member confirmed the login event.
    pub fn login_response(
        user_name: &str,
        client_thread_name: &str,
        received_messages: u64,
        server_time_ns: u64,
    ) -> Self {
        Self::new(
            user_name,
            client_thread_name,
            0,
            PduBody::LoginResponse {
                error_code: ErrorCode::None,
                received_messages,
                server_time_ns,
            },
        )
    }

    /// Rejection of `request`, addressed back to the name it asked for.
    pub fn login_error(request: &Pdu, error_code: ErrorCode) -> Self {
        Self::new(
            &request.user_name,
            &request.client_thread_name,
            request.sequence_number,
            PduBody::LoginResponse {
                error_code,
                received_messages: 0,
                server_time_ns: 0,
            },
        )
    }

    /// Membership snapshot broadcast after `event_user_name` logged in.
    /// The addressee is filled in per recipient with [`Pdu::addressed_to`].
    pub fn login_event(event_user_name: &str, clients: Vec<String>) -> Self {
        Self::new(
            "",
            "",
            0,
            PduBody::LoginEvent {
                event_user_name: event_user_name.to_string(),
                clients,
            },
        )
    }

    pub fn logout_request(user_name: &str, client_thread_name: &str) -> Self {
        Self::new(user_name, client_thread_name, 0, PduBody::LogoutRequest)
    }

    pub fn logout_response(
        user_name: &str,
        client_thread_name: &str,
        received_messages: u64,
        server_time_ns: u64,
    ) -> Self {
        Self::new(
            user_name,
            client_thread_name,
            0,
            PduBody::LogoutResponse {
                received_messages,
                server_time_ns,
            },
        )
    }

    pub fn logout_event(event_user_name: &str, clients: Vec<String>) -> Self {
        Self::new(
            "",
            "",
            0,
            PduBody::LogoutEvent {
                event_user_name: event_user_name.to_string(),
                clients,
            },
        )
    }

    pub fn chat_request(
        user_name: &str,
        client_thread_name: &str,
        sequence_number: u64,
        message: &str,
    ) -> Self {
        Self::new(
            user_name,
            client_thread_name,
            sequence_number,
            PduBody::ChatMessageRequest {
                message: message.to_string(),
            },
        )
    }

    pub fn chat_response(
        user_name: &str,
        client_thread_name: &str,
        sequence_number: u64,
        received_messages: u64,
        server_time_ns: u64,
    ) -> Self {
        Self::new(
            user_name,
            client_thread_name,
            sequence_number,
            PduBody::ChatMessageResponse {
                received_messages,
                server_time_ns,
            },
        )
    }

    /// Chat message relayed from `event_user_name` to every member.
    pub fn chat_event(event_user_name: &str, sequence_number: u64, message: &str) -> Self {
        Self::new(
            "",
            "",
            sequence_number,
            PduBody::ChatMessageEvent {
                event_user_name: event_user_name.to_string(),
                message: message.to_string(),
            },
        )
    }

    /// Copy of this PDU addressed to `recipient`.
    pub fn addressed_to(&self, recipient: &str) -> Self {
        Self {
            user_name: recipient.to_string(),
            ..self.clone()
        }
    }

    /// Build the confirm a recipient sends back for this event.
    ///
    /// Returns `None` when `self` is not an event.
    pub fn confirm_for(&self, confirmer: &str, client_thread_name: &str) -> Option<Pdu> {
        let body = match &self.body {
            PduBody::LoginEvent {
                event_user_name, ..
            } => PduBody::LoginConfirm {
                event_user_name: event_user_name.clone(),
            },
            PduBody::LogoutEvent {
                event_user_name, ..
            } => PduBody::LogoutConfirm {
                event_user_name: event_user_name.clone(),
            },
            PduBody::ChatMessageEvent {
                event_user_name, ..
            } => PduBody::ChatMessageConfirm {
                event_user_name: event_user_name.clone(),
            },
            _ => return None,
        };
        Some(Self::new(
            confirmer,
            client_thread_name,
            self.sequence_number,
            body,
        ))
    }

    pub fn kind(&self) -> PduKind {
        match &self.body {
            PduBody::LoginRequest => PduKind::LoginRequest,
            PduBody::LoginResponse { .. } => PduKind::LoginResponse,
            PduBody::LoginEvent { .. } => PduKind::LoginEvent,
            PduBody::LoginConfirm { .. } => PduKind::LoginConfirm,
            PduBody::LogoutRequest => PduKind::LogoutRequest,
            PduBody::LogoutResponse { .. } => PduKind::LogoutResponse,
            PduBody::LogoutEvent { .. } => PduKind::LogoutEvent,
            PduBody::LogoutConfirm { .. } => PduKind::LogoutConfirm,
            PduBody::ChatMessageRequest { .. } => PduKind::ChatMessageRequest,
            PduBody::ChatMessageResponse { .. } => PduKind::ChatMessageResponse,
            PduBody::ChatMessageEvent { .. } => PduKind::ChatMessageEvent,
            PduBody::ChatMessageConfirm { .. } => PduKind::ChatMessageConfirm,
        }
    }

    /// Originator of an event, or the event a confirm refers to.
    pub fn event_user_name(&self) -> Option<&str> {
        match &self.body {
            PduBody::LoginEvent {
                event_user_name, ..
            }
            | PduBody::LogoutEvent {
                event_user_name, ..
            }
            | PduBody::ChatMessageEvent {
                event_user_name, ..
            }
            | PduBody::LoginConfirm { event_user_name }
            | PduBody::LogoutConfirm { event_user_name }
            | PduBody::ChatMessageConfirm { event_user_name } => Some(event_user_name),
            _ => None,
        }
    }

    /// Membership snapshot carried by login and logout events.
    pub fn clients(&self) -> Option<&[String]> {
        match &self.body {
            PduBody::LoginEvent { clients, .. } | PduBody::LogoutEvent { clients, .. } => {
                Some(clients)
            }
            _ => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match &self.body {
            PduBody::ChatMessageRequest { message }
            | PduBody::ChatMessageEvent { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match &self.body {
            PduBody::LoginResponse { error_code, .. } => *error_code,
            _ => ErrorCode::None,
        }
    }

    /// Server processing time in nanoseconds, carried by responses.
    pub fn server_time_ns(&self) -> Option<u64> {
        match &self.body {
            PduBody::LoginResponse { server_time_ns, .. }
            | PduBody::LogoutResponse { server_time_ns, .. }
            | PduBody::ChatMessageResponse { server_time_ns, .. } => Some(*server_time_ns),
            _ => None,
        }
    }

    /// The originator's received-message count, carried by responses.
    pub fn received_messages(&self) -> Option<u64> {
        match &self.body {
            PduBody::LoginResponse {
                received_messages, ..
            }
            | PduBody::LogoutResponse {
                received_messages, ..
            }
            | PduBody::ChatMessageResponse {
                received_messages, ..
            } => Some(*received_messages),
            _ => None,
        }
    }

    /// Serialize to one JSON line (without the trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}
