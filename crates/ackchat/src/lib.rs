//! Shared pieces of the ackchat broadcast protocol: the PDU wire format and
//! conversation state machine, the line-framed transport, and the client-side
//! listener that confirms every event the server pushes.

pub mod client;
pub mod connection;
pub mod listener;
pub mod protocol;
pub mod ui;

pub use connection::{Connection, ConnectionHandle, TransportError};
pub use protocol::{ConversationStatus, ErrorCode, EventKind, Pdu, PduBody, PduKind};
