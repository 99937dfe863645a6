//! Binary wire protocol between clients and the relay.
//!
//! Wire format (bincode-encoded [`Envelope`]):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ kind     │ sender    │ doc_id   │ version  │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Content and cursor payloads are ciphertext: the relay forwards them
//! without ever holding plaintext or keys. Only the envelope header (kind,
//! sender, version) is relay-visible. The plaintext layouts the clients
//! exchange inside those payloads are [`ContentPayload`] and
//! [`CursorPayload`], also bincode.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cursor::RemoteCursor;
use crate::operation::Operation;

/// Envelope kinds. A closed set: unknown kinds fail decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// First client frame: join the document session.
    Join = 1,
    /// Encrypted operation. Relay assigns a version and fans out.
    Content = 2,
    /// Relay to the sender of a content frame: your operation was accepted
    /// at this version.
    ContentAck = 3,
    /// Encrypted cursor state. Relayed verbatim, no version bump.
    Cursor = 4,
    /// Relay to everyone: current members, on every membership change.
    UsersList = 5,
    /// Relay to exactly one client: you persist from now on.
    YouAreLeader = 6,
    /// Clean-close notice. A dropped connection implies it.
    Leave = 7,
}

/// Top-level wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub sender: Uuid,
    pub doc_id: Uuid,
    /// Relay-assigned document version. Zero for frames outside the ordered
    /// content stream (join, cursor, users-list, leader).
    pub version: u64,
    /// Ciphertext for content/cursor, bincode member list for users-list,
    /// empty otherwise.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Create a join frame (the first frame a client sends).
    pub fn join(sender: Uuid, doc_id: Uuid) -> Self {
        Self { kind: EnvelopeKind::Join, sender, doc_id, version: 0, payload: Vec::new() }
    }

    /// Create a content frame carrying an encrypted operation.
    pub fn content(sender: Uuid, doc_id: Uuid, version: u64, ciphertext: Vec<u8>) -> Self {
        Self { kind: EnvelopeKind::Content, sender, doc_id, version, payload: ciphertext }
    }

    /// Create an acknowledgment for an accepted content frame.
    pub fn content_ack(doc_id: Uuid, version: u64) -> Self {
        Self {
            kind: EnvelopeKind::ContentAck,
            sender: Uuid::nil(),
            doc_id,
            version,
            payload: Vec::new(),
        }
    }

    /// Create a cursor frame carrying encrypted cursor state.
    pub fn cursor(sender: Uuid, doc_id: Uuid, ciphertext: Vec<u8>) -> Self {
        Self { kind: EnvelopeKind::Cursor, sender, doc_id, version: 0, payload: ciphertext }
    }

    /// Create a members-list frame.
    pub fn users_list(doc_id: Uuid, members: &[Uuid]) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(members, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            kind: EnvelopeKind::UsersList,
            sender: Uuid::nil(),
            doc_id,
            version: 0,
            payload,
        })
    }

    /// Create a leader-designation frame.
    pub fn you_are_leader(doc_id: Uuid) -> Self {
        Self {
            kind: EnvelopeKind::YouAreLeader,
            sender: Uuid::nil(),
            doc_id,
            version: 0,
            payload: Vec::new(),
        }
    }

    /// Create a leave frame.
    pub fn leave(sender: Uuid, doc_id: Uuid) -> Self {
        Self { kind: EnvelopeKind::Leave, sender, doc_id, version: 0, payload: Vec::new() }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(envelope)
    }

    /// Parse a users-list payload.
    pub fn members(&self) -> Result<Vec<Uuid>, ProtocolError> {
        if self.kind != EnvelopeKind::UsersList {
            return Err(ProtocolError::InvalidKind);
        }
        let (members, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(members)
    }
}

/// Plaintext of a content payload, visible only to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPayload {
    pub operation: Operation,
}

impl ContentPayload {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (payload, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(payload)
    }
}

/// Plaintext of a cursor payload, visible only to clients.
///
/// The owner is not part of the payload; receivers take it from the envelope
/// sender the relay attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPayload {
    pub position: usize,
    pub selection_end: Option<usize>,
    pub timestamp: u64,
}

impl CursorPayload {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (payload, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(payload)
    }

    /// Attach the envelope sender to form a tracked cursor.
    pub fn into_cursor(self, owner: Uuid) -> RemoteCursor {
        RemoteCursor {
            owner,
            position: self.position,
            selection_end: self.selection_end,
            timestamp: self.timestamp,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidKind,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidKind => write!(f, "Invalid envelope kind"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
