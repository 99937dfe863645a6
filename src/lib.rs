//! # cowrite — Real-time collaborative plain-text editing
//!
//! Multi-user editing over WebSocket using operational transformation, with
//! a zero-knowledge relay: operation and cursor payloads cross the wire as
//! ciphertext the relay never opens.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ RelayServer  │
//! │ (per user)   │    Binary Proto     │ (central)    │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ Editor       │                     │ SessionActor │
//! │ text + queue │                     │ per document │
//! │ + transform  │                     │ version,     │
//! └──────┬───────┘                     │ members,     │
//!        │                             │ leader       │
//!        ▼                             └──────────────┘
//! ┌──────────────┐
//! │ Persister    │  (leader only, debounced, encrypted)
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — Insert/delete edits and their application to text
//! - [`diff`] — Snapshot diffing into single edits
//! - [`transform`] — Operational transformation for edits and cursors
//! - [`pending`] — Coalescing FIFO queue of unacknowledged local operations
//! - [`editor`] — One participant's document state, transport-free
//! - [`cursor`] — Remote cursor tracking
//! - [`protocol`] — Binary wire protocol (bincode-encoded envelopes)
//! - [`crypto`] — Payload cipher boundary
//! - [`persist`] — Persistence boundary and leader write debouncing
//! - [`session`] — Per-document session actors (version, members, leader)
//! - [`relay`] — WebSocket relay server
//! - [`client`] — WebSocket client wiring an editor to a relay

pub mod client;
pub mod crypto;
pub mod cursor;
pub mod diff;
pub mod editor;
pub mod operation;
pub mod pending;
pub mod persist;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod transform;

// Re-exports for convenience
pub use client::{ClientConfig, CollabClient, CollabEvent};
pub use crypto::{CipherError, EnvelopeCipher, PlainCipher, XorCipher};
pub use cursor::{CursorTracker, RemoteCursor};
pub use editor::Editor;
pub use operation::{apply, ApplyError, Edit, Operation};
pub use persist::{
    MemoryPersister, PersistenceDebouncer, PersistError, Persister,
};
pub use protocol::{
    ContentPayload, CursorPayload, Envelope, EnvelopeKind, ProtocolError,
};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use session::{SessionHandle, SessionManager};
pub use transform::{transform, transform_cursor};
