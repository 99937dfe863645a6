//! Per-document sessions: membership, version sequencing, leader choice.
//!
//! Each document gets one actor task that exclusively owns the session state
//! (`version`, `members`, `leader`). Joins, leaves and content frames from
//! all participants funnel through its command channel, so version
//! assignment and leader changes are serialized by construction — there is
//! no lock to get wrong. Clients only ever see the state through the
//! envelopes the actor emits.
//!
//! The actor never decrypts anything: content and cursor payloads pass
//! through as opaque bytes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::Envelope;

/// Commands a connection task sends to its document's session actor.
#[derive(Debug)]
pub enum SessionCommand {
    /// A participant joined; `tx` is where its envelopes go.
    Join { id: Uuid, tx: mpsc::Sender<Envelope> },
    /// A participant left (or its connection dropped).
    Leave { id: Uuid },
    /// An encrypted operation to version and fan out.
    Content { sender: Uuid, payload: Vec<u8> },
    /// Encrypted cursor state to fan out verbatim.
    Cursor { sender: Uuid, payload: Vec<u8> },
}

/// The session actor has exited (last member left).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClosed;

impl std::fmt::Display for SessionClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "document session closed")
    }
}

impl std::error::Error for SessionClosed {}

/// Cloneable handle for sending commands to a session actor.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    doc_id: Uuid,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub async fn join(&self, id: Uuid, tx: mpsc::Sender<Envelope>) -> Result<(), SessionClosed> {
        self.tx
            .send(SessionCommand::Join { id, tx })
            .await
            .map_err(|_| SessionClosed)
    }

    pub async fn leave(&self, id: Uuid) -> Result<(), SessionClosed> {
        self.tx
            .send(SessionCommand::Leave { id })
            .await
            .map_err(|_| SessionClosed)
    }

    pub async fn content(&self, sender: Uuid, payload: Vec<u8>) -> Result<(), SessionClosed> {
        self.tx
            .send(SessionCommand::Content { sender, payload })
            .await
            .map_err(|_| SessionClosed)
    }

    pub async fn cursor(&self, sender: Uuid, payload: Vec<u8>) -> Result<(), SessionClosed> {
        self.tx
            .send(SessionCommand::Cursor { sender, payload })
            .await
            .map_err(|_| SessionClosed)
    }

    /// True once the actor has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct Member {
    id: Uuid,
    tx: mpsc::Sender<Envelope>,
}

/// Session state, owned by exactly one task.
struct SessionActor {
    doc_id: Uuid,
    /// Strictly increasing, +1 per accepted content frame.
    version: u64,
    /// Join order preserved; leader handoff picks the first remaining.
    members: Vec<Member>,
    leader: Option<Uuid>,
    had_members: bool,
}

impl SessionActor {
    fn new(doc_id: Uuid) -> Self {
        Self { doc_id, version: 0, members: Vec::new(), leader: None, had_members: false }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        log::debug!("Session {} started", self.doc_id);
        while let Some(command) = rx.recv().await {
            let mut dead = match command {
                SessionCommand::Join { id, tx } => self.handle_join(id, tx).await,
                SessionCommand::Leave { id } => self.handle_leave(id).await,
                SessionCommand::Content { sender, payload } => {
                    self.handle_content(sender, payload).await
                }
                SessionCommand::Cursor { sender, payload } => {
                    self.handle_cursor(sender, payload).await
                }
            };

            // Members whose channel failed mid-fan-out left without saying
            // so; process them as leaves until the session settles.
            while let Some(id) = dead.pop() {
                log::warn!("Participant {id} channel closed, removing from {}", self.doc_id);
                dead.extend(self.handle_leave(id).await);
            }

            // A member-bearing session must have a leader. Observing
            // otherwise is a relay bug, not a recoverable state.
            debug_assert!(self.members.is_empty() || self.leader.is_some());

            if self.had_members && self.members.is_empty() {
                break;
            }
        }
        log::debug!("Session {} ended at version {}", self.doc_id, self.version);
    }

    async fn handle_join(&mut self, id: Uuid, tx: mpsc::Sender<Envelope>) -> Vec<Uuid> {
        // A rejoin with the same id replaces the stale channel.
        self.members.retain(|m| m.id != id);
        self.members.push(Member { id, tx });
        self.had_members = true;
        log::info!("Participant {id} joined document {}", self.doc_id);

        let mut dead = self.broadcast_members().await;
        if self.leader.is_none() {
            dead.extend(self.designate_leader(id).await);
        }
        dead
    }

    async fn handle_leave(&mut self, id: Uuid) -> Vec<Uuid> {
        let before = self.members.len();
        self.members.retain(|m| m.id != id);
        if self.members.len() == before {
            return Vec::new();
        }
        log::info!("Participant {id} left document {}", self.doc_id);

        let mut dead = self.broadcast_members().await;
        if self.leader == Some(id) {
            self.leader = None;
            if let Some(next) = self.members.first().map(|m| m.id) {
                dead.extend(self.designate_leader(next).await);
            }
        }
        dead
    }

    async fn handle_content(&mut self, sender: Uuid, payload: Vec<u8>) -> Vec<Uuid> {
        self.version += 1;
        let envelope = Envelope::content(sender, self.doc_id, self.version, payload);
        let mut dead = self.send_except(envelope, sender).await;
        dead.extend(
            self.send_to(sender, Envelope::content_ack(self.doc_id, self.version))
                .await,
        );
        dead
    }

    async fn handle_cursor(&mut self, sender: Uuid, payload: Vec<u8>) -> Vec<Uuid> {
        // Cursor traffic is outside the ordered content stream: no version.
        let envelope = Envelope::cursor(sender, self.doc_id, payload);
        self.send_except(envelope, sender).await
    }

    async fn designate_leader(&mut self, id: Uuid) -> Vec<Uuid> {
        self.leader = Some(id);
        log::info!("Participant {id} leads document {}", self.doc_id);
        self.send_to(id, Envelope::you_are_leader(self.doc_id)).await
    }

    async fn broadcast_members(&mut self) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self.members.iter().map(|m| m.id).collect();
        match Envelope::users_list(self.doc_id, &ids) {
            Ok(envelope) => self.send_all(envelope).await,
            Err(e) => {
                log::error!("Failed to encode members list: {e}");
                Vec::new()
            }
        }
    }

    async fn send_to(&self, id: Uuid, envelope: Envelope) -> Vec<Uuid> {
        if let Some(member) = self.members.iter().find(|m| m.id == id) {
            if member.tx.send(envelope).await.is_err() {
                return vec![id];
            }
        }
        Vec::new()
    }

    async fn send_all(&self, envelope: Envelope) -> Vec<Uuid> {
        let mut dead = Vec::new();
        for member in &self.members {
            if member.tx.send(envelope.clone()).await.is_err() {
                dead.push(member.id);
            }
        }
        dead
    }

    async fn send_except(&self, envelope: Envelope, exclude: Uuid) -> Vec<Uuid> {
        let mut dead = Vec::new();
        for member in self.members.iter().filter(|m| m.id != exclude) {
            if member.tx.send(envelope.clone()).await.is_err() {
                dead.push(member.id);
            }
        }
        dead
    }
}

/// Maps document ids to live session actors.
///
/// Sessions are created on first join and end when the last member leaves;
/// a handle whose actor has exited is replaced on the next `get_or_create`.
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<Uuid, SessionHandle>>>,
    command_capacity: usize,
}

impl SessionManager {
    pub fn new(command_capacity: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            command_capacity,
        }
    }

    /// Get the live session for a document, spawning its actor if needed.
    pub async fn get_or_create(&self, doc_id: Uuid) -> SessionHandle {
        // Fast path: read lock.
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(&doc_id) {
                if !handle.is_closed() {
                    return handle.clone();
                }
            }
        }

        let mut sessions = self.sessions.write().await;
        // Double-check after acquiring write lock.
        if let Some(handle) = sessions.get(&doc_id) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        let (tx, rx) = mpsc::channel(self.command_capacity);
        let handle = SessionHandle { doc_id, tx };
        tokio::spawn(SessionActor::new(doc_id).run(rx));
        sessions.insert(doc_id, handle.clone());
        handle
    }

    /// Drop the handle for a session whose actor has exited.
    pub async fn remove_if_closed(&self, doc_id: &Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.get(doc_id).is_some_and(|h| h.is_closed()) {
            sessions.remove(doc_id);
            return true;
        }
        false
    }

    /// Number of tracked sessions (live and not yet reaped).
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Document ids with live sessions.
    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(_, h)| !h.is_closed())
            .map(|(id, _)| *id)
            .collect()
    }
}
