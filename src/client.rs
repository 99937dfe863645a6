//! WebSocket client: wires an [`Editor`] to a relay.
//!
//! Provides:
//! - Connection lifecycle (connect, join, close)
//! - Debounced transmission of coalesced local edits
//! - Transform-and-apply of relayed foreign operations
//! - Encrypted cursor relay
//! - Leader-only persistence after a quiet period, with a final synchronous
//!   flush on teardown
//!
//! All document state lives in one run-loop task: socket frames, UI commands
//! and timer deadlines are serialized through a single `select!`, so the
//! transform pipeline never runs concurrently with itself.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::crypto::EnvelopeCipher;
use crate::cursor::RemoteCursor;
use crate::editor::Editor;
use crate::operation::Operation;
use crate::persist::{PersistenceDebouncer, Persister};
use crate::protocol::{ContentPayload, CursorPayload, Envelope, EnvelopeKind, ProtocolError};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay WebSocket URL.
    pub server_url: String,
    /// Quiet period before an open coalescing tail is transmitted.
    pub flush_debounce: Duration,
    /// Leader-only quiet period before dirty content is persisted.
    pub persist_debounce: Duration,
    /// Event channel capacity.
    pub event_buffer: usize,
    /// Command channel capacity.
    pub command_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            flush_debounce: Duration::from_millis(100),
            persist_debounce: Duration::from_secs(3),
            event_buffer: 256,
            command_buffer: 256,
        }
    }
}

/// Events emitted to the embedding application.
#[derive(Debug, Clone)]
pub enum CollabEvent {
    /// Connected and joined the document session.
    Connected,
    /// Connection lost or closed.
    Disconnected,
    /// A foreign operation was applied; this is the converged text.
    RemoteEdited { text: String },
    /// A remote participant's cursor moved.
    CursorMoved { cursor: RemoteCursor },
    /// The session members list changed.
    MembersChanged { members: Vec<Uuid> },
    /// This client was (or stopped being) the persistence leader.
    LeaderChanged { leading: bool },
    /// A persistence attempt failed; content stays dirty for retry.
    PersistFailed { error: String },
}

/// Commands from the embedding application into the run loop.
enum ClientCommand {
    UpdateText(String),
    UpdateCursor { position: usize, selection_end: Option<usize> },
    Snapshot(oneshot::Sender<String>),
    Close(oneshot::Sender<()>),
}

/// A collaborative-editing client for one participant on one document.
pub struct CollabClient {
    participant: Uuid,
    doc_id: Uuid,
    initial_text: String,
    config: ClientConfig,
    cipher: Arc<dyn EnvelopeCipher>,
    persister: Arc<dyn Persister>,
    command_tx: Option<mpsc::Sender<ClientCommand>>,
    event_rx: Option<mpsc::Receiver<CollabEvent>>,
    event_tx: mpsc::Sender<CollabEvent>,
}

impl CollabClient {
    /// Create a client over an already-fetched document snapshot.
    ///
    /// `cipher` and `persister` are the external collaborators: the document
    /// key is assumed to be in the cipher already, and the persister is only
    /// ever called while this client leads.
    pub fn new(
        participant: Uuid,
        doc_id: Uuid,
        initial_text: impl Into<String>,
        config: ClientConfig,
        cipher: Arc<dyn EnvelopeCipher>,
        persister: Arc<dyn Persister>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        Self {
            participant,
            doc_id,
            initial_text: initial_text.into(),
            config,
            cipher,
            persister,
            command_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<CollabEvent>> {
        self.event_rx.take()
    }

    pub fn participant(&self) -> Uuid {
        self.participant
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Connect to the relay, join the document session and start the run
    /// loop. Events start flowing on the event channel after this returns.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.config.server_url)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let (command_tx, command_rx) = mpsc::channel(self.config.command_buffer);
        self.command_tx = Some(command_tx);

        let run_loop = RunLoop {
            editor: Editor::new(self.participant, self.initial_text.clone(), 0),
            doc_id: self.doc_id,
            cipher: self.cipher.clone(),
            persister: self.persister.clone(),
            event_tx: self.event_tx.clone(),
            flush_debounce: self.config.flush_debounce,
            flush_deadline: None,
            persist: PersistenceDebouncer::new(self.config.persist_debounce),
            leading: false,
        };

        tokio::spawn(run_loop.run(ws_stream, command_rx));

        let _ = self.event_tx.send(CollabEvent::Connected).await;
        Ok(())
    }

    /// Hand the run loop a new text snapshot from the UI.
    pub async fn update_text(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        self.send_command(ClientCommand::UpdateText(text.into())).await
    }

    /// Broadcast the local cursor position.
    pub async fn update_cursor(
        &self,
        position: usize,
        selection_end: Option<usize>,
    ) -> Result<(), ProtocolError> {
        self.send_command(ClientCommand::UpdateCursor { position, selection_end })
            .await
    }

    /// Current converged text, as the run loop sees it.
    pub async fn text(&self) -> Result<String, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(ClientCommand::Snapshot(tx)).await?;
        rx.await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the session. Flushes a final persistence write first if this
    /// client leads and has unsaved changes.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(ClientCommand::Close(tx)).await?;
        rx.await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn send_command(&self, command: ClientCommand) -> Result<(), ProtocolError> {
        match &self.command_tx {
            Some(tx) => tx
                .send(command)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }
}

/// State owned by the per-connection run-loop task.
struct RunLoop {
    editor: Editor,
    doc_id: Uuid,
    cipher: Arc<dyn EnvelopeCipher>,
    persister: Arc<dyn Persister>,
    event_tx: mpsc::Sender<CollabEvent>,
    flush_debounce: Duration,
    /// Pending transmission deadline for the open coalescing tail.
    flush_deadline: Option<Instant>,
    persist: PersistenceDebouncer,
    leading: bool,
}

impl RunLoop {
    async fn run(
        mut self,
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        mut command_rx: mpsc::Receiver<ClientCommand>,
    ) {
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        // First frame: join the document session.
        let join = Envelope::join(self.editor.participant(), self.doc_id);
        if !send_envelope(&mut ws_tx, &join).await {
            let _ = self.event_tx.send(CollabEvent::Disconnected).await;
            return;
        }

        loop {
            let flush_at = self.flush_deadline.unwrap_or_else(Instant::now);
            let persist_at = self.persist.deadline().unwrap_or_else(Instant::now);

            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(ClientCommand::UpdateText(text)) => {
                            for op in self.editor.update_text(&text) {
                                if !self.send_content(&mut ws_tx, op).await {
                                    self.teardown().await;
                                    return;
                                }
                            }
                            // Restart the debounce while a tail is coalescing.
                            self.flush_deadline = self
                                .editor
                                .has_open_tail()
                                .then(|| Instant::now() + self.flush_debounce);
                        }
                        Some(ClientCommand::UpdateCursor { position, selection_end }) => {
                            let payload = CursorPayload {
                                position,
                                selection_end,
                                timestamp: now_millis(),
                            };
                            if !self.send_cursor(&mut ws_tx, payload).await {
                                self.teardown().await;
                                return;
                            }
                        }
                        Some(ClientCommand::Snapshot(reply)) => {
                            let _ = reply.send(self.editor.text().to_string());
                        }
                        Some(ClientCommand::Close(reply)) => {
                            // Push out whatever is still coalescing, then a
                            // final persist if we lead with unsaved changes.
                            if let Some(op) = self.editor.flush() {
                                let _ = self.send_content(&mut ws_tx, op).await;
                            }
                            self.teardown().await;
                            let leave = Envelope::leave(self.editor.participant(), self.doc_id);
                            let _ = send_envelope(&mut ws_tx, &leave).await;
                            let _ = ws_tx.send(Message::Close(None)).await;
                            let _ = reply.send(());
                            return;
                        }
                        None => {
                            self.teardown().await;
                            return;
                        }
                    }
                }

                frame = ws_rx.next() => {
                    match frame {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            match Envelope::decode(&bytes) {
                                Ok(envelope) => {
                                    if !self.handle_envelope(&mut ws_tx, envelope).await {
                                        self.teardown().await;
                                        return;
                                    }
                                }
                                Err(e) => {
                                    // One bad frame must not end the session.
                                    log::warn!("Dropping undecodable frame: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            self.teardown().await;
                            let _ = self.event_tx.send(CollabEvent::Disconnected).await;
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::error!("WebSocket error: {e}");
                            self.teardown().await;
                            let _ = self.event_tx.send(CollabEvent::Disconnected).await;
                            return;
                        }
                    }
                }

                _ = sleep_until(flush_at), if self.flush_deadline.is_some() => {
                    self.flush_deadline = None;
                    if let Some(op) = self.editor.flush() {
                        if !self.send_content(&mut ws_tx, op).await {
                            self.teardown().await;
                            return;
                        }
                    }
                }

                _ = sleep_until(persist_at), if self.persist.armed() => {
                    self.persist.disarm();
                    self.persist_now().await;
                }
            }
        }
    }

    /// Dispatch one relayed envelope. Returns false if the socket died.
    async fn handle_envelope(
        &mut self,
        ws_tx: &mut WsSink,
        envelope: Envelope,
    ) -> bool {
        match envelope.kind {
            EnvelopeKind::Content => {
                let plaintext = match self.cipher.decrypt(&envelope.payload) {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("Dropping content from {}: {e}", envelope.sender);
                        return true;
                    }
                };
                let payload = match ContentPayload::decode(&plaintext) {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("Dropping malformed content from {}: {e}", envelope.sender);
                        return true;
                    }
                };
                match self.editor.handle_remote(envelope.version, payload.operation) {
                    Ok(_) => {
                        let _ = self
                            .event_tx
                            .send(CollabEvent::RemoteEdited {
                                text: self.editor.text().to_string(),
                            })
                            .await;
                        self.touch_persist();
                    }
                    Err(e) => {
                        // Already rejected and logged by the editor; keep the
                        // session alive.
                        log::error!(
                            "Protocol invariant violation at version {}: {e}",
                            envelope.version
                        );
                    }
                }
            }

            EnvelopeKind::ContentAck => {
                match self.editor.handle_ack(envelope.version) {
                    Ok(Some(next)) => {
                        if !self.send_content(ws_tx, next).await {
                            return false;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("Ignoring {e}"),
                }
                self.touch_persist();
            }

            EnvelopeKind::Cursor => {
                let plaintext = match self.cipher.decrypt(&envelope.payload) {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("Dropping cursor from {}: {e}", envelope.sender);
                        return true;
                    }
                };
                match CursorPayload::decode(&plaintext) {
                    Ok(payload) => {
                        let cursor = payload.into_cursor(envelope.sender);
                        self.editor.handle_cursor(cursor.clone());
                        let _ = self.event_tx.send(CollabEvent::CursorMoved { cursor }).await;
                    }
                    Err(e) => log::warn!("Dropping malformed cursor from {}: {e}", envelope.sender),
                }
            }

            EnvelopeKind::UsersList => match envelope.members() {
                Ok(members) => {
                    self.editor.members_changed(&members);
                    let _ = self
                        .event_tx
                        .send(CollabEvent::MembersChanged { members })
                        .await;
                }
                Err(e) => log::warn!("Dropping malformed users list: {e}"),
            },

            EnvelopeKind::YouAreLeader => {
                self.leading = true;
                log::info!("Designated persistence leader for {}", self.doc_id);
                let _ = self
                    .event_tx
                    .send(CollabEvent::LeaderChanged { leading: true })
                    .await;
                self.touch_persist();
            }

            kind => {
                log::debug!("Unhandled envelope kind: {kind:?}");
            }
        }
        true
    }

    /// (Re)arm the persistence debounce if we lead and have unsaved changes.
    fn touch_persist(&mut self) {
        if self.leading && self.editor.is_dirty() {
            self.persist.touch();
        }
    }

    /// Encrypt and write the current content through the persistence
    /// boundary. Failure keeps the dirty flag set.
    async fn persist_now(&mut self) {
        let ciphertext = self.cipher.encrypt(self.editor.text().as_bytes());
        match self.persister.persist(self.doc_id, ciphertext).await {
            Ok(()) => {
                self.editor.mark_persisted();
                log::debug!("Persisted document {}", self.doc_id);
            }
            Err(e) => {
                log::error!("Persistence failed for {}: {e}", self.doc_id);
                let _ = self
                    .event_tx
                    .send(CollabEvent::PersistFailed { error: e.to_string() })
                    .await;
            }
        }
    }

    /// Final flush before the connection goes away: a leader never drops
    /// dirty state on the floor.
    async fn teardown(&mut self) {
        self.persist.disarm();
        if self.leading && self.editor.is_dirty() {
            self.persist_now().await;
        }
    }

    async fn send_content(&mut self, ws_tx: &mut WsSink, op: Operation) -> bool {
        let plaintext = match (ContentPayload { operation: op }).encode() {
            Ok(p) => p,
            Err(e) => {
                log::error!("Failed to encode operation: {e}");
                return true;
            }
        };
        let ciphertext = self.cipher.encrypt(&plaintext);
        let envelope = Envelope::content(self.editor.participant(), self.doc_id, 0, ciphertext);
        send_envelope(ws_tx, &envelope).await
    }

    async fn send_cursor(&mut self, ws_tx: &mut WsSink, payload: CursorPayload) -> bool {
        let plaintext = match payload.encode() {
            Ok(p) => p,
            Err(e) => {
                log::error!("Failed to encode cursor: {e}");
                return true;
            }
        };
        let ciphertext = self.cipher.encrypt(&plaintext);
        let envelope = Envelope::cursor(self.editor.participant(), self.doc_id, ciphertext);
        send_envelope(ws_tx, &envelope).await
    }
}

type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<TcpStream>>,
    Message,
>;

/// Encode and transmit one envelope. Returns false if the socket is gone.
async fn send_envelope(ws_tx: &mut WsSink, envelope: &Envelope) -> bool {
    match envelope.encode() {
        Ok(encoded) => ws_tx.send(Message::Binary(encoded.into())).await.is_ok(),
        Err(e) => {
            log::error!("Failed to encode envelope: {e}");
            true
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
