//! WebSocket relay with per-document session routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Session (doc_id) ── actor: version, members, leader
//! Client B ──┘        │
//!                     ├── Content: version++, fan out, ack sender
//!                     ├── Cursor: fan out verbatim
//!                     └── Join/Leave: members list, leader handoff
//! ```
//!
//! The relay is zero-knowledge: content and cursor payloads are ciphertext
//! it never opens. Each connection is one task; per-document state lives in
//! the session actor ([`crate::session`]), which the connection talks to
//! over a command channel.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{Envelope, EnvelopeKind};
use crate::session::{SessionHandle, SessionManager};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Command channel capacity per session actor.
    pub session_capacity: usize,
    /// Envelope channel capacity per connected member.
    pub member_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            session_capacity: 256,
            member_buffer: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    listener: TcpListener,
    sessions: Arc<SessionManager>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    /// Bind the listener. The accept loop starts with [`RelayServer::run`];
    /// binding separately lets callers bind port 0 and read the real address.
    pub async fn bind(config: RelayConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let sessions = Arc::new(SessionManager::new(config.session_capacity));
        Ok(Self {
            config,
            listener,
            sessions,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        })
    }

    /// Bind with default configuration.
    pub async fn with_defaults() -> std::io::Result<Self> {
        Self::bind(RelayConfig::default()).await
    }

    /// The bound address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Snapshot of the relay statistics.
    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// The session manager, shared with every connection task.
    pub fn sessions(&self) -> Arc<SessionManager> {
        self.sessions.clone()
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> std::io::Result<()> {
        log::info!("Relay listening on {}", self.listener.local_addr()?);

        loop {
            let (stream, addr) = self.listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let sessions = self.sessions.clone();
            let stats = self.stats.clone();
            let member_buffer = self.config.member_buffer;

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, addr, sessions, stats, member_buffer).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Handle a single WebSocket connection, from handshake to leave.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    sessions: Arc<SessionManager>,
    stats: Arc<RwLock<RelayStats>>,
    member_buffer: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");
    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    // First frame must be a join; anything else ends the connection.
    let (participant, doc_id) = match await_join(&mut ws_rx, addr).await {
        Some(identity) => identity,
        None => {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            return Ok(());
        }
    };

    let session = sessions.get_or_create(doc_id).await;
    let (member_tx, mut member_rx) = mpsc::channel(member_buffer);
    if session.join(participant, member_tx).await.is_err() {
        log::warn!("Session {doc_id} closed during join of {participant}");
        let mut s = stats.write().await;
        s.active_connections -= 1;
        return Ok(());
    }
    log::debug!("Participant {participant} on document {doc_id} from {addr}");

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        {
                            let mut s = stats.write().await;
                            s.total_frames += 1;
                            s.total_bytes += bytes.len() as u64;
                        }
                        match Envelope::decode(&bytes) {
                            Ok(envelope) => {
                                if !route_frame(&session, participant, envelope).await {
                                    break;
                                }
                            }
                            Err(e) => {
                                // A malformed frame is dropped, not fatal.
                                log::warn!("Dropping undecodable frame from {participant}: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                }
            }

            envelope = member_rx.recv() => {
                match envelope {
                    Some(envelope) => match envelope.encode() {
                        Ok(encoded) => {
                            if ws_tx.send(Message::Binary(encoded.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::error!("Failed to encode envelope: {e}"),
                    },
                    // The session actor dropped us (or exited).
                    None => break,
                }
            }
        }
    }

    // A dropped connection is a leave.
    let _ = session.leave(participant).await;
    sessions.remove_if_closed(&doc_id).await;

    {
        let mut s = stats.write().await;
        s.active_connections -= 1;
    }
    log::info!("Connection from {addr} closed");
    Ok(())
}

type WsStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<TcpStream>,
>;

/// Wait for the join frame that opens every connection.
async fn await_join(ws_rx: &mut WsStream, addr: SocketAddr) -> Option<(Uuid, Uuid)> {
    loop {
        match ws_rx.next().await? {
            Ok(Message::Binary(data)) => {
                let bytes: Vec<u8> = data.into();
                return match Envelope::decode(&bytes) {
                    Ok(envelope) if envelope.kind == EnvelopeKind::Join => {
                        Some((envelope.sender, envelope.doc_id))
                    }
                    Ok(envelope) => {
                        log::warn!(
                            "Expected join from {addr}, got {:?}; closing",
                            envelope.kind
                        );
                        None
                    }
                    Err(e) => {
                        log::warn!("Undecodable first frame from {addr}: {e}");
                        None
                    }
                };
            }
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                log::warn!("WebSocket error from {addr} before join: {e}");
                return None;
            }
        }
    }
}

/// Route one decoded client frame to the session actor. Returns false when
/// the connection should end.
async fn route_frame(session: &SessionHandle, participant: Uuid, envelope: Envelope) -> bool {
    // The connection identity wins over whatever the frame claims.
    if envelope.sender != participant {
        log::warn!(
            "Dropping frame from {participant} claiming sender {}",
            envelope.sender
        );
        return true;
    }

    match envelope.kind {
        EnvelopeKind::Content => session
            .content(participant, envelope.payload)
            .await
            .is_ok(),
        EnvelopeKind::Cursor => session.cursor(participant, envelope.payload).await.is_ok(),
        EnvelopeKind::Leave => {
            let _ = session.leave(participant).await;
            false
        }
        kind => {
            log::debug!("Ignoring unexpected {kind:?} frame from {participant}");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = RelayConfig { bind_addr: "127.0.0.1:0".to_string(), ..Default::default() };
        let relay = RelayServer::bind(config).await.unwrap();
        let addr = relay.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_stats_start_empty() {
        let relay = RelayServer::bind(RelayConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        let stats = relay.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(relay.sessions().session_count().await, 0);
    }

    #[test]
    fn test_config_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.session_capacity, 256);
    }
}
