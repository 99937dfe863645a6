//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real relay and connect real clients, verifying the
//! full pipeline: join, membership, leader designation, content transform
//! and leader persistence.

use cowrite::client::{ClientConfig, CollabClient, CollabEvent};
use cowrite::crypto::PlainCipher;
use cowrite::persist::{FailingPersister, MemoryPersister};
use cowrite::protocol::Envelope;
use cowrite::relay::{RelayConfig, RelayServer};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Start a relay on an ephemeral port, return its URL.
async fn start_test_relay() -> String {
    let config = RelayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        session_capacity: 64,
        member_buffer: 64,
    };
    let relay = RelayServer::bind(config).await.unwrap();
    let addr = relay.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = relay.run().await;
    });
    format!("ws://{addr}")
}

fn test_config(url: &str) -> ClientConfig {
    ClientConfig {
        server_url: url.to_string(),
        flush_debounce: Duration::from_millis(20),
        persist_debounce: Duration::from_millis(100),
        ..ClientConfig::default()
    }
}

/// Build a client with a plain cipher and its own in-memory persister.
fn test_client(
    doc_id: Uuid,
    text: &str,
    config: ClientConfig,
) -> (CollabClient, Arc<MemoryPersister>) {
    let persister = Arc::new(MemoryPersister::new());
    let client = CollabClient::new(
        Uuid::new_v4(),
        doc_id,
        text,
        config,
        Arc::new(PlainCipher),
        persister.clone(),
    );
    (client, persister)
}

/// Receive events until one matches, within a timeout.
async fn wait_for<F>(
    rx: &mut tokio::sync::mpsc::Receiver<CollabEvent>,
    mut matches: F,
) -> CollabEvent
where
    F: FnMut(&CollabEvent) -> bool,
{
    timeout(Duration::from_secs(3), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll until the client's text matches, within a timeout.
async fn wait_for_text(client: &CollabClient, expected: &str) {
    timeout(Duration::from_secs(3), async {
        loop {
            if client.text().await.unwrap() == expected {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!("timed out waiting for text {expected:?}");
    });
}

#[tokio::test]
async fn test_relay_accepts_connections() {
    let url = start_test_relay().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to relay");
}

#[tokio::test]
async fn test_first_joiner_becomes_leader() {
    let url = start_test_relay().await;
    let doc_id = Uuid::new_v4();

    let (mut client, _) = test_client(doc_id, "hello", test_config(&url));
    let participant = client.participant();
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match wait_for(&mut events, |e| matches!(e, CollabEvent::MembersChanged { .. })).await {
        CollabEvent::MembersChanged { members } => assert_eq!(members, vec![participant]),
        other => panic!("unexpected event {other:?}"),
    }
    match wait_for(&mut events, |e| matches!(e, CollabEvent::LeaderChanged { .. })).await {
        CollabEvent::LeaderChanged { leading } => assert!(leading),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_second_joiner_updates_members() {
    let url = start_test_relay().await;
    let doc_id = Uuid::new_v4();

    let (mut alice, _) = test_client(doc_id, "hello", test_config(&url));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, CollabEvent::LeaderChanged { .. })).await;

    let (mut bob, _) = test_client(doc_id, "hello", test_config(&url));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();

    match wait_for(&mut alice_events, |e| {
        matches!(e, CollabEvent::MembersChanged { members } if members.len() == 2)
    })
    .await
    {
        CollabEvent::MembersChanged { members } => {
            assert!(members.contains(&alice.participant()));
            assert!(members.contains(&bob.participant()));
        }
        other => panic!("unexpected event {other:?}"),
    }
    wait_for(&mut bob_events, |e| matches!(e, CollabEvent::MembersChanged { .. })).await;
}

#[tokio::test]
async fn test_edit_broadcast_between_clients() {
    let url = start_test_relay().await;
    let doc_id = Uuid::new_v4();

    let (mut alice, _) = test_client(doc_id, "hello", test_config(&url));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, CollabEvent::LeaderChanged { .. })).await;

    let (mut bob, _) = test_client(doc_id, "hello", test_config(&url));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, CollabEvent::MembersChanged { .. })).await;

    alice.update_text("hello world").await.unwrap();

    match wait_for(&mut bob_events, |e| matches!(e, CollabEvent::RemoteEdited { .. })).await {
        CollabEvent::RemoteEdited { text } => assert_eq!(text, "hello world"),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(bob.text().await.unwrap(), "hello world");
    assert_eq!(alice.text().await.unwrap(), "hello world");
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let url = start_test_relay().await;
    let doc_id = Uuid::new_v4();

    // Alice flushes quickly; bob's edit stays pending long enough to overlap
    // with alice's, exercising the transform path on bob's side.
    let (mut alice, _) = test_client(doc_id, "hello", test_config(&url));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, CollabEvent::LeaderChanged { .. })).await;

    let bob_config = ClientConfig {
        flush_debounce: Duration::from_millis(300),
        ..test_config(&url)
    };
    let (mut bob, _) = test_client(doc_id, "hello", bob_config);
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, CollabEvent::MembersChanged { .. })).await;

    // Concurrent: alice appends while bob removes the leading char.
    alice.update_text("hello world").await.unwrap();
    bob.update_text("ello").await.unwrap();

    wait_for_text(&alice, "ello world").await;
    wait_for_text(&bob, "ello world").await;
}

#[tokio::test]
async fn test_cursor_relay() {
    let url = start_test_relay().await;
    let doc_id = Uuid::new_v4();

    let (mut alice, _) = test_client(doc_id, "hello", test_config(&url));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, CollabEvent::LeaderChanged { .. })).await;

    let (mut bob, _) = test_client(doc_id, "hello", test_config(&url));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, CollabEvent::MembersChanged { .. })).await;

    alice.update_cursor(3, Some(5)).await.unwrap();

    match wait_for(&mut bob_events, |e| matches!(e, CollabEvent::CursorMoved { .. })).await {
        CollabEvent::CursorMoved { cursor } => {
            assert_eq!(cursor.owner, alice.participant());
            assert_eq!(cursor.position, 3);
            assert_eq!(cursor.selection_end, Some(5));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_leader_persists_after_quiet_period() {
    let url = start_test_relay().await;
    let doc_id = Uuid::new_v4();

    let (mut alice, persister) = test_client(doc_id, "hello", test_config(&url));
    let mut events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, CollabEvent::LeaderChanged { .. })).await;

    alice.update_text("hello world").await.unwrap();

    // Flush (20ms) + ack + persist quiet period (100ms).
    timeout(Duration::from_secs(3), async {
        loop {
            if let Some(stored) = persister.stored(&doc_id) {
                // PlainCipher: stored bytes are the text.
                assert_eq!(stored, b"hello world");
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("leader should persist after the quiet period");
}

#[tokio::test]
async fn test_persist_failure_keeps_dirty_and_retries() {
    let url = start_test_relay().await;
    let doc_id = Uuid::new_v4();

    let persister = Arc::new(FailingPersister::new());
    let mut alice = CollabClient::new(
        Uuid::new_v4(),
        doc_id,
        "hello",
        test_config(&url),
        Arc::new(PlainCipher),
        persister.clone(),
    );
    let mut events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, CollabEvent::LeaderChanged { .. })).await;

    alice.update_text("hello world").await.unwrap();

    // Storage is down: the debounced write fails and nothing is stored.
    match wait_for(&mut events, |e| matches!(e, CollabEvent::PersistFailed { .. })).await {
        CollabEvent::PersistFailed { error } => assert!(error.contains("storage unavailable")),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(persister.stored(&doc_id).is_none());

    // Storage recovers. The content stayed dirty, so the next acknowledged
    // change re-arms the debouncer and the write lands.
    persister.set_healthy(true);
    alice.update_text("hello world!").await.unwrap();

    timeout(Duration::from_secs(3), async {
        loop {
            if persister.stored(&doc_id) == Some(b"hello world!".to_vec()) {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("write should land after storage recovers");
}

#[tokio::test]
async fn test_dirty_leader_persists_on_close() {
    let url = start_test_relay().await;
    let doc_id = Uuid::new_v4();

    // Persistence debounce far longer than the test: only the close-time
    // flush can produce a write.
    let config = ClientConfig {
        persist_debounce: Duration::from_secs(60),
        ..test_config(&url)
    };
    let (mut alice, persister) = test_client(doc_id, "hello", config);
    let mut events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, CollabEvent::LeaderChanged { .. })).await;

    alice.update_text("hello world").await.unwrap();
    assert!(persister.stored(&doc_id).is_none());

    alice.close().await.unwrap();
    assert_eq!(persister.stored(&doc_id), Some(b"hello world".to_vec()));
}

#[tokio::test]
async fn test_leader_handoff_on_close() {
    let url = start_test_relay().await;
    let doc_id = Uuid::new_v4();

    let (mut alice, _) = test_client(doc_id, "hello", test_config(&url));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, CollabEvent::LeaderChanged { .. })).await;

    let (mut bob, _) = test_client(doc_id, "hello", test_config(&url));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, CollabEvent::MembersChanged { .. })).await;

    alice.close().await.unwrap();

    // Shrunk members list first, then the handoff frame.
    match wait_for(&mut bob_events, |e| {
        matches!(e, CollabEvent::MembersChanged { members } if members.len() == 1)
    })
    .await
    {
        CollabEvent::MembersChanged { members } => assert_eq!(members, vec![bob.participant()]),
        other => panic!("unexpected event {other:?}"),
    }
    match wait_for(&mut bob_events, |e| matches!(e, CollabEvent::LeaderChanged { .. })).await {
        CollabEvent::LeaderChanged { leading } => assert!(leading),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_non_join_first_frame_closes_connection() {
    let url = start_test_relay().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    // A content frame before joining is a protocol violation.
    let bogus = Envelope::content(Uuid::new_v4(), Uuid::new_v4(), 0, vec![1, 2, 3]);
    ws.send(Message::Binary(bogus.encode().unwrap().into()))
        .await
        .unwrap();

    let closed = timeout(Duration::from_secs(3), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return true,
            }
        }
    })
    .await;
    assert_eq!(closed, Ok(true), "relay should close the connection");
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let url = start_test_relay().await;

    let (mut alice, _) = test_client(Uuid::new_v4(), "one", test_config(&url));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, CollabEvent::LeaderChanged { .. })).await;

    let (mut bob, _) = test_client(Uuid::new_v4(), "two", test_config(&url));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, CollabEvent::LeaderChanged { .. })).await;

    alice.update_text("one!").await.unwrap();
    sleep(Duration::from_millis(300)).await;

    // Different documents: bob sees nothing of alice's edit.
    assert_eq!(bob.text().await.unwrap(), "two");
}
