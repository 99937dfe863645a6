//! Persistence boundary and the leader's write debouncer.
//!
//! Durable storage is an external collaborator: the engine hands it a
//! document id and a ciphertext and gets back ok or a retryable error.
//! Only the session leader calls it, and only after a quiet period — the
//! [`PersistenceDebouncer`] tracks the deadline, the client's run loop
//! sleeps on it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::time::{Duration, Instant};
use uuid::Uuid;

/// Boxed future so the trait stays object-safe behind `Arc<dyn Persister>`.
pub type PersistFuture<'a> = Pin<Box<dyn Future<Output = Result<(), PersistError>> + Send + 'a>>;

/// External storage contract: `persist(documentId, ciphertext) -> ok | error`.
pub trait Persister: Send + Sync {
    fn persist(&self, doc_id: Uuid, ciphertext: Vec<u8>) -> PersistFuture<'_>;
}

/// Persistence failure. Retryable: the caller keeps its dirty flag set and
/// the debouncer re-fires on the next qualifying change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    Storage(String),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for PersistError {}

/// Quiet-period timer for leader persistence.
///
/// `touch()` (re)arms the deadline on every dirty-making change; the run
/// loop sleeps until `deadline()` and calls `disarm()` once the write is
/// handed off. No timer task: just a deadline the owner selects on.
#[derive(Debug)]
pub struct PersistenceDebouncer {
    quiet: Duration,
    deadline: Option<Instant>,
}

impl PersistenceDebouncer {
    pub fn new(quiet: Duration) -> Self {
        Self { quiet, deadline: None }
    }

    /// (Re)start the quiet period from now.
    pub fn touch(&mut self) {
        self.deadline = Some(Instant::now() + self.quiet);
    }

    /// Cancel the pending deadline.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// The instant to sleep until, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// In-memory persister for tests and examples.
#[derive(Debug, Default)]
pub struct MemoryPersister {
    documents: Mutex<HashMap<Uuid, Vec<u8>>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last persisted ciphertext for a document.
    pub fn stored(&self, doc_id: &Uuid) -> Option<Vec<u8>> {
        self.documents.lock().unwrap().get(doc_id).cloned()
    }

    pub fn document_count(&self) -> usize {
        self.documents.lock().unwrap().len()
    }
}

impl Persister for MemoryPersister {
    fn persist(&self, doc_id: Uuid, ciphertext: Vec<u8>) -> PersistFuture<'_> {
        Box::pin(async move {
            self.documents.lock().unwrap().insert(doc_id, ciphertext);
            Ok(())
        })
    }
}

/// Persister that fails until told otherwise. Exercises the retry path.
#[derive(Debug, Default)]
pub struct FailingPersister {
    healthy: AtomicBool,
    inner: MemoryPersister,
}

impl FailingPersister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn stored(&self, doc_id: &Uuid) -> Option<Vec<u8>> {
        self.inner.stored(doc_id)
    }
}

impl Persister for FailingPersister {
    fn persist(&self, doc_id: Uuid, ciphertext: Vec<u8>) -> PersistFuture<'_> {
        Box::pin(async move {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(PersistError::Storage("storage unavailable".to_string()));
            }
            self.inner.persist(doc_id, ciphertext).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_persister_stores() {
        let persister = MemoryPersister::new();
        let doc = Uuid::new_v4();

        persister.persist(doc, vec![1, 2, 3]).await.unwrap();
        assert_eq!(persister.stored(&doc), Some(vec![1, 2, 3]));

        // Later write replaces the earlier one.
        persister.persist(doc, vec![4, 5]).await.unwrap();
        assert_eq!(persister.stored(&doc), Some(vec![4, 5]));
        assert_eq!(persister.document_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_persister() {
        let persister = FailingPersister::new();
        let doc = Uuid::new_v4();

        let err = persister.persist(doc, vec![1]).await.unwrap_err();
        assert_eq!(err, PersistError::Storage("storage unavailable".to_string()));
        assert!(persister.stored(&doc).is_none());

        persister.set_healthy(true);
        persister.persist(doc, vec![1]).await.unwrap();
        assert_eq!(persister.stored(&doc), Some(vec![1]));
    }

    #[test]
    fn test_debouncer_arming() {
        let mut debouncer = PersistenceDebouncer::new(Duration::from_secs(3));
        assert!(!debouncer.armed());
        assert!(debouncer.deadline().is_none());

        debouncer.touch();
        assert!(debouncer.armed());
        let first = debouncer.deadline().unwrap();

        // Touching again pushes the deadline out.
        std::thread::sleep(std::time::Duration::from_millis(5));
        debouncer.touch();
        assert!(debouncer.deadline().unwrap() > first);

        debouncer.disarm();
        assert!(!debouncer.armed());
    }

    #[tokio::test]
    async fn test_debouncer_fires_after_quiet_period() {
        tokio::time::pause();
        let mut debouncer = PersistenceDebouncer::new(Duration::from_secs(3));
        debouncer.touch();

        let deadline = debouncer.deadline().unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(Instant::now() >= deadline);
    }
}
