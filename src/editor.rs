//! Client-side editing engine, independent of any transport.
//!
//! An [`Editor`] owns one participant's view of a document: the text, the
//! mirror of the relay's version, the pending-operation queue and the remote
//! cursor map. The network client feeds it snapshots, acknowledgments and
//! remote envelopes; it hands back operations to transmit and the edits it
//! applied. Everything here is synchronous and deterministic, which is what
//! makes the full transform pipeline testable without a socket.

use uuid::Uuid;

use crate::cursor::{CursorTracker, RemoteCursor};
use crate::diff;
use crate::operation::{apply, ApplyError, Edit, Operation};
use crate::pending::{NothingInFlight, PendingQueue};

/// One participant's document state.
#[derive(Debug)]
pub struct Editor {
    participant: Uuid,
    text: String,
    /// Read-only mirror of the relay's version, updated only from
    /// acknowledgments and relayed content frames.
    local_version: u64,
    pending: PendingQueue,
    cursors: CursorTracker,
    /// Content has changed since the last persisted write.
    dirty: bool,
}

impl Editor {
    /// Create an editor over an already-fetched document snapshot.
    pub fn new(participant: Uuid, text: impl Into<String>, version: u64) -> Self {
        Self {
            participant,
            text: text.into(),
            local_version: version,
            pending: PendingQueue::new(),
            cursors: CursorTracker::new(),
            dirty: false,
        }
    }

    pub fn participant(&self) -> Uuid {
        self.participant
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn local_version(&self) -> u64 {
        self.local_version
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The persistence layer wrote the current content.
    pub fn mark_persisted(&mut self) {
        self.dirty = false;
    }

    pub fn cursors(&self) -> &CursorTracker {
        &self.cursors
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether an edit is still coalescing and needs a debounced flush.
    pub fn has_open_tail(&self) -> bool {
        self.pending.has_open_tail()
    }

    /// Record a new text snapshot from the UI.
    ///
    /// Diffs against the current text and queues the resulting operations.
    /// Usually that is one insert or delete; an equal-length replacement is
    /// decomposed into a delete followed by an insert over the differing
    /// span. Returns any operations that became ready to transmit (a
    /// non-coalescable edit closes the previous tail).
    pub fn update_text(&mut self, new_text: &str) -> Vec<Operation> {
        if new_text == self.text {
            return Vec::new();
        }

        let mut to_send = Vec::new();
        match diff::extract(&self.text, new_text) {
            Some(edit) => {
                to_send.extend(self.queue_edit(edit));
            }
            None => {
                // Equal length but different content: replacement span.
                let (position, removed, inserted) = replacement_span(&self.text, new_text);
                to_send.extend(self.queue_edit(Edit::Delete { position, length: removed }));
                to_send.extend(self.queue_edit(Edit::Insert { position, text: inserted }));
            }
        }

        self.text = new_text.to_string();
        self.dirty = true;
        to_send
    }

    fn queue_edit(&mut self, edit: Edit) -> Option<Operation> {
        let op = Operation {
            edit,
            origin: self.participant,
            base_version: self.local_version,
        };
        self.pending.push(op)
    }

    /// Debounce timer fired: close the coalescing tail.
    pub fn flush(&mut self) -> Option<Operation> {
        self.pending.flush()
    }

    /// The relay accepted our in-flight operation at `version`.
    ///
    /// Returns the next queued operation to transmit, if any.
    pub fn handle_ack(&mut self, version: u64) -> Result<Option<Operation>, NothingInFlight> {
        let next = self.pending.acknowledge()?;
        self.local_version = version;
        Ok(next)
    }

    /// Apply a foreign operation relayed at `version`.
    ///
    /// The operation is transformed through the pending queue (rewriting the
    /// queue in the other direction), applied to the text, and every remote
    /// cursor is rewritten through the applied edit. An out-of-range
    /// operation is rejected whole: neither the text nor the pending queue
    /// is touched, so one corrupt frame cannot poison local state.
    pub fn handle_remote(&mut self, version: u64, foreign: Operation) -> Result<Edit, ApplyError> {
        let origin = foreign.origin;
        let mut queue = self.pending.clone();
        let transformed = queue.transform_remote(foreign);

        let new_text = apply(&self.text, &transformed.edit).map_err(|e| {
            log::warn!(
                "Rejecting out-of-range operation from {origin} at version {version}: {e}"
            );
            e
        })?;

        self.pending = queue;
        self.text = new_text;
        self.local_version = version;
        self.cursors.transform_all(&transformed.edit);
        self.dirty = true;
        Ok(transformed.edit)
    }

    /// Record a remote participant's cursor.
    pub fn handle_cursor(&mut self, cursor: RemoteCursor) {
        if cursor.owner != self.participant {
            self.cursors.update(cursor);
        }
    }

    /// The members list changed; drop cursors of departed participants.
    pub fn members_changed(&mut self, members: &[Uuid]) {
        self.cursors.retain_members(members);
    }
}

/// Span that differs between two equal-length texts, as
/// (position, chars removed, replacement text).
fn replacement_span(old: &str, new: &str) -> (usize, usize, String) {
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let mut prefix = 0;
    while prefix < old_chars.len() && old_chars[prefix] == new_chars[prefix] {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < old_chars.len() - prefix
        && old_chars[old_chars.len() - 1 - suffix] == new_chars[new_chars.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let removed = old_chars.len() - prefix - suffix;
    let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();
    (prefix, removed, inserted)
}
