//! Pending-operation queue: locally generated edits awaiting acknowledgment.
//!
//! Three jobs:
//! - coalesce bursts of adjacent same-kind edits into one operation before
//!   they are handed to the transport (the debounce timer lives in the
//!   client; the queue only exposes the flush points),
//! - enforce strict FIFO transmission: one operation in flight at a time,
//!   the next leaves only after the relay acknowledged the one before it,
//! - rewrite foreign operations through the pending entries (and the entries
//!   through the foreign operation) so locally buffered edits stay valid
//!   against the new remote state.

use std::collections::VecDeque;

use crate::operation::{Edit, Operation};
use crate::transform::transform;

/// A locally generated operation waiting for its acknowledgment.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    /// The operation as it must be applied now, rewritten as foreign
    /// operations arrive. Each rewrite assigns a fresh value; nothing is
    /// aliased.
    pub current: Operation,
    /// The operation as originally generated, for diagnostics.
    pub original: Operation,
    /// Closed for coalescing. The open tail (at most one, always last) is
    /// still absorbing adjacent edits.
    flushed: bool,
    /// Handed to the transport. Only ever true on the front entry.
    transmitted: bool,
}

impl PendingEntry {
    fn new(op: Operation) -> Self {
        Self {
            original: op.clone(),
            current: op,
            flushed: false,
            transmitted: false,
        }
    }
}

/// Spurious acknowledgment: the relay confirmed an operation we never sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NothingInFlight;

impl std::fmt::Display for NothingInFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "acknowledgment received with no operation in flight")
    }
}

impl std::error::Error for NothingInFlight {}

/// FIFO buffer of unacknowledged local operations.
#[derive(Debug, Clone, Default)]
pub struct PendingQueue {
    entries: VecDeque<PendingEntry>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self { entries: VecDeque::new() }
    }

    /// Add a local operation.
    ///
    /// If the open tail is the same kind and positionally adjacent, the new
    /// edit is merged into it and nothing becomes transmittable. Otherwise
    /// the tail is closed and the operation starts a new open tail. Returns
    /// the next operation to put on the wire, if one just became eligible.
    pub fn push(&mut self, op: Operation) -> Option<Operation> {
        if let Some(tail) = self.entries.back_mut() {
            if !tail.flushed {
                if let Some(merged) = coalesce(&tail.current.edit, &op.edit) {
                    tail.current = tail.current.with_edit(merged.clone());
                    tail.original = tail.original.with_edit(merged);
                    return None;
                }
                tail.flushed = true;
            }
        }
        self.entries.push_back(PendingEntry::new(op));
        self.next_to_send()
    }

    /// Close the open tail (debounce timer fired, or the session is going
    /// down). Returns the next operation to put on the wire, if any.
    pub fn flush(&mut self) -> Option<Operation> {
        if let Some(tail) = self.entries.back_mut() {
            tail.flushed = true;
        }
        self.next_to_send()
    }

    /// Consume the acknowledgment for the in-flight operation.
    ///
    /// Pops the front entry and returns the next operation to transmit, if
    /// one is already closed and waiting.
    pub fn acknowledge(&mut self) -> Result<Option<Operation>, NothingInFlight> {
        match self.entries.front() {
            Some(front) if front.transmitted => {
                self.entries.pop_front();
                Ok(self.next_to_send())
            }
            _ => Err(NothingInFlight),
        }
    }

    /// Rewrite a foreign operation through every pending entry (oldest to
    /// newest), and each entry through the foreign operation. Both directions
    /// are required: the returned operation is what gets applied to the local
    /// text, and the rewritten entries are what eventually go on the wire.
    pub fn transform_remote(&mut self, mut foreign: Operation) -> Operation {
        for entry in self.entries.iter_mut() {
            let rewritten = transform(&foreign, &entry.current);
            entry.current = transform(&entry.current, &foreign);
            foreign = rewritten;
        }
        foreign
    }

    fn next_to_send(&mut self) -> Option<Operation> {
        let front = self.entries.front_mut()?;
        if front.flushed && !front.transmitted {
            front.transmitted = true;
            Some(front.current.clone())
        } else {
            None
        }
    }

    /// Whether an operation has been transmitted and not yet acknowledged.
    pub fn in_flight(&self) -> bool {
        self.entries.front().is_some_and(|e| e.transmitted)
    }

    /// Whether the tail is still open for coalescing.
    pub fn has_open_tail(&self) -> bool {
        self.entries.back().is_some_and(|e| !e.flushed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The pending entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.iter()
    }
}

/// Merge two adjacent same-kind edits into one, if possible.
///
/// Inserts chain head-to-tail (typing forward). Deletes merge when the new
/// range ends where the previous one started (backspacing) or starts at the
/// same position (the forward delete key, which keeps deleting at the same
/// offset as the text closes up).
fn coalesce(tail: &Edit, new: &Edit) -> Option<Edit> {
    match (tail, new) {
        (
            Edit::Insert { position: t_pos, text: t_text },
            Edit::Insert { position: n_pos, text: n_text },
        ) if t_pos + t_text.chars().count() == *n_pos => {
            let mut text = t_text.clone();
            text.push_str(n_text);
            Some(Edit::Insert { position: *t_pos, text })
        }
        (
            Edit::Delete { position: t_pos, length: t_len },
            Edit::Delete { position: n_pos, length: n_len },
        ) if n_pos + n_len == *t_pos || n_pos == t_pos => Some(Edit::Delete {
            position: *n_pos.min(t_pos),
            length: t_len + n_len,
        }),
        _ => None,
    }
}
