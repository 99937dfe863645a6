//! Remote cursor tracking.
//!
//! One [`RemoteCursor`] per remote participant, updated from relayed cursor
//! envelopes and rewritten through every operation applied to the local text
//! so the markers stay attached to the characters they were next to. The
//! local participant's cursor is UI state and is not stored here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operation::Edit;
use crate::transform::transform_cursor;

/// A remote participant's cursor (and optional selection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCursor {
    pub owner: Uuid,
    /// Character offset of the caret.
    pub position: usize,
    /// Selection anchor end, when a range is selected.
    pub selection_end: Option<usize>,
    /// Sender-side milliseconds; used only to discard stale updates that
    /// arrive behind a newer one.
    pub timestamp: u64,
}

/// Cursors of every remote participant in the session.
#[derive(Debug, Default)]
pub struct CursorTracker {
    cursors: HashMap<Uuid, RemoteCursor>,
}

impl CursorTracker {
    pub fn new() -> Self {
        Self { cursors: HashMap::new() }
    }

    /// Record a cursor update. Updates older than the stored one for the
    /// same owner are ignored.
    pub fn update(&mut self, cursor: RemoteCursor) {
        match self.cursors.get(&cursor.owner) {
            Some(existing) if existing.timestamp > cursor.timestamp => {}
            _ => {
                self.cursors.insert(cursor.owner, cursor);
            }
        }
    }

    /// Rewrite every tracked position through an applied edit.
    pub fn transform_all(&mut self, edit: &Edit) {
        for cursor in self.cursors.values_mut() {
            cursor.position = transform_cursor(cursor.position, edit);
            cursor.selection_end = cursor.selection_end.map(|end| transform_cursor(end, edit));
        }
    }

    /// Drop the cursor of a departed participant.
    pub fn remove(&mut self, owner: &Uuid) -> Option<RemoteCursor> {
        self.cursors.remove(owner)
    }

    /// Drop cursors of everyone not in the current members list.
    pub fn retain_members(&mut self, members: &[Uuid]) {
        self.cursors.retain(|owner, _| members.contains(owner));
    }

    pub fn get(&self, owner: &Uuid) -> Option<&RemoteCursor> {
        self.cursors.get(owner)
    }

    /// All tracked cursors, unordered.
    pub fn iter(&self) -> impl Iterator<Item = &RemoteCursor> {
        self.cursors.values()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}
