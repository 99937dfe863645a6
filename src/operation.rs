//! Edit operations: the unit of change exchanged between editors.
//!
//! An [`Edit`] is a single contiguous insert or delete, addressed by
//! character offset. An [`Operation`] wraps an edit with its origin and the
//! document version it was generated against. Operations are value types:
//! transforming one produces a new value, the original is never mutated.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single contiguous edit, in character offsets.
///
/// Offsets count `char`s, not bytes, so splicing can never land inside a
/// UTF-8 sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Edit {
    /// Insert `text` before the character at `position`.
    Insert { position: usize, text: String },
    /// Remove `length` characters starting at `position`.
    Delete { position: usize, length: usize },
}

impl Edit {
    /// Character offset the edit applies at.
    pub fn position(&self) -> usize {
        match self {
            Edit::Insert { position, .. } | Edit::Delete { position, .. } => *position,
        }
    }

    /// Characters inserted or removed.
    pub fn len(&self) -> usize {
        match self {
            Edit::Insert { text, .. } => text.chars().count(),
            Edit::Delete { length, .. } => *length,
        }
    }

    /// True for a zero-length edit (empty insert or delete).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An edit stamped with its origin and the version it was generated against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub edit: Edit,
    /// Client that produced the edit. Also the transform tie-breaker.
    pub origin: Uuid,
    /// Relay version the producing client had applied when the edit was made.
    pub base_version: u64,
}

impl Operation {
    pub fn insert(position: usize, text: impl Into<String>, origin: Uuid, base_version: u64) -> Self {
        Self {
            edit: Edit::Insert { position, text: text.into() },
            origin,
            base_version,
        }
    }

    pub fn delete(position: usize, length: usize, origin: Uuid, base_version: u64) -> Self {
        Self {
            edit: Edit::Delete { position, length },
            origin,
            base_version,
        }
    }

    /// Same operation with a replaced edit. Used by the transform fold.
    pub fn with_edit(&self, edit: Edit) -> Self {
        Self {
            edit,
            origin: self.origin,
            base_version: self.base_version,
        }
    }
}

/// Failure to apply an edit to a text snapshot.
///
/// An out-of-range application means the sender and receiver disagree about
/// the document — a protocol invariant violation, not a recoverable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    OutOfRange {
        position: usize,
        length: usize,
        text_len: usize,
    },
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfRange { position, length, text_len } => write!(
                f,
                "edit out of range: position {position} length {length} on text of {text_len} chars"
            ),
        }
    }
}

impl std::error::Error for ApplyError {}

/// Byte index of the `char_pos`-th character boundary, if it exists.
fn byte_index(text: &str, char_pos: usize) -> Option<usize> {
    text.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .nth(char_pos)
}

/// Apply an edit to a text snapshot, producing the new text.
///
/// Bounds are checked against the current text; a position or range past the
/// end is rejected rather than clamped.
pub fn apply(text: &str, edit: &Edit) -> Result<String, ApplyError> {
    match edit {
        Edit::Insert { position, text: inserted } => {
            let at = byte_index(text, *position).ok_or(ApplyError::OutOfRange {
                position: *position,
                length: 0,
                text_len: text.chars().count(),
            })?;
            let mut out = String::with_capacity(text.len() + inserted.len());
            out.push_str(&text[..at]);
            out.push_str(inserted);
            out.push_str(&text[at..]);
            Ok(out)
        }
        Edit::Delete { position, length } => {
            let start = byte_index(text, *position);
            let end = position
                .checked_add(*length)
                .and_then(|e| byte_index(text, e));
            match (start, end) {
                (Some(start), Some(end)) => {
                    let mut out = String::with_capacity(text.len() - (end - start));
                    out.push_str(&text[..start]);
                    out.push_str(&text[end..]);
                    Ok(out)
                }
                _ => Err(ApplyError::OutOfRange {
                    position: *position,
                    length: *length,
                    text_len: text.chars().count(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_middle() {
        let edit = Edit::Insert { position: 5, text: " world".to_string() };
        assert_eq!(apply("hello", &edit).unwrap(), "hello world");
    }

    #[test]
    fn test_insert_at_start_and_end() {
        let at_start = Edit::Insert { position: 0, text: "ab".to_string() };
        assert_eq!(apply("cd", &at_start).unwrap(), "abcd");

        let at_end = Edit::Insert { position: 2, text: "ef".to_string() };
        assert_eq!(apply("cd", &at_end).unwrap(), "cdef");
    }

    #[test]
    fn test_insert_into_empty() {
        let edit = Edit::Insert { position: 0, text: "hi".to_string() };
        assert_eq!(apply("", &edit).unwrap(), "hi");
    }

    #[test]
    fn test_delete_middle() {
        let edit = Edit::Delete { position: 1, length: 3 };
        assert_eq!(apply("abcde", &edit).unwrap(), "ae");
    }

    #[test]
    fn test_delete_everything() {
        let edit = Edit::Delete { position: 0, length: 5 };
        assert_eq!(apply("abcde", &edit).unwrap(), "");
    }

    #[test]
    fn test_insert_out_of_range() {
        let edit = Edit::Insert { position: 6, text: "x".to_string() };
        let err = apply("hello", &edit).unwrap_err();
        assert_eq!(
            err,
            ApplyError::OutOfRange { position: 6, length: 0, text_len: 5 }
        );
    }

    #[test]
    fn test_delete_out_of_range() {
        let edit = Edit::Delete { position: 3, length: 3 };
        assert!(apply("hello", &edit).is_err());
    }

    #[test]
    fn test_char_offsets_not_bytes() {
        // Multi-byte characters: offsets count chars.
        let edit = Edit::Insert { position: 2, text: "x".to_string() };
        assert_eq!(apply("héllo", &edit).unwrap(), "héxllo");

        let edit = Edit::Delete { position: 1, length: 1 };
        assert_eq!(apply("héllo", &edit).unwrap(), "hllo");
    }

    #[test]
    fn test_edit_len_counts_chars() {
        let edit = Edit::Insert { position: 0, text: "héllo".to_string() };
        assert_eq!(edit.len(), 5);
    }

    #[test]
    fn test_operation_constructors() {
        let origin = Uuid::new_v4();
        let op = Operation::insert(3, "abc", origin, 7);
        assert_eq!(op.edit, Edit::Insert { position: 3, text: "abc".to_string() });
        assert_eq!(op.origin, origin);
        assert_eq!(op.base_version, 7);

        let op = Operation::delete(2, 4, origin, 9);
        assert_eq!(op.edit, Edit::Delete { position: 2, length: 4 });
    }

    #[test]
    fn test_with_edit_preserves_identity() {
        let origin = Uuid::new_v4();
        let op = Operation::insert(3, "abc", origin, 7);
        let moved = op.with_edit(Edit::Insert { position: 5, text: "abc".to_string() });
        assert_eq!(moved.origin, origin);
        assert_eq!(moved.base_version, 7);
        assert_eq!(moved.edit.position(), 5);
        // Original untouched
        assert_eq!(op.edit.position(), 3);
    }
}
