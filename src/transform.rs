//! Operational transform: rewrite one edit so it applies after another.
//!
//! `transform(a, b)` answers: given that `b` has already been applied to the
//! text, where does `a` land now? Both sides of a concurrent pair run the
//! transform with swapped arguments and converge on the same text (the
//! diamond property):
//!
//! ```text
//!            text
//!           /    \
//!          a      b
//!         /        \
//!   text·a          text·b
//!         \        /
//!   transform(b,a)  transform(a,b)
//!           \    /
//!          same text
//! ```
//!
//! The four rules are position arithmetic only; no text inspection. Ties
//! between inserts at the same position are broken by origin id, which both
//! sides order identically.

use crate::operation::{Edit, Operation};

/// Transform `a` to apply after `b`.
///
/// Pure: returns a new operation, neither input is modified.
pub fn transform(a: &Operation, b: &Operation) -> Operation {
    let edit = match (&a.edit, &b.edit) {
        (
            Edit::Insert { position: a_pos, text: a_text },
            Edit::Insert { position: b_pos, text: b_text },
        ) => {
            if a_pos < b_pos || (a_pos == b_pos && a.origin < b.origin) {
                a.edit.clone()
            } else {
                Edit::Insert {
                    position: a_pos + b_text.chars().count(),
                    text: a_text.clone(),
                }
            }
        }

        (
            Edit::Insert { position: a_pos, text: a_text },
            Edit::Delete { position: b_pos, length: b_len },
        ) => {
            let position = if a_pos <= b_pos {
                *a_pos
            } else if *a_pos > b_pos + b_len {
                a_pos - b_len
            } else {
                // Insert point fell inside the deleted range.
                *b_pos
            };
            Edit::Insert { position, text: a_text.clone() }
        }

        (
            Edit::Delete { position: a_pos, length: a_len },
            Edit::Insert { position: b_pos, text: b_text },
        ) => {
            let position = if a_pos < b_pos {
                *a_pos
            } else {
                a_pos + b_text.chars().count()
            };
            Edit::Delete { position, length: *a_len }
        }

        (
            Edit::Delete { position: a_pos, length: a_len },
            Edit::Delete { position: b_pos, length: b_len },
        ) => {
            if a_pos + a_len <= *b_pos {
                // Entirely before b.
                a.edit.clone()
            } else if *a_pos >= b_pos + b_len {
                // Entirely after b.
                Edit::Delete { position: a_pos - b_len, length: *a_len }
            } else {
                // Overlapping ranges: the overlap is already gone.
                let overlap = (a_pos + a_len).min(b_pos + b_len) - a_pos.max(b_pos);
                Edit::Delete {
                    position: *a_pos.min(b_pos),
                    length: a_len.saturating_sub(overlap),
                }
            }
        }
    };

    a.with_edit(edit)
}

/// Transform a single cursor position through an edit.
///
/// The single-position halves of the operation rules: a cursor at or before
/// the edit point stays, a cursor after an insert shifts right, a cursor
/// inside a deleted range clamps to the deletion start.
pub fn transform_cursor(pos: usize, edit: &Edit) -> usize {
    match edit {
        Edit::Insert { position, text } => {
            if pos <= *position {
                pos
            } else {
                pos + text.chars().count()
            }
        }
        Edit::Delete { position, length } => {
            if pos <= *position {
                pos
            } else if pos >= position + length {
                pos - length
            } else {
                *position
            }
        }
    }
}
