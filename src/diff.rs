//! Snapshot diffing: turn a before/after pair of texts into a single edit.
//!
//! Greedy single-edit extraction: find the longest common prefix scanning
//! forward and the longest common suffix scanning backward, and describe
//! whatever lies between as one insert or one delete. This is exact for
//! keystroke-level editing where each callback carries one contiguous change;
//! a multi-point replace (find-and-replace-all) is not decomposed into
//! multiple edits and will be captured only approximately. Known limitation,
//! kept deliberately.

use crate::operation::Edit;

/// Extract the single edit that turns `old` into `new`.
///
/// Returns `None` when the texts are equal, and also when they have equal
/// length but differ — an equal-length replacement cannot be expressed as one
/// insert or delete, and the caller must decompose it into delete + insert.
pub fn extract(old: &str, new: &str) -> Option<Edit> {
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    if old_chars.len() == new_chars.len() {
        return None;
    }

    let shorter = old_chars.len().min(new_chars.len());

    // Longest common prefix.
    let mut prefix = 0;
    while prefix < shorter && old_chars[prefix] == new_chars[prefix] {
        prefix += 1;
    }

    // Longest common suffix, capped so it never overlaps the prefix.
    let mut suffix = 0;
    while suffix < shorter - prefix
        && old_chars[old_chars.len() - 1 - suffix] == new_chars[new_chars.len() - 1 - suffix]
    {
        suffix += 1;
    }

    if new_chars.len() > old_chars.len() {
        let text: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();
        Some(Edit::Insert { position: prefix, text })
    } else {
        Some(Edit::Delete {
            position: prefix,
            length: old_chars.len() - suffix - prefix,
        })
    }
}
