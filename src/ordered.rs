//! Binary search helpers for newest-first sequences.
//!
//! Everything the store keeps in order (block contents, directories, slice
//! windows) is sorted newest to oldest by [`MessageKey`]. These helpers find
//! insertion points and existing positions in such sequences.

use std::cmp::Ordering;

use crate::model::MessageKey;

/// Index at which `key` would be inserted into the newest-first `list`.
pub fn bsearch_for_insert<T, F>(list: &[T], key: &MessageKey, key_of: F) -> usize
where
    F: Fn(&T) -> MessageKey,
{
    list.partition_point(|item| key_of(item) > *key)
}

/// Index of `key` in the newest-first `list`, if present.
pub fn bsearch_maybe_exists<T, F>(list: &[T], key: &MessageKey, key_of: F) -> Option<usize>
where
    F: Fn(&T) -> MessageKey,
{
    list.binary_search_by(|item| key.cmp(&key_of(item))).ok()
}

/// Insertion point in a list ordered by a single key.
///
/// `cmp` reports how an element orders relative to the sought value in list
/// order (`Less` means the element sorts before it).
pub fn bsearch_for_insert_by<T, F>(list: &[T], mut cmp: F) -> usize
where
    F: FnMut(&T) -> Ordering,
{
    list.partition_point(|item| cmp(item) != Ordering::Greater)
}

/// Position of an element equal to the sought value in a single-key list.
pub fn bsearch_maybe_exists_by<T, F>(list: &[T], cmp: F) -> Option<usize>
where
    F: FnMut(&T) -> Ordering,
{
    list.binary_search_by(cmp).ok()
}

/// Compare two keys newest first.
pub fn cmp_young_to_old(a: &MessageKey, b: &MessageKey) -> Ordering {
    b.cmp(a)
}
