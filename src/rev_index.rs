//! Reverse (offset-ordered) pack index.
//!
//! Derived from a [`PackIndex`] on first need: the same entries re-sorted by
//! pack offset. It answers "what object starts at this offset" and "where
//! does this object's raw record end", which the raw-copy path needs to
//! bound an entry's compressed byte range.
//!
//! # Invariants
//! - Entry ranges `[offset, next_offset)` are disjoint and contiguous up to
//!   the pack trailer.
//! - `find_next_offset` only accepts offsets that are valid object starts;
//!   anything else is a corruption error, never a guessed value.

use std::fmt;

use crate::object_id::ObjectId;
use crate::pack_idx::PackIndex;

/// Errors from reverse index lookups.
#[derive(Debug, PartialEq, Eq)]
pub enum RevIndexError {
    /// The queried offset is not the start of any object.
    BadAnchor { offset: u64 },
}

impl fmt::Display for RevIndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadAnchor { offset } => {
                write!(f, "offset {offset} is not the start of a packed object")
            }
        }
    }
}

impl std::error::Error for RevIndexError {}

/// Offset-sorted view over a pack index.
#[derive(Debug)]
pub struct ReverseIndex {
    /// `(offset, hash-order position)` pairs sorted by offset ascending.
    entries: Vec<(u64, u32)>,
}

impl ReverseIndex {
    /// Builds the reverse index from a pack index.
    ///
    /// O(n log n) once per pack; callers cache the result.
    #[must_use]
    pub fn build(index: &PackIndex) -> Self {
        let count = index.object_count() as u32;
        let mut entries: Vec<(u64, u32)> = (0..count)
            .map(|pos| (index.offset_at(pos), pos))
            .collect();
        entries.sort_unstable_by_key(|&(offset, _)| offset);
        Self { entries }
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the pack holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the object starting exactly at `offset`.
    #[must_use]
    pub fn find_object(&self, offset: u64, index: &PackIndex) -> Option<ObjectId> {
        self.position_of(offset).map(|slot| {
            let (_, pos) = self.entries[slot];
            index.oid_at(pos)
        })
    }

    /// Returns the start offset of the object following the one at `offset`,
    /// or `max_offset` if `offset` starts the last object.
    ///
    /// # Errors
    /// Returns `BadAnchor` if `offset` is not a valid object start.
    pub fn find_next_offset(&self, offset: u64, max_offset: u64) -> Result<u64, RevIndexError> {
        let slot = self
            .position_of(offset)
            .ok_or(RevIndexError::BadAnchor { offset })?;
        Ok(self
            .entries
            .get(slot + 1)
            .map_or(max_offset, |&(next, _)| next))
    }

    /// Iterates `(offset, hash-order position)` pairs in offset order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.entries.iter().copied()
    }

    fn position_of(&self, offset: u64) -> Option<usize> {
        self.entries
            .binary_search_by_key(&offset, |&(off, _)| off)
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::IdxBuilder;

    fn oid(first: u8, last: u8) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[0] = first;
        bytes[19] = last;
        ObjectId::from_bytes(bytes)
    }

    fn index_of(entries: &[(ObjectId, u64)]) -> PackIndex {
        let mut builder = IdxBuilder::new();
        for &(id, offset) in entries {
            builder.add(id, offset, 0);
        }
        PackIndex::parse(&builder.build()).unwrap()
    }

    #[test]
    fn find_object_exact_match_only() {
        let index = index_of(&[
            (oid(0x20, 2), 100),
            (oid(0x10, 1), 300),
            (oid(0x30, 3), 200),
        ]);
        let rev = ReverseIndex::build(&index);

        assert_eq!(rev.find_object(100, &index), Some(oid(0x20, 2)));
        assert_eq!(rev.find_object(200, &index), Some(oid(0x30, 3)));
        assert_eq!(rev.find_object(300, &index), Some(oid(0x10, 1)));
        assert_eq!(rev.find_object(150, &index), None);
        assert_eq!(rev.find_object(0, &index), None);
    }

    #[test]
    fn next_offset_walk_is_strictly_increasing() {
        let index = index_of(&[
            (oid(0x01, 1), 12),
            (oid(0x02, 2), 90),
            (oid(0x03, 3), 45),
            (oid(0x04, 4), 230),
        ]);
        let rev = ReverseIndex::build(&index);
        let max = 1000u64;

        let mut offset = 12u64;
        let mut seen = Vec::new();
        for _ in 0..4 {
            let next = rev.find_next_offset(offset, max).unwrap();
            assert!(next > offset);
            seen.push(next);
            offset = next;
        }
        assert_eq!(seen, vec![45, 90, 230, max]);
    }

    #[test]
    fn bad_anchor_is_a_corruption_error() {
        let index = index_of(&[(oid(0x01, 1), 12), (oid(0x02, 2), 90)]);
        let rev = ReverseIndex::build(&index);

        assert_eq!(
            rev.find_next_offset(13, 1000),
            Err(RevIndexError::BadAnchor { offset: 13 })
        );
    }

    #[test]
    fn entries_sorted_by_offset() {
        let index = index_of(&[
            (oid(0xff, 1), 500),
            (oid(0x01, 2), 100),
            (oid(0x80, 3), 300),
        ]);
        let rev = ReverseIndex::build(&index);

        let offsets: Vec<u64> = rev.iter().map(|(off, _)| off).collect();
        assert_eq!(offsets, vec![100, 300, 500]);
        assert_eq!(rev.len(), 3);
    }
}
