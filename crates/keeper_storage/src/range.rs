//! Key ranges and scan direction.

use std::ops::Bound;

/// Order in which a scan visits keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Smallest key first.
    #[default]
    Ascending,
    /// Largest key first.
    Descending,
}

/// A range of raw byte keys.
///
/// Keys compare as unsigned bytes, lexicographically, which is the order
/// LMDB's default comparator uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// Lower bound.
    pub start: Bound<Vec<u8>>,
    /// Upper bound.
    pub end: Bound<Vec<u8>>,
}

impl KeyRange {
    /// The range covering every key.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// Creates a range from explicit bounds.
    #[must_use]
    pub const fn new(start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Self {
        Self { start, end }
    }

    /// Creates an inclusive range `[start, end]`.
    #[must_use]
    pub fn inclusive(start: Vec<u8>, end: Vec<u8>) -> Self {
        Self::new(Bound::Included(start), Bound::Included(end))
    }

    /// Returns true if `key` lies inside the range.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        let above = match &self.start {
            Bound::Included(start) => key >= start.as_slice(),
            Bound::Excluded(start) => key > start.as_slice(),
            Bound::Unbounded => true,
        };
        let below = match &self.end {
            Bound::Included(end) => key <= end.as_slice(),
            Bound::Excluded(end) => key < end.as_slice(),
            Bound::Unbounded => true,
        };
        above && below
    }

    /// Returns true if no key can lie inside the range.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e))
            | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
            _ => false,
        }
    }

    /// Narrows the range so that a scan in `direction` resumes after `key`.
    ///
    /// Paged scans call this with the last key of the previous page.
    #[must_use]
    pub fn resume_after(&self, key: &[u8], direction: Direction) -> Self {
        match direction {
            Direction::Ascending => Self::new(Bound::Excluded(key.to_vec()), self.end.clone()),
            Direction::Descending => Self::new(self.start.clone(), Bound::Excluded(key.to_vec())),
        }
    }

    /// Borrows the bounds as slices, the form LMDB range cursors accept.
    #[must_use]
    pub fn as_slices(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        (
            self.start.as_ref().map(Vec::as_slice),
            self.end.as_ref().map(Vec::as_slice),
        )
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_respects_bounds() {
        let range = KeyRange::new(Bound::Included(b"b".to_vec()), Bound::Excluded(b"d".to_vec()));
        assert!(!range.contains(b"a"));
        assert!(range.contains(b"b"));
        assert!(range.contains(b"c\xff"));
        assert!(!range.contains(b"d"));
    }

    #[test]
    fn empty_ranges_are_detected() {
        assert!(KeyRange::new(Bound::Excluded(b"a".to_vec()), Bound::Excluded(b"a".to_vec())).is_empty());
        assert!(KeyRange::inclusive(b"b".to_vec(), b"a".to_vec()).is_empty());
        assert!(!KeyRange::inclusive(b"a".to_vec(), b"a".to_vec()).is_empty());
        assert!(!KeyRange::all().is_empty());
    }

    #[test]
    fn resume_after_moves_the_leading_bound() {
        let range = KeyRange::inclusive(b"a".to_vec(), b"z".to_vec());

        let asc = range.resume_after(b"m", Direction::Ascending);
        assert!(!asc.contains(b"m"));
        assert!(asc.contains(b"n"));
        assert!(asc.contains(b"z"));

        let desc = range.resume_after(b"m", Direction::Descending);
        assert!(!desc.contains(b"m"));
        assert!(desc.contains(b"l"));
        assert!(desc.contains(b"a"));
    }
}
