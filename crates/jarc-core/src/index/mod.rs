//! In-memory fragment table and dedup index.

use crate::error::{JarcError, Result};
use crate::hash::Sha1Hash;

/// Dense fragment identifier. IDs start at 1; 0 is a reserved sentinel.
pub type FragmentId = u32;

/// Where a fragment's bytes live in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locator {
    /// Archive byte offset of the compressed block whose first fragment
    /// this is.
    Block(u64),
    /// The k-th fragment (k >= 1) after the block's first fragment.
    Within(u32),
    /// Location unknown: a damaged or not-yet-assigned table entry.
    Missing,
}

#[derive(Debug, Clone)]
pub struct FragmentEntry {
    pub hash: Sha1Hash,
    /// Uncompressed size, or None when unknown (streaming segments).
    pub size: Option<u32>,
    pub locator: Locator,
}

impl FragmentEntry {
    pub fn missing() -> Self {
        FragmentEntry {
            hash: Sha1Hash::ZERO,
            size: None,
            locator: Locator::Missing,
        }
    }
}

/// The fragment table (dense IDs; entry 0 is an unused sentinel).
#[derive(Debug)]
pub struct FragmentTable {
    entries: Vec<FragmentEntry>,
}

impl Default for FragmentTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentTable {
    pub fn new() -> Self {
        FragmentTable {
            entries: vec![FragmentEntry::missing()],
        }
    }

    /// Total entry count including the sentinel; the next fresh ID.
    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn get(&self, id: FragmentId) -> Option<&FragmentEntry> {
        if id == 0 {
            return None;
        }
        self.entries.get(id as usize)
    }

    pub fn get_mut(&mut self, id: FragmentId) -> Option<&mut FragmentEntry> {
        if id == 0 {
            return None;
        }
        self.entries.get_mut(id as usize)
    }

    /// Append a new fragment; returns its ID.
    pub fn push(&mut self, entry: FragmentEntry) -> FragmentId {
        self.entries.push(entry);
        self.entries.len() as u32 - 1
    }

    /// Grow with missing entries until `len()` exceeds `id`.
    pub fn grow_to(&mut self, id: FragmentId) {
        while self.len() <= id {
            self.entries.push(FragmentEntry::missing());
        }
    }

    /// Iterate `(id, entry)` over real entries (skips the sentinel).
    pub fn iter(&self) -> impl Iterator<Item = (FragmentId, &FragmentEntry)> {
        self.entries
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, e)| (i as u32, e))
    }

    /// Resolve a fragment's block offset by chasing a `Within` locator back
    /// to the block's first fragment.
    pub fn block_offset_of(&self, id: FragmentId) -> Result<u64> {
        match self.get(id).map(|e| e.locator) {
            Some(Locator::Block(off)) => Ok(off),
            Some(Locator::Within(k)) => match self.get(id - k).map(|e| e.locator) {
                Some(Locator::Block(off)) => Ok(off),
                _ => Err(JarcError::MissingFragment(id)),
            },
            _ => Err(JarcError::MissingFragment(id)),
        }
    }
}

/// Maps fragment hashes to IDs for dedup lookup: a 2^22-bucket array keyed
/// by the low 22 bits of the first three hash bytes, each bucket holding
/// candidate IDs confirmed by a full 20-byte compare. Only fragments of
/// known size are indexed.
pub struct HashIndex {
    buckets: Vec<Vec<FragmentId>>,
    indexed: u32,
}

const BUCKETS: usize = 1 << 22;

impl HashIndex {
    pub fn new(table: &FragmentTable) -> Self {
        let mut idx = HashIndex {
            buckets: vec![Vec::new(); BUCKETS],
            indexed: 1,
        };
        idx.update(table);
        idx
    }

    /// Look up a hash; returns the fragment ID on a full-hash match.
    pub fn find(&self, table: &FragmentTable, hash: &Sha1Hash) -> Option<FragmentId> {
        self.buckets[hash.bucket()]
            .iter()
            .copied()
            .find(|&id| table.get(id).is_some_and(|e| e.hash == *hash))
    }

    /// Index table entries appended since the last update.
    pub fn update(&mut self, table: &FragmentTable) {
        while self.indexed < table.len() {
            let id = self.indexed;
            if let Some(entry) = table.get(id) {
                if entry.size.is_some() {
                    self.buckets[entry.hash.bucket()].push(id);
                }
            }
            self.indexed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(byte: u8, size: Option<u32>) -> FragmentEntry {
        FragmentEntry {
            hash: Sha1Hash([byte; 20]),
            size,
            locator: Locator::Missing,
        }
    }

    #[test]
    fn ids_are_dense_from_one() {
        let mut t = FragmentTable::new();
        assert_eq!(t.len(), 1);
        assert_eq!(t.push(entry(1, Some(10))), 1);
        assert_eq!(t.push(entry(2, Some(20))), 2);
        assert!(t.get(0).is_none());
        assert_eq!(t.get(2).unwrap().size, Some(20));
    }

    #[test]
    fn find_requires_full_hash_match() {
        let mut t = FragmentTable::new();
        t.push(entry(0xAA, Some(10)));
        let mut idx = HashIndex::new(&t);
        idx.update(&t);

        assert_eq!(idx.find(&t, &Sha1Hash([0xAA; 20])), Some(1));
        // Same bucket (first 3 bytes), different tail: no match.
        let mut near = [0xAA; 20];
        near[19] = 0;
        assert_eq!(idx.find(&t, &Sha1Hash(near)), None);
    }

    #[test]
    fn unknown_size_is_not_indexed() {
        let mut t = FragmentTable::new();
        t.push(entry(0xBB, None));
        let idx = HashIndex::new(&t);
        assert_eq!(idx.find(&t, &Sha1Hash([0xBB; 20])), None);
    }

    #[test]
    fn incremental_update_sees_new_entries() {
        let mut t = FragmentTable::new();
        let mut idx = HashIndex::new(&t);
        t.push(entry(0x11, Some(4)));
        assert_eq!(idx.find(&t, &Sha1Hash([0x11; 20])), None);
        idx.update(&t);
        assert_eq!(idx.find(&t, &Sha1Hash([0x11; 20])), Some(1));
    }

    #[test]
    fn block_offset_chases_within() {
        let mut t = FragmentTable::new();
        let first = t.push(FragmentEntry {
            hash: Sha1Hash([1; 20]),
            size: Some(8),
            locator: Locator::Block(4242),
        });
        let second = t.push(FragmentEntry {
            hash: Sha1Hash([2; 20]),
            size: Some(8),
            locator: Locator::Within(1),
        });
        assert_eq!(t.block_offset_of(first).unwrap(), 4242);
        assert_eq!(t.block_offset_of(second).unwrap(), 4242);
        let third = t.push(entry(3, Some(8)));
        assert!(t.block_offset_of(third).is_err());
    }

    #[test]
    fn grow_to_pads_with_missing() {
        let mut t = FragmentTable::new();
        t.grow_to(5);
        assert_eq!(t.len(), 6);
        assert_eq!(t.get(5).unwrap().locator, Locator::Missing);
        assert!(t.get(5).unwrap().hash.is_zero());
    }
}
