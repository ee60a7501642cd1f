//! Free space map for tracking reusable extents of a record file.
//!
//! Every block is indexed twice: by offset, so that a freed block can be
//! merged with its neighbours, and by `(len, offset)`, so that allocation
//! can pick the smallest block that fits.  Adjacent free blocks are always
//! merged, so no two blocks in the map touch.

use std::collections::{BTreeMap, BTreeSet};

use crate::{Extent, StorageError};

#[derive(Clone, Debug, Default)]
pub struct FreeSpaceMap {
    /// Free blocks keyed by offset, mapping to length.
    by_offset: BTreeMap<u64, u64>,

    /// The same blocks ordered by `(len, offset)`.
    by_size: BTreeSet<(u64, u64)>,

    /// Sum of the lengths of all free blocks.
    total: u64,
}

impl FreeSpaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of separate free blocks.
    pub fn len(&self) -> usize {
        self.by_offset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_offset.is_empty()
    }

    /// Total free space across all blocks.
    pub fn total_free(&self) -> u64 {
        self.total
    }

    /// Iterates the free blocks in offset order.
    pub fn iter(&self) -> impl Iterator<Item = Extent> + '_ {
        self.by_offset
            .iter()
            .map(|(&offset, &len)| Extent::new(offset, len))
    }

    /// Returns a free block that shares at least one unit with `extent`.
    pub fn overlapping(&self, extent: Extent) -> Option<Extent> {
        if extent.is_empty() {
            return None;
        }
        let (&offset, &len) = self.by_offset.range(..extent.end()).next_back()?;
        let block = Extent::new(offset, len);
        (block.end() > extent.offset).then_some(block)
    }

    pub fn clear(&mut self) {
        self.by_offset.clear();
        self.by_size.clear();
        self.total = 0;
    }

    fn insert_block(&mut self, offset: u64, len: u64) {
        self.by_offset.insert(offset, len);
        self.by_size.insert((len, offset));
        self.total += len;
    }

    fn remove_block(&mut self, offset: u64, len: u64) {
        self.by_offset.remove(&offset);
        self.by_size.remove(&(len, offset));
        self.total -= len;
    }

    /// Returns `extent` to the map, merging it with any free neighbours.
    ///
    /// Freeing an empty extent does nothing.  Freeing an extent that overlaps
    /// space that is already free is an error and leaves the map unchanged.
    pub fn free(&mut self, extent: Extent) -> Result<(), StorageError> {
        if extent.is_empty() {
            return Ok(());
        }
        let overlap = StorageError::OverlappingFree {
            offset: extent.offset,
            len: extent.len,
        };

        let before = self
            .by_offset
            .range(..=extent.offset)
            .next_back()
            .map(|(&offset, &len)| Extent::new(offset, len));
        let after = self
            .by_offset
            .range(extent.offset + 1..)
            .next()
            .map(|(&offset, &len)| Extent::new(offset, len));

        if before.is_some_and(|before| before.end() > extent.offset)
            || after.is_some_and(|after| after.offset < extent.end())
        {
            return Err(overlap);
        }

        let mut merged = extent;
        if let Some(before) = before.filter(|before| before.end() == extent.offset) {
            self.remove_block(before.offset, before.len);
            merged = Extent::new(before.offset, before.len + merged.len);
        }
        if let Some(after) = after.filter(|after| after.offset == extent.end()) {
            self.remove_block(after.offset, after.len);
            merged.len += after.len;
        }
        self.insert_block(merged.offset, merged.len);
        self.debug_check_invariants();
        Ok(())
    }

    /// Takes `len` units from the smallest free block that can hold them and
    /// returns their offset, handing the remainder of the block back to the
    /// map.  Returns `None` if no block is large enough.
    pub fn allocate(&mut self, len: u64) -> Option<u64> {
        if len == 0 {
            return None;
        }
        let &(block_len, offset) = self.by_size.range((len, 0)..).next()?;
        self.remove_block(offset, block_len);
        if block_len > len {
            self.insert_block(offset + len, block_len - len);
        }
        self.debug_check_invariants();
        Some(offset)
    }

    /// Removes and returns the free block that ends exactly at `end`, if
    /// there is one, so that the owner can shrink its file.
    pub fn take_tail(&mut self, end: u64) -> Option<Extent> {
        let (&offset, &len) = self.by_offset.iter().next_back()?;
        if offset + len != end {
            return None;
        }
        self.remove_block(offset, len);
        Some(Extent::new(offset, len))
    }

    /// Flattens the map as `[offset, len, offset, len, ...]` in offset order.
    pub fn to_vector(&self) -> Vec<u64> {
        self.iter()
            .flat_map(|extent| [extent.offset, extent.len])
            .collect()
    }

    /// Rebuilds a map from the output of [Self::to_vector].  Blocks may be
    /// in any order; touching blocks are merged.
    pub fn from_vector(vector: &[u64]) -> Result<Self, StorageError> {
        let mut map = Self::new();
        for pair in vector.chunks(2) {
            match *pair {
                [offset, len] => map.free(Extent::new(offset, len))?,
                _ => return Err(StorageError::StdIo(std::io::ErrorKind::InvalidData)),
            }
        }
        Ok(map)
    }

    #[allow(dead_code)]
    fn check_invariants(&self) {
        assert_eq!(self.by_offset.len(), self.by_size.len());
        let mut total = 0;
        let mut previous_end = None;
        for (&offset, &len) in &self.by_offset {
            assert!(len > 0);
            assert!(self.by_size.contains(&(len, offset)));
            if let Some(previous_end) = previous_end {
                assert!(previous_end < offset, "blocks must neither touch nor overlap");
            }
            previous_end = Some(offset + len);
            total += len;
        }
        assert_eq!(total, self.total);
    }

    fn debug_check_invariants(&self) {
        #[cfg(debug_assertions)]
        self.check_invariants()
    }
}
