//! Snapshots of simulation state
//!
//! A snapshot is a set of typed items, each keyed by `(type_id, id)` and
//! carrying a flat array of 32-bit words. Items are kept sorted by key so two
//! snapshots with the same content are identical regardless of build order.

pub mod id_pool;
pub mod storage;

use serde::{Deserialize, Serialize};

use crate::game::constants::snapshot::{MAX_ITEMS, MAX_SIZE};

/// Item key: type in the high half, identifier in the low half
pub type ItemKey = u32;

#[inline]
pub fn item_key(type_id: u16, id: u16) -> ItemKey {
    ((type_id as u32) << 16) | id as u32
}

/// One typed item in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapItem {
    pub type_id: u16,
    pub id: u16,
    pub data: Vec<i32>,
}

impl SnapItem {
    #[inline]
    pub fn key(&self) -> ItemKey {
        item_key(self.type_id, self.id)
    }

    /// Bytes this item occupies in the encoded snapshot (offset, key, data)
    #[inline]
    fn encoded_size(&self) -> usize {
        8 + self.data.len() * 4
    }
}

/// Immutable snapshot of the world as seen by one recipient
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    items: Vec<SnapItem>,
}

impl Snapshot {
    /// The empty snapshot, used as baseline when none is available
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[SnapItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn find(&self, key: ItemKey) -> Option<&SnapItem> {
        self.items
            .binary_search_by_key(&key, SnapItem::key)
            .ok()
            .map(|idx| &self.items[idx])
    }

    /// Checksum sent alongside every snapshot: wrapping sum of all item words
    pub fn crc(&self) -> u32 {
        self.items
            .iter()
            .flat_map(|item| item.data.iter())
            .fold(0u32, |acc, &word| acc.wrapping_add(word as u32))
    }

    /// Size of the snapshot in its flat encoding
    pub fn encoded_size(&self) -> usize {
        8 + self.items.iter().map(SnapItem::encoded_size).sum::<usize>()
    }

    /// Drop items matching the predicate (used to strip per-viewer data)
    pub fn retain(&mut self, mut keep: impl FnMut(&SnapItem) -> bool) {
        self.items.retain(|item| keep(item));
    }

    pub(crate) fn from_sorted_items(items: Vec<SnapItem>) -> Self {
        debug_assert!(items.windows(2).all(|w| w[0].key() < w[1].key()));
        Self { items }
    }
}

/// Errors raised while building a snapshot
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("duplicate snapshot item (type {type_id}, id {id})")]
    DuplicateItem { type_id: u16, id: u16 },
    #[error("snapshot exceeds {max} bytes")]
    TooLarge { max: usize },
    #[error("snapshot exceeds {max} items")]
    TooManyItems { max: usize },
}

/// Accumulates items during a snapshot pass
#[derive(Debug)]
pub struct SnapshotBuilder {
    items: Vec<SnapItem>,
    size: usize,
    max_size: usize,
    max_items: usize,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::with_limits(MAX_SIZE, MAX_ITEMS)
    }

    pub fn with_limits(max_size: usize, max_items: usize) -> Self {
        Self {
            items: Vec::new(),
            size: 8,
            max_size,
            max_items,
        }
    }

    /// Add an item. Keys must be unique within one snapshot.
    pub fn add_item(&mut self, type_id: u16, id: u16, data: &[i32]) -> Result<(), SnapshotError> {
        if self.items.len() >= self.max_items {
            return Err(SnapshotError::TooManyItems { max: self.max_items });
        }
        let item_size = 8 + data.len() * 4;
        if self.size + item_size > self.max_size {
            return Err(SnapshotError::TooLarge { max: self.max_size });
        }
        if self.items.iter().any(|item| item.type_id == type_id && item.id == id) {
            return Err(SnapshotError::DuplicateItem { type_id, id });
        }

        self.size += item_size;
        self.items.push(SnapItem {
            type_id,
            id,
            data: data.to_vec(),
        });
        Ok(())
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn finish(mut self) -> Snapshot {
        self.items.sort_unstable_by_key(SnapItem::key);
        Snapshot { items: self.items }
    }
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sorts_by_key() {
        let mut builder = SnapshotBuilder::new();
        builder.add_item(3, 1, &[1]).unwrap();
        builder.add_item(1, 7, &[2]).unwrap();
        builder.add_item(1, 2, &[3]).unwrap();
        let snap = builder.finish();

        let keys: Vec<_> = snap.items().iter().map(|i| (i.type_id, i.id)).collect();
        assert_eq!(keys, vec![(1, 2), (1, 7), (3, 1)]);
        assert_eq!(snap.find(item_key(1, 7)).unwrap().data, vec![2]);
        assert!(snap.find(item_key(2, 7)).is_none());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut builder = SnapshotBuilder::new();
        builder.add_item(1, 1, &[0]).unwrap();
        assert_eq!(
            builder.add_item(1, 1, &[5]),
            Err(SnapshotError::DuplicateItem { type_id: 1, id: 1 })
        );
        assert_eq!(builder.item_count(), 1);
    }

    #[test]
    fn test_size_limits() {
        let mut builder = SnapshotBuilder::with_limits(8 + 16, 10);
        builder.add_item(1, 1, &[1, 2]).unwrap();
        assert_eq!(
            builder.add_item(1, 2, &[1]),
            Err(SnapshotError::TooLarge { max: 24 })
        );

        let mut builder = SnapshotBuilder::with_limits(1024, 1);
        builder.add_item(1, 1, &[]).unwrap();
        assert_eq!(
            builder.add_item(1, 2, &[]),
            Err(SnapshotError::TooManyItems { max: 1 })
        );
    }

    #[test]
    fn test_crc_wraps() {
        let mut builder = SnapshotBuilder::new();
        builder.add_item(1, 1, &[i32::MAX, 1]).unwrap();
        builder.add_item(1, 2, &[-1]).unwrap();
        let snap = builder.finish();
        assert_eq!(snap.crc(), (i32::MAX as u32).wrapping_add(1).wrapping_add(u32::MAX));
        assert_eq!(Snapshot::empty().crc(), 0);
    }
}
