//! Snapshot delta encoding
//!
//! A delta turns a baseline snapshot the client acknowledged into the
//! current one. Layout, as a flat array of words:
//!
//! ```text
//! [num_deleted][num_updated][num_temp]
//! [deleted key] * num_deleted
//! ([type][id]([size])[word diff] * size) * num_updated
//! ```
//!
//! `size` is omitted for item types with a registered static size. Word
//! diffs use wrapping arithmetic; items missing from the baseline are diffed
//! against zeros. Unchanged items are not sent at all, so identical
//! snapshots produce an empty delta.

use rustc_hash::FxHashMap;

use crate::game::constants::snapshot::MAX_ITEM_TYPES;
use crate::snapshot::{item_key, ItemKey, SnapItem, Snapshot};

const HEADER_WORDS: usize = 3;

/// Errors from encoding or applying a delta
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    #[error("delta truncated")]
    Truncated,
    #[error("invalid delta header")]
    InvalidHeader,
    #[error("invalid item type {0}")]
    InvalidType(i32),
    #[error("invalid item size {0}")]
    InvalidSize(i32),
    #[error("item type {type_id} has static size {expected}, got {actual}")]
    StaticSizeMismatch {
        type_id: u16,
        expected: usize,
        actual: usize,
    },
    #[error("{0} trailing words after delta")]
    TrailingData(usize),
}

/// Static item sizes registered by the simulation at startup
#[derive(Debug, Clone)]
pub struct ItemSchema {
    static_sizes: [Option<u16>; MAX_ITEM_TYPES],
}

impl ItemSchema {
    pub fn new() -> Self {
        Self {
            static_sizes: [None; MAX_ITEM_TYPES],
        }
    }

    /// Register the word count every item of `type_id` carries. Types
    /// outside the schema range always carry an explicit size.
    pub fn set_static_size(&mut self, type_id: u16, words: u16) {
        if let Some(slot) = self.static_sizes.get_mut(type_id as usize) {
            *slot = Some(words);
        }
    }

    pub fn static_size(&self, type_id: u16) -> Option<usize> {
        self.static_sizes
            .get(type_id as usize)
            .copied()
            .flatten()
            .map(usize::from)
    }
}

impl Default for ItemSchema {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode `to` relative to `from`. An empty result means nothing changed.
pub fn create_delta(
    from: &Snapshot,
    to: &Snapshot,
    schema: &ItemSchema,
) -> Result<Vec<i32>, DeltaError> {
    let deleted: Vec<ItemKey> = from
        .items()
        .iter()
        .map(SnapItem::key)
        .filter(|&key| to.find(key).is_none())
        .collect();

    let mut body = Vec::new();
    let mut num_updated = 0;

    for item in to.items() {
        if let Some(expected) = schema.static_size(item.type_id) {
            if expected != item.data.len() {
                return Err(DeltaError::StaticSizeMismatch {
                    type_id: item.type_id,
                    expected,
                    actual: item.data.len(),
                });
            }
        }

        let base = from
            .find(item.key())
            .filter(|base| base.data.len() == item.data.len());

        if let Some(base) = base {
            if base.data == item.data {
                continue;
            }
        }

        num_updated += 1;
        body.push(item.type_id as i32);
        body.push(item.id as i32);
        if schema.static_size(item.type_id).is_none() {
            body.push(item.data.len() as i32);
        }
        match base {
            Some(base) => body.extend(
                item.data
                    .iter()
                    .zip(&base.data)
                    .map(|(&cur, &old)| cur.wrapping_sub(old)),
            ),
            None => body.extend_from_slice(&item.data),
        }
    }

    if deleted.is_empty() && num_updated == 0 {
        return Ok(Vec::new());
    }

    let mut delta = Vec::with_capacity(HEADER_WORDS + deleted.len() + body.len());
    delta.push(deleted.len() as i32);
    delta.push(num_updated);
    delta.push(0);
    delta.extend(deleted.iter().map(|&key| key as i32));
    delta.extend_from_slice(&body);
    Ok(delta)
}

/// Reconstruct the snapshot a delta was created for. An empty delta yields
/// the baseline unchanged.
pub fn apply_delta(
    from: &Snapshot,
    delta: &[i32],
    schema: &ItemSchema,
) -> Result<Snapshot, DeltaError> {
    if delta.is_empty() {
        return Ok(from.clone());
    }
    if delta.len() < HEADER_WORDS {
        return Err(DeltaError::Truncated);
    }
    let num_deleted = usize::try_from(delta[0]).map_err(|_| DeltaError::InvalidHeader)?;
    let num_updated = usize::try_from(delta[1]).map_err(|_| DeltaError::InvalidHeader)?;
    if delta[2] != 0 {
        return Err(DeltaError::InvalidHeader);
    }

    let mut cursor = Cursor {
        words: delta,
        pos: HEADER_WORDS,
    };

    let deleted = cursor.take(num_deleted)?;
    let mut items: FxHashMap<ItemKey, (u16, u16, Vec<i32>)> = from
        .items()
        .iter()
        .filter(|item| !deleted.contains(&(item.key() as i32)))
        .map(|item| (item.key(), (item.type_id, item.id, item.data.clone())))
        .collect();

    for _ in 0..num_updated {
        let type_id = cursor.next()?;
        let type_id = u16::try_from(type_id).map_err(|_| DeltaError::InvalidType(type_id))?;
        let id = cursor.next()?;
        let id = u16::try_from(id).map_err(|_| DeltaError::InvalidType(id))?;
        let size = match schema.static_size(type_id) {
            Some(size) => size,
            None => {
                let size = cursor.next()?;
                usize::try_from(size).map_err(|_| DeltaError::InvalidSize(size))?
            }
        };
        let diff = cursor.take(size)?;

        let key = item_key(type_id, id);
        let data = match from.find(key).filter(|base| base.data.len() == size) {
            Some(base) => diff
                .iter()
                .zip(&base.data)
                .map(|(&d, &old)| old.wrapping_add(d))
                .collect(),
            None => diff.to_vec(),
        };
        items.insert(key, (type_id, id, data));
    }

    if cursor.remaining() > 0 {
        return Err(DeltaError::TrailingData(cursor.remaining()));
    }

    let mut items: Vec<SnapItem> = items
        .into_values()
        .map(|(type_id, id, data)| SnapItem { type_id, id, data })
        .collect();
    items.sort_unstable_by_key(SnapItem::key);
    Ok(Snapshot::from_sorted_items(items))
}

struct Cursor<'a> {
    words: &'a [i32],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn next(&mut self) -> Result<i32, DeltaError> {
        let word = *self.words.get(self.pos).ok_or(DeltaError::Truncated)?;
        self.pos += 1;
        Ok(word)
    }

    fn take(&mut self, count: usize) -> Result<&'a [i32], DeltaError> {
        let end = self.pos.checked_add(count).ok_or(DeltaError::Truncated)?;
        let slice = self.words.get(self.pos..end).ok_or(DeltaError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn remaining(&self) -> usize {
        self.words.len() - self.pos
    }
}
