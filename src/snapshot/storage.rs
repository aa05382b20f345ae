//! Per-client history of recently sent snapshots
//!
//! Entries are appended in tick order, so purging old ticks pops from the
//! front.

use std::collections::VecDeque;
use std::time::Instant;

use super::Snapshot;
use crate::net::protocol::Tick;

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub tick: Tick,
    /// When the snapshot was built, for latency measurement on ack
    pub tagged_at: Instant,
    pub snapshot: Snapshot,
}

#[derive(Debug, Default)]
pub struct SnapshotStorage {
    entries: VecDeque<StoredSnapshot>,
}

impl SnapshotStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tick: Tick, tagged_at: Instant, snapshot: Snapshot) {
        self.entries.push_back(StoredSnapshot {
            tick,
            tagged_at,
            snapshot,
        });
    }

    pub fn get(&self, tick: Tick) -> Option<&StoredSnapshot> {
        self.entries.iter().rev().find(|entry| entry.tick == tick)
    }

    /// Remove every entry older than `tick`
    pub fn purge_until(&mut self, tick: Tick) {
        while self.entries.front().is_some_and(|entry| entry.tick < tick) {
            self.entries.pop_front();
        }
    }

    pub fn purge_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
