//! Snapshot identifier pool
//!
//! Hands out small integer identifiers for simulation objects. A released
//! identifier is held back for a grace period before it can be handed out
//! again, so clients never see a fresh object under an identifier they still
//! associate with a destroyed one.
//!
//! Free identifiers live in an intrusive singly linked list threaded through
//! `next`; released identifiers sit in a FIFO ordered by release time.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::game::constants::snapshot::{ID_GRACE_SECONDS, MAX_IDS};

pub type SnapId = u16;

const NIL: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdState {
    Free,
    Allocated,
    Timed,
}

/// Errors from the identifier pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IdPoolError {
    /// Capacity invariant violated. The server cannot continue.
    #[error("snapshot identifier pool exhausted ({capacity} ids)")]
    Exhausted { capacity: usize },
    #[error("snapshot id {0} is not allocated")]
    NotAllocated(SnapId),
    #[error("snapshot id {0} is out of range")]
    OutOfRange(SnapId),
}

#[derive(Debug)]
pub struct SnapIdPool {
    next: Vec<u16>,
    state: Vec<IdState>,
    first_free: u16,
    timed: VecDeque<(SnapId, Instant)>,
    grace: Duration,
    in_use: usize,
}

impl SnapIdPool {
    pub fn new() -> Self {
        Self::with_capacity(MAX_IDS, Duration::from_secs(ID_GRACE_SECONDS))
    }

    pub fn with_capacity(capacity: usize, grace: Duration) -> Self {
        let capacity = capacity.min(NIL as usize);
        let mut pool = Self {
            next: vec![NIL; capacity],
            state: vec![IdState::Free; capacity],
            first_free: NIL,
            timed: VecDeque::new(),
            grace,
            in_use: 0,
        };
        pool.rebuild_free_list();
        pool
    }

    fn rebuild_free_list(&mut self) {
        let capacity = self.next.len();
        for idx in 0..capacity {
            self.next[idx] = if idx + 1 < capacity { (idx + 1) as u16 } else { NIL };
        }
        self.first_free = if capacity > 0 { 0 } else { NIL };
    }

    pub fn capacity(&self) -> usize {
        self.next.len()
    }

    /// Identifiers currently held by the simulation
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Identifiers waiting out their grace period
    pub fn pending(&self) -> usize {
        self.timed.len()
    }

    /// Identifiers that can be handed out right now
    pub fn available(&self) -> usize {
        self.capacity() - self.in_use - self.timed.len()
    }

    pub fn allocate(&mut self) -> Result<SnapId, IdPoolError> {
        self.allocate_at(Instant::now())
    }

    /// Allocate, first returning any identifier whose grace period ended
    /// strictly before `now` to the free list.
    pub fn allocate_at(&mut self, now: Instant) -> Result<SnapId, IdPoolError> {
        while let Some(&(id, released_until)) = self.timed.front() {
            if released_until >= now {
                break;
            }
            self.timed.pop_front();
            self.push_free(id);
        }

        let id = self.first_free;
        if id == NIL {
            return Err(IdPoolError::Exhausted {
                capacity: self.capacity(),
            });
        }
        self.first_free = self.next[id as usize];
        self.next[id as usize] = NIL;
        self.state[id as usize] = IdState::Allocated;
        self.in_use += 1;
        Ok(id)
    }

    pub fn release(&mut self, id: SnapId) -> Result<(), IdPoolError> {
        self.release_at(id, Instant::now())
    }

    pub fn release_at(&mut self, id: SnapId, now: Instant) -> Result<(), IdPoolError> {
        let idx = id as usize;
        if idx >= self.capacity() {
            return Err(IdPoolError::OutOfRange(id));
        }
        if self.state[idx] != IdState::Allocated {
            return Err(IdPoolError::NotAllocated(id));
        }
        self.state[idx] = IdState::Timed;
        self.in_use -= 1;
        self.timed.push_back((id, now + self.grace));
        Ok(())
    }

    /// Return every pending identifier to the free list immediately.
    /// Used on map change, when no client keeps stale associations.
    pub fn flush(&mut self) {
        while let Some((id, _)) = self.timed.pop_front() {
            self.push_free(id);
        }
    }

    fn push_free(&mut self, id: SnapId) {
        self.state[id as usize] = IdState::Free;
        self.next[id as usize] = self.first_free;
        self.first_free = id;
    }
}

impl Default for SnapIdPool {
    fn default() -> Self {
        Self::new()
    }
}
