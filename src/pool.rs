//! Fixed-capacity record arena.
//!
//! A [`RecordPool`] owns a slot array plus an index permutation over it. The
//! permutation is kept as a ring: the busy records are the `busy` indices
//! starting at `head`, in insertion order, and the remaining indices are free.
//! Compaction and eviction only move `head`, so record payloads are never
//! shifted and their buffers survive for reuse.

use tracing::{debug, warn};

use crate::error::CapacityError;
use crate::model::RecordKind;

/// Initial number of slots in a pool.
pub const DEFAULT_INITIAL_CAPACITY: usize = 500;

/// Hard ceiling a pool may grow to before it starts dropping old records.
pub const DEFAULT_CAPACITY_CEILING: usize = 10_000;

/// Records that can live in a pool slot and be recycled.
pub trait PoolRecord: Default {
    /// Reset the record for reuse without releasing its buffers.
    fn clear(&mut self);
}

/// Statistics about pool operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of slots handed out
    pub allocated: u64,

    /// Records dropped because the pool was at its ceiling
    pub evicted: u64,

    /// Records released after a successful send
    pub compacted: u64,

    /// Number of times the backing arrays doubled
    pub grown: u64,
}

/// Arena of reusable records of one kind.
#[derive(Debug)]
pub struct RecordPool<T> {
    kind: RecordKind,
    slots: Vec<T>,
    /// Permutation of `0..slots.len()`
    indices: Vec<usize>,
    head: usize,
    busy: usize,
    /// Busy records (from the front) that belong to a batch currently being sent
    in_flight: usize,
    ceiling: usize,
    stats: PoolStats,
}

impl<T: PoolRecord> RecordPool<T> {
    /// Create a pool with the default capacity and ceiling.
    pub fn new(kind: RecordKind) -> Self {
        Self::with_capacity(kind, DEFAULT_INITIAL_CAPACITY, DEFAULT_CAPACITY_CEILING)
    }

    /// Create a pool with `capacity` slots that may double up to `ceiling`.
    pub fn with_capacity(kind: RecordKind, capacity: usize, ceiling: usize) -> Self {
        let capacity = capacity.max(1);
        let ceiling = ceiling.max(capacity);

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, T::default);

        Self {
            kind,
            slots,
            indices: (0..capacity).collect(),
            head: 0,
            busy: 0,
            in_flight: 0,
            ceiling,
            stats: PoolStats::default(),
        }
    }

    /// Claim a slot at the end of the busy region and return it cleared.
    ///
    /// Never fails: a full pool doubles while it stays within its ceiling,
    /// otherwise the oldest busy record is dropped to make room.
    pub fn allocate(&mut self) -> &mut T {
        if self.busy == self.slots.len() {
            if self.slots.len() * 2 <= self.ceiling {
                self.grow();
            } else {
                self.evict_oldest();
            }
        }

        let pos = self.physical(self.busy);
        self.busy += 1;
        self.stats.allocated += 1;

        let slot = &mut self.slots[self.indices[pos]];
        slot.clear();
        slot
    }

    /// Release the logically first `n` busy records, keeping the order of the rest.
    pub fn compact(&mut self, n: usize) {
        let n = n.min(self.busy);
        if n == 0 {
            return;
        }

        self.head = (self.head + n) % self.slots.len();
        self.busy -= n;
        self.in_flight = self.in_flight.saturating_sub(n);
        self.stats.compacted += n as u64;
    }

    /// Busy records in insertion order.
    pub fn snapshot_view(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.busy).map(move |i| &self.slots[self.indices[self.physical(i)]])
    }

    /// Apply `f` to every busy record in insertion order.
    pub fn for_each_busy_mut(&mut self, mut f: impl FnMut(&mut T)) {
        for i in 0..self.busy {
            let idx = self.indices[self.physical(i)];
            f(&mut self.slots[idx]);
        }
    }

    /// Busy record at logical position `i`.
    pub fn get(&self, i: usize) -> Option<&T> {
        (i < self.busy).then(|| &self.slots[self.indices[self.physical(i)]])
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut T> {
        if i < self.busy {
            let idx = self.indices[self.physical(i)];
            Some(&mut self.slots[idx])
        } else {
            None
        }
    }

    /// Most recently allocated busy record.
    pub fn last_mut(&mut self) -> Option<&mut T> {
        self.busy.checked_sub(1).and_then(|i| self.get_mut(i))
    }

    pub fn last(&self) -> Option<&T> {
        self.busy.checked_sub(1).and_then(|i| self.get(i))
    }

    /// Find a busy record that is not part of an in-flight batch.
    pub fn find_unsent_mut(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<&mut T> {
        let pos = (self.in_flight..self.busy).find(|&i| {
            let idx = self.indices[self.physical(i)];
            pred(&self.slots[idx])
        })?;
        self.get_mut(pos)
    }

    /// Append already-built records, e.g. ones restored from durable storage.
    pub fn extend_from(&mut self, records: impl IntoIterator<Item = T>) {
        for record in records {
            *self.allocate() = record;
        }
    }

    /// Mark every current busy record as part of a batch being sent.
    pub fn mark_in_flight(&mut self) -> usize {
        self.in_flight = self.busy;
        self.in_flight
    }

    /// Number of busy records still belonging to the in-flight batch.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Forget the in-flight batch without releasing anything.
    pub fn release_in_flight(&mut self) {
        self.in_flight = 0;
    }

    pub fn busy_count(&self) -> usize {
        self.busy
    }

    pub fn is_empty(&self) -> bool {
        self.busy == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Slot indices in permutation order, starting with the busy region.
    pub fn index_order(&self) -> Vec<usize> {
        (0..self.slots.len())
            .map(|i| self.indices[self.physical(i)])
            .collect()
    }

    fn physical(&self, logical: usize) -> usize {
        (self.head + logical) % self.slots.len()
    }

    fn grow(&mut self) {
        let old_len = self.slots.len();
        let new_len = old_len * 2;

        // Linearize the ring so the busy region sits at the front again.
        self.indices.rotate_left(self.head);
        self.head = 0;
        self.indices.extend(old_len..new_len);
        self.slots.resize_with(new_len, T::default);
        self.stats.grown += 1;

        debug!(
            kind = %self.kind,
            old_capacity = old_len,
            new_capacity = new_len,
            "Extending record pool"
        );
    }

    fn evict_oldest(&mut self) {
        self.head = (self.head + 1) % self.slots.len();
        self.busy -= 1;
        self.in_flight = self.in_flight.saturating_sub(1);
        self.stats.evicted += 1;

        let err = CapacityError {
            kind: self.kind,
            ceiling: self.ceiling,
        };
        warn!(
            error = %err,
            evicted_total = self.stats.evicted,
            "Record pool degraded: dropping oldest unsent record"
        );
    }
}
