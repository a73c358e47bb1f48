//! Per-thread statistics storage.
//!
//! Each profiled thread gets a private [`ThreadStat`] record, bound when the
//! thread starts and read back once at program exit. Records are boxed and
//! wrapped in [`CachePadded`] so two threads never share a cache line.
//!
//! Increments need no synchronization beyond a `Relaxed` atomic add: only
//! the owning thread writes its record while the program runs, and the host
//! runs fini callbacks after every thread has stopped. The single lock here
//! protects the started-thread counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ProfileError, Result};
use crate::host::ThreadId;

/// Default number of thread slots, matching the engine's thread id ceiling.
pub const MAX_THREADS: usize = 2048;

/// Live counters of one thread.
#[derive(Debug, Default)]
pub struct ThreadStat {
    instructions: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    taken_branches: AtomicU64,
    predicated_ops: AtomicU64,
}

/// Point-in-time copy of a [`ThreadStat`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadCounts {
    pub instructions: u64,
    pub reads: u64,
    pub writes: u64,
    pub taken_branches: u64,
    pub predicated_ops: u64,
}

impl ThreadStat {
    pub fn new() -> Self { Self::default() }

    #[inline(always)]
    pub fn add_instructions(&self, n: u64) {
        self.instructions.fetch_add(n, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_taken_branch(&self) {
        self.taken_branches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_predicated_op(&self) {
        self.predicated_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ThreadCounts {
        ThreadCounts {
            instructions: self.instructions.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            taken_branches: self.taken_branches.load(Ordering::Relaxed),
            predicated_ops: self.predicated_ops.load(Ordering::Relaxed),
        }
    }
}

/// Fixed-capacity arena of per-thread records indexed by [`ThreadId`].
///
/// Binding takes the counter lock; lookups from analysis probes are lock-free.
pub struct ThreadStorage<T> {
    slots: Box<[OnceLock<Box<CachePadded<T>>>]>,
    started: Mutex<u32>,
}

impl<T> ThreadStorage<T> {
    pub fn new() -> Self {
        Self::with_capacity(MAX_THREADS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ThreadStorage {
            slots: (0..capacity).map(|_| OnceLock::new()).collect(),
            started: Mutex::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Count a started thread and bind `value` as its private record.
    pub fn bind(&self, tid: ThreadId, value: T) -> Result<&T> {
        let slot = self.slots.get(tid.index()).ok_or(ProfileError::ThreadCapacity {
            tid: tid.0,
            capacity: self.slots.len(),
        })?;
        let mut fresh = false;
        let record = slot.get_or_init(|| {
            fresh = true;
            Box::new(CachePadded::new(value))
        });
        if !fresh {
            return Err(ProfileError::ThreadRebound(tid.0));
        }
        *self.started.lock() += 1;
        Ok(&***record)
    }

    /// Record bound to `tid`, if any.
    #[inline(always)]
    pub fn get(&self, tid: ThreadId) -> Option<&T> {
        self.slots.get(tid.index())?.get().map(|b| &***b)
    }

    /// Number of threads that have started so far.
    pub fn started(&self) -> u32 {
        *self.started.lock()
    }

    /// Bound records in ascending thread index.
    pub fn iter(&self) -> impl Iterator<Item = (ThreadId, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.get().map(|b| (ThreadId(i as u32), &***b))
        })
    }
}

impl<T> Default for ThreadStorage<T> {
    fn default() -> Self { Self::new() }
}
