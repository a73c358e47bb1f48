//! Per-routine statistics registry.
//!
//! Routines are recorded as the engine discovers them. Identity (name, image,
//! address) is copied out of the engine's routine handle at discovery time,
//! because the handle dies with its image.
//!
//! Discoveries are not deduplicated: if the engine instruments the same code
//! twice (e.g. an image unloaded and loaded again), each discovery gets its own
//! record and its own report row.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::host::Routine;

/// Final path component of `path` (text after the last `/`).
pub fn strip_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Counter shared by every thread running the same routine.
///
/// The increment is a plain relaxed load followed by a relaxed store, with no
/// read-modify-write instruction and no lock: concurrent callers of the same
/// routine may lose updates. Counts are exact for single-threaded routines
/// and approximate under contention, in exchange for near-zero probe cost.
#[derive(Debug, Default)]
pub struct RelaxedCounter(AtomicU64);

impl RelaxedCounter {
    #[inline(always)]
    pub fn bump(&self) {
        let v = self.0.load(Ordering::Relaxed);
        self.0.store(v.wrapping_add(1), Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Statistics for one discovered routine.
#[derive(Debug)]
pub struct RoutineStat {
    pub name: String,
    /// Image file name, directory stripped
    pub image: String,
    pub address: u64,
    pub calls: RelaxedCounter,
    pub instructions: RelaxedCounter,
}

impl RoutineStat {
    /// Snapshot the identity of `rtn`.
    pub fn capture(rtn: &Routine) -> Self {
        RoutineStat {
            name: rtn.name.clone(),
            image: strip_path(&rtn.image).to_owned(),
            address: rtn.address,
            calls: RelaxedCounter::default(),
            instructions: RelaxedCounter::default(),
        }
    }
}

/// Append-only catalogue of routine records.
#[derive(Default)]
pub struct RoutineRegistry {
    records: Mutex<Vec<Arc<RoutineStat>>>,
}

impl RoutineRegistry {
    pub fn new() -> Self { Self::default() }

    /// Record a newly discovered routine and return its shared record.
    pub fn discover(&self, rtn: &Routine) -> Arc<RoutineStat> {
        let stat = Arc::new(RoutineStat::capture(rtn));
        self.records.lock().push(stat.clone());
        stat
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records, most recently discovered first.
    pub fn recent_first(&self) -> Vec<Arc<RoutineStat>> {
        self.records.lock().iter().rev().cloned().collect()
    }
}
