//! Post-hoc aggregation of allocation streams.
//!
//! Two analytical views share one live-heap engine:
//!
//! * [`HighWaterAggregator`] answers "who owned the heap at its peak, and
//!   who never freed" (with a temporal per-snapshot variant,
//!   [`TemporalHighWaterAggregator`]);
//! * [`LifetimeAggregator`] answers "when was each location's memory
//!   allocated and released", as snapshot-granular intervals.
//!
//! Snapshots are defined purely by `MEMORY_RECORD` boundaries in the
//! stream; the aggregators are oblivious to the sampler's actual rate.

mod high_water;
mod lifetime;
mod live;
mod ranges;

pub use high_water::{HighWaterAggregator, HighWaterReport, HighWaterRow, TemporalHighWaterAggregator, TemporalRow};
pub use lifetime::{LifetimeAggregator, LifetimeRow};
pub use ranges::{RangeMap, RemovedRange};

use crate::records::{AllocatorKind, NativeStackId, StackId, ThreadId};

/// Where an allocation came from: the tuple aggregators group by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct LocationKey {
    pub tid: ThreadId,
    pub stack: StackId,
    pub native_stack: NativeStackId,
    pub kind: AllocatorKind,
}

/// A run of snapshots, half-open: the payload holds for snapshots
/// `start_snapshot..end_snapshot`, and `end_snapshot == None` means it was
/// still present at stream end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Interval {
    pub start_snapshot: u32,
    pub end_snapshot: Option<u32>,
    pub n_allocations: u64,
    pub bytes: u64,
}

/// Dense interning of [`LocationKey`]s so the hot tables are keyed by a
/// small integer.
#[derive(Debug, Default)]
pub(crate) struct LocationTable {
    keys: Vec<LocationKey>,
    ids: ahash::AHashMap<LocationKey, u32>,
}

impl LocationTable {
    pub fn intern(&mut self, key: LocationKey) -> u32 {
        if let Some(&id) = self.ids.get(&key) {
            return id;
        }
        let id = u32::try_from(self.keys.len()).unwrap_or(u32::MAX);
        self.ids.insert(key, id);
        self.keys.push(key);
        id
    }

    pub fn key(&self, id: u32) -> LocationKey {
        self.keys[id as usize]
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}
