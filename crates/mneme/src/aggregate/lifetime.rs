//! Allocation-lifetime aggregation: for each location, the snapshot
//! intervals during which its memory was live.
//!
//! Every allocation is stamped with the window (snapshot index) it was
//! made in; its free stamps the closing window. Allocations freed in the
//! window they were made in are churn, not residency, and are not
//! reported. Per location, overlapping closed intervals merge into one
//! summed row, and leaked allocations merge into a single open interval.

use ahash::AHashMap;

use super::{
    Interval, LocationKey, LocationTable,
    live::{LiveTable, Removals},
};

/// One location's lifetime intervals, sorted by start snapshot.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LifetimeRow {
    pub location: LocationKey,
    pub intervals: Vec<Interval>,
}

/// Metadata carried per live allocation: owning location and the window
/// it was allocated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Birth {
    location: u32,
    window: u32,
}

#[derive(Debug)]
pub struct LifetimeAggregator {
    locations: LocationTable,
    table: LiveTable<Birth>,
    /// (location, allocated window, freed window) -> (count, bytes).
    cohorts: AHashMap<(u32, u32, u32), (u64, u64)>,
    window: u32,
}

impl Default for LifetimeAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl LifetimeAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            locations: LocationTable::default(),
            table: LiveTable::new(),
            cohorts: AHashMap::new(),
            window: 0,
        }
    }

    pub fn add(&mut self, location: LocationKey, address: u64, size: u64) {
        let mut removed: Removals<Birth> = Removals::new();
        match location.kind {
            kind if kind.is_deallocator() => {
                if kind.is_range() {
                    self.table.unmap_range(address, size, &mut removed);
                } else {
                    self.table.free(address, &mut removed);
                }
            }
            kind => {
                let id = self.locations.intern(location);
                let birth = Birth {
                    location: id,
                    window: self.window,
                };
                if kind.is_range() {
                    self.table.map_range(birth, address, size, &mut removed);
                } else {
                    self.table.allocate(birth, address, size, &mut removed);
                }
            }
        }
        self.record_deaths(&removed);
    }

    /// A `MEMORY_RECORD` boundary: subsequent events belong to the next
    /// window.
    pub fn add_snapshot_boundary(&mut self) {
        self.window += 1;
    }

    #[must_use]
    pub fn finish(self) -> Vec<LifetimeRow> {
        let Self {
            locations,
            table,
            mut cohorts,
            window: _,
        } = self;

        // Whatever is still live leaks: an open cohort per location and
        // birth window, tagged with the reserved "no end" window.
        let mut leaks: AHashMap<(u32, u32), (u64, u64)> = AHashMap::new();
        for survivor in table.drain_live() {
            let entry = leaks.entry((survivor.meta.location, survivor.meta.window)).or_insert((0, 0));
            if survivor.completes_allocation {
                entry.0 += 1;
            }
            entry.1 += survivor.bytes;
        }

        let mut per_location: AHashMap<u32, (Vec<Interval>, Vec<Interval>)> = AHashMap::new();
        for ((location, start, end), (n, bytes)) in cohorts.drain() {
            per_location.entry(location).or_default().0.push(Interval {
                start_snapshot: start,
                end_snapshot: Some(end),
                n_allocations: n,
                bytes,
            });
        }
        for ((location, start), (n, bytes)) in leaks {
            per_location.entry(location).or_default().1.push(Interval {
                start_snapshot: start,
                end_snapshot: None,
                n_allocations: n,
                bytes,
            });
        }

        let mut rows: Vec<LifetimeRow> = per_location
            .into_iter()
            .map(|(id, (closed, open))| {
                let mut intervals = merge_closed(closed);
                if let Some(leaked) = merge_open(open) {
                    intervals.push(leaked);
                }
                intervals.sort_by_key(|interval| {
                    // Closed intervals first, open (leaked) ones last.
                    (interval.start_snapshot, interval.end_snapshot.is_none(), interval.end_snapshot)
                });
                LifetimeRow {
                    location: locations.key(id),
                    intervals,
                }
            })
            .collect();
        rows.sort_by_key(|row| row.intervals.first().map_or(0, |interval| interval.start_snapshot));
        rows
    }

    fn record_deaths(&mut self, removed: &Removals<Birth>) {
        for removal in removed {
            // Allocated and freed inside one window: never reported.
            if removal.meta.window == self.window {
                continue;
            }
            let entry = self
                .cohorts
                .entry((removal.meta.location, removal.meta.window, self.window))
                .or_insert((0, 0));
            if removal.completes_allocation {
                entry.0 += 1;
            }
            entry.1 += removal.bytes;
        }
    }
}

/// Merges overlapping half-open intervals (`[start, end)`), summing their
/// counts. Adjacent-but-disjoint intervals stay separate: a cohort freed
/// at a boundary and one allocated at it are different lifetimes.
fn merge_closed(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.sort_by_key(|interval| (interval.start_snapshot, interval.end_snapshot));
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            Some(last)
                if interval.start_snapshot < last.end_snapshot.unwrap_or(u32::MAX) =>
            {
                last.end_snapshot = last.end_snapshot.max(interval.end_snapshot);
                last.n_allocations += interval.n_allocations;
                last.bytes += interval.bytes;
            }
            _ => merged.push(interval),
        }
    }
    merged
}

/// All leaked cohorts of one location share "still alive at stream end";
/// they merge into a single open interval starting at the earliest birth.
fn merge_open(intervals: Vec<Interval>) -> Option<Interval> {
    intervals.into_iter().reduce(|mut acc, interval| {
        acc.start_snapshot = acc.start_snapshot.min(interval.start_snapshot);
        acc.n_allocations += interval.n_allocations;
        acc.bytes += interval.bytes;
        acc
    })
}
