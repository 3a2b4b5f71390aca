//! Streaming high-water-mark aggregation.
//!
//! The aggregator never rescans the live set. Each location keeps its own
//! live counters, and a "touched since the last peak" list makes a new
//! global maximum an O(touched) event: only locations that changed since
//! the previous peak can differ from their recorded peak values. The
//! comparison is strictly greater-than, so the recorded peak is always the
//! *earliest* moment the maximum was attained.

use super::{
    Interval, LocationKey, LocationTable,
    live::{LiveTable, Removals},
};

/// Peak and leak totals for one location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct HighWaterRow {
    pub location: LocationKey,
    pub n_allocations_in_high_water_mark: u64,
    pub bytes_in_high_water_mark: u64,
    pub n_allocations_leaked: u64,
    pub bytes_leaked: u64,
}

/// Result of a whole-stream high-water-mark aggregation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HighWaterReport {
    /// The global maximum of live bytes over the stream.
    pub high_water_bytes: u64,
    pub rows: Vec<HighWaterRow>,
    /// Events dropped for referencing memory the stream never allocated.
    pub anomalies: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct LocationStats {
    current_n: u64,
    current_bytes: u64,
    peak_n: u64,
    peak_bytes: u64,
    /// In the touched list, awaiting the next peak flush.
    dirty: bool,
}

/// Whole-stream peak-and-leak aggregation: the numbers behind the
/// `AGGREGATED_ALLOCATION` record and the flamegraph reporter.
#[derive(Debug)]
pub struct HighWaterAggregator {
    locations: LocationTable,
    stats: Vec<LocationStats>,
    table: LiveTable<u32>,
    touched: Vec<u32>,
    high_water_bytes: u64,
}

impl Default for HighWaterAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl HighWaterAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            locations: LocationTable::default(),
            stats: Vec::new(),
            table: LiveTable::new(),
            touched: Vec::new(),
            high_water_bytes: 0,
        }
    }

    /// Feeds one allocator event. For deallocators the location's stack
    /// fields are irrelevant: freed bytes are attributed to the location
    /// that allocated them.
    pub fn add(&mut self, location: LocationKey, address: u64, size: u64) {
        let mut removed: Removals<u32> = Removals::new();
        match location.kind {
            kind if kind.is_deallocator() => {
                if kind.is_range() {
                    self.table.unmap_range(address, size, &mut removed);
                } else {
                    self.table.free(address, &mut removed);
                }
            }
            kind => {
                let id = self.intern(location);
                if kind.is_range() {
                    self.table.map_range(id, address, size, &mut removed);
                } else {
                    self.table.allocate(id, address, size, &mut removed);
                }
                self.apply_removals(&removed);
                let stats = &mut self.stats[id as usize];
                stats.current_n += 1;
                stats.current_bytes += size;
                Self::touch(&mut self.touched, stats, id);
                self.maybe_new_peak();
                return;
            }
        }
        self.apply_removals(&removed);
    }

    /// Snapshot boundaries carry no information for the whole-stream view;
    /// accepted so callers can feed any event stream uniformly.
    pub fn add_snapshot_boundary(&mut self) {}

    /// Live-range bytes currently mapped (the union measure of `mmap`
    /// regions minus unmapped overlap).
    #[must_use]
    pub fn live_range_bytes(&self) -> u64 {
        self.table.range_bytes()
    }

    #[must_use]
    pub fn finish(self) -> HighWaterReport {
        let mut rows = Vec::with_capacity(self.locations.len());
        for (id, stats) in self.stats.iter().enumerate() {
            if stats.peak_n == 0 && stats.peak_bytes == 0 && stats.current_n == 0 && stats.current_bytes == 0 {
                continue;
            }
            rows.push(HighWaterRow {
                location: self.locations.key(u32::try_from(id).unwrap_or(u32::MAX)),
                n_allocations_in_high_water_mark: stats.peak_n,
                bytes_in_high_water_mark: stats.peak_bytes,
                n_allocations_leaked: stats.current_n,
                bytes_leaked: stats.current_bytes,
            });
        }
        HighWaterReport {
            high_water_bytes: self.high_water_bytes,
            rows,
            anomalies: self.table.anomalies(),
        }
    }

    fn intern(&mut self, location: LocationKey) -> u32 {
        let id = self.locations.intern(location);
        if self.stats.len() <= id as usize {
            self.stats.resize(id as usize + 1, LocationStats::default());
        }
        id
    }

    fn apply_removals(&mut self, removed: &Removals<u32>) {
        for removal in removed {
            let stats = &mut self.stats[removal.meta as usize];
            stats.current_bytes -= removal.bytes;
            if removal.completes_allocation {
                stats.current_n -= 1;
            }
            Self::touch(&mut self.touched, stats, removal.meta);
        }
    }

    fn touch(touched: &mut Vec<u32>, stats: &mut LocationStats, id: u32) {
        if !stats.dirty {
            stats.dirty = true;
            touched.push(id);
        }
    }

    fn maybe_new_peak(&mut self) {
        if self.table.current_bytes() <= self.high_water_bytes {
            return;
        }
        self.high_water_bytes = self.table.current_bytes();
        for id in self.touched.drain(..) {
            let stats = &mut self.stats[id as usize];
            stats.peak_n = stats.current_n;
            stats.peak_bytes = stats.current_bytes;
            stats.dirty = false;
        }
    }
}

/// One location's contribution to successive snapshot high-water marks.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TemporalRow {
    pub location: LocationKey,
    pub intervals: Vec<Interval>,
}

#[derive(Debug, Clone, Copy, Default)]
struct TemporalStats {
    current_n: u64,
    current_bytes: u64,
    /// Values at the moment of the current window's peak; valid when
    /// `peak_window` equals the current window.
    win_peak_n: u64,
    win_peak_bytes: u64,
    peak_window: u32,
    /// Values at the start of the window of first touch; valid when
    /// `touch_window` equals the current window.
    win_start_n: u64,
    win_start_bytes: u64,
    touch_window: u32,
    dirty: bool,
}

/// Sentinel for "never stamped": window indices start at 0.
const NO_WINDOW: u32 = u32::MAX;

#[derive(Debug, Default)]
struct OpenRun {
    start: u32,
    n: u64,
    bytes: u64,
}

/// Per-snapshot high-water-mark aggregation.
///
/// The stream divides into windows at `MEMORY_RECORD` boundaries. Each
/// window gets its own peak (its starting state counts: carried-over live
/// memory is part of the window's high-water mark even if no event touches
/// it), and per location, runs of windows with an identical peak
/// contribution compress into one [`Interval`].
#[derive(Debug)]
pub struct TemporalHighWaterAggregator {
    locations: LocationTable,
    stats: Vec<TemporalStats>,
    runs: Vec<(Option<OpenRun>, Vec<Interval>)>,
    table: LiveTable<u32>,
    touched: Vec<u32>,
    window: u32,
    window_peak_bytes: u64,
}

impl Default for TemporalHighWaterAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl TemporalHighWaterAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            locations: LocationTable::default(),
            stats: Vec::new(),
            runs: Vec::new(),
            table: LiveTable::new(),
            touched: Vec::new(),
            window: 0,
            window_peak_bytes: 0,
        }
    }

    pub fn add(&mut self, location: LocationKey, address: u64, size: u64) {
        let mut removed: Removals<u32> = Removals::new();
        match location.kind {
            kind if kind.is_deallocator() => {
                if kind.is_range() {
                    self.table.unmap_range(address, size, &mut removed);
                } else {
                    self.table.free(address, &mut removed);
                }
                self.apply_removals(&removed);
            }
            kind => {
                let id = self.intern(location);
                if kind.is_range() {
                    self.table.map_range(id, address, size, &mut removed);
                } else {
                    self.table.allocate(id, address, size, &mut removed);
                }
                self.apply_removals(&removed);
                self.stamp_touch(id);
                let stats = &mut self.stats[id as usize];
                stats.current_n += 1;
                stats.current_bytes += size;
                self.maybe_window_peak();
            }
        }
    }

    /// A `MEMORY_RECORD` boundary: closes the current window.
    pub fn add_snapshot_boundary(&mut self) {
        self.close_window();
        self.window += 1;
        self.window_peak_bytes = self.table.current_bytes();
    }

    #[must_use]
    pub fn finish(mut self) -> Vec<TemporalRow> {
        self.close_window();
        let mut rows = Vec::with_capacity(self.locations.len());
        for (id, (open, mut intervals)) in self.runs.into_iter().enumerate() {
            if let Some(run) = open {
                intervals.push(Interval {
                    start_snapshot: run.start,
                    end_snapshot: None,
                    n_allocations: run.n,
                    bytes: run.bytes,
                });
            }
            if intervals.is_empty() {
                continue;
            }
            rows.push(TemporalRow {
                location: self.locations.key(u32::try_from(id).unwrap_or(u32::MAX)),
                intervals,
            });
        }
        rows
    }

    fn intern(&mut self, location: LocationKey) -> u32 {
        let id = self.locations.intern(location);
        if self.stats.len() <= id as usize {
            self.stats.resize(
                id as usize + 1,
                TemporalStats {
                    peak_window: NO_WINDOW,
                    touch_window: NO_WINDOW,
                    ..TemporalStats::default()
                },
            );
            self.runs.resize_with(id as usize + 1, Default::default);
        }
        id
    }

    fn apply_removals(&mut self, removed: &Removals<u32>) {
        for removal in removed {
            self.stamp_touch(removal.meta);
            let stats = &mut self.stats[removal.meta as usize];
            stats.current_bytes -= removal.bytes;
            if removal.completes_allocation {
                stats.current_n -= 1;
            }
        }
    }

    /// First touch in a window preserves the window-start values: if no
    /// peak flush happens later, the window's high-water moment was its
    /// very beginning.
    fn stamp_touch(&mut self, id: u32) {
        let window = self.window;
        let stats = &mut self.stats[id as usize];
        if stats.touch_window != window {
            stats.touch_window = window;
            stats.win_start_n = stats.current_n;
            stats.win_start_bytes = stats.current_bytes;
        }
        if !stats.dirty {
            stats.dirty = true;
            self.touched.push(id);
        }
    }

    fn maybe_window_peak(&mut self) {
        if self.table.current_bytes() <= self.window_peak_bytes {
            return;
        }
        self.window_peak_bytes = self.table.current_bytes();
        let window = self.window;
        for id in self.touched.drain(..) {
            let stats = &mut self.stats[id as usize];
            stats.win_peak_n = stats.current_n;
            stats.win_peak_bytes = stats.current_bytes;
            stats.peak_window = window;
            stats.dirty = false;
        }
    }

    fn close_window(&mut self) {
        let window = self.window;
        for id in 0..self.stats.len() {
            let stats = self.stats[id];
            let (n, bytes) = if stats.peak_window == window {
                (stats.win_peak_n, stats.win_peak_bytes)
            } else if stats.touch_window == window {
                (stats.win_start_n, stats.win_start_bytes)
            } else {
                (stats.current_n, stats.current_bytes)
            };
            let (open, intervals) = &mut self.runs[id];
            match open {
                Some(run) if run.n == n && run.bytes == bytes => {}
                Some(run) => {
                    intervals.push(Interval {
                        start_snapshot: run.start,
                        end_snapshot: Some(window),
                        n_allocations: run.n,
                        bytes: run.bytes,
                    });
                    *open = (n > 0 || bytes > 0).then_some(OpenRun { start: window, n, bytes });
                }
                None => {
                    if n > 0 || bytes > 0 {
                        *open = Some(OpenRun { start: window, n, bytes });
                    }
                }
            }
        }
    }
}
