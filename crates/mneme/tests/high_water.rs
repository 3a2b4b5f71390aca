//! High-water-mark aggregation over scripted event streams.

use mneme::{
    AllocatorKind, HighWaterAggregator, Interval, LocationKey, NativeStackId, StackId, TemporalHighWaterAggregator,
    ThreadId,
};
use pretty_assertions::assert_eq;

fn location(tid: u64, stack: u32, native: u32, kind: AllocatorKind) -> LocationKey {
    LocationKey {
        tid: ThreadId(tid),
        stack: StackId::from_raw(stack),
        native_stack: NativeStackId::from_raw(native),
        kind,
    }
}

#[test]
fn calloc_then_free_peaks_without_leaking() {
    // One calloc of 1234 bytes at 0x1000, then its free.
    let mut aggregator = HighWaterAggregator::new();
    let site = location(1, 5, 4, AllocatorKind::Calloc);
    aggregator.add(site, 0x1000, 1234);
    aggregator.add(location(1, 5, 4, AllocatorKind::Free), 0x1000, 0);
    let report = aggregator.finish();

    assert_eq!(report.high_water_bytes, 1234);
    assert_eq!(report.rows.len(), 1);
    let row = &report.rows[0];
    assert_eq!(row.location, site);
    assert_eq!(row.n_allocations_in_high_water_mark, 1);
    assert_eq!(row.bytes_in_high_water_mark, 1234);
    assert_eq!(row.n_allocations_leaked, 0);
    assert_eq!(row.bytes_leaked, 0);
}

#[test]
fn unfreed_calloc_leaks() {
    let mut aggregator = HighWaterAggregator::new();
    let site = location(1, 5, 4, AllocatorKind::Calloc);
    aggregator.add(site, 0x1000, 1234);
    let report = aggregator.finish();

    let row = &report.rows[0];
    assert_eq!(row.bytes_in_high_water_mark, 1234);
    assert_eq!(row.n_allocations_leaked, 1);
    assert_eq!(row.bytes_leaked, 1234);
}

#[test]
fn partial_munmap_splits_the_mapping() {
    // mmap 1234 bytes at 0x1000, then unmap 100 bytes in the middle.
    let mut aggregator = HighWaterAggregator::new();
    let site = location(1, 7, 0, AllocatorKind::Mmap);
    aggregator.add(site, 0x1000, 1234);
    aggregator.add_snapshot_boundary();
    aggregator.add(location(1, 7, 0, AllocatorKind::Munmap), 0x1000 + 1000, 100);

    assert_eq!(aggregator.live_range_bytes(), 1134);
    let report = aggregator.finish();
    let row = &report.rows[0];
    assert_eq!(row.bytes_in_high_water_mark, 1234);
    assert_eq!(row.n_allocations_in_high_water_mark, 1);
    assert_eq!(row.bytes_leaked, 1134);
    assert_eq!(row.n_allocations_leaked, 1);
}

#[test]
fn address_reuse_keeps_peak_attribution() {
    // A and B allocate; B frees and reallocates a smaller block at the
    // same address. The peak was after the first two allocations.
    let size_a = 4096;
    let size_b = 2048;
    let new_size_b = 1024;
    let loc_a = location(1, 1, 0, AllocatorKind::Calloc);
    let loc_b = location(1, 2, 0, AllocatorKind::Calloc);

    let mut aggregator = HighWaterAggregator::new();
    aggregator.add(loc_a, 4096, size_a);
    aggregator.add(loc_b, 8192, size_b);
    aggregator.add(location(1, 2, 0, AllocatorKind::Free), 8192, 0);
    aggregator.add(loc_b, 8192, new_size_b);
    let report = aggregator.finish();

    assert_eq!(report.high_water_bytes, size_a + size_b);
    let row_a = report.rows.iter().find(|row| row.location == loc_a).unwrap();
    assert_eq!(
        (row_a.n_allocations_in_high_water_mark, row_a.bytes_in_high_water_mark),
        (1, size_a)
    );
    assert_eq!((row_a.n_allocations_leaked, row_a.bytes_leaked), (1, size_a));
    let row_b = report.rows.iter().find(|row| row.location == loc_b).unwrap();
    assert_eq!(
        (row_b.n_allocations_in_high_water_mark, row_b.bytes_in_high_water_mark),
        (1, size_b)
    );
    assert_eq!((row_b.n_allocations_leaked, row_b.bytes_leaked), (1, new_size_b));
}

#[test]
fn free_of_unknown_address_is_dropped_and_tallied() {
    let mut aggregator = HighWaterAggregator::new();
    aggregator.add(location(1, 1, 0, AllocatorKind::Free), 0xdead, 0);
    aggregator.add(location(1, 1, 0, AllocatorKind::Malloc), 0x1000, 10);
    let report = aggregator.finish();
    assert_eq!(report.anomalies, 1);
    assert_eq!(report.high_water_bytes, 10);
}

#[test]
fn peak_is_frozen_at_its_earliest_attainment() {
    // The maximum (300 bytes) is reached twice with different owners; the
    // first attainment wins.
    let loc_a = location(1, 1, 0, AllocatorKind::Malloc);
    let loc_b = location(1, 2, 0, AllocatorKind::Malloc);
    let mut aggregator = HighWaterAggregator::new();
    aggregator.add(loc_a, 0x1, 300);
    aggregator.add(location(1, 1, 0, AllocatorKind::Free), 0x1, 0);
    aggregator.add(loc_b, 0x2, 300);
    let report = aggregator.finish();

    let row_a = report.rows.iter().find(|row| row.location == loc_a).unwrap();
    let row_b = report.rows.iter().find(|row| row.location == loc_b).unwrap();
    assert_eq!(row_a.bytes_in_high_water_mark, 300);
    assert_eq!(row_b.bytes_in_high_water_mark, 0);
    assert_eq!(row_b.bytes_leaked, 300);
}

/// Brute-force recomputation of the high-water mark for a scripted event
/// sequence, checked against the streaming aggregator.
#[test]
fn peak_bytes_equal_maximum_live_sum() {
    // Deterministic pseudo-random event script.
    let mut seed = 0x2545_f491_4f6c_dd1du64;
    let mut rng = move || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };

    let mut live: Vec<(u64, u64)> = Vec::new();
    let mut current = 0u64;
    let mut max_live = 0u64;
    let mut aggregator = HighWaterAggregator::new();
    for step in 0..2000u64 {
        let roll = rng();
        if roll % 3 != 0 || live.is_empty() {
            let address = 0x10_0000 + step * 16;
            let size = roll % 4096 + 1;
            let stack = u32::try_from(roll % 7).unwrap();
            aggregator.add(location(1, stack, 0, AllocatorKind::Malloc), address, size);
            live.push((address, size));
            current += size;
            max_live = max_live.max(current);
        } else {
            let index = (roll as usize / 7) % live.len();
            let (address, size) = live.swap_remove(index);
            aggregator.add(location(1, 0, 0, AllocatorKind::Free), address, 0);
            current -= size;
        }
    }

    let report = aggregator.finish();
    assert_eq!(report.high_water_bytes, max_live);
    let peak_sum: u64 = report.rows.iter().map(|row| row.bytes_in_high_water_mark).sum();
    assert_eq!(peak_sum, max_live);
    let leaked_sum: u64 = report.rows.iter().map(|row| row.bytes_leaked).sum();
    assert_eq!(leaked_sum, current);
}

#[test]
fn aggregation_is_deterministic_across_runs() {
    let script = |aggregator: &mut HighWaterAggregator| {
        aggregator.add(location(1, 1, 0, AllocatorKind::Malloc), 0x1000, 100);
        aggregator.add(location(2, 2, 0, AllocatorKind::Mmap), 0x2000, 4096);
        aggregator.add_snapshot_boundary();
        aggregator.add(location(2, 2, 0, AllocatorKind::Munmap), 0x2800, 1024);
        aggregator.add(location(1, 1, 0, AllocatorKind::Free), 0x1000, 0);
    };
    let mut first = HighWaterAggregator::new();
    script(&mut first);
    let mut second = HighWaterAggregator::new();
    script(&mut second);
    assert_eq!(first.finish(), second.finish());
}

#[test]
fn temporal_intervals_track_per_window_contributions() {
    // Window 0: A allocates. Window 1: B allocates, then A frees (the
    // window peak holds both). Window 2: only B remains.
    let loc_a = location(1, 1, 0, AllocatorKind::Malloc);
    let loc_b = location(1, 2, 0, AllocatorKind::Malloc);
    let mut aggregator = TemporalHighWaterAggregator::new();
    aggregator.add(loc_a, 0x1000, 100);
    aggregator.add_snapshot_boundary();
    aggregator.add(loc_b, 0x2000, 200);
    aggregator.add(location(1, 1, 0, AllocatorKind::Free), 0x1000, 0);
    aggregator.add_snapshot_boundary();
    let rows = aggregator.finish();

    let row_a = rows.iter().find(|row| row.location == loc_a).unwrap();
    assert_eq!(
        row_a.intervals,
        vec![Interval {
            start_snapshot: 0,
            end_snapshot: Some(2),
            n_allocations: 1,
            bytes: 100,
        }]
    );
    let row_b = rows.iter().find(|row| row.location == loc_b).unwrap();
    assert_eq!(
        row_b.intervals,
        vec![Interval {
            start_snapshot: 1,
            end_snapshot: None,
            n_allocations: 1,
            bytes: 200,
        }]
    );
}

#[test]
fn temporal_carried_memory_counts_in_quiet_windows() {
    // An allocation in window 0 and no further events: the carried bytes
    // are part of every later window's high-water mark.
    let site = location(1, 1, 0, AllocatorKind::Malloc);
    let mut aggregator = TemporalHighWaterAggregator::new();
    aggregator.add(site, 0x1000, 64);
    aggregator.add_snapshot_boundary();
    aggregator.add_snapshot_boundary();
    let rows = aggregator.finish();

    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].intervals,
        vec![Interval {
            start_snapshot: 0,
            end_snapshot: None,
            n_allocations: 1,
            bytes: 64,
        }]
    );
}
