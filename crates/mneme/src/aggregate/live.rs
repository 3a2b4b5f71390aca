//! The live-heap engine shared by all aggregators.
//!
//! Tracks which addresses are live, with a caller-chosen metadata tag per
//! allocation, and turns every deallocation into explicit removals. Plain
//! allocations live in an open-addressed address table; range allocations
//! (`mmap`) live in an ordered interval map so a partial `munmap` splits
//! them correctly and reports the true overlap.
//!
//! Per the tracing contract, a free for an address that was never seen
//! allocated is dropped, not failed: hooks can observe frees of memory
//! allocated before tracking started. Such drops are tallied as anomalies.

use ahash::AHashMap;
use hashbrown::HashMap;
use smallvec::SmallVec;

use super::ranges::RangeMap;

/// One piece of memory leaving the live set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Removal<M> {
    pub meta: M,
    pub bytes: u64,
    /// `true` when this removal retires a whole allocation (the last byte
    /// of a mapping, or a plain free); per-location allocation counts
    /// decrement only then.
    pub completes_allocation: bool,
}

pub(crate) type Removals<M> = SmallVec<[Removal<M>; 2]>;

#[derive(Debug, Clone, Copy)]
struct RangeOrigin<M> {
    meta: M,
    serial: u64,
}

#[derive(Debug)]
pub(crate) struct LiveTable<M> {
    /// address -> (metadata, size) for non-range allocations.
    plain: HashMap<u64, (M, u64)>,
    /// Live mapped ranges.
    ranges: RangeMap<RangeOrigin<M>>,
    /// Bytes still live per original mapping.
    mapping_remaining: AHashMap<u64, u64>,
    next_serial: u64,
    current_bytes: u64,
    anomalies: u64,
}

impl<M: Copy> LiveTable<M> {
    pub fn new() -> Self {
        Self {
            plain: HashMap::new(),
            ranges: RangeMap::new(),
            mapping_remaining: AHashMap::new(),
            next_serial: 0,
            current_bytes: 0,
            anomalies: 0,
        }
    }

    /// Total live bytes (plain and mapped).
    pub fn current_bytes(&self) -> u64 {
        self.current_bytes
    }

    /// Live-range bytes only (the measure of the mapped interval union).
    pub fn range_bytes(&self) -> u64 {
        self.ranges.total_bytes()
    }

    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    /// Records a plain allocation. An address observed twice without an
    /// intervening free means the matching free predates the hooks; the
    /// stale entry is removed first and reported.
    pub fn allocate(&mut self, meta: M, address: u64, size: u64, removed: &mut Removals<M>) {
        if let Some((stale_meta, stale_size)) = self.plain.insert(address, (meta, size)) {
            self.current_bytes -= stale_size;
            self.anomalies += 1;
            removed.push(Removal {
                meta: stale_meta,
                bytes: stale_size,
                completes_allocation: true,
            });
        }
        self.current_bytes += size;
    }

    /// Records a free. Unknown addresses are dropped (and tallied).
    pub fn free(&mut self, address: u64, removed: &mut Removals<M>) {
        match self.plain.remove(&address) {
            Some((meta, size)) => {
                self.current_bytes -= size;
                removed.push(Removal {
                    meta,
                    bytes: size,
                    completes_allocation: true,
                });
            }
            None => self.anomalies += 1,
        }
    }

    /// Records an `mmap`. Any bytes already mapped in the window are
    /// displaced first (mapping over an existing region unmaps it).
    pub fn map_range(&mut self, meta: M, address: u64, len: u64, removed: &mut Removals<M>) {
        let serial = self.next_serial;
        self.next_serial += 1;
        let displaced = self.ranges.insert(address, len, RangeOrigin { meta, serial });
        for piece in displaced {
            self.retire_range_piece(piece.value, piece.len, removed);
        }
        self.mapping_remaining.insert(serial, len);
        self.current_bytes += len;
    }

    /// Records an `munmap`, splitting partially covered mappings. An
    /// unmap that overlaps nothing live is dropped (and tallied).
    pub fn unmap_range(&mut self, address: u64, len: u64, removed: &mut Removals<M>) {
        let pieces = self.ranges.remove(address, len);
        if pieces.is_empty() {
            self.anomalies += 1;
            return;
        }
        for piece in pieces {
            self.retire_range_piece(piece.value, piece.len, removed);
        }
    }

    fn retire_range_piece(&mut self, origin: RangeOrigin<M>, len: u64, removed: &mut Removals<M>) {
        self.current_bytes -= len;
        let remaining = self
            .mapping_remaining
            .get_mut(&origin.serial)
            .map(|remaining| {
                *remaining -= len;
                *remaining
            })
            .unwrap_or(0);
        let completes = remaining == 0;
        if completes {
            self.mapping_remaining.remove(&origin.serial);
        }
        removed.push(Removal {
            meta: origin.meta,
            bytes: len,
            completes_allocation: completes,
        });
    }

    /// Everything still live, for leak accounting: `(meta, bytes,
    /// counts_as_allocation)` per surviving piece.
    pub fn drain_live(self) -> Vec<Removal<M>> {
        let mut live = Vec::with_capacity(self.plain.len());
        for (_, (meta, size)) in &self.plain {
            live.push(Removal {
                meta: *meta,
                bytes: *size,
                completes_allocation: true,
            });
        }
        let mut seen_serials = ahash::AHashSet::new();
        for (_, len, origin) in self.ranges.iter() {
            // Count each surviving mapping once, however many pieces
            // remain of it.
            let first_piece = seen_serials.insert(origin.serial);
            live.push(Removal {
                meta: origin.meta,
                bytes: len,
                completes_allocation: first_piece,
            });
        }
        live
    }
}
