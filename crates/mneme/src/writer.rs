//! The recorder: turns events into records and feeds the sink.
//!
//! One `TraceWriter` exists per capture. All threads funnel through the
//! inner mutex; the critical sections are bounded (encode into a buffer,
//! occasionally hand the buffer to the sink) and never call back into user
//! code or the host allocator. Per-thread ordering is preserved because
//! each event is encoded under the lock in arrival order; cross-thread
//! order is whatever interleaving the lock produces, with a
//! `CONTEXT_SWITCH` record emitted whenever the writing thread changes.

use std::{
    io,
    sync::{Mutex, MutexGuard},
};

use ahash::AHashMap;

use crate::{
    aggregate::{HighWaterAggregator, LocationKey},
    interner::{CodeInterner, NativeStackInterner},
    records::{
        AggregatedAllocationRecord, AllocationRecord, CaptureHeader, CodeDescriptor, CodeId, FRAME_POP_BATCH,
        FileFormat, ImageMap, MemorySnapshot, NativeStackId, Record, ShadowFrame, StackId, ThreadId,
    },
    sink::RecordSink,
    stack_tree::StackTree,
    wire,
};

/// Records are batched in memory and pushed to the sink in chunks of this
/// size, on snapshot boundaries, and on teardown.
const FLUSH_THRESHOLD: usize = 64 * 1024;

pub(crate) struct TraceWriter {
    code_interner: CodeInterner,
    native_interner: NativeStackInterner,
    inner: Mutex<WriterInner>,
}

struct WriterInner {
    sink: Box<dyn RecordSink>,
    header: CaptureHeader,
    buffer: Vec<u8>,
    scratch: Vec<u8>,
    last_tid: Option<ThreadId>,
    /// Name the host last assigned per thread.
    pending_names: AHashMap<ThreadId, String>,
    /// Name last written to the stream per thread.
    announced_names: AHashMap<ThreadId, String>,
    n_allocations: u64,
    n_frames: u64,
    aggregate: Option<AggregateState>,
    finished: bool,
}

/// Extra state carried only for `AGGREGATED_ALLOCATIONS` captures: the
/// writer replays its own frame records through a stack tree (mirroring
/// what any reader will do) and feeds the high-water-mark aggregator
/// instead of emitting per-event `ALLOCATION` records.
struct AggregateState {
    tree: StackTree,
    thread_nodes: AHashMap<ThreadId, StackId>,
    aggregator: HighWaterAggregator,
}

impl TraceWriter {
    pub fn new(mut sink: Box<dyn RecordSink>, header: CaptureHeader) -> io::Result<Self> {
        sink.write_header(&wire::encode_header(&header))?;
        let aggregate = match header.file_format {
            FileFormat::AllAllocations => None,
            FileFormat::AggregatedAllocations => Some(AggregateState {
                tree: StackTree::new(),
                thread_nodes: AHashMap::new(),
                aggregator: HighWaterAggregator::new(),
            }),
        };
        Ok(Self {
            code_interner: CodeInterner::new(),
            native_interner: NativeStackInterner::new(),
            inner: Mutex::new(WriterInner {
                sink,
                header,
                buffer: Vec::with_capacity(FLUSH_THRESHOLD + 1024),
                scratch: Vec::with_capacity(256),
                last_tid: None,
                pending_names: AHashMap::new(),
                announced_names: AHashMap::new(),
                n_allocations: 0,
                n_frames: 0,
                aggregate,
                finished: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, WriterInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Interns a code object, writing its `CODE_OBJECT` record on first
    /// sight. Lock order is interner, then writer; nothing ever takes them
    /// the other way around.
    pub fn intern_code(&self, descriptor: &CodeDescriptor) -> io::Result<CodeId> {
        self.code_interner.intern(descriptor, |id, descriptor| {
            let mut inner = self.lock();
            inner.append_record(&Record::CodeObject {
                id,
                descriptor: descriptor.clone(),
            })
        })
    }

    /// Interns a native stack (innermost first), writing one
    /// `NATIVE_FRAME_ID` record per new trie node.
    pub fn intern_native_stack(&self, ips_innermost_first: &[u64]) -> io::Result<NativeStackId> {
        self.native_interner.intern(ips_innermost_first, |ip, parent| {
            let mut inner = self.lock();
            inner.append_record(&Record::NativeFrame(crate::records::NativeFrameRecord { ip, parent }))
        })
    }

    /// Latest host-assigned name for a thread. Written to the stream the
    /// next time that thread emits a record (once per name change).
    pub fn set_thread_name(&self, tid: ThreadId, name: &str) {
        let mut inner = self.lock();
        inner.pending_names.insert(tid, name.to_owned());
    }

    /// Writes a thread's coalesced pops followed by frame pushes.
    pub fn write_frames(&self, tid: ThreadId, pops: u32, pushes: &[ShadowFrame]) -> io::Result<()> {
        if pops == 0 && pushes.is_empty() {
            return Ok(());
        }
        let mut inner = self.lock();
        inner.ensure_thread(tid)?;
        inner.write_pops(tid, pops)?;
        for &frame in pushes {
            inner.append_record(&Record::FramePush(frame))?;
            inner.n_frames += 1;
            if let Some(aggregate) = inner.aggregate.as_mut() {
                let node = aggregate.thread_nodes.get(&tid).copied().unwrap_or(StackId::EMPTY);
                let child = aggregate.tree.child(node, frame);
                aggregate.thread_nodes.insert(tid, child);
            }
        }
        Ok(())
    }

    /// Writes one allocation event, preceded by the thread's pending pops.
    /// For aggregated captures the event is folded into the in-process
    /// aggregation instead of hitting the wire.
    pub fn write_allocation(&self, tid: ThreadId, pops: u32, allocation: AllocationRecord) -> io::Result<()> {
        let mut inner = self.lock();
        inner.ensure_thread(tid)?;
        inner.write_pops(tid, pops)?;
        inner.n_allocations += 1;
        if let Some(aggregate) = inner.aggregate.as_mut() {
            let stack = aggregate.thread_nodes.get(&tid).copied().unwrap_or(StackId::EMPTY);
            let location = LocationKey {
                tid,
                stack,
                native_stack: allocation.native_stack,
                kind: allocation.kind,
            };
            aggregate.aggregator.add(location, allocation.address, allocation.size);
            Ok(())
        } else {
            inner.append_record(&Record::Allocation(allocation))
        }
    }

    /// Writes a periodic memory snapshot and flushes the batch buffer, so
    /// snapshots are also durability points.
    pub fn write_memory_snapshot(&self, snapshot: MemorySnapshot) -> io::Result<()> {
        let mut inner = self.lock();
        inner.append_record(&Record::MemoryRecord(snapshot))?;
        inner.flush_buffer()?;
        inner.sink.flush()
    }

    /// Pushes everything batched so far towards the backing store.
    pub fn flush(&self) -> io::Result<()> {
        let mut inner = self.lock();
        inner.flush_buffer()?;
        inner.sink.flush()
    }

    /// Finishes the capture: drains aggregated rows, writes the memory-map
    /// section and the trailer, finalizes the sink, and patches the header
    /// counts in place. Returns `(n_allocations, n_frames)`.
    pub fn close(&self, end_time_ms: u64, memory_maps: &[ImageMap]) -> io::Result<(u64, u64)> {
        let mut inner = self.lock();
        if inner.finished {
            return Ok((inner.n_allocations, inner.n_frames));
        }

        if let Some(aggregate) = inner.aggregate.take() {
            let report = aggregate.aggregator.finish();
            for row in report.rows {
                inner.append_record(&Record::AggregatedAllocation(AggregatedAllocationRecord {
                    tid: row.location.tid,
                    stack: row.location.stack,
                    native_stack: row.location.native_stack,
                    kind: row.location.kind,
                    n_allocations_in_high_water_mark: row.n_allocations_in_high_water_mark,
                    bytes_in_high_water_mark: row.bytes_in_high_water_mark,
                    n_allocations_leaked: row.n_allocations_leaked,
                    bytes_leaked: row.bytes_leaked,
                }))?;
            }
        }

        if !memory_maps.is_empty() {
            inner.append_record(&Record::MemoryMapStart)?;
            for image in memory_maps {
                inner.append_record(&Record::SegmentHeader {
                    filename: image.filename.clone(),
                    base_addr: image.base_addr,
                    n_segments: image.segments.len() as u64,
                })?;
                for &(vaddr, memsz) in &image.segments {
                    inner.append_record(&Record::Segment { vaddr, memsz })?;
                }
            }
        }

        inner.append_record(&Record::Trailer)?;
        inner.flush_buffer()?;
        inner.sink.finalize()?;

        inner.header.n_allocations = inner.n_allocations;
        inner.header.n_frames = inner.n_frames;
        inner.header.end_time_ms = end_time_ms;
        let patched = wire::encode_header(&inner.header);
        match inner.sink.patch_header(&patched) {
            Ok(()) => {}
            // A sink that cannot rewrite (socket-like) keeps its open-time
            // header; the capture is still complete.
            Err(err) if err.kind() == io::ErrorKind::Unsupported => {}
            Err(err) => return Err(err),
        }
        inner.finished = true;
        Ok((inner.n_allocations, inner.n_frames))
    }

}

impl WriterInner {
    fn append_record(&mut self, record: &Record) -> io::Result<()> {
        let Self { buffer, scratch, .. } = self;
        wire::write_record(buffer, record, scratch)?;
        if self.buffer.len() >= FLUSH_THRESHOLD {
            self.flush_buffer()?;
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.sink.append(&self.buffer)?;
        self.buffer.clear();
        Ok(())
    }

    /// Emits `CONTEXT_SWITCH` when the writing thread changes and the
    /// thread's name when it changed since last written.
    fn ensure_thread(&mut self, tid: ThreadId) -> io::Result<()> {
        if self.last_tid != Some(tid) {
            self.append_record(&Record::ContextSwitch(tid))?;
            self.last_tid = Some(tid);
        }
        let pending = self.pending_names.get(&tid).cloned();
        if let Some(name) = pending {
            if self.announced_names.get(&tid).map(String::as_str) != Some(name.as_str()) {
                self.append_record(&Record::ThreadName(name.clone()))?;
                self.announced_names.insert(tid, name);
            }
        }
        Ok(())
    }

    /// Emits a coalesced pop run as chained `FRAME_POP` records, at most
    /// [`FRAME_POP_BATCH`] per record.
    fn write_pops(&mut self, tid: ThreadId, mut pops: u32) -> io::Result<()> {
        while pops > 0 {
            let count = pops.min(u32::from(FRAME_POP_BATCH)) as u8;
            self.append_record(&Record::FramePop { count })?;
            pops -= u32::from(count);
            if let Some(aggregate) = self.aggregate.as_mut() {
                let mut node = aggregate.thread_nodes.get(&tid).copied().unwrap_or(StackId::EMPTY);
                for _ in 0..count {
                    node = aggregate.tree.parent(node).unwrap_or(StackId::EMPTY);
                }
                aggregate.thread_nodes.insert(tid, node);
            }
        }
        Ok(())
    }
}
