//! Replaying captures back into typed event streams.
//!
//! The reader is stateful: it rebuilds the code-object table, the native
//! frame chains, and every thread's stack exactly as the recorder emitted
//! them, so each allocation comes out annotated with a resolved stack id.
//!
//! Failure handling splits two ways. Structural violations (unknown tags,
//! bad payloads, pop underflows, dangling ids) are *errors*, reported with
//! the offending record's stream offset. Running out of bytes is not: a
//! capture without a trailer is the normal result of a process that died
//! with tracking installed, so every record that fully parsed is yielded
//! and the stream then reports [`CaptureOutcome::Truncated`].

use std::{
    fs::File,
    io::{self, BufReader, Cursor, Read},
    path::Path,
};

use ahash::AHashMap;
use flate2::read::ZlibDecoder;

use crate::{
    aggregate::{
        HighWaterAggregator, HighWaterReport, HighWaterRow, LifetimeAggregator, LifetimeRow, LocationKey,
        TemporalHighWaterAggregator, TemporalRow,
    },
    error::{CaptureOutcome, ReadError, ReadErrorKind},
    records::{
        AggregatedAllocationRecord, AllocatorKind, CaptureHeader, CodeDescriptor, FileFormat, ImageMap,
        MemorySnapshot, NativeFrameRecord, NativeStackId, Record, ShadowFrame, StackId, ThreadId,
    },
    stack_tree::StackTree,
    wire,
};

/// Records larger than this are treated as corruption rather than honored
/// with a matching buffer allocation.
const MAX_RECORD_LEN: u64 = 16 * 1024 * 1024;

/// First byte of every zlib stream with the deflate method; no record tag
/// shares it, so the body's compression is detected from this one byte.
const ZLIB_MAGIC: u8 = 0x78;

/// One allocation event with its attribution fully resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationEvent {
    pub tid: ThreadId,
    pub address: u64,
    pub size: u64,
    pub kind: AllocatorKind,
    pub stack: StackId,
    pub native_stack: NativeStackId,
}

impl AllocationEvent {
    /// The aggregation key of this event.
    #[must_use]
    pub fn location(&self) -> LocationKey {
        LocationKey {
            tid: self.tid,
            stack: self.stack,
            native_stack: self.native_stack,
            kind: self.kind,
        }
    }
}

/// The analysed view of a capture: allocator events interleaved with the
/// snapshot boundaries that structure them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackedEvent {
    Allocation(AllocationEvent),
    MemorySnapshot(MemorySnapshot),
    /// Pre-aggregated row (only in `AGGREGATED_ALLOCATIONS` captures).
    AggregatedAllocation(AggregatedAllocationRecord),
}

/// One resolved host frame, outermost first in a resolved stack.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ResolvedFrame {
    pub function_name: String,
    pub file_name: String,
    pub line: u32,
    pub is_entry: bool,
}

type Prefixed<R> = io::Chain<Cursor<Vec<u8>>, R>;

enum Body<R: Read> {
    Plain(Prefixed<R>),
    Compressed(Box<ZlibDecoder<Prefixed<R>>>),
}

impl<R: Read> Read for Body<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(reader) => reader.read(buf),
            Self::Compressed(reader) => reader.read(buf),
        }
    }
}

/// Streaming capture parser. See the module docs for the error contract.
pub struct CaptureReader<R: Read> {
    body: Body<R>,
    header: CaptureHeader,
    /// Logical offset of the next record: bytes into the file for plain
    /// captures, bytes of header plus decompressed body for compressed
    /// ones.
    offset: u64,
    code_table: AHashMap<u32, CodeDescriptor>,
    native_nodes: Vec<NativeFrameRecord>,
    stack_tree: StackTree,
    thread_nodes: AHashMap<ThreadId, StackId>,
    thread_names: AHashMap<ThreadId, String>,
    current_tid: Option<ThreadId>,
    memory_maps: Vec<ImageMap>,
    open_image: Option<(ImageMap, u64)>,
    outcome: Option<CaptureOutcome>,
    payload_buf: Vec<u8>,
}

impl CaptureReader<BufReader<File>> {
    /// Opens a capture file.
    pub fn open(path: &Path) -> Result<Self, ReadError> {
        let file = File::open(path).map_err(|err| ReadError::new(ReadErrorKind::Io(err), 0))?;
        Self::new(BufReader::new(file))
    }
}

impl CaptureReader<Cursor<Vec<u8>>> {
    /// Reads a capture from an in-memory byte buffer.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ReadError> {
        Self::new(Cursor::new(bytes))
    }
}

impl<R: Read> CaptureReader<R> {
    /// Parses the header and positions the reader at the first record.
    pub fn new(mut source: R) -> Result<Self, ReadError> {
        let (header, header_len) = match wire::read_header(&mut source) {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(wire_error)) => return Err(ReadError::new(ReadErrorKind::Wire(wire_error), 0)),
            Err(io_error) => return Err(ReadError::new(ReadErrorKind::Io(io_error), 0)),
        };

        // One byte of lookahead decides whether the body is a zlib stream;
        // the byte is handed back through a prefix chain either way.
        let mut first = [0u8; 1];
        let body = match source.read(&mut first) {
            Ok(0) => Body::Plain(Cursor::new(Vec::new()).chain(source)),
            Ok(_) => {
                let prefixed = Cursor::new(vec![first[0]]).chain(source);
                if first[0] == ZLIB_MAGIC {
                    Body::Compressed(Box::new(ZlibDecoder::new(prefixed)))
                } else {
                    Body::Plain(prefixed)
                }
            }
            Err(err) => return Err(ReadError::new(ReadErrorKind::Io(err), header_len)),
        };

        Ok(Self {
            body,
            header,
            offset: header_len,
            code_table: AHashMap::new(),
            native_nodes: Vec::new(),
            stack_tree: StackTree::new(),
            thread_nodes: AHashMap::new(),
            thread_names: AHashMap::new(),
            current_tid: None,
            memory_maps: Vec::new(),
            open_image: None,
            outcome: None,
            payload_buf: Vec::new(),
        })
    }

    #[must_use]
    pub fn header(&self) -> &CaptureHeader {
        &self.header
    }

    /// How the stream ended. `None` until the last record has been read.
    #[must_use]
    pub fn outcome(&self) -> Option<CaptureOutcome> {
        self.outcome
    }

    /// The memory-map section, populated once those records have been read
    /// (they sit at the end of complete captures).
    #[must_use]
    pub fn memory_maps(&self) -> &[ImageMap] {
        &self.memory_maps
    }

    /// Host-assigned name of a thread, if one was recorded.
    #[must_use]
    pub fn thread_name(&self, tid: ThreadId) -> Option<&str> {
        self.thread_names.get(&tid).map(String::as_str)
    }

    /// Resolves a stack id into frames, outermost first.
    #[must_use]
    pub fn resolve_stack(&self, stack: StackId) -> Vec<ResolvedFrame> {
        self.stack_tree
            .frames(stack)
            .into_iter()
            .map(|frame| self.resolve_frame(frame))
            .collect()
    }

    fn resolve_frame(&self, frame: ShadowFrame) -> ResolvedFrame {
        match self.code_table.get(&frame.code.raw()) {
            Some(descriptor) => ResolvedFrame {
                function_name: descriptor.function_name.clone(),
                file_name: descriptor.file_name.clone(),
                line: descriptor.resolve_line(frame.instr_offset),
                is_entry: frame.is_entry,
            },
            None => ResolvedFrame {
                function_name: format!("<code {}>", frame.code.raw()),
                file_name: String::new(),
                line: 0,
                is_entry: frame.is_entry,
            },
        }
    }

    /// Resolves a native stack id into instruction pointers, outermost
    /// first (the capture stores them innermost-first; reading reverses).
    #[must_use]
    pub fn resolve_native_stack(&self, native_stack: NativeStackId) -> Vec<u64> {
        let mut ips = Vec::new();
        let mut cursor = native_stack;
        while cursor != NativeStackId::NONE {
            let Some(node) = self.native_nodes.get(cursor.raw() as usize - 1) else {
                break;
            };
            ips.push(node.ip);
            cursor = node.parent;
        }
        ips.reverse();
        ips
    }

    /// Reads the next raw record, replaying it into the reader state.
    /// `Ok(None)` means the stream ended (see [`CaptureReader::outcome`]).
    pub fn next_record(&mut self) -> Result<Option<(u64, Record)>, ReadError> {
        if self.outcome.is_some() {
            return Ok(None);
        }
        let record_offset = self.offset;

        let mut tag = [0u8; 1];
        match self.body.read(&mut tag) {
            Ok(0) => return Ok(self.truncate()),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(self.truncate()),
            Err(err) => return Err(ReadError::new(ReadErrorKind::Io(err), record_offset)),
        }

        let length = match wire::varint_from_reader(&mut self.body) {
            Ok(Some(length)) => length,
            Ok(None) => return Ok(self.truncate()),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(self.truncate()),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                return Err(ReadError::new(ReadErrorKind::Wire(wire::WireError::BadVarint), record_offset));
            }
            Err(err) => return Err(ReadError::new(ReadErrorKind::Io(err), record_offset)),
        };
        if length > MAX_RECORD_LEN {
            return Err(ReadError::new(
                ReadErrorKind::Wire(wire::WireError::ValueOutOfRange("record length")),
                record_offset,
            ));
        }

        self.payload_buf.clear();
        self.payload_buf.resize(length as usize, 0);
        let mut filled = 0usize;
        while filled < self.payload_buf.len() {
            match self.body.read(&mut self.payload_buf[filled..]) {
                Ok(0) => return Ok(self.truncate()),
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(self.truncate()),
                Err(err) => return Err(ReadError::new(ReadErrorKind::Io(err), record_offset)),
            }
        }

        let record = wire::decode_payload(tag[0], &self.payload_buf)
            .map_err(|err| ReadError::new(ReadErrorKind::Wire(err), record_offset))?;
        self.offset += 1 + wire::varint_len(length) + length;
        self.replay(&record, record_offset)?;
        Ok(Some((record_offset, record)))
    }

    fn truncate(&mut self) -> Option<(u64, Record)> {
        self.outcome = Some(CaptureOutcome::Truncated);
        None
    }

    fn replay(&mut self, record: &Record, offset: u64) -> Result<(), ReadError> {
        match record {
            Record::ContextSwitch(tid) => self.current_tid = Some(*tid),
            Record::ThreadName(name) => {
                let tid = self.require_tid(offset)?;
                self.thread_names.insert(tid, name.clone());
            }
            Record::CodeObject { id, descriptor } => {
                self.code_table.insert(id.raw(), descriptor.clone());
            }
            Record::FramePush(frame) => {
                let tid = self.require_tid(offset)?;
                if !self.code_table.contains_key(&frame.code.raw()) {
                    return Err(ReadError::new(ReadErrorKind::UnknownCodeId(frame.code.raw()), offset));
                }
                let node = self.thread_nodes.get(&tid).copied().unwrap_or(StackId::EMPTY);
                let child = self.stack_tree.child(node, *frame);
                self.thread_nodes.insert(tid, child);
            }
            Record::FramePop { count } => {
                if *count == 0 {
                    return Err(ReadError::new(ReadErrorKind::EmptyPop, offset));
                }
                let tid = self.require_tid(offset)?;
                let mut node = self.thread_nodes.get(&tid).copied().unwrap_or(StackId::EMPTY);
                for _ in 0..*count {
                    node = self
                        .stack_tree
                        .parent(node)
                        .ok_or_else(|| ReadError::new(ReadErrorKind::PopUnderflow { tid: tid.0 }, offset))?;
                }
                self.thread_nodes.insert(tid, node);
            }
            Record::NativeFrame(node) => {
                if node.parent.raw() as usize > self.native_nodes.len() {
                    return Err(ReadError::new(ReadErrorKind::UnknownNativeId(node.parent.raw()), offset));
                }
                self.native_nodes.push(*node);
            }
            Record::Allocation(allocation) => {
                self.require_tid(offset)?;
                if allocation.native_stack.raw() as usize > self.native_nodes.len() {
                    return Err(ReadError::new(
                        ReadErrorKind::UnknownNativeId(allocation.native_stack.raw()),
                        offset,
                    ));
                }
            }
            Record::MemoryMapStart => {
                self.memory_maps.clear();
                self.open_image = None;
            }
            Record::SegmentHeader {
                filename,
                base_addr,
                n_segments,
            } => {
                self.finish_open_image();
                self.open_image = Some((
                    ImageMap {
                        filename: filename.clone(),
                        base_addr: *base_addr,
                        segments: Vec::new(),
                    },
                    *n_segments,
                ));
            }
            Record::Segment { vaddr, memsz } => match self.open_image.as_mut() {
                Some((image, expected)) => {
                    image.segments.push((*vaddr, *memsz));
                    if *expected == image.segments.len() as u64 {
                        self.finish_open_image();
                    }
                }
                None => {
                    return Err(ReadError::new(
                        ReadErrorKind::UnexpectedRecord("SEGMENT record outside a segment header"),
                        offset,
                    ));
                }
            },
            Record::Trailer => {
                self.finish_open_image();
                self.outcome = Some(CaptureOutcome::Complete);
            }
            Record::MemoryRecord(_) | Record::AggregatedAllocation(_) => {}
        }
        Ok(())
    }

    fn finish_open_image(&mut self) {
        if let Some((image, _)) = self.open_image.take() {
            self.memory_maps.push(image);
        }
    }

    fn require_tid(&self, offset: u64) -> Result<ThreadId, ReadError> {
        self.current_tid.ok_or_else(|| {
            ReadError::new(
                ReadErrorKind::UnexpectedRecord("thread-scoped record before any CONTEXT_SWITCH"),
                offset,
            )
        })
    }

    /// Reads forward to the next analysed event (allocation, snapshot, or
    /// aggregated row). `Ok(None)` at stream end.
    pub fn next_event(&mut self) -> Result<Option<TrackedEvent>, ReadError> {
        loop {
            let Some((_, record)) = self.next_record()? else {
                return Ok(None);
            };
            match record {
                Record::Allocation(allocation) => {
                    let tid = self.current_tid.unwrap_or_default();
                    let stack = self.thread_nodes.get(&tid).copied().unwrap_or(StackId::EMPTY);
                    return Ok(Some(TrackedEvent::Allocation(AllocationEvent {
                        tid,
                        address: allocation.address,
                        size: allocation.size,
                        kind: allocation.kind,
                        stack,
                        native_stack: allocation.native_stack,
                    })));
                }
                Record::MemoryRecord(snapshot) => return Ok(Some(TrackedEvent::MemorySnapshot(snapshot))),
                Record::AggregatedAllocation(row) => return Ok(Some(TrackedEvent::AggregatedAllocation(row))),
                _ => {}
            }
        }
    }

    /// Drives the whole stream through the high-water-mark aggregation.
    /// Works for both file formats: pre-aggregated captures simply yield
    /// their stored rows.
    pub fn high_water_report(&mut self) -> Result<HighWaterReport, ReadError> {
        match self.header.file_format {
            FileFormat::AllAllocations => {
                let mut aggregator = HighWaterAggregator::new();
                while let Some(event) = self.next_event()? {
                    match event {
                        TrackedEvent::Allocation(allocation) => {
                            aggregator.add(allocation.location(), allocation.address, allocation.size);
                        }
                        TrackedEvent::MemorySnapshot(_) => aggregator.add_snapshot_boundary(),
                        TrackedEvent::AggregatedAllocation(_) => {}
                    }
                }
                Ok(aggregator.finish())
            }
            FileFormat::AggregatedAllocations => {
                let mut rows = Vec::new();
                let mut high_water_bytes = 0;
                while let Some(event) = self.next_event()? {
                    if let TrackedEvent::AggregatedAllocation(row) = event {
                        high_water_bytes += row.bytes_in_high_water_mark;
                        rows.push(HighWaterRow {
                            location: LocationKey {
                                tid: row.tid,
                                stack: row.stack,
                                native_stack: row.native_stack,
                                kind: row.kind,
                            },
                            n_allocations_in_high_water_mark: row.n_allocations_in_high_water_mark,
                            bytes_in_high_water_mark: row.bytes_in_high_water_mark,
                            n_allocations_leaked: row.n_allocations_leaked,
                            bytes_leaked: row.bytes_leaked,
                        });
                    }
                }
                Ok(HighWaterReport {
                    high_water_bytes,
                    rows,
                    anomalies: 0,
                })
            }
        }
    }

    /// Temporal high-water-mark aggregation over snapshot windows.
    /// Requires a per-event capture.
    pub fn temporal_report(&mut self) -> Result<Vec<TemporalRow>, ReadError> {
        self.require_all_allocations("temporal analysis needs a per-event capture")?;
        let mut aggregator = TemporalHighWaterAggregator::new();
        while let Some(event) = self.next_event()? {
            match event {
                TrackedEvent::Allocation(allocation) => {
                    aggregator.add(allocation.location(), allocation.address, allocation.size);
                }
                TrackedEvent::MemorySnapshot(_) => aggregator.add_snapshot_boundary(),
                TrackedEvent::AggregatedAllocation(_) => {}
            }
        }
        Ok(aggregator.finish())
    }

    /// Allocation-lifetime aggregation over snapshot windows. Requires a
    /// per-event capture.
    pub fn lifetime_report(&mut self) -> Result<Vec<LifetimeRow>, ReadError> {
        self.require_all_allocations("lifetime analysis needs a per-event capture")?;
        let mut aggregator = LifetimeAggregator::new();
        while let Some(event) = self.next_event()? {
            match event {
                TrackedEvent::Allocation(allocation) => {
                    aggregator.add(allocation.location(), allocation.address, allocation.size);
                }
                TrackedEvent::MemorySnapshot(_) => aggregator.add_snapshot_boundary(),
                TrackedEvent::AggregatedAllocation(_) => {}
            }
        }
        Ok(aggregator.finish())
    }

    fn require_all_allocations(&self, what: &'static str) -> Result<(), ReadError> {
        match self.header.file_format {
            FileFormat::AllAllocations => Ok(()),
            FileFormat::AggregatedAllocations => {
                Err(ReadError::new(ReadErrorKind::WrongFileFormat(what), self.offset))
            }
        }
    }
}
