//! The capture data model: allocator kinds, record tags, typed records, and
//! the capture header.
//!
//! Everything the writer emits and the reader replays is described here.
//! Wire encoding lives in [`crate::wire`]; this module only defines the
//! shapes and the small integer ids that tie them together.
//!
//! Ids are laid out as follows:
//! * `CodeId`, `StackId` and `NativeStackId` are dense `u32` ids issued
//!   monotonically from 1 by the interners.
//! * 0 is the sentinel "no frame" / "empty stack" value for all three.

use strum::{EnumString, FromRepr, IntoStaticStr};

/// Capture file magic, first key of the textual header.
pub const FILE_MAGIC: &str = "memray";

/// Capture format version. Bumped on any wire change.
pub const FILE_VERSION: u32 = 12;

/// Maximum pops folded into a single `FRAME_POP` record. Longer runs are
/// written as chained continuation records.
pub const FRAME_POP_BATCH: u8 = 16;

/// Index into the code-object interner.
///
/// Uses `u32` to save space (4 bytes vs 8 bytes for `usize`). This limits us
/// to ~4 billion distinct code objects, which is more than sufficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct CodeId(u32);

impl CodeId {
    /// The "no frame" sentinel. Interners never issue it.
    pub const NONE: Self = Self(0);

    /// Creates a `CodeId` from a raw wire value. The caller is responsible
    /// for ensuring the id was issued by the matching interner.
    #[inline]
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw wire value.
    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Identifier of a distinct host-frame chain, issued by the stack tree in
/// first-visit stream order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct StackId(u32);

impl StackId {
    /// The empty stack.
    pub const EMPTY: Self = Self(0);

    #[inline]
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Identifier of an interned native frame chain (the leaf of a parent-linked
/// list of instruction pointers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct NativeStackId(u32);

impl NativeStackId {
    /// No native trace was captured for the event.
    pub const NONE: Self = Self(0);

    #[inline]
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// A host thread id, in whatever convention the host runtime uses (the
/// native hook path uses the pthread id so both sides agree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ThreadId(pub u64);

/// Every allocator the hook layer can observe.
///
/// The discriminants are the wire values; they are part of the capture
/// format and must never be reordered.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, EnumString, IntoStaticStr, serde::Serialize, serde::Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum AllocatorKind {
    Malloc = 1,
    Calloc = 2,
    Realloc = 3,
    Valloc = 4,
    Pvalloc = 5,
    Memalign = 6,
    PosixMemalign = 7,
    AlignedAlloc = 8,
    Free = 9,
    PymallocMalloc = 10,
    PymallocCalloc = 11,
    PymallocRealloc = 12,
    PymallocFree = 13,
    Mmap = 14,
    Munmap = 15,
}

impl AllocatorKind {
    /// Returns `true` for kinds that release memory rather than acquire it.
    #[inline]
    #[must_use]
    pub fn is_deallocator(self) -> bool {
        matches!(self, Self::Free | Self::PymallocFree | Self::Munmap)
    }

    /// Returns `true` for range allocators, whose deallocation carries an
    /// address *and* a length and may split a live mapping.
    #[inline]
    #[must_use]
    pub fn is_range(self) -> bool {
        matches!(self, Self::Mmap | Self::Munmap)
    }

    /// Returns `true` for the host interpreter's object allocator family.
    #[inline]
    #[must_use]
    pub fn is_host_allocator(self) -> bool {
        matches!(
            self,
            Self::PymallocMalloc | Self::PymallocCalloc | Self::PymallocRealloc | Self::PymallocFree
        )
    }
}

/// One-byte record tags. Tag 0 is reserved so a zeroed byte can never be
/// mistaken for a record, and no tag collides with the zlib stream marker
/// (`0x78`) the reader uses to detect a compressed body.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordTag {
    MemoryRecord = 1,
    ContextSwitch = 2,
    ThreadName = 3,
    CodeObject = 4,
    FramePush = 5,
    FramePop = 6,
    NativeFrameId = 7,
    Allocation = 8,
    AggregatedAllocation = 9,
    MemoryMapStart = 10,
    SegmentHeader = 11,
    Segment = 12,
    Trailer = 13,
}

/// Whether a capture stores raw allocation events or pre-aggregated rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr, serde::Serialize, serde::Deserialize)]
pub enum FileFormat {
    #[strum(serialize = "ALL_ALLOCATIONS")]
    AllAllocations,
    #[strum(serialize = "AGGREGATED_ALLOCATIONS")]
    AggregatedAllocations,
}

/// Immutable description of a host code object.
///
/// The line table is a byte-packed sequence of `(instruction-offset delta,
/// line delta)` varint pairs, enough to recover the current source line for
/// any execution point without storing per-instruction line numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodeDescriptor {
    pub function_name: String,
    pub file_name: String,
    pub first_line: u32,
    pub linetable: Vec<u8>,
}

impl CodeDescriptor {
    /// Builds a descriptor with an empty line table; every instruction
    /// offset resolves to `first_line`.
    #[must_use]
    pub fn flat(function_name: impl Into<String>, file_name: impl Into<String>, first_line: u32) -> Self {
        Self {
            function_name: function_name.into(),
            file_name: file_name.into(),
            first_line,
            linetable: Vec::new(),
        }
    }

    /// Resolves the source line active at `instr_offset`.
    ///
    /// Walks the delta pairs until the cumulative offset passes the target.
    /// A malformed trailing entry ends the walk early, yielding the last
    /// fully decoded line.
    #[must_use]
    pub fn resolve_line(&self, instr_offset: u32) -> u32 {
        let mut line = i64::from(self.first_line);
        let mut offset = 0u64;
        let mut cursor = self.linetable.as_slice();
        while !cursor.is_empty() {
            let Some((delta_offset, rest)) = crate::wire::varint_from_slice(cursor) else {
                break;
            };
            let Some((raw_delta_line, rest)) = crate::wire::varint_from_slice(rest) else {
                break;
            };
            offset += delta_offset;
            if offset > u64::from(instr_offset) {
                break;
            }
            line += crate::wire::zigzag_decode(raw_delta_line);
            cursor = rest;
        }
        u32::try_from(line.max(0)).unwrap_or(u32::MAX)
    }
}

/// Incremental builder for [`CodeDescriptor`] line tables.
///
/// Hosts feed it `(instruction offset, line)` pairs in offset order.
#[derive(Debug, Default)]
pub struct LineTableBuilder {
    bytes: Vec<u8>,
    last_offset: u32,
    last_line: i64,
    started: bool,
}

impl LineTableBuilder {
    #[must_use]
    pub fn new(first_line: u32) -> Self {
        Self {
            bytes: Vec::new(),
            last_offset: 0,
            last_line: i64::from(first_line),
            started: false,
        }
    }

    /// Records that `line` becomes active at `instr_offset`. Offsets must be
    /// non-decreasing; out-of-order pairs are ignored.
    pub fn push(&mut self, instr_offset: u32, line: u32) {
        if self.started && instr_offset < self.last_offset {
            return;
        }
        let delta_offset = u64::from(instr_offset - if self.started { self.last_offset } else { 0 });
        let delta_line = i64::from(line) - self.last_line;
        crate::wire::varint_to_vec(&mut self.bytes, delta_offset);
        crate::wire::varint_to_vec(&mut self.bytes, crate::wire::zigzag_encode(delta_line));
        self.last_offset = instr_offset;
        self.last_line = i64::from(line);
        self.started = true;
    }

    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// A periodic resident-set sample, also the aggregation boundary between
/// snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MemorySnapshot {
    pub time_ms: u64,
    pub rss_bytes: u64,
}

/// One frame of a thread's shadow stack, and the payload of a
/// `FRAME_PUSH` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShadowFrame {
    pub code: CodeId,
    pub instr_offset: u32,
    /// Marks a boundary between host-language and native code.
    pub is_entry: bool,
}

impl ShadowFrame {
    /// A frame at its entry point (instruction offset zero).
    #[must_use]
    pub fn at_entry(code: CodeId, is_entry: bool) -> Self {
        Self {
            code,
            instr_offset: 0,
            is_entry,
        }
    }
}

/// A single raw allocation event as stored on the wire. The owning thread
/// is implied by the most recent `CONTEXT_SWITCH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub address: u64,
    pub size: u64,
    pub kind: AllocatorKind,
    pub native_stack: NativeStackId,
}

/// One node of the interned native-frame trie: an instruction pointer plus
/// the id of its parent node. The node's own id is implicit (ids are issued
/// in record order, starting at 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeFrameRecord {
    pub ip: u64,
    pub parent: NativeStackId,
}

/// A pre-aggregated high-water-mark row, present only in
/// [`FileFormat::AggregatedAllocations`] captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct AggregatedAllocationRecord {
    pub tid: ThreadId,
    pub stack: StackId,
    pub native_stack: NativeStackId,
    pub kind: AllocatorKind,
    pub n_allocations_in_high_water_mark: u64,
    pub bytes_in_high_water_mark: u64,
    pub n_allocations_leaked: u64,
    pub bytes_leaked: u64,
}

/// The loaded segments of one mapped image, written near the end of a
/// capture so native instruction pointers can be resolved against them.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ImageMap {
    pub filename: String,
    pub base_addr: u64,
    /// `(vaddr, memsz)` pairs.
    pub segments: Vec<(u64, u64)>,
}

/// Every record the reader can yield, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    MemoryRecord(MemorySnapshot),
    ContextSwitch(ThreadId),
    ThreadName(String),
    CodeObject { id: CodeId, descriptor: CodeDescriptor },
    FramePush(ShadowFrame),
    FramePop { count: u8 },
    NativeFrame(NativeFrameRecord),
    Allocation(AllocationRecord),
    AggregatedAllocation(AggregatedAllocationRecord),
    MemoryMapStart,
    SegmentHeader { filename: String, base_addr: u64, n_segments: u64 },
    Segment { vaddr: u64, memsz: u64 },
    Trailer,
}

impl Record {
    /// The tag this record is written under.
    #[must_use]
    pub fn tag(&self) -> RecordTag {
        match self {
            Self::MemoryRecord(_) => RecordTag::MemoryRecord,
            Self::ContextSwitch(_) => RecordTag::ContextSwitch,
            Self::ThreadName(_) => RecordTag::ThreadName,
            Self::CodeObject { .. } => RecordTag::CodeObject,
            Self::FramePush(_) => RecordTag::FramePush,
            Self::FramePop { .. } => RecordTag::FramePop,
            Self::NativeFrame(_) => RecordTag::NativeFrameId,
            Self::Allocation(_) => RecordTag::Allocation,
            Self::AggregatedAllocation(_) => RecordTag::AggregatedAllocation,
            Self::MemoryMapStart => RecordTag::MemoryMapStart,
            Self::SegmentHeader { .. } => RecordTag::SegmentHeader,
            Self::Segment { .. } => RecordTag::Segment,
            Self::Trailer => RecordTag::Trailer,
        }
    }
}

/// The textual capture header. Grep-able `key=value` lines terminated by a
/// single separator byte; see [`crate::wire`] for the exact layout.
///
/// `n_allocations`, `n_frames` and `end_time` are patched in place when the
/// capture closes, so the writer emits them zero-padded to fixed width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureHeader {
    /// Host interpreter version in CPython hex form (e.g. `0x030c_00f0`).
    pub python_version: u32,
    pub native_traces: bool,
    pub file_format: FileFormat,
    pub n_allocations: u64,
    pub n_frames: u64,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
    pub pid: u32,
    pub main_tid: ThreadId,
    pub skipped_frames_on_main_tid: u32,
    pub command_line: String,
    /// Host allocator flavor, e.g. `pymalloc`.
    pub python_allocator: String,
    pub trace_python_allocators: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_table_resolves_offsets_to_lines() {
        let mut builder = LineTableBuilder::new(10);
        builder.push(0, 10);
        builder.push(8, 12);
        builder.push(20, 11);
        let descriptor = CodeDescriptor {
            function_name: "f".to_owned(),
            file_name: "m.py".to_owned(),
            first_line: 10,
            linetable: builder.finish(),
        };
        assert_eq!(descriptor.resolve_line(0), 10);
        assert_eq!(descriptor.resolve_line(7), 10);
        assert_eq!(descriptor.resolve_line(8), 12);
        assert_eq!(descriptor.resolve_line(19), 12);
        assert_eq!(descriptor.resolve_line(20), 11);
        assert_eq!(descriptor.resolve_line(10_000), 11);
    }

    #[test]
    fn empty_line_table_resolves_to_first_line() {
        let descriptor = CodeDescriptor::flat("f", "m.py", 42);
        assert_eq!(descriptor.resolve_line(0), 42);
        assert_eq!(descriptor.resolve_line(999), 42);
    }

    #[test]
    fn allocator_kind_wire_values_are_stable() {
        assert_eq!(AllocatorKind::Malloc as u8, 1);
        assert_eq!(AllocatorKind::Free as u8, 9);
        assert_eq!(AllocatorKind::Munmap as u8, 15);
        assert_eq!(AllocatorKind::from_repr(2), Some(AllocatorKind::Calloc));
        let name: &'static str = AllocatorKind::PosixMemalign.into();
        assert_eq!(name, "posix_memalign");
    }
}

impl CaptureHeader {
    /// A header with every field at its neutral value; the writer fills in
    /// the real values at open and close.
    #[must_use]
    pub fn empty(file_format: FileFormat) -> Self {
        Self {
            python_version: 0,
            native_traces: false,
            file_format,
            n_allocations: 0,
            n_frames: 0,
            start_time_ms: 0,
            end_time_ms: 0,
            pid: 0,
            main_tid: ThreadId(0),
            skipped_frames_on_main_tid: 0,
            command_line: String::new(),
            python_allocator: String::new(),
            trace_python_allocators: false,
        }
    }
}
