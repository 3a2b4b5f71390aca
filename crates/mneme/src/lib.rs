#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts are intentional")]
#![expect(clippy::must_use_candidate, reason = "accessor return values are optional to use")]

mod aggregate;
mod error;
mod hooks;
mod interner;
mod maps;
mod reader;
mod records;
mod shadow;
mod sink;
mod stack_tree;
mod tracker;
mod unwind;
mod wire;
mod writer;

pub use crate::{
    aggregate::{
        HighWaterAggregator, HighWaterReport, HighWaterRow, Interval, LifetimeAggregator, LifetimeRow, LocationKey,
        RangeMap, RemovedRange, TemporalHighWaterAggregator, TemporalRow,
    },
    error::{CaptureOutcome, ReadError, ReadErrorKind, TrackerError},
    hooks::{AllocatorTable, LibcAllocator, ReentrancyGuard, SystemAllocator, TrackingAllocator},
    interner::{CodeInterner, NativeStackInterner},
    maps::{now_ms, read_memory_maps, read_rss_bytes},
    reader::{AllocationEvent, CaptureReader, ResolvedFrame, TrackedEvent},
    records::{
        AggregatedAllocationRecord, AllocationRecord, AllocatorKind, CaptureHeader, CodeDescriptor, CodeId,
        FILE_MAGIC, FILE_VERSION, FRAME_POP_BATCH, FileFormat, ImageMap, LineTableBuilder, MemorySnapshot,
        NativeFrameRecord, NativeStackId, Record, RecordTag, ShadowFrame, StackId, ThreadId,
    },
    shadow::ThreadStack,
    sink::{CollectSink, CompressedFileSink, FileSink, RecordSink},
    tracker::{
        CaptureStats, DEFAULT_MEMORY_INTERVAL_MS, StackProvider, Tracker, TrackerBuilder, current_thread_id,
    },
    unwind::{MAX_NATIVE_FRAMES, NativeStackBuf, capture_native_stack},
    wire::WireError,
};
