//! Hook-layer behavior: adapter recording, reentrancy, and the
//! `GlobalAlloc` wrapper.

use std::{
    ffi::c_void,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use mneme::{
    AllocatorKind, AllocatorTable, CaptureReader, CodeDescriptor, CollectSink, ReentrancyGuard, SystemAllocator,
    ThreadId, TrackedEvent, TrackerBuilder,
};
use pretty_assertions::assert_eq;

static TRACKER_LOCK: Mutex<()> = Mutex::new(());

fn tracker_lock() -> MutexGuard<'static, ()> {
    TRACKER_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Hands out predictable fake addresses and never touches the process
/// heap, so tests can assert on exact events.
#[derive(Default)]
struct ArenaAllocator {
    next: AtomicUsize,
}

impl ArenaAllocator {
    fn grab(&self, size: usize) -> *mut c_void {
        let address = 0x5000_0000 + self.next.fetch_add(size.max(16), Ordering::Relaxed);
        address as *mut c_void
    }
}

impl SystemAllocator for ArenaAllocator {
    unsafe fn malloc(&self, size: usize) -> *mut c_void {
        self.grab(size)
    }

    unsafe fn calloc(&self, count: usize, size: usize) -> *mut c_void {
        self.grab(count * size)
    }

    unsafe fn realloc(&self, _ptr: *mut c_void, size: usize) -> *mut c_void {
        self.grab(size)
    }

    unsafe fn free(&self, _ptr: *mut c_void) {}

    unsafe fn posix_memalign(&self, out: &mut *mut c_void, _align: usize, size: usize) -> i32 {
        *out = self.grab(size);
        0
    }

    unsafe fn aligned_alloc(&self, _align: usize, size: usize) -> *mut c_void {
        self.grab(size)
    }

    unsafe fn mmap(
        &self,
        _addr: *mut c_void,
        len: usize,
        _prot: i32,
        _flags: i32,
        _fd: i32,
        _offset: i64,
    ) -> *mut c_void {
        self.grab(len)
    }

    unsafe fn munmap(&self, _addr: *mut c_void, _len: usize) -> i32 {
        0
    }

    #[cfg(target_os = "linux")]
    unsafe fn valloc(&self, size: usize) -> *mut c_void {
        self.grab(size)
    }

    #[cfg(target_os = "linux")]
    unsafe fn memalign(&self, _align: usize, size: usize) -> *mut c_void {
        self.grab(size)
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    unsafe fn pvalloc(&self, size: usize) -> *mut c_void {
        self.grab(size)
    }
}

#[test]
fn reentrancy_guard_is_exclusive_per_thread() {
    let first = ReentrancyGuard::acquire();
    assert!(first.is_some());
    assert!(ReentrancyGuard::acquire().is_none());
    drop(first);
    assert!(ReentrancyGuard::acquire().is_some());
}

#[test]
fn adapter_table_records_through_the_active_tracker() {
    let _serialized = tracker_lock();
    let sink = CollectSink::new();
    let handle = sink.handle();
    let tracker = TrackerBuilder::with_sink(Box::new(sink))
        .memory_interval_ms(0)
        .start()
        .unwrap();
    let code = tracker.intern_code(&CodeDescriptor::flat("native_caller", "ext.py", 1));
    tracker.on_thread_start(ThreadId(1), "main");
    tracker.on_frame_enter(code, true);

    let table = AllocatorTable::with_allocator(ArenaAllocator::default());
    // SAFETY: the arena allocator fabricates addresses and never
    // dereferences them.
    let (first, second, third) = unsafe {
        let first = table.malloc(100);
        let second = table.calloc(4, 25);
        table.free(first);
        let third = table.realloc(second, 300);
        (first, second, third)
    };
    tracker.finish().unwrap();

    let bytes = handle.lock().unwrap().clone();
    let mut reader = CaptureReader::from_bytes(bytes).unwrap();
    let mut events = Vec::new();
    while let Some(event) = reader.next_event().unwrap() {
        if let TrackedEvent::Allocation(event) = event {
            events.push((event.kind, event.address, event.size));
        }
    }
    assert_eq!(
        events,
        vec![
            (AllocatorKind::Malloc, first as u64, 100),
            (AllocatorKind::Calloc, second as u64, 100),
            (AllocatorKind::Free, first as u64, 0),
            // realloc reports a free of the old block plus a fresh
            // allocation at the new address.
            (AllocatorKind::Free, second as u64, 0),
            (AllocatorKind::Realloc, third as u64, 300),
        ]
    );
}

#[test]
fn host_allocator_events_honor_the_tracing_flag() {
    let _serialized = tracker_lock();
    let sink = CollectSink::new();
    let handle = sink.handle();
    let tracker = TrackerBuilder::with_sink(Box::new(sink))
        .memory_interval_ms(0)
        .trace_python_allocators(false)
        .start()
        .unwrap();
    tracker.on_thread_start(ThreadId(1), "main");
    tracker.record_allocation(AllocatorKind::PymallocMalloc, 0x100, 32);
    tracker.record_allocation(AllocatorKind::Malloc, 0x200, 8);
    tracker.finish().unwrap();

    let bytes = handle.lock().unwrap().clone();
    let mut reader = CaptureReader::from_bytes(bytes).unwrap();
    let mut kinds = Vec::new();
    while let Some(event) = reader.next_event().unwrap() {
        if let TrackedEvent::Allocation(event) = event {
            kinds.push(event.kind);
        }
    }
    assert_eq!(kinds, vec![AllocatorKind::Malloc]);
}

#[test]
fn global_alloc_wrapper_records_rust_heap_traffic() {
    use std::alloc::{GlobalAlloc, Layout, System};

    let _serialized = tracker_lock();
    let sink = CollectSink::new();
    let handle = sink.handle();
    let tracker = TrackerBuilder::with_sink(Box::new(sink))
        .memory_interval_ms(0)
        .start()
        .unwrap();
    tracker.on_thread_start(ThreadId(1), "main");

    let wrapper = mneme::TrackingAllocator(System);
    let layout = Layout::from_size_align(64, 8).unwrap();
    // SAFETY: layout is valid and the pointer is freed with the same
    // layout it was allocated with.
    let address = unsafe {
        let pointer = wrapper.alloc(layout);
        assert!(!pointer.is_null());
        wrapper.dealloc(pointer, layout);
        pointer as u64
    };
    tracker.finish().unwrap();

    let bytes = handle.lock().unwrap().clone();
    let mut reader = CaptureReader::from_bytes(bytes).unwrap();
    let mut events = Vec::new();
    while let Some(event) = reader.next_event().unwrap() {
        if let TrackedEvent::Allocation(event) = event {
            events.push((event.kind, event.address, event.size));
        }
    }
    assert_eq!(
        events,
        vec![(AllocatorKind::Malloc, address, 64), (AllocatorKind::Free, address, 0)]
    );
}
