//! The scoped tracker: lifecycle, host capabilities, and hook dispatch.
//!
//! One tracker may be active per process. Starting it opens the sink,
//! writes the header, installs the process-wide hook target, and spawns
//! the memory-snapshot sampler; dropping it (or calling
//! [`Tracker::finish`]) tears everything down in order, so a panic
//! unwinding through the tracked scope still produces a closed capture.
//!
//! Hook-path failures never propagate into the traced program. Any
//! recording error deactivates tracking: hooks keep forwarding to the real
//! allocator, nothing more is recorded, and the process keeps running. The
//! capture is then truncated but remains readable up to the failure.

use std::{
    cell::RefCell,
    io,
    path::PathBuf,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    error::TrackerError,
    hooks::ReentrancyGuard,
    maps,
    records::{
        AllocationRecord, AllocatorKind, CaptureHeader, CodeDescriptor, CodeId, FileFormat, MemorySnapshot,
        NativeStackId, ShadowFrame, ThreadId,
    },
    shadow::ThreadStack,
    sink::{CompressedFileSink, FileSink, RecordSink},
    unwind::{NativeStackBuf, capture_native_stack},
    writer::TraceWriter,
};

/// Default period of the resident-set sampler.
pub const DEFAULT_MEMORY_INTERVAL_MS: u64 = 10;

static ACTIVE: RwLock<Option<Arc<TrackerCore>>> = RwLock::new(None);
static ACTIVE_FLAG: AtomicBool = AtomicBool::new(false);
static NEXT_TRACKER_GENERATION: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_STATE: RefCell<ThreadState> = RefCell::new(ThreadState::stale());
}

/// Per-thread tracking context. Owned exclusively by its thread; the
/// generation stamp invalidates state left over from a previous tracker.
///
/// The thread id and the coalesced pending-pop count live in a shared
/// slot ([`ThreadShared`]) that is also registered with the tracker core,
/// because teardown runs on whichever thread closes the tracker and must
/// still flush pop runs left coalescing on threads that went quiet.
struct ThreadState {
    generation: u64,
    shared: Arc<ThreadShared>,
    stack: ThreadStack,
}

/// The teardown-reachable slice of a thread's context.
struct ThreadShared {
    tid: AtomicU64,
    pending_pops: AtomicU32,
}

impl ThreadState {
    fn stale() -> Self {
        Self {
            generation: 0,
            shared: Arc::new(ThreadShared {
                tid: AtomicU64::new(0),
                pending_pops: AtomicU32::new(0),
            }),
            stack: ThreadStack::new(),
        }
    }

    fn fresh(generation: u64) -> Self {
        Self {
            generation,
            shared: Arc::new(ThreadShared {
                tid: AtomicU64::new(current_thread_id().0),
                pending_pops: AtomicU32::new(0),
            }),
            stack: ThreadStack::new(),
        }
    }

    fn tid(&self) -> ThreadId {
        ThreadId(self.shared.tid.load(Ordering::Acquire))
    }

    /// Takes the coalesced pop count for flushing to the stream.
    fn take_pending_pops(&self) -> u32 {
        self.shared.pending_pops.swap(0, Ordering::AcqRel)
    }

    fn add_pending_pops(&self, pops: u32) {
        if pops > 0 {
            self.shared.pending_pops.fetch_add(pops, Ordering::AcqRel);
        }
    }
}

/// The host thread id of the calling thread (pthread id), used whenever
/// the host has not announced its own id for the thread.
#[must_use]
pub fn current_thread_id() -> ThreadId {
    // SAFETY: pthread_self has no preconditions.
    ThreadId(unsafe { libc::pthread_self() } as u64)
}

/// Closure walking the host's live frame chain, used to seed the shadow
/// stack of threads that existed before tracking started.
pub type StackProvider = Box<dyn Fn() -> Vec<ShadowFrame> + Send + Sync>;

fn with_core<R>(f: impl FnOnce(&Arc<TrackerCore>) -> R) -> Option<R> {
    if !ACTIVE_FLAG.load(Ordering::Acquire) {
        return None;
    }
    let core = {
        let guard = ACTIVE.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.clone()
    };
    core.as_ref().map(f)
}

/// Entry point for the allocator hook layer (see [`crate::hooks`]).
pub(crate) fn record_foreign_event(kind: AllocatorKind, address: u64, size: u64) {
    with_core(|core| core.record_event(kind, address, size));
}

/// Configuration and construction of a [`Tracker`].
pub struct TrackerBuilder {
    destination: Destination,
    overwrite: bool,
    compress: bool,
    native_traces: bool,
    follow_fork: bool,
    trace_python_allocators: bool,
    aggregate: bool,
    memory_interval_ms: u64,
    command_line: Option<String>,
    python_version: u32,
    python_allocator: String,
    skipped_frames_on_main_tid: u32,
    stack_provider: Option<StackProvider>,
}

enum Destination {
    Path(PathBuf),
    Sink(Box<dyn RecordSink>),
}

impl TrackerBuilder {
    /// A tracker writing its capture to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            destination: Destination::Path(path.into()),
            overwrite: false,
            compress: false,
            native_traces: false,
            follow_fork: false,
            trace_python_allocators: false,
            aggregate: false,
            memory_interval_ms: DEFAULT_MEMORY_INTERVAL_MS,
            command_line: None,
            python_version: 0,
            python_allocator: "malloc".to_owned(),
            skipped_frames_on_main_tid: 0,
            stack_provider: None,
        }
    }

    /// A tracker writing into an arbitrary sink (in-memory capture, test
    /// harness, streaming transport).
    #[must_use]
    pub fn with_sink(sink: Box<dyn RecordSink>) -> Self {
        let mut builder = Self::new(PathBuf::new());
        builder.destination = Destination::Sink(sink);
        builder
    }

    /// Reads the activation protocol exported by `mneme run` from the
    /// environment. `None` when the process was not launched under it.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let output = std::env::var_os("MNEME_OUTPUT")?;
        let mut builder = Self::new(PathBuf::from(output));
        builder = builder
            .native_traces(env_flag("MNEME_NATIVE"))
            .follow_fork(env_flag("MNEME_FOLLOW_FORK"))
            .trace_python_allocators(env_flag("MNEME_TRACE_PYTHON_ALLOCATORS"))
            .aggregate(env_flag("MNEME_AGGREGATE"))
            .overwrite(env_flag("MNEME_FORCE"))
            .compress(env_flag("MNEME_COMPRESS"));
        Some(builder)
    }

    #[must_use]
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Wraps the record body in a zlib stream.
    #[must_use]
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Captures a native stack for every allocation event.
    #[must_use]
    pub fn native_traces(mut self, native_traces: bool) -> Self {
        self.native_traces = native_traces;
        self
    }

    /// Keep tracking in forked children, one capture file per pid.
    /// Without it, children silently stop tracking.
    #[must_use]
    pub fn follow_fork(mut self, follow_fork: bool) -> Self {
        self.follow_fork = follow_fork;
        self
    }

    /// Record the host interpreter's object-allocator events too.
    #[must_use]
    pub fn trace_python_allocators(mut self, trace: bool) -> Self {
        self.trace_python_allocators = trace;
        self
    }

    /// Run the high-water-mark aggregation in-process and store only the
    /// aggregated rows.
    #[must_use]
    pub fn aggregate(mut self, aggregate: bool) -> Self {
        self.aggregate = aggregate;
        self
    }

    /// Period of the resident-set sampler; zero disables it.
    #[must_use]
    pub fn memory_interval_ms(mut self, interval: u64) -> Self {
        self.memory_interval_ms = interval;
        self
    }

    #[must_use]
    pub fn command_line(mut self, command_line: impl Into<String>) -> Self {
        self.command_line = Some(command_line.into());
        self
    }

    /// Host interpreter version in CPython hex form.
    #[must_use]
    pub fn python_version(mut self, version: u32) -> Self {
        self.python_version = version;
        self
    }

    /// Host allocator flavor recorded in the header (e.g. `pymalloc`).
    #[must_use]
    pub fn python_allocator(mut self, allocator: impl Into<String>) -> Self {
        self.python_allocator = allocator.into();
        self
    }

    /// Frames of the main thread that predate tracking and will never be
    /// seen popping.
    #[must_use]
    pub fn skipped_frames_on_main_tid(mut self, skipped: u32) -> Self {
        self.skipped_frames_on_main_tid = skipped;
        self
    }

    /// Provider of the live frame chain, used to seed shadow stacks of
    /// threads created before tracking started.
    #[must_use]
    pub fn stack_provider(mut self, provider: StackProvider) -> Self {
        self.stack_provider = Some(provider);
        self
    }

    /// Installs the tracker. Fails without side effects if another tracker
    /// is active or the sink cannot be opened.
    pub fn start(self) -> Result<Tracker, TrackerError> {
        let mut active = ACTIVE.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if active.is_some() {
            return Err(TrackerError::AlreadyActive);
        }

        let Self {
            destination,
            overwrite,
            compress,
            native_traces,
            follow_fork,
            trace_python_allocators,
            aggregate,
            memory_interval_ms,
            command_line,
            python_version,
            python_allocator,
            skipped_frames_on_main_tid,
            stack_provider,
        } = self;

        let (sink, path) = match destination {
            Destination::Sink(sink) => (sink, None),
            Destination::Path(path) => (open_sink(&path, overwrite, compress)?, Some(path)),
        };

        let header = CaptureHeader {
            python_version,
            native_traces,
            file_format: if aggregate {
                FileFormat::AggregatedAllocations
            } else {
                FileFormat::AllAllocations
            },
            n_allocations: 0,
            n_frames: 0,
            start_time_ms: maps::now_ms(),
            end_time_ms: 0,
            pid: std::process::id(),
            main_tid: current_thread_id(),
            skipped_frames_on_main_tid,
            command_line: command_line
                .unwrap_or_else(|| std::env::args().collect::<Vec<_>>().join(" ")),
            python_allocator,
            trace_python_allocators,
        };

        let writer = TraceWriter::new(sink, header)?;
        let core = Arc::new(TrackerCore {
            writer,
            generation: NEXT_TRACKER_GENERATION.fetch_add(1, Ordering::Relaxed),
            native_traces,
            follow_fork,
            trace_python_allocators,
            memory_interval_ms,
            path,
            overwrite,
            compress,
            stack_provider,
            deactivated: AtomicBool::new(false),
            sampler: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        });

        core.spawn_sampler();
        *active = Some(Arc::clone(&core));
        ACTIVE_FLAG.store(true, Ordering::Release);
        Ok(Tracker { done: false })
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|value| value == "1" || value.eq_ignore_ascii_case("true"))
}

fn open_sink(path: &std::path::Path, overwrite: bool, compress: bool) -> Result<Box<dyn RecordSink>, TrackerError> {
    let map_exists = |err: io::Error| {
        if err.kind() == io::ErrorKind::AlreadyExists {
            TrackerError::OutputExists(path.to_path_buf())
        } else {
            TrackerError::Io(err)
        }
    };
    if compress {
        Ok(Box::new(CompressedFileSink::create(path, overwrite).map_err(map_exists)?))
    } else {
        Ok(Box::new(FileSink::create(path, overwrite).map_err(map_exists)?))
    }
}

/// Statistics reported when a capture closes cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub n_allocations: u64,
    pub n_frames: u64,
}

/// A running tracking session. Exiting the scope (drop) is the supported
/// shutdown; [`Tracker::finish`] does the same but reports errors.
#[derive(Debug)]
pub struct Tracker {
    done: bool,
}

impl Tracker {
    /// Interns a host code object for use in [`Tracker::on_frame_enter`].
    /// Returns the sentinel id if tracking has been deactivated.
    #[must_use]
    pub fn intern_code(&self, descriptor: &CodeDescriptor) -> CodeId {
        with_core(|core| core.intern_code(descriptor)).unwrap_or(CodeId::NONE)
    }

    /// Host callback: a function was entered on the current thread.
    pub fn on_frame_enter(&self, code: CodeId, is_entry: bool) {
        with_core(|core| core.frame_enter(ShadowFrame::at_entry(code, is_entry)));
    }

    /// Host callback: the current function returned (or was unwound by an
    /// exception).
    pub fn on_frame_leave(&self) {
        with_core(|core| core.frame_leave());
    }

    /// Host callback: the current thread is now known as `tid`/`name`.
    pub fn on_thread_start(&self, tid: ThreadId, name: &str) {
        with_core(|core| core.thread_start(tid, name));
    }

    /// Host callback: cooperative task switch replaced the logical call
    /// stack of the current thread with `frames` (outermost first).
    pub fn on_stack_switch(&self, frames: &[ShadowFrame]) {
        with_core(|core| core.stack_switch(frames));
    }

    /// Records one allocator event on the current thread. This is the
    /// entry point for the host object allocator (`pymalloc_*` kinds); the
    /// C-allocator hook layer routes through the same path internally.
    pub fn record_allocation(&self, kind: AllocatorKind, address: u64, size: u64) {
        with_core(|core| core.record_event(kind, address, size));
    }

    /// Host callback: the process forked and this is the child. With
    /// `follow_fork` the child continues into its own pid-suffixed
    /// capture; otherwise the child stops tracking.
    pub fn on_fork_child(&self) {
        handle_fork_child();
    }

    /// Closes the capture and uninstalls the tracker.
    pub fn finish(mut self) -> Result<CaptureStats, TrackerError> {
        self.done = true;
        shutdown()
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if !self.done {
            let _ = shutdown();
        }
    }
}

fn shutdown() -> Result<CaptureStats, TrackerError> {
    let core = {
        let mut active = ACTIVE.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        ACTIVE_FLAG.store(false, Ordering::Release);
        active.take()
    };
    match core {
        Some(core) => core.close(),
        None => Err(TrackerError::Deactivated),
    }
}

fn handle_fork_child() {
    let core = {
        let mut active = ACTIVE.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        ACTIVE_FLAG.store(false, Ordering::Release);
        active.take()
    };
    let Some(core) = core else { return };
    // The sampler thread did not survive the fork; its handle must not be
    // joined in the child.
    core.forget_sampler();
    // The old sink's file descriptor is shared with the parent; the child
    // must never write or flush through it.
    core.deactivated.store(true, Ordering::Release);

    if !core.follow_fork {
        return;
    }
    let Some(base) = core.path.clone() else { return };
    let child_path = PathBuf::from(format!("{}.{}", base.display(), std::process::id()));

    // The seeding provider cannot be moved out of the shared parent core;
    // the child's threads re-seed through real frame activity instead.
    let builder = TrackerBuilder::new(child_path)
        .overwrite(core.overwrite)
        .compress(core.compress)
        .native_traces(core.native_traces)
        .follow_fork(true)
        .trace_python_allocators(core.trace_python_allocators)
        .memory_interval_ms(core.memory_interval_ms);
    // The child owns the new tracker through the global slot; the parent's
    // `Tracker` handle, inherited by the child, closes it at scope exit
    // exactly like the parent closes its own.
    if let Ok(tracker) = builder.start() {
        std::mem::forget(tracker);
    }
}

struct TrackerCore {
    writer: TraceWriter,
    generation: u64,
    native_traces: bool,
    follow_fork: bool,
    trace_python_allocators: bool,
    memory_interval_ms: u64,
    path: Option<PathBuf>,
    overwrite: bool,
    compress: bool,
    stack_provider: Option<StackProvider>,
    deactivated: AtomicBool,
    sampler: Mutex<Option<Sampler>>,
    /// Every thread that ever recorded under this tracker, so teardown can
    /// flush their remaining coalesced pops.
    threads: Mutex<Vec<Arc<ThreadShared>>>,
}

struct Sampler {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl TrackerCore {
    fn is_deactivated(&self) -> bool {
        self.deactivated.load(Ordering::Acquire)
    }

    /// Deactivates tracking after a recording failure: flush what the
    /// buffers still hold, then go quiet. The host program is unaffected.
    fn deactivate(&self) {
        if !self.deactivated.swap(true, Ordering::AcqRel) {
            let _ = self.writer.flush();
        }
    }

    fn with_state(&self, f: impl FnOnce(&mut ThreadState, &TraceWriter) -> io::Result<()>) {
        let result = THREAD_STATE.with(|cell| {
            let mut state = cell.borrow_mut();
            if state.generation != self.generation {
                *state = ThreadState::fresh(self.generation);
                let mut threads = self.threads.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                threads.push(Arc::clone(&state.shared));
            }
            f(&mut state, &self.writer)
        });
        if result.is_err() {
            self.deactivate();
        }
    }

    fn intern_code(&self, descriptor: &CodeDescriptor) -> CodeId {
        if self.is_deactivated() {
            return CodeId::NONE;
        }
        let Some(_guard) = ReentrancyGuard::acquire() else {
            return CodeId::NONE;
        };
        match self.writer.intern_code(descriptor) {
            Ok(id) => id,
            Err(_) => {
                self.deactivate();
                CodeId::NONE
            }
        }
    }

    fn frame_enter(&self, frame: ShadowFrame) {
        if self.is_deactivated() || frame.code == CodeId::NONE {
            return;
        }
        let Some(_guard) = ReentrancyGuard::acquire() else { return };
        self.with_state(|state, writer| {
            let pops = state.take_pending_pops();
            state.stack.push(frame);
            writer.write_frames(state.tid(), pops, std::slice::from_ref(&frame))
        });
    }

    fn frame_leave(&self) {
        if self.is_deactivated() {
            return;
        }
        let Some(_guard) = ReentrancyGuard::acquire() else { return };
        self.with_state(|state, _writer| {
            let popped = state.stack.pop(1);
            state.add_pending_pops(popped);
            Ok(())
        });
    }

    fn thread_start(&self, tid: ThreadId, name: &str) {
        if self.is_deactivated() {
            return;
        }
        let Some(_guard) = ReentrancyGuard::acquire() else { return };
        self.with_state(|state, writer| {
            state.shared.tid.store(tid.0, Ordering::Release);
            writer.set_thread_name(tid, name);
            Ok(())
        });
    }

    fn stack_switch(&self, frames: &[ShadowFrame]) {
        if self.is_deactivated() {
            return;
        }
        let Some(_guard) = ReentrancyGuard::acquire() else { return };
        self.with_state(|state, writer| {
            let popped = state.stack.clear_for_switch();
            state.add_pending_pops(popped);
            let pops = state.take_pending_pops();
            for &frame in frames {
                state.stack.push(frame);
            }
            writer.write_frames(state.tid(), pops, frames)
        });
    }

    fn record_event(&self, kind: AllocatorKind, address: u64, size: u64) {
        if self.is_deactivated() {
            return;
        }
        if kind.is_host_allocator() && !self.trace_python_allocators {
            return;
        }
        let Some(_guard) = ReentrancyGuard::acquire() else { return };
        self.with_state(|state, writer| {
            if !state.stack.seeded {
                state.stack.seeded = true;
                if let Some(provider) = &self.stack_provider {
                    let chain = provider();
                    for &frame in &chain {
                        state.stack.push(frame);
                    }
                    writer.write_frames(state.tid(), 0, &chain)?;
                }
            }
            let pops = state.take_pending_pops();
            let native_stack = if self.native_traces && !kind.is_deallocator() {
                let mut ips = NativeStackBuf::new();
                capture_native_stack(&mut ips);
                writer.intern_native_stack(&ips)?
            } else {
                NativeStackId::NONE
            };
            writer.write_allocation(
                state.tid(),
                pops,
                AllocationRecord {
                    address,
                    size,
                    kind,
                    native_stack,
                },
            )
        });
    }

    fn spawn_sampler(self: &Arc<Self>) {
        if self.memory_interval_ms == 0 {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(self);
        let interval = Duration::from_millis(self.memory_interval_ms);
        let stop_for_thread = Arc::clone(&stop);
        let spawned = std::thread::Builder::new()
            .name("mneme-memory".to_owned())
            .spawn(move || {
                while !stop_for_thread.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    let Some(core) = weak.upgrade() else { break };
                    if core.is_deactivated() {
                        break;
                    }
                    let Some(_guard) = ReentrancyGuard::acquire() else { continue };
                    let snapshot = MemorySnapshot {
                        time_ms: maps::now_ms(),
                        rss_bytes: maps::read_rss_bytes(),
                    };
                    if core.writer.write_memory_snapshot(snapshot).is_err() {
                        core.deactivate();
                        break;
                    }
                }
            });
        if let Ok(handle) = spawned {
            let mut sampler = self.sampler.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            *sampler = Some(Sampler { stop, handle });
        }
    }

    fn stop_sampler(&self) {
        let sampler = {
            let mut slot = self.sampler.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            slot.take()
        };
        if let Some(sampler) = sampler {
            sampler.stop.store(true, Ordering::Release);
            let _ = sampler.handle.join();
        }
    }

    /// Teardown flush of every thread's coalesced pop run: threads that
    /// went quiet after popping frames still owe the stream their
    /// `FRAME_POP` records, and those must land ahead of the memory-map
    /// section and the trailer.
    fn flush_thread_buffers(&self) {
        let threads: Vec<Arc<ThreadShared>> = {
            let registry = self.threads.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            registry.clone()
        };
        for shared in threads {
            let pops = shared.pending_pops.swap(0, Ordering::AcqRel);
            if pops == 0 {
                continue;
            }
            let tid = ThreadId(shared.tid.load(Ordering::Acquire));
            if self.writer.write_frames(tid, pops, &[]).is_err() {
                self.deactivate();
                return;
            }
        }
    }

    /// Drops the sampler handle without joining (fork child: the thread
    /// does not exist on this side of the fork).
    fn forget_sampler(&self) {
        let mut slot = self.sampler.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(sampler) = slot.take() {
            sampler.stop.store(true, Ordering::Release);
            drop(sampler.handle);
        }
    }

    fn close(&self) -> Result<CaptureStats, TrackerError> {
        self.stop_sampler();
        if self.is_deactivated() {
            return Err(TrackerError::Deactivated);
        }
        self.flush_thread_buffers();
        if self.is_deactivated() {
            return Err(TrackerError::Deactivated);
        }
        let memory_maps = if self.native_traces {
            maps::read_memory_maps().unwrap_or_default()
        } else {
            Vec::new()
        };
        let (n_allocations, n_frames) = self.writer.close(maps::now_ms(), &memory_maps)?;
        Ok(CaptureStats {
            n_allocations,
            n_frames,
        })
    }
}
