//! The allocator hook layer.
//!
//! Hooks wrap the process allocator as a table of adapters: each adapter
//! calls the real symbol, then reports the observed event to the active
//! tracker. Dispatch is a compile-time trait plus a match on
//! [`AllocatorKind`]; nothing is rebound at runtime.
//!
//! Reentrancy is the central hazard: the recorder allocates too, and those
//! allocations must not be observed (they would recurse forever). Every
//! recording path runs under a per-thread [`ReentrancyGuard`]; while one is
//! held, further events on the same thread are invisible.

use std::{
    alloc::{GlobalAlloc, Layout},
    cell::Cell,
    ffi::c_void,
};

use crate::{records::AllocatorKind, tracker};

// `valloc`/`pvalloc` are deprecated glibc allocator extensions no longer
// declared by the `libc` crate; declare them ourselves since the hooks
// below still need to forward to the real symbols.
#[cfg(target_os = "linux")]
unsafe extern "C" {
    fn valloc(size: libc::size_t) -> *mut c_void;
    #[cfg(target_env = "gnu")]
    fn pvalloc(size: libc::size_t) -> *mut c_void;
}

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Scoped per-thread reentrancy flag.
///
/// [`ReentrancyGuard::acquire`] returns `None` when the current thread is
/// already inside a hook; the flag is cleared on drop on all paths,
/// including unwinds.
pub struct ReentrancyGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ReentrancyGuard {
    #[must_use]
    pub fn acquire() -> Option<Self> {
        IN_HOOK.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(Self {
                    _not_send: std::marker::PhantomData,
                })
            }
        })
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        IN_HOOK.with(|flag| flag.set(false));
    }
}

/// The real allocator underneath the hooks.
///
/// Production uses [`LibcAllocator`]; tests substitute an arena that hands
/// out predictable addresses without touching the process heap.
pub trait SystemAllocator {
    /// # Safety
    /// Same contract as the underlying C allocator entry point.
    unsafe fn malloc(&self, size: usize) -> *mut c_void;
    /// # Safety
    /// Same contract as the underlying C allocator entry point.
    unsafe fn calloc(&self, count: usize, size: usize) -> *mut c_void;
    /// # Safety
    /// `ptr` must be null or a live allocation from this allocator.
    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void;
    /// # Safety
    /// `ptr` must be null or a live allocation from this allocator.
    unsafe fn free(&self, ptr: *mut c_void);
    /// # Safety
    /// Same contract as `posix_memalign(3)`.
    unsafe fn posix_memalign(&self, out: &mut *mut c_void, align: usize, size: usize) -> i32;
    /// # Safety
    /// Same contract as `aligned_alloc(3)`.
    unsafe fn aligned_alloc(&self, align: usize, size: usize) -> *mut c_void;
    /// # Safety
    /// Same contract as `mmap(2)`.
    unsafe fn mmap(&self, addr: *mut c_void, len: usize, prot: i32, flags: i32, fd: i32, offset: i64) -> *mut c_void;
    /// # Safety
    /// Same contract as `munmap(2)`.
    unsafe fn munmap(&self, addr: *mut c_void, len: usize) -> i32;
    /// # Safety
    /// Same contract as `valloc(3)`.
    #[cfg(target_os = "linux")]
    unsafe fn valloc(&self, size: usize) -> *mut c_void;
    /// # Safety
    /// Same contract as `memalign(3)`.
    #[cfg(target_os = "linux")]
    unsafe fn memalign(&self, align: usize, size: usize) -> *mut c_void;
    /// # Safety
    /// Same contract as `pvalloc(3)`.
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    unsafe fn pvalloc(&self, size: usize) -> *mut c_void;
}

/// Adapter over the C library's allocator symbols.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcAllocator;

impl SystemAllocator for LibcAllocator {
    unsafe fn malloc(&self, size: usize) -> *mut c_void {
        // SAFETY: forwarded verbatim to libc.
        unsafe { libc::malloc(size) }
    }

    unsafe fn calloc(&self, count: usize, size: usize) -> *mut c_void {
        // SAFETY: forwarded verbatim to libc.
        unsafe { libc::calloc(count, size) }
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        // SAFETY: caller upholds the realloc contract.
        unsafe { libc::realloc(ptr, size) }
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        // SAFETY: caller upholds the free contract.
        unsafe { libc::free(ptr) }
    }

    unsafe fn posix_memalign(&self, out: &mut *mut c_void, align: usize, size: usize) -> i32 {
        // SAFETY: `out` is a valid pointer-to-pointer for the call.
        unsafe { libc::posix_memalign(out, align, size) }
    }

    unsafe fn aligned_alloc(&self, align: usize, size: usize) -> *mut c_void {
        // SAFETY: forwarded verbatim to libc.
        unsafe { libc::aligned_alloc(align, size) }
    }

    unsafe fn mmap(&self, addr: *mut c_void, len: usize, prot: i32, flags: i32, fd: i32, offset: i64) -> *mut c_void {
        // SAFETY: caller upholds the mmap contract.
        unsafe { libc::mmap(addr, len, prot, flags, fd, offset) }
    }

    unsafe fn munmap(&self, addr: *mut c_void, len: usize) -> i32 {
        // SAFETY: caller upholds the munmap contract.
        unsafe { libc::munmap(addr, len) }
    }

    #[cfg(target_os = "linux")]
    unsafe fn valloc(&self, size: usize) -> *mut c_void {
        // SAFETY: forwarded verbatim to libc.
        unsafe { valloc(size) }
    }

    #[cfg(target_os = "linux")]
    unsafe fn memalign(&self, align: usize, size: usize) -> *mut c_void {
        // SAFETY: forwarded verbatim to libc.
        unsafe { libc::memalign(align, size) }
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    unsafe fn pvalloc(&self, size: usize) -> *mut c_void {
        // SAFETY: forwarded verbatim to libc.
        unsafe { pvalloc(size) }
    }
}

/// The hook table: every entry calls the real allocator, then reports the
/// event to the active tracker. This is what a traced process routes its
/// allocator calls through.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllocatorTable<A: SystemAllocator = LibcAllocator> {
    real: A,
}

impl<A: SystemAllocator> AllocatorTable<A> {
    #[must_use]
    pub fn with_allocator(real: A) -> Self {
        Self { real }
    }

    /// # Safety
    /// Same contract as `malloc(3)`.
    pub unsafe fn malloc(&self, size: usize) -> *mut c_void {
        // SAFETY: forwarded to the real allocator.
        let result = unsafe { self.real.malloc(size) };
        if !result.is_null() {
            tracker::record_foreign_event(AllocatorKind::Malloc, result as usize as u64, size as u64);
        }
        result
    }

    /// # Safety
    /// Same contract as `calloc(3)`.
    pub unsafe fn calloc(&self, count: usize, size: usize) -> *mut c_void {
        // SAFETY: forwarded to the real allocator.
        let result = unsafe { self.real.calloc(count, size) };
        if !result.is_null() {
            tracker::record_foreign_event(AllocatorKind::Calloc, result as usize as u64, (count * size) as u64);
        }
        result
    }

    /// # Safety
    /// Same contract as `realloc(3)`.
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        // SAFETY: forwarded to the real allocator.
        let result = unsafe { self.real.realloc(ptr, size) };
        if !result.is_null() {
            // Reported as a free of the old block plus a fresh allocation,
            // so aggregators need no realloc special case.
            if !ptr.is_null() {
                tracker::record_foreign_event(AllocatorKind::Free, ptr as usize as u64, 0);
            }
            tracker::record_foreign_event(AllocatorKind::Realloc, result as usize as u64, size as u64);
        }
        result
    }

    /// # Safety
    /// Same contract as `free(3)`.
    pub unsafe fn free(&self, ptr: *mut c_void) {
        // SAFETY: forwarded to the real allocator.
        unsafe { self.real.free(ptr) };
        if !ptr.is_null() {
            tracker::record_foreign_event(AllocatorKind::Free, ptr as usize as u64, 0);
        }
    }

    /// # Safety
    /// Same contract as `posix_memalign(3)`.
    pub unsafe fn posix_memalign(&self, out: &mut *mut c_void, align: usize, size: usize) -> i32 {
        // SAFETY: forwarded to the real allocator.
        let rc = unsafe { self.real.posix_memalign(out, align, size) };
        if rc == 0 && !out.is_null() {
            tracker::record_foreign_event(AllocatorKind::PosixMemalign, *out as usize as u64, size as u64);
        }
        rc
    }

    /// # Safety
    /// Same contract as `aligned_alloc(3)`.
    pub unsafe fn aligned_alloc(&self, align: usize, size: usize) -> *mut c_void {
        // SAFETY: forwarded to the real allocator.
        let result = unsafe { self.real.aligned_alloc(align, size) };
        if !result.is_null() {
            tracker::record_foreign_event(AllocatorKind::AlignedAlloc, result as usize as u64, size as u64);
        }
        result
    }

    /// # Safety
    /// Same contract as `mmap(2)`.
    pub unsafe fn mmap(&self, addr: *mut c_void, len: usize, prot: i32, flags: i32, fd: i32, offset: i64) -> *mut c_void {
        // SAFETY: forwarded to the real allocator.
        let result = unsafe { self.real.mmap(addr, len, prot, flags, fd, offset) };
        if result != libc::MAP_FAILED {
            tracker::record_foreign_event(AllocatorKind::Mmap, result as usize as u64, len as u64);
        }
        result
    }

    /// # Safety
    /// Same contract as `munmap(2)`.
    pub unsafe fn munmap(&self, addr: *mut c_void, len: usize) -> i32 {
        // SAFETY: forwarded to the real allocator.
        let rc = unsafe { self.real.munmap(addr, len) };
        if rc == 0 {
            tracker::record_foreign_event(AllocatorKind::Munmap, addr as usize as u64, len as u64);
        }
        rc
    }

    /// # Safety
    /// Same contract as `valloc(3)`.
    #[cfg(target_os = "linux")]
    pub unsafe fn valloc(&self, size: usize) -> *mut c_void {
        // SAFETY: forwarded to the real allocator.
        let result = unsafe { self.real.valloc(size) };
        if !result.is_null() {
            tracker::record_foreign_event(AllocatorKind::Valloc, result as usize as u64, size as u64);
        }
        result
    }

    /// # Safety
    /// Same contract as `memalign(3)`.
    #[cfg(target_os = "linux")]
    pub unsafe fn memalign(&self, align: usize, size: usize) -> *mut c_void {
        // SAFETY: forwarded to the real allocator.
        let result = unsafe { self.real.memalign(align, size) };
        if !result.is_null() {
            tracker::record_foreign_event(AllocatorKind::Memalign, result as usize as u64, size as u64);
        }
        result
    }

    /// # Safety
    /// Same contract as `pvalloc(3)`.
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    pub unsafe fn pvalloc(&self, size: usize) -> *mut c_void {
        // SAFETY: forwarded to the real allocator.
        let result = unsafe { self.real.pvalloc(size) };
        if !result.is_null() {
            tracker::record_foreign_event(AllocatorKind::Pvalloc, result as usize as u64, size as u64);
        }
        result
    }
}

/// `GlobalAlloc` wrapper so a Rust host embedding the tracker observes its
/// own heap traffic through the same hook layer:
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: TrackingAllocator<std::alloc::System> = TrackingAllocator(std::alloc::System);
/// ```
pub struct TrackingAllocator<A>(pub A);

// SAFETY: every call forwards to the inner allocator unchanged; recording
// happens after the fact and never observes recorder-internal allocations
// thanks to the reentrancy guard.
unsafe impl<A: GlobalAlloc> GlobalAlloc for TrackingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: forwarded to the inner allocator.
        let result = unsafe { self.0.alloc(layout) };
        if !result.is_null() {
            tracker::record_foreign_event(AllocatorKind::Malloc, result as usize as u64, layout.size() as u64);
        }
        result
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: forwarded to the inner allocator.
        let result = unsafe { self.0.alloc_zeroed(layout) };
        if !result.is_null() {
            tracker::record_foreign_event(AllocatorKind::Calloc, result as usize as u64, layout.size() as u64);
        }
        result
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: forwarded to the inner allocator.
        unsafe { self.0.dealloc(ptr, layout) };
        tracker::record_foreign_event(AllocatorKind::Free, ptr as usize as u64, 0);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: forwarded to the inner allocator.
        let result = unsafe { self.0.realloc(ptr, layout, new_size) };
        if !result.is_null() {
            tracker::record_foreign_event(AllocatorKind::Free, ptr as usize as u64, 0);
            tracker::record_foreign_event(AllocatorKind::Realloc, result as usize as u64, new_size as u64);
        }
        result
    }
}
