//! Native stack capture for allocation events.
//!
//! Walks the current native call stack with the `backtrace` crate's frame
//! walker and collects raw instruction pointers, innermost first. Symbol
//! resolution is deliberately absent here: captures store bare ips plus the
//! memory-map section, and resolution happens offline.
//!
//! Frames belonging to the tracer itself are not part of the user's story:
//! the walker discards everything up to and including its own marker frame,
//! then a fixed number of tracer frames above it (the hook adapter and the
//! recording call).

use smallvec::SmallVec;

/// Hard cap on captured frames; pathological recursion should not bloat
/// every allocation record.
pub const MAX_NATIVE_FRAMES: usize = 128;

/// Tracer frames between [`capture_native_stack`] and the user's code:
/// the recording call and the allocator adapter.
const TRACER_FRAMES: usize = 2;

pub type NativeStackBuf = SmallVec<[u64; 64]>;

/// Captures the current native stack, innermost frame first, excluding the
/// tracer's own frames. If unwinding stops mid-stack the partial prefix
/// collected so far is kept.
#[inline(never)]
pub fn capture_native_stack(out: &mut NativeStackBuf) {
    out.clear();
    let marker = capture_native_stack as *mut std::ffi::c_void;
    let mut passed_marker = false;
    let mut to_skip = TRACER_FRAMES;
    backtrace::trace(|frame| {
        if !passed_marker {
            if frame.symbol_address() == marker {
                passed_marker = true;
            }
            return true;
        }
        if to_skip > 0 {
            to_skip -= 1;
            return true;
        }
        out.push(frame.ip() as u64);
        out.len() < MAX_NATIVE_FRAMES
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn alloc_site(out: &mut NativeStackBuf) {
        capture_native_stack(out);
    }

    #[test]
    fn captures_caller_frames_without_tracer_frames() {
        let mut stack = NativeStackBuf::new();
        // Two wrapper frames stand in for the recording call and the
        // allocator adapter that sit above the marker in production.
        #[inline(never)]
        fn recording_shim(out: &mut NativeStackBuf) {
            alloc_site(out);
        }
        #[inline(never)]
        fn adapter_shim(out: &mut NativeStackBuf) {
            recording_shim(out);
        }
        adapter_shim(&mut stack);
        assert!(!stack.is_empty(), "unwinder produced no frames");
        assert!(stack.len() <= MAX_NATIVE_FRAMES);
        let marker = capture_native_stack as usize as u64;
        assert!(!stack.contains(&marker), "tracer marker frame leaked into capture");
    }
}
