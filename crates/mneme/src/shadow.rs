//! Per-thread shadow stacks.
//!
//! Each traced thread mirrors its host call stack here, driven by the
//! host's frame-enter/leave callbacks. Pops are not written to the stream
//! one by one: the tracker coalesces a run of consecutive pops into a
//! single pending count (kept in its per-thread context, where teardown
//! can still reach it) and flushes the run as chained `FRAME_POP` records
//! before the next event that needs the stack to be current.

use smallvec::SmallVec;

use crate::records::ShadowFrame;

/// The shadow call stack of one thread. Mutated only by its owning thread.
#[derive(Debug, Default)]
pub struct ThreadStack {
    frames: SmallVec<[ShadowFrame; 32]>,
    /// Set once the stack has been initialized, either by real frame
    /// activity or by seeding from the host's live frame chain.
    pub seeded: bool,
}

impl ThreadStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn frames(&self) -> &[ShadowFrame] {
        &self.frames
    }

    /// Pushes a frame. The caller must have drained its pending pops first
    /// so the record stream observes the pops before the push.
    pub fn push(&mut self, frame: ShadowFrame) {
        self.frames.push(frame);
        self.seeded = true;
    }

    /// Pops up to `count` frames, clamped to the current depth (a host
    /// that unwinds through frames entered before tracking started pops
    /// more than we ever saw pushed). Returns the number actually popped,
    /// which the caller adds to its coalesced pending-pop count.
    pub fn pop(&mut self, count: u32) -> u32 {
        let popped = count.min(u32::try_from(self.frames.len()).unwrap_or(u32::MAX));
        self.frames.truncate(self.frames.len() - popped as usize);
        self.seeded = true;
        popped
    }

    /// Empties the whole stack for a cooperative stack switch. Returns the
    /// number of frames popped; the incoming task's chain must then be
    /// pushed by the caller after flushing the pops, so record order stays
    /// pop-then-push.
    pub fn clear_for_switch(&mut self) -> u32 {
        let depth = u32::try_from(self.frames.len()).unwrap_or(u32::MAX);
        self.pop(depth)
    }
}
