//! Code-object and native-frame interning.
//!
//! Both interners dedupe into shared tables and hand out dense `u32` ids,
//! issued monotonically from 1 (0 is the "no frame" sentinel). The shared
//! tables sit behind a mutex that is only taken on a miss; the hit path for
//! code objects reads a thread-local cache so concurrent allocators on
//! different threads never contend once warm.
//!
//! Interning and record emission are a single atomic step: the defining
//! `CODE_OBJECT` / `NATIVE_FRAME_ID` record is written while the table lock
//! is still held, so no thread can put an id on the wire before the stream
//! has defined it.

use std::{
    cell::RefCell,
    io,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use ahash::AHashMap;

use crate::records::{CodeDescriptor, CodeId, NativeStackId};

/// Distinguishes interner instances across successive trackers so stale
/// thread-local caches from a finished tracker are never trusted.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CODE_CACHE: RefCell<(u64, AHashMap<CodeDescriptor, CodeId>)> =
        RefCell::new((0, AHashMap::new()));
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    // The tables hold plain maps; a panicking writer cannot leave them in a
    // state worth refusing.
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Interner for host code objects.
pub struct CodeInterner {
    generation: u64,
    shared: Mutex<CodeTable>,
}

struct CodeTable {
    ids: AHashMap<CodeDescriptor, CodeId>,
    next: u32,
}

impl CodeInterner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            shared: Mutex::new(CodeTable {
                ids: AHashMap::new(),
                next: 1,
            }),
        }
    }

    /// Returns the id for `descriptor`, interning it on first sight.
    ///
    /// `emit` runs exactly once per new id, under the table lock, and is
    /// expected to write the defining `CODE_OBJECT` record. Lock nesting is
    /// always interner → sink, never the reverse.
    pub fn intern<E>(&self, descriptor: &CodeDescriptor, emit: E) -> io::Result<CodeId>
    where
        E: FnOnce(CodeId, &CodeDescriptor) -> io::Result<()>,
    {
        let cached = CODE_CACHE.with(|cache| {
            let cache = cache.borrow();
            if cache.0 == self.generation {
                cache.1.get(descriptor).copied()
            } else {
                None
            }
        });
        if let Some(id) = cached {
            return Ok(id);
        }

        let id = {
            let mut table = lock(&self.shared);
            if let Some(&id) = table.ids.get(descriptor) {
                id
            } else {
                let id = CodeId::from_raw(table.next);
                emit(id, descriptor)?;
                table.next += 1;
                table.ids.insert(descriptor.clone(), id);
                id
            }
        };

        CODE_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            if cache.0 != self.generation {
                *cache = (self.generation, AHashMap::new());
            }
            cache.1.insert(descriptor.clone(), id);
        });
        Ok(id)
    }

    /// Number of distinct code objects interned so far.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.shared).ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CodeInterner {
    fn default() -> Self {
        Self::new()
    }
}

/// Interner for native call stacks.
///
/// Stacks are stored as a parent-linked trie: each node is one instruction
/// pointer plus the id of the chain below it (towards the outermost frame).
/// Interning a stack therefore emits one record per *new* node only, and an
/// allocation references just the leaf id.
pub struct NativeStackInterner {
    shared: Mutex<NativeTable>,
}

struct NativeTable {
    nodes: AHashMap<(NativeStackId, u64), NativeStackId>,
    next: u32,
}

impl NativeStackInterner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Mutex::new(NativeTable {
                nodes: AHashMap::new(),
                next: 1,
            }),
        }
    }

    /// Interns a stack captured innermost-first (as the unwinder produces
    /// it) and returns the leaf id. `emit` runs once per new node, under
    /// the table lock, with `(ip, parent)`; node ids are implicit in
    /// emission order.
    pub fn intern<E>(&self, ips_innermost_first: &[u64], mut emit: E) -> io::Result<NativeStackId>
    where
        E: FnMut(u64, NativeStackId) -> io::Result<()>,
    {
        if ips_innermost_first.is_empty() {
            return Ok(NativeStackId::NONE);
        }
        let mut table = lock(&self.shared);
        let mut parent = NativeStackId::NONE;
        // Build from the outermost frame so parents exist before children.
        for &ip in ips_innermost_first.iter().rev() {
            if let Some(&node) = table.nodes.get(&(parent, ip)) {
                parent = node;
            } else {
                let node = NativeStackId::from_raw(table.next);
                emit(ip, parent)?;
                table.next += 1;
                table.nodes.insert((parent, ip), node);
                parent = node;
            }
        }
        Ok(parent)
    }

    /// Number of trie nodes interned so far.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.shared).nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NativeStackInterner {
    fn default() -> Self {
        Self::new()
    }
}
