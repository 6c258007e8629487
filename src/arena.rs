//! Managed arena (L3): composes the backing block chain and handle table
//! into the public allocation API, and links arenas into a parent/child
//! tree.
//!
//! Almost every failure surface here is fatal by design — see `SPEC_FULL.md`
//! §7. `alloc` aborts the process on true allocator exhaustion (matching the
//! systems-language convention that arena allocation never returns null);
//! `pin` of an invalid handle and unbalanced `unpin` are `debug_assert!`
//! failures, undefined behavior in release builds, exactly as specified.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::block::{align_up, Block};
use crate::config::ArenaConfig;
use crate::handle::{Handle, HANDLE_NULL};
use crate::legacy::LegacyState;
use crate::table::HandleTable;

#[cfg(feature = "gc_logging")]
use tracing::trace;

/// A cleanup callback registered against an arena.
pub type CleanupFn = Box<dyn FnOnce() + Send>;

pub(crate) struct CleanupNode {
    pub(crate) priority: i32,
    pub(crate) key: usize,
    pub(crate) callback: Option<CleanupFn>,
}

pub(crate) struct AllocState {
    /// Head of the live block chain (owned).
    pub(crate) first: *mut Block,
    /// Head of the retired block chain (owned; linked via `Block::next`).
    pub(crate) retired_head: *mut Block,
    /// Recyclable handle indices.
    pub(crate) free_list: Vec<u32>,
}

// SAFETY: raw block pointers here are exclusively owned by the arena that
// created them; all mutation is serialized by `ArenaInner::alloc_state`.
unsafe impl Send for AllocState {}

pub(crate) struct ArenaInner {
    pub(crate) config: ArenaConfig,

    // L1
    pub(crate) current: AtomicPtr<Block>,
    pub(crate) block_epoch: AtomicU32,
    pub(crate) total_allocated: AtomicUsize,
    pub(crate) alloc_state: Mutex<AllocState>,

    // L2
    pub(crate) table: HandleTable,
    pub(crate) table_count: AtomicU32,

    // stats
    pub(crate) live_bytes: AtomicUsize,
    pub(crate) dead_bytes: AtomicUsize,

    // tree
    pub(crate) parent: Option<Arc<ArenaInner>>,
    pub(crate) children: Mutex<Vec<Weak<ArenaInner>>>,
    pub(crate) root: Weak<ArenaInner>,
    pub(crate) is_root: bool,
    pub(crate) destroying: AtomicBool,
    pub(crate) gc_processing: AtomicI32,

    /// Tree-wide pin/lease lock. Only meaningful on the root; children
    /// reach it through `root`.
    pub(crate) pin_mutex: Mutex<()>,

    pub(crate) cleanup_list: Mutex<Vec<CleanupNode>>,

    // GC threads (root only)
    pub(crate) running: AtomicBool,
    pub(crate) gc_cleaner_epoch: AtomicU32,
    pub(crate) gc_compactor_epoch: AtomicU32,
    pub(crate) gc_threads: Mutex<Option<crate::gc::GcThreads>>,

    // legacy bridge (§3 supplemental)
    pub(crate) legacy: Mutex<LegacyState>,
}

impl ArenaInner {
    pub(crate) fn root(&self) -> Arc<ArenaInner> {
        self.root.upgrade().expect("root arena dropped while a descendant is alive")
    }

    pub(crate) fn block_epoch(&self) -> u32 {
        self.block_epoch.load(Ordering::Acquire)
    }

    pub(crate) fn current_block(&self) -> *mut Block {
        self.current.load(Ordering::Acquire)
    }
}

/// A handle-based managed memory arena with a concurrent background GC.
///
/// Cheap to clone (an `Arc` around the shared state); clones refer to the
/// same arena node.
#[derive(Clone)]
pub struct ManagedArena {
    pub(crate) inner: Arc<ArenaInner>,
}

impl ManagedArena {
    /// Create a root arena and start its cleaner and compactor threads.
    pub fn create_root() -> Self {
        Self::create_root_with_config(ArenaConfig::default())
    }

    /// Create a root arena with custom tunables.
    pub fn create_root_with_config(config: ArenaConfig) -> Self {
        let block_size = config.block_size;
        let table_cap = config.table_init_capacity;
        let inner = Arc::new_cyclic(|weak_self| {
            let first = Box::into_raw(Block::new(block_size));
            ArenaInner {
                config,
                current: AtomicPtr::new(first),
                block_epoch: AtomicU32::new(0),
                total_allocated: AtomicUsize::new(block_size),
                alloc_state: Mutex::new(AllocState {
                    first,
                    retired_head: std::ptr::null_mut(),
                    free_list: Vec::new(),
                }),
                table: HandleTable::new(table_cap),
                table_count: AtomicU32::new(1), // index 0 reserved for HANDLE_NULL
                live_bytes: AtomicUsize::new(0),
                dead_bytes: AtomicUsize::new(0),
                parent: None,
                children: Mutex::new(Vec::new()),
                root: weak_self.clone(),
                is_root: true,
                destroying: AtomicBool::new(false),
                gc_processing: AtomicI32::new(0),
                pin_mutex: Mutex::new(()),
                cleanup_list: Mutex::new(Vec::new()),
                running: AtomicBool::new(true),
                gc_cleaner_epoch: AtomicU32::new(0),
                gc_compactor_epoch: AtomicU32::new(0),
                gc_threads: Mutex::new(None),
                legacy: Mutex::new(LegacyState::default()),
            }
        });
        let arena = ManagedArena { inner };
        crate::gc::start_threads(&arena);
        arena
    }

    /// Create a child arena for a lexical scope. No GC threads of its own —
    /// the root's threads walk the whole tree.
    pub fn create_child(&self) -> ManagedArena {
        let block_size = self.inner.config.block_size;
        let table_cap = self.inner.config.table_init_capacity;
        let first = Box::into_raw(Block::new(block_size));
        let inner = Arc::new(ArenaInner {
            config: self.inner.config.clone(),
            current: AtomicPtr::new(first),
            block_epoch: AtomicU32::new(0),
            total_allocated: AtomicUsize::new(block_size),
            alloc_state: Mutex::new(AllocState {
                first,
                retired_head: std::ptr::null_mut(),
                free_list: Vec::new(),
            }),
            table: HandleTable::new(table_cap),
            table_count: AtomicU32::new(1),
            live_bytes: AtomicUsize::new(0),
            dead_bytes: AtomicUsize::new(0),
            parent: Some(self.inner.clone()),
            children: Mutex::new(Vec::new()),
            root: self.inner.root.clone(),
            is_root: false,
            destroying: AtomicBool::new(false),
            gc_processing: AtomicI32::new(0),
            pin_mutex: Mutex::new(()),
            cleanup_list: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            gc_cleaner_epoch: AtomicU32::new(0),
            gc_compactor_epoch: AtomicU32::new(0),
            gc_threads: Mutex::new(None),
            legacy: Mutex::new(LegacyState::default()),
        });
        self.inner
            .children
            .lock()
            .push(Arc::downgrade(&inner));
        ManagedArena { inner }
    }

    /// Get the root arena from any arena in the tree.
    pub fn root(&self) -> ManagedArena {
        ManagedArena { inner: self.inner.root() }
    }

    fn aligned_size(size: usize) -> usize {
        align_up(size, align_of::<usize>())
    }

    /// Allocate `size` bytes, optionally retiring `old`. Returns a new
    /// handle. Aborts the process on allocator exhaustion (§7).
    pub fn alloc(&self, old: Handle, size: usize) -> Handle {
        let (ptr, block, actual_size) = self.bump_alloc(size);
        let idx = self.alloc_index();
        let entry = self.inner.table.get(idx);
        {
            let _guard = self.inner.root().pin_mutex.lock();
            // SAFETY: brand-new slot, not yet published to any other thread.
            unsafe { entry.install(ptr, actual_size, block) };
        }
        self.inner.live_bytes.fetch_add(actual_size, Ordering::AcqRel);
        #[cfg(feature = "gc_logging")]
        trace!(handle = idx, size = actual_size, "alloc");
        if old != HANDLE_NULL {
            self.mark_dead(old);
        }
        idx
    }

    fn bump_alloc(&self, size: usize) -> (*mut u8, *mut Block, usize) {
        let aligned = Self::aligned_size(size.max(1));
        if aligned > self.inner.config.block_size {
            // Oversize: dedicated block, always goes through the slow path.
            return self.bump_alloc_slow(aligned);
        }
        loop {
            let epoch_before = self.inner.block_epoch();
            let block_ptr = self.inner.current_block();
            // SAFETY: `current` always points at a live block owned by this
            // arena until the arena is destroyed.
            let block = unsafe { &*block_ptr };
            if let Some(offset) = block.try_bump(aligned) {
                let epoch_after = self.inner.block_epoch();
                if epoch_after == epoch_before {
                    let ptr = unsafe { block.data_ptr().add(offset) };
                    return (ptr, block_ptr, aligned);
                }
                // Compactor swapped the chain mid-flight: the bytes we just
                // claimed are in a block that may be retired. Retry.
                continue;
            }
            return self.bump_alloc_slow(aligned);
        }
    }

    fn bump_alloc_slow(&self, aligned: usize) -> (*mut u8, *mut Block, usize) {
        let mut state = self.inner.alloc_state.lock();
        // Double-check: another thread may have appended a block already.
        loop {
            let block_ptr = self.inner.current_block();
            let block = unsafe { &*block_ptr };
            if let Some(offset) = block.try_bump(aligned) {
                let ptr = unsafe { block.data_ptr().add(offset) };
                return (ptr, block_ptr, aligned);
            }
            let new_size = aligned.max(self.inner.config.block_size);
            let new_block = Box::into_raw(Block::new(new_size));
            unsafe { (*block_ptr).set_next(new_block) };
            self.inner.current.store(new_block, Ordering::Release);
            self.inner
                .total_allocated
                .fetch_add(new_size, Ordering::AcqRel);
            if state.first.is_null() {
                state.first = new_block;
            }
        }
    }

    /// Bump-allocate while the caller already holds `alloc_state` locked.
    /// Used by the compactor's orphan-rescue pass, which must not re-enter
    /// the lock `bump_alloc_slow` would otherwise take.
    pub(crate) fn bump_alloc_with_state(
        &self,
        state: &mut AllocState,
        size: usize,
    ) -> (*mut u8, *mut Block) {
        let aligned = Self::aligned_size(size.max(1));
        loop {
            let block_ptr = self.inner.current_block();
            let block = unsafe { &*block_ptr };
            if let Some(offset) = block.try_bump(aligned) {
                let ptr = unsafe { block.data_ptr().add(offset) };
                return (ptr, block_ptr);
            }
            let new_size = aligned.max(self.inner.config.block_size);
            let new_block = Box::into_raw(Block::new(new_size));
            unsafe { (*block_ptr).set_next(new_block) };
            self.inner.current.store(new_block, Ordering::Release);
            self.inner
                .total_allocated
                .fetch_add(new_size, Ordering::AcqRel);
            if state.first.is_null() {
                state.first = new_block;
            }
        }
    }

    fn alloc_index(&self) -> u32 {
        let mut state = self.inner.alloc_state.lock();
        if let Some(idx) = state.free_list.pop() {
            return idx;
        }
        let idx = self.inner.table_count.fetch_add(1, Ordering::AcqRel);
        self.inner.table.ensure_capacity(idx + 1);
        idx
    }

    /// # Safety
    /// Caller must hold no lock that would deadlock with `pin_mutex`.
    pub(crate) fn recycle_index(&self, idx: u32) {
        let mut state = self.inner.alloc_state.lock();
        state.free_list.push(idx);
    }

    /// Pin a handle: returns a raw pointer valid until the matching `unpin`.
    pub fn pin(&self, h: Handle) -> *mut u8 {
        debug_assert_ne!(h, HANDLE_NULL, "pin of the null handle");
        let entry = self.inner.table.get(h);
        let root = self.inner.root();
        let _guard = root.pin_mutex.lock();
        debug_assert!(!entry.is_dead(), "pin of a dead handle");
        unsafe {
            entry.lease_inc();
            let slot = entry.slot();
            if !slot.block.is_null() {
                (*slot.block).inc_lease();
            }
            slot.ptr
        }
    }

    /// Permanently pin a handle: the entry is never relocated and its block
    /// is never retired while it is occupied.
    pub fn pin_permanent(&self, h: Handle) -> *mut u8 {
        let entry = self.inner.table.get(h);
        let root = self.inner.root();
        let _guard = root.pin_mutex.lock();
        entry.set_pinned_permanent();
        unsafe {
            let slot = entry.slot();
            if !slot.block.is_null() {
                (*slot.block).inc_pinned();
            }
            slot.ptr
        }
    }

    /// Release a lease taken by `pin`.
    pub fn unpin(&self, h: Handle) {
        let entry = self.inner.table.get(h);
        let root = self.inner.root();
        let _guard = root.pin_mutex.lock();
        unsafe {
            entry.lease_dec();
            let slot = entry.slot();
            if !slot.block.is_null() {
                (*slot.block).dec_lease();
            }
        }
    }

    /// Mark a handle dead. Its backing bytes become reclaimable once the
    /// cleaner and compactor observe it.
    pub fn mark_dead(&self, h: Handle) {
        if h == HANDLE_NULL {
            return;
        }
        let entry = self.inner.table.get(h);
        if entry.is_dead() {
            return;
        }
        let root = self.inner.root();
        let _guard = root.pin_mutex.lock();
        let size = unsafe {
            let slot = entry.slot();
            // A free-listed (or never-allocated) slot reads ptr=NULL,
            // dead=false (§3 invariant 1). Marking it dead would leave it
            // both dead and still on the free list, so the next cleaner
            // pass would recycle its index a second time.
            if slot.ptr.is_null() {
                return;
            }
            slot.size
        };
        entry.mark_dead();
        self.inner.dead_bytes.fetch_add(size, Ordering::AcqRel);
        self.inner.live_bytes.fetch_sub(size, Ordering::AcqRel);
    }

    /// Copy a handle's payload from `src` into `dest`, producing a fresh
    /// handle and marking the source dead. One-way: child → ancestor.
    pub fn promote(dest: &ManagedArena, src: &ManagedArena, h: Handle) -> Handle {
        let size = {
            let entry = src.inner.table.get(h);
            let _guard = src.inner.root().pin_mutex.lock();
            unsafe { entry.slot().size }
        };
        let src_ptr = src.pin(h);
        let bytes = unsafe { std::slice::from_raw_parts(src_ptr, size) };
        let new_handle = dest.alloc(HANDLE_NULL, size);
        let dest_ptr = dest.pin(new_handle);
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest_ptr, size) };
        dest.unpin(new_handle);
        src.unpin(h);
        src.mark_dead(h);
        new_handle
    }

    /// Duplicate a NUL-terminated UTF-8 string into the arena.
    pub fn strdup(&self, old: Handle, s: &str) -> Handle {
        self.strndup(old, s, s.len())
    }

    /// Duplicate up to `n` bytes of `s`, NUL-terminated, into the arena.
    pub fn strndup(&self, old: Handle, s: &str, n: usize) -> Handle {
        let n = n.min(s.len());
        let bytes = &s.as_bytes()[..n];
        let h = self.alloc(HANDLE_NULL, n + 1);
        let ptr = self.pin(h);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, n);
            *ptr.add(n) = 0;
        }
        self.unpin(h);
        if old != HANDLE_NULL {
            self.mark_dead(old);
        }
        h
    }

    /// Register a cleanup callback, run on `reset`/`destroy` in ascending
    /// priority order. `key` identifies the registration for
    /// [`ManagedArena::remove_cleanup`].
    pub fn register_cleanup(&self, key: usize, priority: i32, callback: CleanupFn) {
        let mut list = self.inner.cleanup_list.lock();
        list.push(CleanupNode {
            priority,
            key,
            callback: Some(callback),
        });
        list.sort_by_key(|n| n.priority);
    }

    /// Remove a previously registered cleanup callback by its key.
    pub fn remove_cleanup(&self, key: usize) {
        self.inner.cleanup_list.lock().retain(|n| n.key != key);
    }

    fn run_cleanups(&self) {
        let callbacks: Vec<CleanupFn> = {
            let mut list = self.inner.cleanup_list.lock();
            list.sort_by_key(|n| n.priority);
            list.drain(..).filter_map(|n| n.callback).collect()
        };
        for cb in callbacks {
            cb();
        }
    }

    /// Run cleanups and mark every live entry dead. Memory is reclaimed by
    /// the GC threads afterward.
    pub fn reset(&self) {
        self.drain_legacy_resources();
        self.run_cleanups();
        let count = self.inner.table_count.load(Ordering::Acquire);
        for idx in 1..count {
            self.mark_dead(idx);
        }
    }

    /// Destroy a child arena: unlinks it from its parent and retires its
    /// blocks to the root's retirement flow.
    pub fn destroy_child(self) {
        assert!(!self.inner.is_root, "destroy_child called on the root arena; use destroy()");
        self.inner.destroying.store(true, Ordering::Release);
        while self.inner.gc_processing.load(Ordering::Acquire) > 0 {
            std::thread::yield_now();
        }
        self.drain_legacy_resources();
        self.run_cleanups();
        let count = self.inner.table_count.load(Ordering::Acquire);
        for idx in 1..count {
            self.mark_dead(idx);
        }
        if let Some(parent) = &self.inner.parent {
            parent
                .children
                .lock()
                .retain(|w| !std::ptr::eq(w.as_ptr(), Arc::as_ptr(&self.inner)));
            let mut alloc = self.inner.alloc_state.lock();
            let mut parent_state = parent.alloc_state.lock();
            retire_chain_into(&mut parent_state.retired_head, alloc.first);
            alloc.first = std::ptr::null_mut();
            retire_chain_into(&mut parent_state.retired_head, alloc.retired_head);
            alloc.retired_head = std::ptr::null_mut();
        }
    }

    /// Destroy the root arena: stops the GC threads and frees everything,
    /// including any remaining children.
    pub fn destroy(self) {
        assert!(self.inner.is_root, "destroy called on a non-root arena; use destroy_child()");
        self.inner.running.store(false, Ordering::Release);
        if let Some(threads) = self.inner.gc_threads.lock().take() {
            threads.join();
        }
        drain_legacy_tree(&self.inner);
        self.run_cleanups();
        free_tree(&self.inner);
    }

    /// Block until both GC threads complete one full iteration (500ms cap).
    pub fn gc_flush(&self) {
        let root = self.inner.root();
        let cleaner_before = root.gc_cleaner_epoch.load(Ordering::Acquire);
        let compactor_before = root.gc_compactor_epoch.load(Ordering::Acquire);
        let deadline = std::time::Instant::now() + root.config.gc_flush_timeout;
        while std::time::Instant::now() < deadline {
            let cleaner_now = root.gc_cleaner_epoch.load(Ordering::Acquire);
            let compactor_now = root.gc_compactor_epoch.load(Ordering::Acquire);
            if cleaner_now != cleaner_before && compactor_now != compactor_before {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    /// Force a compaction pass on this arena (for testing).
    pub fn force_compact(&self) {
        crate::gc::compactor::compact_arena(self);
    }

    pub fn total_allocated(&self) -> usize {
        self.inner.total_allocated.load(Ordering::Acquire)
    }

    pub fn live_count(&self) -> usize {
        let count = self.inner.table_count.load(Ordering::Acquire);
        let mut n = 0;
        for idx in 1..count {
            if !self.inner.table.get(idx).is_dead() {
                n += 1;
            }
        }
        n
    }

    pub fn dead_count(&self) -> usize {
        let count = self.inner.table_count.load(Ordering::Acquire);
        let mut n = 0;
        for idx in 1..count {
            if self.inner.table.get(idx).is_dead() {
                n += 1;
            }
        }
        n
    }

    pub fn fragmentation(&self) -> f64 {
        let live = self.inner.live_bytes.load(Ordering::Acquire) as f64;
        let dead = self.inner.dead_bytes.load(Ordering::Acquire) as f64;
        if live + dead == 0.0 {
            0.0
        } else {
            dead / (live + dead)
        }
    }

    pub fn arena_used(&self) -> usize {
        self.total_allocated()
    }

    pub(crate) fn handle_ptr(&self, h: Handle) -> NonNull<u8> {
        let entry = self.inner.table.get(h);
        let root = self.inner.root();
        let _guard = root.pin_mutex.lock();
        unsafe { NonNull::new(entry.slot().ptr).expect("dangling handle") }
    }
}

fn retire_chain_into(retired_head: &mut *mut Block, chain: *mut Block) {
    if chain.is_null() {
        return;
    }
    let mut tail = chain;
    unsafe {
        (*tail).set_retired(true);
        while !(*tail).next().is_null() {
            tail = (*tail).next();
            (*tail).set_retired(true);
        }
        (*tail).set_next(*retired_head);
    }
    *retired_head = chain;
}

/// Run every arena's legacy file/thread drain, depth-first, before the tree
/// is freed (children before their parent, matching `drain_legacy_resources`
/// scoping on `destroy_child`).
fn drain_legacy_tree(root: &Arc<ArenaInner>) {
    let children: Vec<Arc<ArenaInner>> = root
        .children
        .lock()
        .iter()
        .filter_map(|w| w.upgrade())
        .collect();
    for child in children {
        drain_legacy_tree(&child);
    }
    ManagedArena { inner: root.clone() }.drain_legacy_resources();
}

fn free_tree(root: &Arc<ArenaInner>) {
    let children: Vec<Arc<ArenaInner>> = root
        .children
        .lock()
        .iter()
        .filter_map(|w| w.upgrade())
        .collect();
    for child in children {
        free_tree(&child);
    }
    let mut state = root.alloc_state.lock();
    free_chain(state.first);
    free_chain(state.retired_head);
    state.first = std::ptr::null_mut();
    state.retired_head = std::ptr::null_mut();
}

pub(crate) fn free_chain(mut block: *mut Block) {
    while !block.is_null() {
        let next = unsafe { (*block).next() };
        unsafe { drop(Box::from_raw(block)) };
        block = next;
    }
}
