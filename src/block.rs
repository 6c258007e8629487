//! Backing block chain (L1): lock-free bump allocation with epoch-guarded
//! compaction safety.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// A contiguous backing memory region served by a lock-free bump cursor.
///
/// Analogous in role to the teacher's `MarkedBlock`, but bump-only (no
/// free-cell bitmap): this design never reuses space inside a live block,
/// it only ever appends, matching `SPEC_FULL.md` §4.1.
pub(crate) struct Block {
    data: NonNull<u8>,
    layout: Layout,
    capacity: usize,
    /// Bytes claimed so far. CAS target for the lock-free fast path, padded
    /// so contending allocator threads don't false-share the cache line with
    /// `next`/`lease_count`/`pinned_count`, which are touched by unrelated
    /// pin/unpin and compactor traffic.
    used: CachePadded<AtomicUsize>,
    /// Next block in the arena's chain (live or retired).
    next: AtomicPtr<Block>,
    /// Number of leased (transiently pinned) entries whose `block == self`.
    lease_count: AtomicUsize,
    /// Number of permanently pinned entries whose `block == self`.
    pinned_count: AtomicUsize,
    /// Set by the compactor when the block is no longer part of the active
    /// chain. Checked by `retire_drained_blocks` before freeing.
    retired: std::sync::atomic::AtomicBool,
}

// SAFETY: `data` points at a heap allocation owned exclusively by this
// `Block`; all shared mutation goes through the atomics above or through
// the arena's locks (for `next`-chain relinking).
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    /// Allocate a new block with the given byte capacity.
    pub(crate) fn new(capacity: usize) -> Box<Block> {
        let layout = Layout::from_size_align(capacity.max(1), align_of::<usize>())
            .expect("block capacity overflow");
        let data = unsafe { alloc::alloc(layout) };
        let data = NonNull::new(data).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Box::new(Block {
            data,
            layout,
            capacity,
            used: CachePadded::new(AtomicUsize::new(0)),
            next: AtomicPtr::new(std::ptr::null_mut()),
            lease_count: AtomicUsize::new(0),
            pinned_count: AtomicUsize::new(0),
            retired: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn data_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    pub(crate) fn contains(&self, ptr: *const u8) -> bool {
        let start = self.data.as_ptr() as usize;
        let end = start + self.capacity;
        let p = ptr as usize;
        p >= start && p < end
    }

    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Lock-free bump attempt. Returns the start offset on success.
    ///
    /// Caller is responsible for the epoch check described in §4.1: re-read
    /// the arena's `block_epoch` after this call succeeds and discard the
    /// result (do not publish the handle) if the epoch changed mid-flight.
    pub(crate) fn try_bump(&self, aligned_n: usize) -> Option<usize> {
        let mut cur = self.used.load(Ordering::Acquire);
        loop {
            let end = cur.checked_add(aligned_n)?;
            if end > self.capacity {
                return None;
            }
            match self.used.compare_exchange_weak(
                cur,
                end,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(cur),
                Err(observed) => cur = observed,
            }
        }
    }

    pub(crate) fn next(&self) -> *mut Block {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn set_next(&self, next: *mut Block) {
        self.next.store(next, Ordering::Release);
    }

    pub(crate) fn lease_count(&self) -> usize {
        self.lease_count.load(Ordering::Acquire)
    }

    pub(crate) fn pinned_count(&self) -> usize {
        self.pinned_count.load(Ordering::Acquire)
    }

    pub(crate) fn inc_lease(&self) {
        self.lease_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_lease(&self) {
        let prev = self.lease_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "block lease underflow");
    }

    pub(crate) fn inc_pinned(&self) {
        self.pinned_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn has_active_entries(&self) -> bool {
        self.lease_count() > 0 || self.pinned_count() > 0
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn set_retired(&self, value: bool) {
        self.retired.store(value, Ordering::Release);
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe {
            alloc::dealloc(self.data.as_ptr(), self.layout);
        }
    }
}

/// Round `n` up to a multiple of `align` (minimum pointer-width per §4.1).
pub(crate) fn align_up(n: usize, align: usize) -> usize {
    let align = align.max(align_of::<usize>());
    (n + align - 1) & !(align - 1)
}
