//! Handles and handle-table entries (L2 data model).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI32};

use crate::block::Block;

/// A 32-bit opaque identifier indexing into an arena's handle table.
///
/// Zero is the null handle ([`HANDLE_NULL`]).
pub type Handle = u32;

/// The null handle. No allocation ever has this value.
pub const HANDLE_NULL: Handle = 0;

/// Mutable fields of a handle entry that move together under the owning
/// root's `pin_mutex`.
///
/// Grouped into one struct so the compactor always updates `ptr`, `size` and
/// `block` atomically with respect to any concurrent `pin`.
pub(crate) struct EntrySlot {
    pub ptr: *mut u8,
    pub size: usize,
    pub block: *mut Block,
}

impl Default for EntrySlot {
    fn default() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            size: 0,
            block: std::ptr::null_mut(),
        }
    }
}

/// Per-handle bookkeeping.
///
/// `ptr`/`size`/`block` live behind an [`UnsafeCell`] because they are
/// mutated by the compactor and read by `pin`, both while holding the
/// root arena's `pin_mutex` — see `SPEC_FULL.md` §5. `leased`, `pinned` and
/// `dead` are plain atomics: the lease counter is incremented/decremented
/// while holding `pin_mutex` (so it never races with a relocation), but is
/// also read lock-free by the compactor's `block_has_active_entries` check.
pub(crate) struct HandleEntry {
    slot: UnsafeCell<EntrySlot>,
    leased: AtomicI32,
    pinned: AtomicBool,
    dead: AtomicBool,
}

// SAFETY: all mutable access to `slot` is documented to require the owning
// root arena's `pin_mutex`; the atomics are independently safe to share.
unsafe impl Send for HandleEntry {}
unsafe impl Sync for HandleEntry {}

impl Default for HandleEntry {
    fn default() -> Self {
        Self {
            slot: UnsafeCell::new(EntrySlot::default()),
            leased: AtomicI32::new(0),
            pinned: AtomicBool::new(false),
            dead: AtomicBool::new(false),
        }
    }
}

impl HandleEntry {
    /// Reset this slot to the free-list invariant (§3, invariant 1).
    ///
    /// # Safety
    /// Caller must hold the owning root's `pin_mutex` and must have already
    /// verified the entry is dead and unleased.
    pub(crate) unsafe fn reset_for_free_list(&self) {
        unsafe {
            *self.slot.get() = EntrySlot::default();
        }
        self.dead.store(false, std::sync::atomic::Ordering::Release);
        self.pinned
            .store(false, std::sync::atomic::Ordering::Release);
        self.leased.store(0, std::sync::atomic::Ordering::Release);
    }

    /// Install a fresh allocation into this slot.
    ///
    /// # Safety
    /// Caller must hold the owning root's `pin_mutex` (or be constructing a
    /// brand-new, not-yet-published entry) and `leased`/`pinned`/`dead` must
    /// already read as their reset defaults.
    pub(crate) unsafe fn install(&self, ptr: *mut u8, size: usize, block: *mut Block) {
        unsafe {
            *self.slot.get() = EntrySlot { ptr, size, block };
        }
    }

    /// # Safety
    /// Caller must hold the owning root's `pin_mutex`.
    pub(crate) unsafe fn slot(&self) -> &EntrySlot {
        unsafe { &*self.slot.get() }
    }

    /// # Safety
    /// Caller must hold the owning root's `pin_mutex`; used by the compactor
    /// to relocate a live entry.
    pub(crate) unsafe fn set_slot(&self, ptr: *mut u8, size: usize, block: *mut Block) {
        unsafe {
            *self.slot.get() = EntrySlot { ptr, size, block };
        }
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(std::sync::atomic::Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.dead.store(true, std::sync::atomic::Ordering::Release);
    }

    pub(crate) fn is_pinned_permanent(&self) -> bool {
        self.pinned.load(std::sync::atomic::Ordering::Acquire)
    }

    pub(crate) fn set_pinned_permanent(&self) {
        self.pinned.store(true, std::sync::atomic::Ordering::Release);
    }

    pub(crate) fn lease_count(&self) -> i32 {
        self.leased.load(std::sync::atomic::Ordering::Acquire)
    }

    /// # Safety
    /// Caller must hold the owning root's `pin_mutex`.
    pub(crate) unsafe fn lease_inc(&self) {
        self.leased.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }

    /// # Safety
    /// Caller must hold the owning root's `pin_mutex`. Panics (debug) on
    /// underflow per the fatal "lease underflow" error kind (§7).
    pub(crate) unsafe fn lease_dec(&self) {
        let prev = self.leased.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin without matching pin (lease underflow)");
    }
}
