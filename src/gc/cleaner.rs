//! Cleaner thread (§4.4): sweeps dead, unleased, unpinned entries back onto
//! the free-list. Grounded on
//! `original_source/src/runtime/arena/managed_arena_gc.c`
//! (`clean_arena` / `rt_managed_cleaner_thread`).

use std::sync::atomic::Ordering;

use crate::arena::ManagedArena;

#[cfg(feature = "gc_logging")]
use tracing::trace;

/// Sweep one arena's table. Returns whether any slot was recycled.
pub(crate) fn clean_arena(arena: &ManagedArena) -> bool {
    if arena.inner.destroying.load(Ordering::Acquire) {
        return false;
    }
    arena.inner.gc_processing.fetch_add(1, Ordering::AcqRel);
    let did_work = {
        let root = arena.inner.root();
        let mut alloc_state = arena.inner.alloc_state.lock();
        let _pin_guard = root.pin_mutex.lock();
        let count = arena.inner.table_count.load(Ordering::Acquire);
        let mut did_work = false;
        for idx in 1..count {
            let entry = arena.inner.table.get(idx);
            if entry.is_dead() && entry.lease_count() == 0 && !entry.is_pinned_permanent() {
                // SAFETY: holding the root's pin_mutex, as required.
                unsafe { entry.reset_for_free_list() };
                alloc_state.free_list.push(idx);
                did_work = true;
            }
        }
        did_work
    };
    arena.inner.gc_processing.fetch_sub(1, Ordering::AcqRel);
    did_work
}

pub(crate) fn run(root: ManagedArena) {
    while root.inner.running.load(Ordering::Acquire) {
        let arenas = super::snapshot_tree(&root, root.inner.config.max_snapshot_arenas);
        let mut did_work = false;
        for arena in &arenas {
            if clean_arena(arena) {
                did_work = true;
            }
        }
        root.inner
            .gc_cleaner_epoch
            .fetch_add(1, Ordering::AcqRel);
        #[cfg(feature = "gc_logging")]
        trace!(arenas = arenas.len(), did_work, "cleaner cycle");
        if !did_work {
            std::thread::sleep(root.inner.config.cleaner_interval);
        }
    }
}
