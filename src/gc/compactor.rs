//! Compactor thread (§4.5): two-phase per iteration — free previously
//! retired blocks (rescuing any orphaned live entries first), then compact
//! arenas whose fragmentation ratio crosses the configured threshold.
//! Grounded on
//! `original_source/src/runtime/arena/managed_arena_gc.c`
//! (`rt_managed_compact` / `retire_drained_blocks` /
//! `rescue_orphaned_entries` / `rt_managed_compactor_thread`).

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::block::{align_up, Block};
use crate::arena::ManagedArena;

#[cfg(feature = "gc_logging")]
use tracing::trace;

/// Allocate `size` bytes into a chain under construction, appending a new
/// block when the current tail is full. Independent of the arena's live
/// `current` pointer — the chain is only installed at the end of
/// [`compact_arena`].
fn chain_alloc(
    head: &mut *mut Block,
    tail: &mut *mut Block,
    block_size: usize,
    size: usize,
    total_allocated: &AtomicUsize,
) -> (*mut u8, *mut Block) {
    let aligned = align_up(size.max(1), align_of::<usize>());
    loop {
        if tail.is_null() {
            let new_size = aligned.max(block_size);
            let b = Box::into_raw(Block::new(new_size));
            *head = b;
            *tail = b;
            total_allocated.fetch_add(new_size, Ordering::AcqRel);
        }
        let block = unsafe { &**tail };
        if let Some(offset) = block.try_bump(aligned) {
            return (unsafe { block.data_ptr().add(offset) }, *tail);
        }
        let new_size = aligned.max(block_size);
        let nb = Box::into_raw(Block::new(new_size));
        unsafe { (**tail).set_next(nb) };
        *tail = nb;
        total_allocated.fetch_add(new_size, Ordering::AcqRel);
    }
}

/// Phase A: free drained retired blocks, rescuing any orphaned live entry
/// first (§4.5).
pub(crate) fn retire_drained_blocks(arena: &ManagedArena) {
    let root = arena.inner.root();
    let mut alloc_state = arena.inner.alloc_state.lock();
    let _pin_guard = root.pin_mutex.lock();

    let mut kept_head: *mut Block = ptr::null_mut();
    let mut kept_tail: *mut Block = ptr::null_mut();
    let mut block = alloc_state.retired_head;

    while !block.is_null() {
        let next = unsafe { (*block).next() };
        unsafe { (*block).set_next(ptr::null_mut()) };

        if unsafe { (*block).has_active_entries() } {
            if kept_head.is_null() {
                kept_head = block;
            } else {
                unsafe { (*kept_tail).set_next(block) };
            }
            kept_tail = block;
            block = next;
            continue;
        }

        // Rescue orphans: an entry may have been leased at compaction time
        // and unpinned since, leaving it pointing into this now-drained
        // block.
        let count = arena.inner.table_count.load(Ordering::Acquire);
        for idx in 1..count {
            let entry = arena.inner.table.get(idx);
            if entry.is_dead() {
                continue;
            }
            let entry_block = unsafe { entry.slot().block };
            if entry_block != block {
                continue;
            }
            let size = unsafe { entry.slot().size };
            let (new_ptr, new_block) = arena.bump_alloc_with_state(&mut alloc_state, size);
            let old_ptr = unsafe { entry.slot().ptr };
            unsafe { std::ptr::copy_nonoverlapping(old_ptr, new_ptr, size) };
            unsafe { entry.set_slot(new_ptr, size, new_block) };
        }

        // SAFETY: no remaining entry points into `block`.
        unsafe { drop(Box::from_raw(block)) };
        block = next;
    }

    alloc_state.retired_head = kept_head;
}

/// Phase B: compact one fragmented arena.
pub(crate) fn compact_arena(arena: &ManagedArena) {
    let root = arena.inner.root();
    let mut alloc_state = arena.inner.alloc_state.lock();
    let _pin_guard = root.pin_mutex.lock();

    let old_first = alloc_state.first;
    let mut b = old_first;
    while !b.is_null() {
        unsafe { (*b).set_retired(true) };
        b = unsafe { (*b).next() };
    }

    let mut new_head: *mut Block = ptr::null_mut();
    let mut new_tail: *mut Block = ptr::null_mut();

    let count = arena.inner.table_count.load(Ordering::Acquire);
    for idx in 1..count {
        let entry = arena.inner.table.get(idx);

        if entry.is_dead() {
            if entry.lease_count() == 0 && !entry.is_pinned_permanent() {
                unsafe { entry.reset_for_free_list() };
                alloc_state.free_list.push(idx);
            }
            continue;
        }
        if entry.is_pinned_permanent() || entry.lease_count() > 0 {
            let block_ptr = unsafe { entry.slot().block };
            if !block_ptr.is_null() {
                unsafe { (*block_ptr).set_retired(false) };
            }
            continue;
        }

        let size = unsafe { entry.slot().size };
        let (new_ptr, new_block) = chain_alloc(
            &mut new_head,
            &mut new_tail,
            arena.inner.config.block_size,
            size,
            &arena.inner.total_allocated,
        );
        let old_ptr = unsafe { entry.slot().ptr };
        unsafe { std::ptr::copy_nonoverlapping(old_ptr, new_ptr, size) };
        unsafe { entry.set_slot(new_ptr, size, new_block) };
    }

    // Partition old blocks: those still retire-candidate vs. those a
    // skipped (leased/pinned) entry cleared.
    let mut kept_head: *mut Block = ptr::null_mut();
    let mut kept_tail: *mut Block = ptr::null_mut();
    let mut retire_head: *mut Block = ptr::null_mut();
    let mut retire_tail: *mut Block = ptr::null_mut();
    let mut b = old_first;
    while !b.is_null() {
        let next = unsafe { (*b).next() };
        unsafe { (*b).set_next(ptr::null_mut()) };
        if unsafe { (*b).is_retired() } {
            if retire_head.is_null() {
                retire_head = b;
            } else {
                unsafe { (*retire_tail).set_next(b) };
            }
            retire_tail = b;
        } else {
            if kept_head.is_null() {
                kept_head = b;
            } else {
                unsafe { (*kept_tail).set_next(b) };
            }
            kept_tail = b;
        }
        b = next;
    }

    // Kept blocks (still hosting skipped entries) are appended to the end
    // of the new chain so their still-valid pointers remain reachable.
    if !kept_head.is_null() {
        if new_tail.is_null() {
            new_head = kept_head;
        } else {
            unsafe { (*new_tail).set_next(kept_head) };
        }
        new_tail = kept_tail;
    }

    if new_head.is_null() {
        let fresh = Box::into_raw(Block::new(arena.inner.config.block_size));
        arena
            .inner
            .total_allocated
            .fetch_add(unsafe { (*fresh).capacity() }, Ordering::AcqRel);
        new_head = fresh;
        new_tail = fresh;
    }

    alloc_state.first = new_head;
    arena.inner.current.store(new_tail, Ordering::Release);

    let mut total = 0usize;
    let mut cur = new_head;
    while !cur.is_null() {
        total += unsafe { (*cur).capacity() };
        cur = unsafe { (*cur).next() };
    }
    arena.inner.total_allocated.store(total, Ordering::Release);

    if !retire_head.is_null() {
        unsafe { (*retire_tail).set_next(alloc_state.retired_head) };
        alloc_state.retired_head = retire_head;
    }

    // Invalidate any in-flight lock-free bumper targeting the old chain.
    arena.inner.block_epoch.fetch_add(1, Ordering::Release);
    arena.inner.dead_bytes.store(0, Ordering::Release);

    #[cfg(feature = "gc_logging")]
    trace!(arena = ?(arena.inner.as_ref() as *const _), "compacted");
}

pub(crate) fn run(root: ManagedArena) {
    while root.inner.running.load(Ordering::Acquire) {
        let arenas = super::snapshot_tree(&root, root.inner.config.max_snapshot_arenas);

        // Phase A runs every iteration, ahead of Phase B, so a block
        // retired last cycle has had at least one full sleep interval to
        // let in-flight lock-free bumpers observe the epoch change.
        for arena in &arenas {
            if arena.inner.destroying.load(Ordering::Acquire) {
                continue;
            }
            retire_drained_blocks(arena);
        }

        for arena in &arenas {
            if arena.inner.destroying.load(Ordering::Acquire) {
                continue;
            }
            if arena.fragmentation() >= arena.inner.config.compact_threshold {
                compact_arena(arena);
            }
        }

        root.inner
            .gc_compactor_epoch
            .fetch_add(1, Ordering::AcqRel);
        #[cfg(feature = "gc_logging")]
        trace!(arenas = arenas.len(), "compactor cycle");
        std::thread::sleep(root.inner.config.compactor_interval);
    }

    // Final drain on shutdown, across every arena including ones mid-destroy.
    let arenas = super::snapshot_tree(&root, usize::MAX);
    for arena in &arenas {
        retire_drained_blocks(arena);
    }
}
