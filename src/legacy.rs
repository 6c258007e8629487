//! Legacy arena bridge: permanently-pinned, non-compactable allocation for
//! internal bookkeeping, plus file-handle/thread tracking and the
//! shared-thread-mode freeze mechanism.
//!
//! Grounded on `original_source/src/runtime/runtime_arena.{h,c}`. Every
//! legacy allocation is, underneath, a managed-arena allocation with an
//! implicit `pin_permanent` — this module is a thin facade, not a second
//! allocator (see `SPEC_FULL.md` §9).

use std::thread::{JoinHandle, ThreadId};

use crate::arena::ManagedArena;
use crate::error::ArenaError;
use crate::handle::{Handle, HANDLE_NULL};

/// A tracked, still-open file-like resource.
pub struct TrackedFile {
    id: u64,
    closer: Option<Box<dyn FnOnce() + Send>>,
}

/// Per-arena legacy bookkeeping state.
#[derive(Default)]
pub(crate) struct LegacyState {
    open_files: Vec<TrackedFile>,
    active_threads: Vec<JoinHandle<()>>,
    frozen: bool,
    frozen_owner: Option<ThreadId>,
    next_file_id: u64,
}

impl ManagedArena {
    /// Allocate memory permanently pinned for internal bookkeeping use.
    /// Never moved, never unpinned; appropriate for short-lived diagnostic
    /// or format buffers that must expose a stable address.
    ///
    /// Returns [`ArenaError::FrozenArena`] if the arena is frozen for
    /// exclusive use by another thread (the one recoverable error surface
    /// in this module; see `SPEC_FULL.md` §7).
    pub fn legacy_alloc(&self, size: usize) -> Result<*mut u8, ArenaError> {
        self.check_not_frozen()?;
        let h = self.alloc(HANDLE_NULL, size);
        Ok(self.pin_permanent(h))
    }

    /// Duplicate a string via the legacy (permanently-pinned) path.
    pub fn legacy_strdup(&self, s: &str) -> Result<Handle, ArenaError> {
        self.check_not_frozen()?;
        let h = self.strdup(HANDLE_NULL, s);
        self.pin_permanent(h);
        Ok(h)
    }

    fn check_not_frozen(&self) -> Result<(), ArenaError> {
        let legacy = self.inner.legacy.lock();
        if legacy.frozen && legacy.frozen_owner != Some(std::thread::current().id()) {
            Err(ArenaError::FrozenArena)
        } else {
            Ok(())
        }
    }

    /// Track an open file-like resource; `closer` is invoked at most once,
    /// on `reset`/`destroy`, if the handle is still tracked.
    pub fn track_file(&self, closer: impl FnOnce() + Send + 'static) -> u64 {
        let mut legacy = self.inner.legacy.lock();
        let id = legacy.next_file_id;
        legacy.next_file_id += 1;
        legacy.open_files.push(TrackedFile {
            id,
            closer: Some(Box::new(closer)),
        });
        id
    }

    /// Stop tracking a file handle without closing it.
    pub fn untrack_file(&self, id: u64) {
        self.inner.legacy.lock().open_files.retain(|f| f.id != id);
    }

    /// Track a detached worker thread; it is joined (panics discarded) on
    /// `reset`/`destroy`.
    pub fn track_thread(&self, handle: JoinHandle<()>) {
        self.inner.legacy.lock().active_threads.push(handle);
    }

    /// Run every tracked file-closer and join every tracked thread. Called
    /// as part of `reset`/`destroy` before the generic cleanup-hook pass.
    pub(crate) fn drain_legacy_resources(&self) {
        let (threads, files) = {
            let mut legacy = self.inner.legacy.lock();
            (
                std::mem::take(&mut legacy.active_threads),
                std::mem::take(&mut legacy.open_files),
            )
        };
        for t in threads {
            let _ = t.join();
        }
        for mut f in files {
            if let Some(closer) = f.closer.take() {
                closer();
            }
        }
    }

    /// Freeze the arena: only the calling thread may allocate from it until
    /// [`ManagedArena::unfreeze`]. Used while a shared arena is being driven
    /// by exactly one thread during a parallel region.
    pub fn freeze(&self) {
        let mut legacy = self.inner.legacy.lock();
        legacy.frozen = true;
        legacy.frozen_owner = Some(std::thread::current().id());
    }

    /// Unfreeze the arena.
    pub fn unfreeze(&self) {
        let mut legacy = self.inner.legacy.lock();
        legacy.frozen = false;
        legacy.frozen_owner = None;
    }

    /// Whether the arena is currently frozen.
    pub fn is_frozen(&self) -> bool {
        self.inner.legacy.lock().frozen
    }
}
